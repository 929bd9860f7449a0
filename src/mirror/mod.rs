pub mod access;
pub mod bundle;
pub mod files;
pub mod sync;

pub use access::{DirectoryAccess, LocalDirectory, PermissionState, ensure_permission};
pub use bundle::{ImportBundle, ImportReport, import_into, write_bundle};
pub use sync::{MirrorReport, MirrorSync, RestoreReport};
