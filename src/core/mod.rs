pub mod config;
pub mod document;
pub mod error;
pub mod metadata;
pub mod migration;
pub mod types;

pub use config::{BackupPolicy, MergePolicy, MigrationPolicy, MirrorPolicy, PersisterPolicy, VaultConfig};
pub use document::{AssetDefinition, CURRENT_DOCUMENT_VERSION, MediaSlot, ProjectDocument, ScriptCut, StyleAnchor};
pub use error::{Result, VaultError};
pub use metadata::{ProgressSummary, ProjectMetadata, ROOT_STATE_VERSION, RootState, RootStateEnvelope};
pub use migration::{SchemaMigrationPlan, SchemaMigrationStep};
pub use types::{
    BLOB_SCHEME, Blob, BlobHandle, BlobKind, InlineEncoding, InlineMedia, ItemId, MediaRef, PROJECT_KEY_PREFIX,
    ProjectId, blob_key, sanitize_key,
};
