//! Recommended imports grouped by abstraction level.
//!
//! `app` covers what an editor front end needs. `advanced` exposes the stores
//! and the persistence pieces for tooling and tests.

pub mod app {
    //! Vault, documents and save status.
    pub use crate::core::{
        AssetDefinition, ItemId, MediaRef, ProjectDocument, ProjectId, ProjectMetadata, ScriptCut, StyleAnchor,
        VaultConfig, VaultError,
    };
    pub use crate::mirror::{DirectoryAccess, LocalDirectory, PermissionState};
    pub use crate::persist::{SaveStatus, SyncBus, WriteOutcome, WriteTicket};
    pub use crate::vault::ProjectVault;
}

pub mod advanced {
    //! Escape hatch for storage and persistence internals.
    pub use crate::mirror::{ImportBundle, MirrorSync, import_into, write_bundle};
    pub use crate::persist::{
        Broadcaster, JitMigrator, MetadataIndex, Persister, merge_with_disk, rehome_blobs, spawn_sync_listener,
    };
    pub use crate::storage::{BlobStore, DocumentStore, FileBackend, KvBackend, KvSpace, MemoryBackend};
}
