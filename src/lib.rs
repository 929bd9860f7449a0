// ============================================================================
// ProjectVault Library
// ============================================================================
//
// Persistence and synchronization engine for project documents: an embedded
// key/value document store, a blob store for binary media, a debounced write
// coalescer with merge-on-save, just-in-time migration of inline media into
// blobs, cross-context change notifications, and an external directory mirror.

pub mod core;
pub mod mirror;
pub mod persist;
pub mod prelude;
pub mod storage;
pub mod vault;

// Re-export main types for convenience
pub use core::{
    Blob, BlobHandle, BlobKind, MediaRef, ProjectDocument, ProjectId, ProjectMetadata, Result, VaultConfig,
    VaultError,
};
pub use persist::{SaveStatus, SyncBus, WriteOutcome, WriteTicket};
pub use vault::{DeleteReport, ProjectVault, RecoveryReport};
