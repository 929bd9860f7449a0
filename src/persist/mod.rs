pub mod broadcast;
pub mod index;
pub mod jit_migration;
pub mod merge;
pub mod persister;
pub mod rehome;

pub use broadcast::{Broadcaster, SyncBus, SyncKind, SyncListenerWorker, SyncMessage, spawn_sync_listener};
pub use index::MetadataIndex;
pub use jit_migration::{JitMigrator, MigrationReport};
pub use merge::{FillGaps, MergeReport, merge_needed, merge_with_disk};
pub use persister::{CommitObserver, Persister, PersisterStats, SaveStatus, WriteOutcome, WriteTicket};
pub use rehome::{BlobSource, RehomeReport, rehome_blobs};
