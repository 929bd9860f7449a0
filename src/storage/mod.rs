pub mod blob_store;
pub mod document_store;
pub mod engine;
pub mod memory;
pub mod persistence;

pub use blob_store::BlobStore;
pub use document_store::{DocumentStore, ROOT_STATE_KEY};
pub use engine::{KvBackend, KvSpace};
pub use memory::MemoryBackend;
pub use persistence::FileBackend;
