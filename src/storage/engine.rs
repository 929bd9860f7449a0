use crate::core::{BlobKind, Result};
use async_trait::async_trait;
use std::fmt;

/// Independent key spaces inside one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvSpace {
    /// Project documents and the root state wrapper.
    Documents,
    Blobs(BlobKind),
    /// Timestamped copies written by the size-based backup heuristic.
    Backups,
}

impl KvSpace {
    pub fn name(&self) -> String {
        match self {
            Self::Documents => "documents".to_string(),
            Self::Blobs(kind) => format!("blobs-{}", kind),
            Self::Backups => "backups".to_string(),
        }
    }
}

impl fmt::Display for KvSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Pluggable key/value backend underneath the blob and document stores.
///
/// A backend is a process-wide resource; the engine is its only writer.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, space: KvSpace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Inserts or overwrites `key`.
    async fn put(&self, space: KvSpace, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns whether a value was removed.
    async fn delete(&self, space: KvSpace, key: &str) -> Result<bool>;

    /// Enumerates every key in `space` directly from storage.
    async fn keys(&self, space: KvSpace) -> Result<Vec<String>>;

    async fn contains(&self, space: KvSpace, key: &str) -> Result<bool> {
        Ok(self.get(space, key).await?.is_some())
    }
}
