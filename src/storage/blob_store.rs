use super::engine::{KvBackend, KvSpace};
use crate::core::{Blob, BlobHandle, BlobKind, ProjectId, Result, VaultError};
use std::sync::Arc;
use tracing::{Level, event};

/// Keyed binary storage addressed by `(kind, key)` handles.
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn KvBackend>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Stores `blob` under `(kind, key)`, overwriting any previous payload.
    pub async fn put(&self, kind: BlobKind, key: &str, blob: &Blob) -> Result<BlobHandle> {
        if key.is_empty() {
            return Err(VaultError::InvalidHandle("empty blob key".to_string()));
        }
        let bytes = rmp_serde::to_vec(blob)
            .map_err(|err| VaultError::Serialization(format!("encode blob {}: {}", key, err)))?;
        self.backend.put(KvSpace::Blobs(kind), key, bytes).await?;
        Ok(BlobHandle::new(kind, key))
    }

    /// Lenient lookup: anything that prevents reading the blob yields `None`.
    pub async fn get(&self, handle: &BlobHandle) -> Option<Blob> {
        match self.try_get(handle).await {
            Ok(blob) => blob,
            Err(err) => {
                event!(Level::WARN, handle = %handle, error = %err, "blob unavailable");
                None
            }
        }
    }

    /// Strict lookup that surfaces backend and decoding errors.
    pub async fn try_get(&self, handle: &BlobHandle) -> Result<Option<Blob>> {
        let Some(bytes) = self.backend.get(KvSpace::Blobs(handle.kind), &handle.key).await? else {
            return Ok(None);
        };
        let blob = rmp_serde::from_slice(&bytes)
            .map_err(|err| VaultError::Serialization(format!("decode blob {}: {}", handle, err)))?;
        Ok(Some(blob))
    }

    pub async fn contains(&self, handle: &BlobHandle) -> Result<bool> {
        self.backend.contains(KvSpace::Blobs(handle.kind), &handle.key).await
    }

    pub async fn delete(&self, handle: &BlobHandle) -> Result<bool> {
        self.backend.delete(KvSpace::Blobs(handle.kind), &handle.key).await
    }

    pub async fn keys(&self, kind: BlobKind) -> Result<Vec<String>> {
        self.backend.keys(KvSpace::Blobs(kind)).await
    }

    /// Every stored blob whose key is namespaced by `project`.
    pub async fn handles_owned_by(&self, project: &ProjectId) -> Result<Vec<BlobHandle>> {
        let prefix = project.blob_key_prefix();
        let mut handles = Vec::new();
        for kind in BlobKind::ALL {
            for key in self.keys(kind).await? {
                if key.starts_with(&prefix) {
                    handles.push(BlobHandle::new(kind, key));
                }
            }
        }
        Ok(handles)
    }
}
