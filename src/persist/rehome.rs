//! Copies a document's blobs under keys owned by the document's own id.

use crate::core::{Blob, BlobHandle, MediaRef, ProjectDocument, ProjectId, Result, blob_key, sanitize_key};
use crate::storage::BlobStore;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::{Level, event};

/// Somewhere blobs can be read from while re-homing.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, handle: &BlobHandle) -> Result<Option<Blob>>;
}

#[async_trait]
impl BlobSource for BlobStore {
    async fn fetch(&self, handle: &BlobHandle) -> Result<Option<Blob>> {
        self.try_get(handle).await
    }
}

#[async_trait]
impl BlobSource for HashMap<BlobHandle, Blob> {
    async fn fetch(&self, handle: &BlobHandle) -> Result<Option<Blob>> {
        Ok(self.get(handle).cloned())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehomeReport {
    pub copied: usize,
    /// Handles whose payload the source did not have; left untouched.
    pub missing: usize,
}

/// Key for `handle` once it belongs to `to` instead of `from`.
pub fn rehomed_key(handle: &BlobHandle, from: &ProjectId, to: &ProjectId) -> String {
    match handle.key.strip_prefix(&from.blob_key_prefix()) {
        Some(rest) => sanitize_key(&format!("{}{}", to.blob_key_prefix(), rest)),
        None => blob_key(to, "ext", &handle.key),
    }
}

/// Copies every blob `doc` references from `source` into `target` under keys
/// owned by `doc.id`, rewriting the handles in place. `from` is the project the
/// handles were minted for.
pub async fn rehome_blobs(
    doc: &mut ProjectDocument,
    from: &ProjectId,
    source: &dyn BlobSource,
    target: &BlobStore,
) -> Result<RehomeReport> {
    let to = doc.id.clone();
    let mut report = RehomeReport::default();
    let mut mapping: HashMap<BlobHandle, BlobHandle> = HashMap::new();

    for handle in doc.blob_handles() {
        match source.fetch(&handle).await? {
            Some(blob) => {
                let key = rehomed_key(&handle, from, &to);
                let copy = target.put(handle.kind, &key, &blob).await?;
                mapping.insert(handle, copy);
                report.copied += 1;
            }
            None => {
                event!(Level::WARN, handle = %handle, project = %to, "blob missing while re-homing");
                report.missing += 1;
            }
        }
    }

    for (_, media) in doc.media_slots_mut() {
        if let MediaRef::Blob(handle) = media {
            if let Some(copy) = mapping.get(&*handle) {
                *handle = copy.clone();
            }
        }
    }
    for (_, map) in doc.extra_maps_mut() {
        for value in map.values_mut() {
            rewrite_json_handles(value, &mapping);
        }
    }

    Ok(report)
}

fn rewrite_json_handles(value: &mut JsonValue, mapping: &HashMap<BlobHandle, BlobHandle>) {
    match value {
        JsonValue::String(raw) if BlobHandle::is_handle(raw) => {
            if let Some(copy) = BlobHandle::parse(raw).ok().and_then(|h| mapping.get(&h)) {
                *raw = copy.to_string();
            }
        }
        JsonValue::Array(items) => items.iter_mut().for_each(|v| rewrite_json_handles(v, mapping)),
        JsonValue::Object(map) => map.values_mut().for_each(|v| rewrite_json_handles(v, mapping)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlobKind, ScriptCut};
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_rehomed_key_swaps_owner_prefix() {
        let handle = BlobHandle::new(BlobKind::Images, "src-3-cut-final");
        let key = rehomed_key(&handle, &ProjectId::new("src"), &ProjectId::new("dst"));
        assert_eq!(key, "dst-3-cut-final");

        let foreign = BlobHandle::new(BlobKind::Images, "other-3-cut-final");
        let key = rehomed_key(&foreign, &ProjectId::new("src"), &ProjectId::new("dst"));
        assert_eq!(key, "dst-ext-other-3-cut-final");
    }

    #[tokio::test]
    async fn test_rehome_copies_and_rewrites_handles() {
        let blobs = BlobStore::new(Arc::new(MemoryBackend::new()));
        let source_id = ProjectId::new("src");
        let image = blobs
            .put(BlobKind::Images, "src-1-cut-final", &Blob::new("image/png", vec![1, 2]))
            .await
            .unwrap();

        let mut doc = ProjectDocument::new(ProjectId::new("dst"), "Copy");
        let mut cut = ScriptCut::new(1);
        cut.final_image = Some(MediaRef::Blob(image.clone()));
        cut.extra.insert("alt".into(), json!({"image": image.to_string()}));
        doc.script.push(cut);
        doc.thumbnail = Some(MediaRef::Blob(BlobHandle::new(BlobKind::Images, "src-doc-thumbnail")));

        let report = rehome_blobs(&mut doc, &source_id, &blobs, &blobs).await.unwrap();
        assert_eq!(report, RehomeReport { copied: 1, missing: 1 });

        let copy = BlobHandle::new(BlobKind::Images, "dst-1-cut-final");
        assert_eq!(doc.script[0].final_image, Some(MediaRef::Blob(copy.clone())));
        assert_eq!(doc.script[0].extra["alt"]["image"], json!(copy.to_string()));
        assert_eq!(blobs.get(&copy).await.unwrap().data, vec![1, 2]);
        assert!(blobs.contains(&image).await.unwrap());
    }
}
