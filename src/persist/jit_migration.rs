use crate::core::{
    BlobHandle, InlineMedia, MediaRef, MigrationPolicy, ProjectDocument, Result, blob_key,
};
use crate::storage::{BlobStore, DocumentStore};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tracing::{Level, event};

/// Outcome of one migration pass over a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Literals moved into the blob store.
    pub migrated: usize,
    /// Literals discarded after the time budget ran out, or undecodable.
    pub stripped: usize,
    /// Literals left in place because the blob store rejected them.
    pub failed: usize,
    /// Decoded bytes written to the blob store.
    pub bytes_moved: usize,
    pub budget_exceeded: bool,
}

impl MigrationReport {
    /// Whether the document was rewritten and should be saved.
    pub fn changed(&self) -> bool {
        self.migrated > 0 || self.stripped > 0
    }
}

/// Rewrites oversized inline literals into blob handles, in place.
#[derive(Clone)]
pub struct JitMigrator {
    blobs: BlobStore,
    policy: MigrationPolicy,
}

enum Step {
    Migrated(BlobHandle, usize),
    Stripped,
    Failed,
}

impl JitMigrator {
    pub fn new(blobs: BlobStore, policy: MigrationPolicy) -> Self {
        Self { blobs, policy }
    }

    /// Migrates `doc` and saves it once if anything changed.
    pub async fn run(&self, doc: &mut ProjectDocument, documents: &DocumentStore) -> Result<MigrationReport> {
        let report = self.migrate(doc).await;
        if report.changed() {
            documents.save(doc).await?;
            event!(
                Level::INFO,
                project = %doc.id,
                migrated = report.migrated,
                stripped = report.stripped,
                bytes = report.bytes_moved,
                "jit migration persisted"
            );
        }
        Ok(report)
    }

    /// One pass over every media field and extension map of `doc`.
    ///
    /// Already-migrated documents perform no blob writes.
    pub async fn migrate(&self, doc: &mut ProjectDocument) -> MigrationReport {
        let deadline = Instant::now() + self.policy.budget();
        let threshold = self.policy.threshold_bytes;
        let project = doc.id.clone();
        let mut report = MigrationReport::default();

        for (slot, media) in doc.media_slots_mut() {
            if media.inline_len().is_none_or(|len| len <= threshold) {
                continue;
            }
            let MediaRef::Inline(inline) = &mut *media else {
                event!(Level::WARN, project = %project, role = %slot.role, "unparseable inline media stripped");
                *media = MediaRef::External(String::new());
                report.stripped += 1;
                continue;
            };
            let key = blob_key(&project, &slot.item, &slot.role);
            match self.step(inline, &key, deadline, &mut report).await {
                Step::Migrated(handle, bytes) => {
                    *media = MediaRef::Blob(handle);
                    report.migrated += 1;
                    report.bytes_moved += bytes;
                }
                Step::Stripped => {
                    *media = MediaRef::External(String::new());
                    report.stripped += 1;
                }
                Step::Failed => report.failed += 1,
            }
        }

        for (item, map) in doc.extra_maps_mut() {
            let mut found = Vec::new();
            for (field, value) in map.iter_mut() {
                collect_large_literals(value, format!("x-{}", field), threshold, &mut found);
            }
            for (role, literal) in found {
                let raw = std::mem::take(literal);
                let inline = match InlineMedia::parse(raw) {
                    Ok(inline) => inline,
                    Err(_) => {
                        event!(Level::WARN, project = %project, role = %role, "unparseable inline media stripped");
                        report.stripped += 1;
                        continue;
                    }
                };
                let key = blob_key(&project, &item, &role);
                match self.step(&inline, &key, deadline, &mut report).await {
                    Step::Migrated(handle, bytes) => {
                        *literal = handle.to_string();
                        report.migrated += 1;
                        report.bytes_moved += bytes;
                    }
                    Step::Stripped => report.stripped += 1,
                    Step::Failed => {
                        *literal = inline.to_string();
                        report.failed += 1;
                    }
                }
            }
        }

        if report.stripped > 0 {
            event!(
                Level::WARN,
                project = %project,
                stripped = report.stripped,
                budget_exceeded = report.budget_exceeded,
                "jit migration discarded inline media"
            );
        }
        report
    }

    async fn step(
        &self,
        inline: &InlineMedia,
        key: &str,
        deadline: Instant,
        report: &mut MigrationReport,
    ) -> Step {
        if report.budget_exceeded || Instant::now() >= deadline {
            report.budget_exceeded = true;
            return Step::Stripped;
        }

        let blob = match inline.decode() {
            Ok(blob) => blob,
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "undecodable inline media stripped");
                return Step::Stripped;
            }
        };
        let bytes = blob.len();
        match self.blobs.put(inline.kind(), key, &blob).await {
            Ok(handle) => Step::Migrated(handle, bytes),
            Err(err) => {
                event!(Level::ERROR, key = %key, error = %err, "jit migration blob write failed");
                Step::Failed
            }
        }
    }
}

fn collect_large_literals<'a>(
    value: &'a mut JsonValue,
    path: String,
    threshold: usize,
    out: &mut Vec<(String, &'a mut String)>,
) {
    match value {
        JsonValue::String(s) if s.starts_with("data:") && s.len() > threshold => out.push((path, s)),
        JsonValue::Array(items) => {
            for (idx, item) in items.iter_mut().enumerate() {
                collect_large_literals(item, format!("{}-{}", path, idx), threshold, out);
            }
        }
        JsonValue::Object(map) => {
            for (field, item) in map.iter_mut() {
                collect_large_literals(item, format!("{}-{}", path, field), threshold, out);
            }
        }
        _ => {}
    }
}

/// Whether any typed field of `doc` still holds an inline literal above `threshold`.
pub fn has_oversized_literals(doc: &ProjectDocument, threshold: usize) -> bool {
    doc.media_slots()
        .into_iter()
        .any(|(_, media)| media.inline_len().is_some_and(|len| len > threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BackupPolicy, Blob, BlobKind, ProjectId, ScriptCut};
    use crate::storage::{KvBackend, KvSpace, MemoryBackend};
    use serde_json::json;
    use std::sync::Arc;

    fn migrator(policy: MigrationPolicy) -> (Arc<MemoryBackend>, JitMigrator) {
        let backend = Arc::new(MemoryBackend::new());
        let blobs = BlobStore::new(backend.clone());
        (backend, JitMigrator::new(blobs, policy))
    }

    fn policy(threshold: usize) -> MigrationPolicy {
        MigrationPolicy {
            threshold_bytes: threshold,
            budget_ms: 30_000,
        }
    }

    fn document_with_image(payload: &[u8]) -> ProjectDocument {
        let mut doc = ProjectDocument::new(ProjectId::new("p1"), "Pilot");
        let mut cut = ScriptCut::new(7);
        cut.final_image = Some(MediaRef::Inline(InlineMedia::from_bytes("image/png", payload)));
        cut.audio = Some(MediaRef::Inline(InlineMedia::from_bytes("audio/mpeg", &[1, 2, 3])));
        doc.script.push(cut);
        doc
    }

    #[tokio::test]
    async fn test_large_literal_becomes_handle() {
        let (_, migrator) = migrator(policy(1024));
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut doc = document_with_image(&payload);

        let report = migrator.migrate(&mut doc).await;
        assert_eq!(report.migrated, 1);
        assert_eq!(report.bytes_moved, payload.len());

        let handle = doc.script[0].final_image.as_ref().and_then(MediaRef::as_handle).unwrap().clone();
        assert_eq!(handle.kind, BlobKind::Images);
        assert_eq!(handle.key, "p1-7-cut-final");
        let stored = migrator.blobs.get(&handle).await.unwrap();
        assert_eq!(stored.data, payload);

        // Small literal stays inline.
        assert!(matches!(doc.script[0].audio, Some(MediaRef::Inline(_))));
        assert!(!has_oversized_literals(&doc, 1024));
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (backend, migrator) = migrator(policy(16));
        let mut doc = document_with_image(&[7u8; 256]);
        migrator.migrate(&mut doc).await;
        let after_first = doc.clone();
        let keys_after_first = backend.keys(KvSpace::Blobs(BlobKind::Images)).await.unwrap();

        let report = migrator.migrate(&mut doc).await;
        assert!(!report.changed());
        assert_eq!(report, MigrationReport::default());
        assert_eq!(doc, after_first);
        assert_eq!(
            backend.keys(KvSpace::Blobs(BlobKind::Images)).await.unwrap(),
            keys_after_first
        );
    }

    #[tokio::test]
    async fn test_exhausted_budget_strips_remaining_literals() {
        let (backend, migrator) = migrator(MigrationPolicy {
            threshold_bytes: 16,
            budget_ms: 0,
        });
        let mut doc = document_with_image(&[1u8; 256]);

        let report = migrator.migrate(&mut doc).await;
        assert!(report.budget_exceeded);
        assert_eq!(report.stripped, 1);
        assert_eq!(report.migrated, 0);
        assert_eq!(doc.script[0].final_image, Some(MediaRef::External(String::new())));
        assert!(backend.keys(KvSpace::Blobs(BlobKind::Images)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extension_fields_are_migrated() {
        let (_, migrator) = migrator(policy(16));
        let mut doc = ProjectDocument::new(ProjectId::new("p1"), "Pilot");
        let literal = InlineMedia::from_bytes("image/webp", &[9u8; 64]).to_string();
        doc.extra.insert("moodBoard".into(), json!([literal.clone(), "https://x"]));

        let report = migrator.migrate(&mut doc).await;
        assert_eq!(report.migrated, 1);
        let rewritten = doc.extra["moodBoard"][0].as_str().unwrap().to_string();
        let handle = BlobHandle::parse(&rewritten).unwrap();
        assert_eq!(handle.key, "p1-doc-x-moodBoard-0");
        assert_eq!(doc.extra["moodBoard"][1], json!("https://x"));
        assert_eq!(migrator.blobs.get(&handle).await.unwrap(), Blob::new("image/webp", vec![9u8; 64]));
    }

    #[tokio::test]
    async fn test_percent_encoded_literals_are_migrated() {
        let (_, migrator) = migrator(policy(64));
        let mut doc = ProjectDocument::new(ProjectId::new("p1"), "Pilot");
        let svg = format!("<svg>{}</svg>", "x".repeat(200));
        let literal = format!("data:image/svg+xml;utf8,{}", svg.replace('<', "%3C").replace('>', "%3E"));
        doc.thumbnail = Some(MediaRef::parse(literal.clone()));
        doc.extra.insert("cover".into(), json!(literal));

        let report = migrator.migrate(&mut doc).await;
        assert_eq!(report.migrated, 2);
        let handle = doc.thumbnail.as_ref().and_then(MediaRef::as_handle).unwrap();
        let blob = migrator.blobs.get(handle).await.unwrap();
        assert_eq!(blob.mime, "image/svg+xml");
        assert_eq!(blob.data, svg.into_bytes());
        assert!(BlobHandle::is_handle(doc.extra["cover"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_unparseable_oversized_literals_are_stripped() {
        let (_, migrator) = migrator(policy(64));
        let mut doc = ProjectDocument::new(ProjectId::new("p1"), "Pilot");
        let junk = format!("data:image/png;base64{}", "A".repeat(200));
        let mut cut = ScriptCut::new(1);
        cut.final_image = Some(MediaRef::parse(junk.clone()));
        cut.audio = Some(MediaRef::parse("data:audio/mpeg,short".to_string()));
        doc.script.push(cut);
        doc.extra.insert("cover".into(), json!(junk));
        assert!(has_oversized_literals(&doc, 64));

        let report = migrator.migrate(&mut doc).await;
        assert_eq!(report.stripped, 2);
        assert_eq!(doc.script[0].final_image, Some(MediaRef::External(String::new())));
        assert_eq!(doc.extra["cover"], json!(""));
        assert!(matches!(doc.script[0].audio, Some(MediaRef::Inline(_))));
        assert!(!has_oversized_literals(&doc, 64));
    }

    #[tokio::test]
    async fn test_run_saves_only_when_changed() {
        let (backend, migrator) = migrator(policy(16));
        let documents = DocumentStore::new(backend.clone(), BackupPolicy::default());
        let mut clean = ProjectDocument::new(ProjectId::new("clean"), "Clean");
        migrator.run(&mut clean, &documents).await.unwrap();
        assert!(!documents.exists(&clean.id).await.unwrap());

        let mut dirty = document_with_image(&[3u8; 128]);
        migrator.run(&mut dirty, &documents).await.unwrap();
        let stored = documents.load(&dirty.id).await.unwrap().unwrap();
        assert!(stored.script[0].final_image.as_ref().unwrap().as_handle().is_some());
    }
}
