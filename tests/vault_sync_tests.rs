mod common;

use common::memory_vault;
use projectvault::core::{Blob, BlobKind, MediaRef, ProjectDocument, ProjectId, ScriptCut, VaultConfig, VaultError, blob_key};
use projectvault::mirror::{LocalDirectory, write_bundle};
use projectvault::storage::MemoryBackend;
use projectvault::{ProjectVault, SyncBus, WriteOutcome};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

async fn project_with_image(vault: &ProjectVault, title: &str) -> ProjectDocument {
    let doc = vault.create_project(title).await.unwrap();
    let handle = vault
        .blobs()
        .put(
            BlobKind::Images,
            &blob_key(&doc.id, "1", "cut-final"),
            &Blob::new("image/png", vec![4, 5, 6]),
        )
        .await
        .unwrap();
    vault
        .edit(|d| {
            let mut cut = ScriptCut::new(1);
            cut.dialogue = Some("Line".to_string());
            cut.final_image = Some(MediaRef::Blob(handle.clone()));
            d.script.push(cut);
        })
        .await;
    assert_eq!(vault.flush(&doc.id).await, Some(WriteOutcome::Committed));
    vault.documents().load(&doc.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn commits_in_one_context_refresh_the_other() {
    let backend = Arc::new(MemoryBackend::new());
    let bus = SyncBus::new(16);
    let writer = ProjectVault::open(VaultConfig::new(), backend.clone(), bus.clone()).await.unwrap();
    let reader = ProjectVault::open(VaultConfig::new(), backend, bus).await.unwrap();
    assert!(reader.list_projects().await.is_empty());

    let doc = writer.create_project("Shared").await.unwrap();

    let mut seen = reader.sync_messages_seen().unwrap();
    seen.wait_for(|count| *count >= 1).await.unwrap();
    let listed = reader.list_projects().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, doc.id);
    assert!(reader.index().refresh_count() >= 2);

    writer.delete(&doc.id).await.unwrap();
    seen.wait_for(|count| *count >= 2).await.unwrap();
    assert!(reader.list_projects().await.is_empty());

    writer.shutdown().await.unwrap();
    reader.shutdown().await.unwrap();
}

#[tokio::test]
async fn mirror_round_trips_into_a_fresh_vault() {
    let mirror_dir = tempdir().unwrap();
    let source = memory_vault(VaultConfig::new()).await;
    let doc = project_with_image(&source, "Pilot").await;
    source.set_research_pool(json!({"notes": ["castle at dusk"]})).await.unwrap();

    source
        .connect_mirror(Arc::new(LocalDirectory::new(mirror_dir.path())))
        .await
        .unwrap();
    let report = source.mirror_all().await.unwrap();
    assert_eq!(report.projects, 1);
    assert_eq!(report.assets_written, 1);
    assert!(
        mirror_dir
            .path()
            .join("projects")
            .join(format!("{}.json", doc.id.storage_key()))
            .exists()
    );
    assert!(mirror_dir.path().join("global-research.json").exists());

    let target = memory_vault(VaultConfig::new()).await;
    target
        .connect_mirror(Arc::new(LocalDirectory::new(mirror_dir.path())))
        .await
        .unwrap();
    let restored = target.restore_from_mirror().await.unwrap();
    assert_eq!(restored.restored, vec![doc.id.clone()]);
    assert_eq!(restored.assets_restored, 1);
    assert!(restored.research_pool_restored);

    let loaded = target.load(&doc.id).await.unwrap();
    assert_eq!(loaded.title, "Pilot");
    assert_eq!(loaded.script[0].dialogue.as_deref(), Some("Line"));
    let handle = loaded.script[0].final_image.as_ref().and_then(MediaRef::as_handle).unwrap();
    assert_eq!(target.blobs().get(handle).await.unwrap().data, vec![4, 5, 6]);
    assert_eq!(target.research_pool().await, json!({"notes": ["castle at dusk"]}));
    assert_eq!(target.list_projects().await.len(), 1);
}

#[tokio::test]
async fn restore_fills_gaps_without_overwriting_local_edits() {
    let mirror_dir = tempdir().unwrap();
    let vault = memory_vault(VaultConfig::new()).await;
    let doc = project_with_image(&vault, "Pilot").await;
    vault
        .connect_mirror(Arc::new(LocalDirectory::new(mirror_dir.path())))
        .await
        .unwrap();
    vault.mirror_all().await.unwrap();

    let mut local = doc.clone();
    local.title = "Local title".to_string();
    local.script[0].dialogue = None;
    vault.documents().save(&local).await.unwrap();

    let report = vault.restore_from_mirror().await.unwrap();
    assert_eq!(report.merged, vec![doc.id.clone()]);
    assert_eq!(report.assets_kept, 1);

    let merged = vault.documents().load(&doc.id).await.unwrap().unwrap();
    assert_eq!(merged.title, "Local title");
    assert_eq!(merged.script[0].dialogue.as_deref(), Some("Line"));
}

#[tokio::test]
async fn auto_mirror_skips_quietly_when_permission_lapses() {
    let mirror_dir = tempdir().unwrap();
    let vault = memory_vault(VaultConfig::new().auto_mirror(true)).await;
    let access = Arc::new(LocalDirectory::new(mirror_dir.path()));
    vault.connect_mirror(access.clone()).await.unwrap();

    let doc = vault.create_project("Mirrored").await.unwrap();
    let mirrored_path = mirror_dir
        .path()
        .join("projects")
        .join(format!("{}.json", doc.id.storage_key()));
    assert!(mirrored_path.exists());

    access.revoke();
    access.grant_on_request(false);
    vault.edit(|d| d.title = "Renamed offline".to_string()).await;
    assert_eq!(vault.flush(&doc.id).await, Some(WriteOutcome::Committed));

    let stored = vault.documents().load(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "Renamed offline");
    let mirrored: serde_json::Value = serde_json::from_slice(&std::fs::read(&mirrored_path).unwrap()).unwrap();
    assert_eq!(mirrored["title"], "Mirrored");
    assert!(vault.mirror_connected());

    assert!(matches!(
        vault.mirror_all().await,
        Err(VaultError::MirrorPermissionDenied(_))
    ));
}

#[tokio::test]
async fn denied_directory_cannot_be_connected() {
    let mirror_dir = tempdir().unwrap();
    let vault = memory_vault(VaultConfig::new()).await;
    let access = Arc::new(LocalDirectory::new(mirror_dir.path()));
    access.deny();
    access.grant_on_request(false);

    let err = vault.connect_mirror(access).await.unwrap_err();
    assert!(matches!(err, VaultError::MirrorPermissionDenied(_)));
    assert!(!vault.mirror_connected());
    assert!(matches!(vault.mirror_all().await, Err(VaultError::MirrorNotConnected)));
}

#[tokio::test]
async fn import_collision_becomes_a_renamed_copy() {
    let dir = tempdir().unwrap();
    let vault = memory_vault(VaultConfig::new()).await;
    let shared = ProjectId::new("shared");
    let local = ProjectDocument::new(shared.clone(), "Local");
    assert!(vault.schedule(local).await.outcome().await.is_committed());

    let handle = projectvault::BlobHandle::new(BlobKind::Images, blob_key(&shared, "1", "cut-final"));
    let mut incoming = ProjectDocument::new(shared.clone(), "Incoming");
    let mut cut = ScriptCut::new(1);
    cut.final_image = Some(MediaRef::Blob(handle.clone()));
    incoming.script.push(cut);
    let bundle_path = dir.path().join("bundle.tar");
    let file = std::fs::File::create(&bundle_path).unwrap();
    write_bundle(file, &[incoming], &[(handle, Blob::new("image/png", vec![8, 8]))], None).unwrap();

    let report = vault.import_bundle(&bundle_path).await.unwrap();
    assert_eq!(report.imported.len(), 1);
    assert_eq!(report.renamed.len(), 1);
    let new_id = report.imported[0].clone();
    assert_ne!(new_id, shared);
    assert_eq!(report.renamed[0], (shared.clone(), new_id.clone()));

    let untouched = vault.load(&shared).await.unwrap();
    assert_eq!(untouched.title, "Local");
    assert!(untouched.script.is_empty());

    let imported = vault.load(&new_id).await.unwrap();
    assert_eq!(imported.title, "Incoming (imported)");
    let copied = imported.script[0].final_image.as_ref().and_then(MediaRef::as_handle).unwrap();
    assert!(copied.belongs_to(&new_id));
    assert_eq!(vault.blobs().get(copied).await.unwrap().data, vec![8, 8]);
    assert_eq!(vault.list_projects().await.len(), 2);
}

#[tokio::test]
async fn exported_bundle_imports_into_an_empty_vault() {
    let dir = tempdir().unwrap();
    let source = memory_vault(VaultConfig::new()).await;
    let doc = project_with_image(&source, "Pilot").await;
    let bundle_path = dir.path().join("export.tar");
    assert_eq!(source.export_bundle(&[], &bundle_path).await.unwrap(), 1);

    let target = memory_vault(VaultConfig::new()).await;
    let report = target.import_bundle(&bundle_path).await.unwrap();
    assert_eq!(report.imported, vec![doc.id.clone()]);
    assert!(report.renamed.is_empty());
    assert_eq!(report.assets_copied, 1);

    let loaded = target.load(&doc.id).await.unwrap();
    let handle = loaded.script[0].final_image.as_ref().and_then(MediaRef::as_handle).unwrap();
    assert_eq!(target.blobs().get(handle).await.unwrap().data, vec![4, 5, 6]);
}
