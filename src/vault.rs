//! `ProjectVault`: the explicitly constructed service object tying the stores,
//! the write coalescer, the broadcaster and the mirror together, plus the
//! active editing session.

use crate::core::{
    ProjectDocument, ProjectId, ProjectMetadata, ROOT_STATE_VERSION, Result, RootState, RootStateEnvelope,
    VaultConfig, VaultError,
};
use crate::mirror::{
    DirectoryAccess, ImportBundle, ImportReport, MirrorReport, MirrorSync, RestoreReport, ensure_permission,
    import_into, write_bundle,
};
use crate::persist::{
    Broadcaster, JitMigrator, MetadataIndex, MigrationReport, Persister, SaveStatus, SyncBus, SyncListenerWorker,
    WriteOutcome, WriteTicket, rehome_blobs, spawn_sync_listener,
};
use crate::storage::{BlobStore, DocumentStore, FileBackend, KvBackend};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, watch};
use tracing::{Instrument, Level, event, info_span};

/// Title given to the clean document a reset session starts from.
pub const UNTITLED: &str = "Untitled Project";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub document_removed: bool,
    pub blobs_removed: usize,
    pub pending_write_cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stored documents that were missing from the index.
    pub recovered: Vec<ProjectId>,
    /// Index entries whose document no longer exists.
    pub dropped: Vec<ProjectId>,
    /// Stored documents that could not be decoded.
    pub unreadable: Vec<ProjectId>,
}

impl RecoveryReport {
    pub fn changed(&self) -> bool {
        !self.recovered.is_empty() || !self.dropped.is_empty()
    }
}

pub struct ProjectVault {
    config: VaultConfig,
    blobs: BlobStore,
    documents: DocumentStore,
    migrator: JitMigrator,
    persister: Persister,
    index: MetadataIndex,
    broadcaster: Broadcaster,
    mirror: MirrorSync,
    session: Mutex<ProjectDocument>,
    listener: StdMutex<Option<SyncListenerWorker>>,
}

impl ProjectVault {
    /// Wires a vault over `backend`, joining `bus` for cross-context updates.
    ///
    /// ```
    /// use projectvault::storage::MemoryBackend;
    /// use projectvault::{ProjectVault, SyncBus, VaultConfig};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let backend = Arc::new(MemoryBackend::new());
    /// let vault = ProjectVault::open(VaultConfig::default(), backend, SyncBus::new(16))
    ///     .await
    ///     .unwrap();
    /// let doc = vault.create_project("Pilot").await.unwrap();
    /// assert_eq!(vault.list_projects().await[0].id, doc.id);
    /// # });
    /// ```
    pub async fn open(config: VaultConfig, backend: Arc<dyn KvBackend>, bus: SyncBus) -> Result<Self> {
        let blobs = BlobStore::new(backend.clone());
        let documents = DocumentStore::new(backend, config.backup.clone());
        let index = MetadataIndex::new();
        index.refresh_from(&documents).await?;

        let broadcaster = Broadcaster::new(bus);
        let persister = Persister::new(
            documents.clone(),
            index.clone(),
            Some(broadcaster.clone()),
            config.persister.clone(),
        );
        let mirror = MirrorSync::new(blobs.clone(), documents.clone());
        if config.mirror.auto_sync_on_commit {
            persister.set_observer(Some(Arc::new(mirror.clone())));
        }
        let listener = spawn_sync_listener(
            &broadcaster,
            documents.clone(),
            index.clone(),
            persister.subscribe_status(),
        );
        let migrator = JitMigrator::new(blobs.clone(), config.migration.clone());

        event!(
            Level::INFO,
            origin = %broadcaster.origin(),
            projects = index.len().await,
            "vault opened"
        );

        Ok(Self {
            config,
            blobs,
            documents,
            migrator,
            persister,
            index,
            broadcaster,
            mirror,
            session: Mutex::new(ProjectDocument::new(ProjectId::generate(), UNTITLED)),
            listener: StdMutex::new(Some(listener)),
        })
    }

    /// Opens a vault stored in a directory.
    pub async fn open_dir<P: AsRef<Path>>(config: VaultConfig, root: P, bus: SyncBus) -> Result<Self> {
        let backend = FileBackend::open(root).await?;
        Self::open(config, Arc::new(backend), bus).await
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    pub fn origin(&self) -> &str {
        self.broadcaster.origin()
    }

    pub fn status(&self) -> SaveStatus {
        self.persister.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.persister.subscribe_status()
    }

    /// Messages the cross-context listener has consumed so far.
    pub fn sync_messages_seen(&self) -> Option<watch::Receiver<u64>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(SyncListenerWorker::seen)
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    pub async fn active_document(&self) -> ProjectDocument {
        self.session.lock().await.clone()
    }

    pub async fn active_id(&self) -> ProjectId {
        self.session.lock().await.id.clone()
    }

    async fn activate(&self, doc: &ProjectDocument) {
        *self.session.lock().await = doc.clone();
    }

    async fn reset_session(&self) {
        *self.session.lock().await = ProjectDocument::new(ProjectId::generate(), UNTITLED);
    }

    /// Applies `mutate` to the active document and schedules its commit.
    pub async fn edit<F>(&self, mutate: F) -> WriteTicket
    where
        F: FnOnce(&mut ProjectDocument),
    {
        let snapshot = {
            let mut session = self.session.lock().await;
            mutate(&mut *session);
            session.touch();
            session.clone()
        };
        self.persister.schedule(snapshot)
    }

    /// Schedules a debounced commit of `doc`.
    pub async fn schedule(&self, doc: ProjectDocument) -> WriteTicket {
        {
            let mut session = self.session.lock().await;
            if session.id == doc.id {
                *session = doc.clone();
            }
        }
        self.persister.schedule(doc)
    }

    pub async fn flush(&self, id: &ProjectId) -> Option<WriteOutcome> {
        self.persister.flush(id).await
    }

    // ------------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------------

    pub async fn create_project(&self, title: &str) -> Result<ProjectDocument> {
        let doc = ProjectDocument::new(ProjectId::generate(), title);
        self.commit_required(doc.clone()).await?;
        self.activate(&doc).await;
        event!(Level::INFO, project = %doc.id, "project created");
        Ok(doc)
    }

    /// New episode sharing the series name, asset definitions and style anchor
    /// of `source`. Blobs are copied under the new project's keys.
    pub async fn create_from_series(&self, source: &ProjectId, title: &str) -> Result<ProjectDocument> {
        self.persister.flush(source).await;
        let template = self
            .documents
            .load(source)
            .await?
            .ok_or_else(|| VaultError::ProjectNotFound(source.to_string()))?;

        let mut doc = ProjectDocument::new(ProjectId::generate(), title);
        doc.series_name = template.series_name.clone();
        doc.assets = template.assets.clone();
        doc.style_anchor = template.style_anchor.clone();
        rehome_blobs(&mut doc, &template.id, &self.blobs, &self.blobs).await?;

        self.commit_required(doc.clone()).await?;
        self.activate(&doc).await;
        Ok(doc)
    }

    /// Loads, migrates and activates a project. A missing project resets the
    /// session to a clean document instead of leaving the old one active.
    pub async fn load(&self, id: &ProjectId) -> Result<ProjectDocument> {
        let span = info_span!("vault.load", project = %id);
        async {
            match self.load_document(id).await {
                Ok((doc, _)) => {
                    self.activate(&doc).await;
                    Ok(doc)
                }
                Err(err) => {
                    if matches!(err, VaultError::ProjectNotFound(_)) {
                        event!(Level::WARN, "project missing; session reset");
                        self.reset_session().await;
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn load_document(&self, id: &ProjectId) -> Result<(ProjectDocument, MigrationReport)> {
        self.persister.flush(id).await;
        let mut doc = self
            .documents
            .load(id)
            .await?
            .ok_or_else(|| VaultError::ProjectNotFound(id.to_string()))?;

        let report = self.migrator.run(&mut doc, &self.documents).await?;
        if report.changed() {
            let state = self.documents.update_root(|state| state.upsert(&doc)).await?;
            self.index.replace(state).await;
        }
        Ok((doc, report))
    }

    /// Runs the binary migration over every stored project.
    pub async fn migrate_all(&self) -> Result<Vec<(ProjectId, MigrationReport)>> {
        let mut reports = Vec::new();
        for id in self.documents.list_keys().await? {
            match self.load_document(&id).await {
                Ok((_, report)) => reports.push((id, report)),
                Err(err) => event!(Level::WARN, project = %id, error = %err, "migration skipped"),
            }
        }
        Ok(reports)
    }

    /// Independent copy of a project; its blobs are duplicated, not shared.
    pub async fn duplicate(&self, id: &ProjectId) -> Result<ProjectId> {
        self.persister.flush(id).await;
        let source = self
            .documents
            .load(id)
            .await?
            .ok_or_else(|| VaultError::ProjectNotFound(id.to_string()))?;

        let mut copy = source.clone();
        copy.id = ProjectId::generate();
        copy.title = format!("{} (copy)", source.title);
        copy.touch();
        let report = rehome_blobs(&mut copy, &source.id, &self.blobs, &self.blobs).await?;

        let new_id = copy.id.clone();
        self.commit_required(copy).await?;
        event!(Level::INFO, from = %id, to = %new_id, blobs = report.copied, "project duplicated");
        Ok(new_id)
    }

    /// Removes a project, its pending write and every blob keyed under its id.
    pub async fn delete(&self, id: &ProjectId) -> Result<DeleteReport> {
        let pending_write_cancelled = self.persister.cancel(id);
        let _guard = self.persister.lock_project(id).await;

        let indexed = self.index.contains(id).await;
        let document_removed = self.documents.remove(id).await?;
        if !document_removed && !indexed {
            return Err(VaultError::ProjectNotFound(id.to_string()));
        }

        let mut blobs_removed = 0;
        for handle in self.blobs.handles_owned_by(id).await? {
            if self.blobs.delete(&handle).await? {
                blobs_removed += 1;
            }
        }

        let state = self
            .documents
            .update_root(|state| {
                state.projects.remove(id);
            })
            .await?;
        self.index.replace(state).await;
        self.broadcaster.project_deleted(id);

        if self.active_id().await == *id {
            self.reset_session().await;
        }

        event!(Level::INFO, project = %id, blobs = blobs_removed, "project deleted");
        Ok(DeleteReport {
            document_removed,
            blobs_removed,
            pending_write_cancelled,
        })
    }

    pub async fn list_projects(&self) -> Vec<ProjectMetadata> {
        self.index.listing().await
    }

    /// Reconciles the index with the documents actually in storage.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport> {
        let keys = self.documents.list_keys().await?;
        let root = self.documents.load_root().await?.state;
        let mut report = RecoveryReport::default();
        let mut found = Vec::new();

        for id in keys.iter().filter(|id| !root.projects.contains_key(*id)) {
            match self.documents.load(id).await {
                Ok(Some(doc)) => {
                    report.recovered.push(id.clone());
                    found.push(doc);
                }
                Ok(None) => {}
                Err(err) => {
                    event!(Level::WARN, project = %id, error = %err, "orphan unreadable");
                    report.unreadable.push(id.clone());
                }
            }
        }
        report.dropped = root
            .projects
            .keys()
            .filter(|id| !keys.contains(*id))
            .cloned()
            .collect();

        if report.changed() {
            let dropped = report.dropped.clone();
            let state = self
                .documents
                .update_root(|state| {
                    for doc in &found {
                        state.upsert(doc);
                    }
                    for id in &dropped {
                        state.projects.remove(id);
                    }
                })
                .await?;
            self.index.replace(state).await;
            self.broadcaster.index_rebuilt();
            event!(
                Level::INFO,
                recovered = report.recovered.len(),
                dropped = report.dropped.len(),
                "index reconciled with storage"
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Root state
    // ------------------------------------------------------------------------

    /// Replaces the root state. Returns the backup key when the previous copy
    /// was backed up because the new one is much smaller.
    pub async fn save_root_state(&self, state: RootState) -> Result<Option<String>> {
        let envelope = RootStateEnvelope {
            state,
            version: ROOT_STATE_VERSION,
        };
        let backup = self.documents.save_root(&envelope).await?;
        self.index.replace(envelope.state).await;
        self.broadcaster.index_rebuilt();
        Ok(backup)
    }

    pub async fn research_pool(&self) -> JsonValue {
        self.index.research_pool().await
    }

    pub async fn set_research_pool(&self, pool: JsonValue) -> Result<()> {
        let state = self
            .documents
            .update_root(|state| state.research_pool = pool)
            .await?;
        self.index.replace(state).await;
        self.broadcaster.index_rebuilt();
        Ok(())
    }

    pub async fn list_backups(&self) -> Result<Vec<String>> {
        self.documents.list_backups().await
    }

    pub async fn restore_backup(&self, key: &str) -> Result<()> {
        let envelope = self
            .documents
            .load_backup(key)
            .await?
            .ok_or_else(|| VaultError::StorageUnavailable(format!("backup {} not found", key)))?;
        self.save_root_state(envelope.state).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mirror
    // ------------------------------------------------------------------------

    pub async fn connect_mirror(&self, access: Arc<dyn DirectoryAccess>) -> Result<()> {
        ensure_permission(access.as_ref()).await?;
        self.mirror.connect(access);
        Ok(())
    }

    pub fn disconnect_mirror(&self) -> bool {
        self.mirror.disconnect()
    }

    pub fn mirror_connected(&self) -> bool {
        self.mirror.is_connected()
    }

    pub async fn mirror_project(&self, id: &ProjectId) -> Result<MirrorReport> {
        self.persister.flush(id).await;
        let doc = self
            .documents
            .load(id)
            .await?
            .ok_or_else(|| VaultError::ProjectNotFound(id.to_string()))?;
        self.mirror.sync_one(&doc).await
    }

    pub async fn mirror_all(&self) -> Result<MirrorReport> {
        self.persister.flush_all().await;
        self.mirror.sync_all().await
    }

    pub async fn restore_from_mirror(&self) -> Result<RestoreReport> {
        let report = self.mirror.restore().await?;
        self.index.refresh_from(&self.documents).await?;
        self.broadcaster.index_rebuilt();
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Bundles
    // ------------------------------------------------------------------------

    pub async fn import_bundle(&self, path: &Path) -> Result<ImportReport> {
        let bundle = ImportBundle::open(path).await?;
        let report = import_into(bundle, &self.documents, &self.blobs)
            .instrument(info_span!("vault.import", path = %path.display()))
            .await?;
        self.index.refresh_from(&self.documents).await?;
        self.broadcaster.index_rebuilt();
        event!(
            Level::INFO,
            imported = report.imported.len(),
            renamed = report.renamed.len(),
            "bundle imported"
        );
        Ok(report)
    }

    /// Writes the given projects (all when `ids` is empty) and their blobs to a
    /// tar bundle. Returns the number of projects written.
    pub async fn export_bundle(&self, ids: &[ProjectId], path: &Path) -> Result<usize> {
        self.persister.flush_all().await;
        let ids: Vec<ProjectId> = if ids.is_empty() {
            self.documents.list_keys().await?.into_iter().collect()
        } else {
            ids.to_vec()
        };

        let mut docs = Vec::with_capacity(ids.len());
        let mut assets = Vec::new();
        let mut seen = HashSet::new();
        for id in &ids {
            let doc = self
                .documents
                .load(id)
                .await?
                .ok_or_else(|| VaultError::ProjectNotFound(id.to_string()))?;
            for handle in doc.blob_handles() {
                if !seen.insert(handle.clone()) {
                    continue;
                }
                if let Some(blob) = self.blobs.get(&handle).await {
                    assets.push((handle, blob));
                }
            }
            docs.push(doc);
        }

        let pool = self.research_pool().await;
        let count = docs.len();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&path)?;
            let pool = (!pool.is_null()).then_some(&pool);
            let mut writer = write_bundle(BufWriter::new(file), &docs, &assets, pool)?;
            writer.flush()?;
            Ok::<_, VaultError>(())
        })
        .await
        .map_err(|err| VaultError::ExecutionError(format!("bundle writer join: {}", err)))??;
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Commits every pending write and stops the sync listener.
    pub async fn shutdown(&self) -> Result<Vec<(ProjectId, WriteOutcome)>> {
        let outcomes = self.persister.flush_all().await;
        let worker = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.stop().await?;
        }
        Ok(outcomes)
    }

    async fn commit_required(&self, doc: ProjectDocument) -> Result<()> {
        match self.persister.commit_now(doc).await {
            WriteOutcome::Committed => Ok(()),
            WriteOutcome::Failed(reason) => Err(VaultError::StorageUnavailable(reason)),
            other => Err(VaultError::ExecutionError(format!("write did not land: {:?}", other))),
        }
    }
}
