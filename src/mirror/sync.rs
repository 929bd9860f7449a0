//! Human-browsable copy of the vault in an external directory.
//!
//! Layout under the mirror root:
//!
//! ```text
//! projects/project-{id}.json
//! assets/{images|audio|assets}/{key}.{ext}
//! assets/{images|audio|assets}/{key}.mime   (only when {ext} loses the type)
//! global-research.json
//! ```

use super::access::{DirectoryAccess, ensure_permission};
use super::files::{
    MIME_SIDECAR_EXT, extension_for, mime_for, mime_sidecar, parse_mime_sidecar, write_atomic,
};
use crate::core::{
    Blob, BlobHandle, BlobKind, PROJECT_KEY_PREFIX, ProjectDocument, ProjectId, Result, VaultError, sanitize_key,
};
use crate::persist::{CommitObserver, merge_with_disk};
use crate::storage::{BlobStore, DocumentStore};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::fs;
use tracing::{Instrument, Level, event, info_span};

pub const PROJECTS_DIR: &str = "projects";
pub const ASSETS_DIR: &str = "assets";
pub const GLOBAL_RESEARCH_FILE: &str = "global-research.json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub projects: usize,
    pub assets_written: usize,
    /// Handles that did not resolve in the blob store.
    pub assets_missing: usize,
    /// Projects that could not be read from the store.
    pub skipped: Vec<ProjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Projects absent locally and written from the mirror.
    pub restored: Vec<ProjectId>,
    /// Local projects gap-filled from their mirror copy.
    pub merged: Vec<ProjectId>,
    pub assets_restored: usize,
    /// Assets already present locally.
    pub assets_kept: usize,
    /// Unreadable files under the mirror root.
    pub invalid_files: Vec<PathBuf>,
    pub research_pool_restored: bool,
}

impl RestoreReport {
    pub fn touched(&self) -> impl Iterator<Item = &ProjectId> {
        self.restored.iter().chain(self.merged.iter())
    }
}

/// Mirror sync against whichever directory is currently connected.
#[derive(Clone)]
pub struct MirrorSync {
    blobs: BlobStore,
    documents: DocumentStore,
    access: Arc<RwLock<Option<Arc<dyn DirectoryAccess>>>>,
}

impl MirrorSync {
    pub fn new(blobs: BlobStore, documents: DocumentStore) -> Self {
        Self {
            blobs,
            documents,
            access: Arc::new(RwLock::new(None)),
        }
    }

    pub fn connect(&self, access: Arc<dyn DirectoryAccess>) {
        event!(Level::INFO, root = %access.root().display(), "mirror connected");
        *self.access.write().unwrap_or_else(PoisonError::into_inner) = Some(access);
    }

    pub fn disconnect(&self) -> bool {
        let previous = self.access.write().unwrap_or_else(PoisonError::into_inner).take();
        previous.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.access.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// The connected directory, with its permission re-verified.
    async fn verified(&self) -> Result<Arc<dyn DirectoryAccess>> {
        let access = self
            .access
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(VaultError::MirrorNotConnected)?;
        ensure_permission(access.as_ref()).await?;
        Ok(access)
    }

    pub async fn sync_one(&self, doc: &ProjectDocument) -> Result<MirrorReport> {
        let access = self.verified().await?;
        let mut report = MirrorReport::default();
        let mut written = HashSet::new();
        self.write_project(access.root(), doc, &mut written, &mut report)
            .instrument(info_span!("vault.mirror.sync_one", project = %doc.id))
            .await?;
        Ok(report)
    }

    /// Mirrors every stored project, including ones missing from the index.
    pub async fn sync_all(&self) -> Result<MirrorReport> {
        let access = self.verified().await?;
        let root = access.root();
        let mut report = MirrorReport::default();
        let mut written = HashSet::new();

        for id in self.documents.list_keys().await? {
            match self.documents.load(&id).await {
                Ok(Some(doc)) => self.write_project(root, &doc, &mut written, &mut report).await?,
                Ok(None) => {}
                Err(err) => {
                    event!(Level::WARN, project = %id, error = %err, "project skipped by mirror");
                    report.skipped.push(id);
                }
            }
        }

        let pool = self.documents.load_root().await?.state.research_pool;
        write_atomic(&root.join(GLOBAL_RESEARCH_FILE), &serde_json::to_vec_pretty(&pool)?).await?;

        event!(
            Level::INFO,
            projects = report.projects,
            assets = report.assets_written,
            missing = report.assets_missing,
            "mirror sync complete"
        );
        Ok(report)
    }

    async fn write_project(
        &self,
        root: &Path,
        doc: &ProjectDocument,
        written: &mut HashSet<BlobHandle>,
        report: &mut MirrorReport,
    ) -> Result<()> {
        let path = root
            .join(PROJECTS_DIR)
            .join(format!("{}.json", doc.id.storage_key()));
        write_atomic(&path, &serde_json::to_vec_pretty(doc)?).await?;
        report.projects += 1;

        let fresh: Vec<BlobHandle> = doc
            .blob_handles()
            .into_iter()
            .filter(|handle| written.insert(handle.clone()))
            .collect();

        let results = try_join_all(fresh.iter().map(|handle| self.write_asset(root, handle))).await?;
        for wrote in results {
            if wrote {
                report.assets_written += 1;
            } else {
                report.assets_missing += 1;
            }
        }
        Ok(())
    }

    async fn write_asset(&self, root: &Path, handle: &BlobHandle) -> Result<bool> {
        let Some(blob) = self.blobs.get(handle).await else {
            return Ok(false);
        };
        write_atomic(&asset_path(root, handle, &blob.mime), &blob.data).await?;
        if let Some(mime) = mime_sidecar(&blob.mime) {
            write_atomic(&sidecar_path(root, handle), mime.as_bytes()).await?;
        }
        Ok(true)
    }

    /// Rebuilds local state from the mirror, merging into what is already there.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let access = self.verified().await?;
        let root = access.root().to_path_buf();
        let mut report = RestoreReport::default();

        async {
            self.restore_assets(&root, &mut report).await?;
            self.restore_projects(&root, &mut report).await?;
            self.restore_research_pool(&root, &mut report).await
        }
        .instrument(info_span!("vault.mirror.restore", root = %root.display()))
        .await?;

        event!(
            Level::INFO,
            restored = report.restored.len(),
            merged = report.merged.len(),
            assets = report.assets_restored,
            "mirror restore complete"
        );
        Ok(report)
    }

    async fn restore_assets(&self, root: &Path, report: &mut RestoreReport) -> Result<()> {
        for kind in BlobKind::ALL {
            let dir = root.join(ASSETS_DIR).join(kind.as_str());
            for path in list_files(&dir).await? {
                let (Some(stem), ext) = (
                    path.file_stem().and_then(|s| s.to_str()),
                    path.extension().and_then(|s| s.to_str()).unwrap_or(""),
                ) else {
                    continue;
                };
                if ext == MIME_SIDECAR_EXT {
                    continue;
                }
                let handle = BlobHandle::new(kind, stem);
                if self.blobs.contains(&handle).await? {
                    report.assets_kept += 1;
                    continue;
                }
                let data = fs::read(&path).await?;
                let mime = match fs::read(sidecar_path(root, &handle)).await {
                    Ok(bytes) => parse_mime_sidecar(&bytes),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                    Err(err) => return Err(err.into()),
                };
                let mime = mime.unwrap_or_else(|| mime_for(ext).to_string());
                self.blobs.put(kind, stem, &Blob::new(mime, data)).await?;
                report.assets_restored += 1;
            }
        }
        Ok(())
    }

    async fn restore_projects(&self, root: &Path, report: &mut RestoreReport) -> Result<()> {
        let mut touched = Vec::new();
        for path in list_files(&root.join(PROJECTS_DIR)).await? {
            let is_project = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.starts_with(PROJECT_KEY_PREFIX) && name.ends_with(".json"));
            if !is_project {
                continue;
            }
            let mirrored = match read_project(&self.documents, &path).await {
                Ok(doc) => doc,
                Err(err) => {
                    event!(Level::WARN, path = %path.display(), error = %err, "unreadable mirror project");
                    report.invalid_files.push(path);
                    continue;
                }
            };

            match self.documents.load(&mirrored.id).await? {
                Some(mut local) => {
                    if merge_with_disk(&mut local, &mirrored).changed() {
                        self.documents.save(&local).await?;
                    }
                    report.merged.push(local.id.clone());
                    touched.push(local);
                }
                None => {
                    self.documents.save(&mirrored).await?;
                    report.restored.push(mirrored.id.clone());
                    touched.push(mirrored);
                }
            }
        }

        if !touched.is_empty() {
            self.documents
                .update_root(|state| {
                    for doc in &touched {
                        state.upsert(doc);
                    }
                })
                .await?;
        }
        Ok(())
    }

    async fn restore_research_pool(&self, root: &Path, report: &mut RestoreReport) -> Result<()> {
        let path = root.join(GLOBAL_RESEARCH_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let pool: JsonValue = match serde_json::from_slice(&bytes) {
            Ok(pool) => pool,
            Err(err) => {
                event!(Level::WARN, error = %err, "unreadable mirror research pool");
                report.invalid_files.push(path);
                return Ok(());
            }
        };
        if pool.is_null() {
            return Ok(());
        }

        let mut restored = false;
        self.documents
            .update_root(|state| restored = state.adopt_research_pool(pool))
            .await?;
        report.research_pool_restored = restored;
        Ok(())
    }
}

#[async_trait]
impl CommitObserver for MirrorSync {
    async fn committed(&self, doc: &ProjectDocument) {
        if !self.is_connected() {
            return;
        }
        if let Err(err) = self.sync_one(doc).await {
            event!(Level::WARN, project = %doc.id, error = %err, "mirror skipped for this commit");
        }
    }
}

pub fn asset_path(root: &Path, handle: &BlobHandle, mime: &str) -> PathBuf {
    root.join(ASSETS_DIR)
        .join(handle.kind.as_str())
        .join(format!("{}.{}", sanitize_key(&handle.key), extension_for(mime)))
}

fn sidecar_path(root: &Path, handle: &BlobHandle) -> PathBuf {
    root.join(ASSETS_DIR)
        .join(handle.kind.as_str())
        .join(format!("{}.{}", sanitize_key(&handle.key), MIME_SIDECAR_EXT))
}

async fn read_project(documents: &DocumentStore, path: &Path) -> Result<ProjectDocument> {
    let bytes = fs::read(path).await?;
    let raw: JsonValue = serde_json::from_slice(&bytes)?;
    let doc = documents.decode(raw)?;
    let expected = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(ProjectId::from_storage_key);
    match expected {
        Some(id) if id != doc.id => Err(VaultError::Serialization(format!(
            "{} holds project {}",
            path.display(),
            doc.id
        ))),
        _ => Ok(doc),
    }
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        // Dot files are interrupted writes.
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
