//! Tar bundles laid out like the mirror directory.

use super::files::{MIME_SIDECAR_EXT, extension_for, mime_for, mime_sidecar, parse_mime_sidecar};
use super::sync::{ASSETS_DIR, GLOBAL_RESEARCH_FILE, PROJECTS_DIR};
use crate::core::{Blob, BlobHandle, BlobKind, ProjectDocument, ProjectId, Result, VaultError, sanitize_key};
use crate::persist::{BlobSource, rehome_blobs};
use crate::storage::{BlobStore, DocumentStore};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Component, Path};
use tracing::{Level, event};

/// Decoded contents of an import bundle.
#[derive(Debug, Default)]
pub struct ImportBundle {
    pub projects: Vec<JsonValue>,
    pub assets: HashMap<BlobHandle, Blob>,
    pub research_pool: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Final ids of every imported project, in bundle order.
    pub imported: Vec<ProjectId>,
    /// `(bundle id, fresh id)` for projects that collided with existing ones.
    pub renamed: Vec<(ProjectId, ProjectId)>,
    pub assets_copied: usize,
    pub assets_missing: usize,
    pub invalid_projects: usize,
}

impl ImportBundle {
    /// Reads a tar stream. Entries may sit under a common top-level directory.
    pub fn read<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut bundle = Self::default();
        let mut exact_mimes: HashMap<BlobHandle, String> = HashMap::new();

        for entry in archive.entries().map_err(import_err)? {
            let mut entry = entry.map_err(import_err)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(import_err)?.into_owned();
            let parts: Vec<String> = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => part.to_str().map(str::to_string),
                    _ => None,
                })
                .collect();
            let Some(name) = parts.last() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(import_err)?;

            let parent = parts.len().checked_sub(2).map(|idx| parts[idx].as_str());
            let grandparent = parts.len().checked_sub(3).map(|idx| parts[idx].as_str());

            if name == GLOBAL_RESEARCH_FILE {
                bundle.research_pool = Some(serde_json::from_slice(&data)?);
            } else if parent == Some(PROJECTS_DIR) && name.ends_with(".json") {
                bundle.projects.push(serde_json::from_slice(&data)?);
            } else if grandparent == Some(ASSETS_DIR) {
                let Some(kind) = parent.and_then(|dir| dir.parse::<BlobKind>().ok()) else {
                    continue;
                };
                let file = Path::new(name);
                let (Some(stem), ext) = (
                    file.file_stem().and_then(|s| s.to_str()),
                    file.extension().and_then(|s| s.to_str()).unwrap_or(""),
                ) else {
                    continue;
                };
                let handle = BlobHandle::new(kind, stem);
                if ext == MIME_SIDECAR_EXT {
                    if let Some(mime) = parse_mime_sidecar(&data) {
                        exact_mimes.insert(handle, mime);
                    }
                } else {
                    bundle.assets.insert(handle, Blob::new(mime_for(ext), data));
                }
            }
        }

        for (handle, mime) in exact_mimes {
            if let Some(blob) = bundle.assets.get_mut(&handle) {
                blob.mime = mime;
            }
        }
        Ok(bundle)
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            Self::read(std::io::BufReader::new(file))
        })
        .await
        .map_err(|err| VaultError::ExecutionError(format!("bundle reader join: {}", err)))?
    }
}

/// Writes `docs` and `assets` as a bundle `import_into` can read back.
pub fn write_bundle<W: Write>(
    writer: W,
    docs: &[ProjectDocument],
    assets: &[(BlobHandle, Blob)],
    research_pool: Option<&JsonValue>,
) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    for doc in docs {
        let path = format!("{}/{}.json", PROJECTS_DIR, doc.id.storage_key());
        append(&mut builder, &path, &serde_json::to_vec_pretty(doc)?)?;
    }
    for (handle, blob) in assets {
        let stem = format!("{}/{}/{}", ASSETS_DIR, handle.kind, sanitize_key(&handle.key));
        append(&mut builder, &format!("{}.{}", stem, extension_for(&blob.mime)), &blob.data)?;
        if let Some(mime) = mime_sidecar(&blob.mime) {
            append(&mut builder, &format!("{}.{}", stem, MIME_SIDECAR_EXT), mime.as_bytes())?;
        }
    }
    if let Some(pool) = research_pool {
        append(&mut builder, GLOBAL_RESEARCH_FILE, &serde_json::to_vec_pretty(pool)?)?;
    }
    builder.into_inner().map_err(import_err)
}

fn append<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).map_err(import_err)
}

fn import_err(err: std::io::Error) -> VaultError {
    VaultError::Import(err.to_string())
}

/// Bundle payloads first, then whatever the local store already holds.
struct LayeredSource<'a> {
    bundle: &'a HashMap<BlobHandle, Blob>,
    local: &'a BlobStore,
}

#[async_trait]
impl BlobSource for LayeredSource<'_> {
    async fn fetch(&self, handle: &BlobHandle) -> Result<Option<Blob>> {
        match self.bundle.get(handle) {
            Some(blob) => Ok(Some(blob.clone())),
            None => self.local.try_get(handle).await,
        }
    }
}

/// Writes every bundled project into the stores. Projects whose id already
/// exists are imported as renamed copies with fresh ids; nothing is
/// overwritten.
pub async fn import_into(
    bundle: ImportBundle,
    documents: &DocumentStore,
    blobs: &BlobStore,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut imported = Vec::new();
    let mut claimed = HashSet::new();
    let source = LayeredSource {
        bundle: &bundle.assets,
        local: blobs,
    };

    for raw in bundle.projects {
        let mut doc = match documents.decode(raw) {
            Ok(doc) => doc,
            Err(err) => {
                event!(Level::WARN, error = %err, "bundle project rejected");
                report.invalid_projects += 1;
                continue;
            }
        };

        let original = doc.id.clone();
        if claimed.contains(&original) || documents.exists(&original).await? {
            doc.id = ProjectId::generate();
            doc.title = format!("{} (imported)", doc.title);
            doc.touch();
            event!(Level::INFO, from = %original, to = %doc.id, "import collision; importing as copy");
            report.renamed.push((original.clone(), doc.id.clone()));
        }

        let rehomed = rehome_blobs(&mut doc, &original, &source, blobs).await?;
        report.assets_copied += rehomed.copied;
        report.assets_missing += rehomed.missing;

        documents.save(&doc).await?;
        claimed.insert(doc.id.clone());
        report.imported.push(doc.id.clone());
        imported.push(doc);
    }

    let pool = bundle.research_pool;
    if !imported.is_empty() || pool.is_some() {
        documents
            .update_root(|state| {
                for doc in &imported {
                    state.upsert(doc);
                }
                if let Some(pool) = pool {
                    state.adopt_research_pool(pool);
                }
            })
            .await?;
    }

    Ok(report)
}
