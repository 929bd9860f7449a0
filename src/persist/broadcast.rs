//! Cross-context change notifications.
//!
//! Every context sharing a storage root joins the same [`SyncBus`]. After a
//! commit a context announces it; the others reload their metadata index
//! from storage unless they are busy saving themselves.

use super::index::MetadataIndex;
use super::persister::SaveStatus;
use crate::core::{ProjectId, Result, VaultError};
use crate::storage::DocumentStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Level, event};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    ProjectSaved,
    ProjectDeleted,
    /// Bulk changes such as restore, import or orphan recovery.
    IndexRebuilt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: SyncKind,
    pub project_id: Option<ProjectId>,
    pub origin: String,
}

/// Named channel shared by all contexts of one storage root.
#[derive(Clone)]
pub struct SyncBus {
    tx: broadcast::Sender<SyncMessage>,
}

impl SyncBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }

    fn send(&self, message: SyncMessage) {
        // No receivers is the single-context case.
        let _ = self.tx.send(message);
    }
}

/// One context's sending side, stamped with its origin id.
#[derive(Clone)]
pub struct Broadcaster {
    bus: SyncBus,
    origin: String,
}

impl Broadcaster {
    pub fn new(bus: SyncBus) -> Self {
        Self {
            bus,
            origin: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn bus(&self) -> &SyncBus {
        &self.bus
    }

    pub fn project_saved(&self, id: &ProjectId) {
        self.publish(SyncKind::ProjectSaved, Some(id.clone()));
    }

    pub fn project_deleted(&self, id: &ProjectId) {
        self.publish(SyncKind::ProjectDeleted, Some(id.clone()));
    }

    pub fn index_rebuilt(&self) {
        self.publish(SyncKind::IndexRebuilt, None);
    }

    fn publish(&self, kind: SyncKind, project_id: Option<ProjectId>) {
        event!(Level::DEBUG, kind = ?kind, project = ?project_id, "broadcasting change");
        self.bus.send(SyncMessage {
            kind,
            project_id,
            origin: self.origin.clone(),
        });
    }
}

/// Background task applying other contexts' notifications to the local index.
pub struct SyncListenerWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
    seen: watch::Receiver<u64>,
}

impl SyncListenerWorker {
    /// Running count of messages taken off the bus, applied or ignored.
    pub fn seen(&self) -> watch::Receiver<u64> {
        self.seen.clone()
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| VaultError::ExecutionError(format!("sync listener join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for SyncListenerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub fn spawn_sync_listener(
    broadcaster: &Broadcaster,
    documents: DocumentStore,
    index: MetadataIndex,
    status: watch::Receiver<SaveStatus>,
) -> SyncListenerWorker {
    let mut rx = broadcaster.bus().subscribe();
    let origin = broadcaster.origin().to_string();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (seen_tx, seen) = watch::channel(0u64);

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                received = rx.recv() => {
                    match received {
                        Ok(message) => {
                            if should_apply(&message, &origin, *status.borrow()) {
                                refresh(&documents, &index).await;
                            } else {
                                event!(Level::TRACE, kind = ?message.kind, "sync message ignored");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            event!(Level::WARN, skipped, "sync listener lagged; reloading index");
                            refresh(&documents, &index).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    seen_tx.send_modify(|count| *count += 1);
                }
            }
        }
    });

    SyncListenerWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
        seen,
    }
}

/// Own messages are skipped, and so is everything while a local save is in
/// progress, so a refresh never clobbers in-flight edits.
fn should_apply(message: &SyncMessage, origin: &str, status: SaveStatus) -> bool {
    message.origin != origin && status == SaveStatus::Idle
}

async fn refresh(documents: &DocumentStore, index: &MetadataIndex) {
    if let Err(err) = index.refresh_from(documents).await {
        event!(Level::WARN, error = %err, "index refresh after sync message failed");
    }
}
