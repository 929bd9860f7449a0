//! Debounced write coalescing with an observable save status.
//!
//! Each project id has at most one pending write. Scheduling again replaces the
//! pending document and restarts the quiet-period timer, so a burst of edits
//! produces a single commit carrying the last state. Commits for the same id
//! are serialized by a per-id lock.

use super::broadcast::Broadcaster;
use super::index::MetadataIndex;
use super::merge::{merge_needed, merge_with_disk};
use crate::core::{PersisterPolicy, ProjectDocument, ProjectId, Result, VaultError};
use crate::storage::DocumentStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    Error,
}

/// How a scheduled write ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// A later write for the same project replaced this one before it fired.
    Superseded,
    /// The project was deleted or the write was cancelled.
    Cancelled,
    Failed(String),
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Resolves once the scheduled write commits, fails, or is replaced.
#[derive(Debug)]
pub struct WriteTicket {
    project: ProjectId,
    rx: oneshot::Receiver<WriteOutcome>,
}

impl WriteTicket {
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub async fn outcome(self) -> WriteOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| WriteOutcome::Failed("write abandoned".to_string()))
    }
}

/// Runs after every successful commit, outside the commit deadline.
#[async_trait]
pub trait CommitObserver: Send + Sync {
    async fn committed(&self, doc: &ProjectDocument);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersisterStats {
    pub committed: u64,
    pub superseded: u64,
    pub cancelled: u64,
    pub failed: u64,
}

struct PendingWrite {
    generation: u64,
    doc: ProjectDocument,
    ticket: oneshot::Sender<WriteOutcome>,
    timer: JoinHandle<()>,
}

impl PendingWrite {
    fn resolve_early(self, outcome: WriteOutcome) {
        self.timer.abort();
        let _ = self.ticket.send(outcome);
    }
}

#[derive(Default)]
struct StatusState {
    epoch: u64,
    in_flight: usize,
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    superseded: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

struct PersisterInner {
    documents: DocumentStore,
    index: MetadataIndex,
    broadcaster: Option<Broadcaster>,
    observer: StdMutex<Option<Arc<dyn CommitObserver>>>,
    policy: PersisterPolicy,
    pending: StdMutex<HashMap<ProjectId, PendingWrite>>,
    commit_locks: StdMutex<HashMap<ProjectId, Arc<Mutex<()>>>>,
    /// Writes with a generation below the watermark were cancelled.
    cancel_watermarks: StdMutex<HashMap<ProjectId, u64>>,
    next_generation: AtomicU64,
    status_tx: watch::Sender<SaveStatus>,
    status: StdMutex<StatusState>,
    counters: Counters,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to the write coalescer.
#[derive(Clone)]
pub struct Persister {
    inner: Arc<PersisterInner>,
}

impl Persister {
    pub fn new(
        documents: DocumentStore,
        index: MetadataIndex,
        broadcaster: Option<Broadcaster>,
        policy: PersisterPolicy,
    ) -> Self {
        let (status_tx, _) = watch::channel(SaveStatus::Idle);
        Self {
            inner: Arc::new(PersisterInner {
                documents,
                index,
                broadcaster,
                observer: StdMutex::new(None),
                policy,
                pending: StdMutex::new(HashMap::new()),
                commit_locks: StdMutex::new(HashMap::new()),
                cancel_watermarks: StdMutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                status_tx,
                status: StdMutex::new(StatusState::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn CommitObserver>>) {
        *lock(&self.inner.observer) = observer;
    }

    pub fn status(&self) -> SaveStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn has_pending(&self, id: &ProjectId) -> bool {
        lock(&self.inner.pending).contains_key(id)
    }

    pub fn stats(&self) -> PersisterStats {
        let counters = &self.inner.counters;
        PersisterStats {
            committed: counters.committed.load(Ordering::Relaxed),
            superseded: counters.superseded.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Queues `doc` for a debounced commit, replacing any pending write for the
    /// same project.
    pub fn schedule(&self, doc: ProjectDocument) -> WriteTicket {
        let id = doc.id.clone();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (ticket, rx) = oneshot::channel();
        let debounce = self.inner.policy.debounce();

        // Held across the spawn so the timer cannot observe the map before
        // its own entry is in it.
        let mut pending = lock(&self.inner.pending);
        let inner = Arc::clone(&self.inner);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            sleep(debounce).await;
            inner.fire(timer_id, generation).await;
        });
        let previous = pending.insert(
            id.clone(),
            PendingWrite {
                generation,
                doc,
                ticket,
                timer,
            },
        );
        drop(pending);

        if let Some(previous) = previous {
            self.inner.counters.superseded.fetch_add(1, Ordering::Relaxed);
            event!(Level::DEBUG, project = %id, generation = previous.generation, "pending write superseded");
            previous.resolve_early(WriteOutcome::Superseded);
        }

        WriteTicket { project: id, rx }
    }

    /// Commits immediately, bypassing the quiet period.
    pub async fn commit_now(&self, doc: ProjectDocument) -> WriteOutcome {
        if let Some(previous) = lock(&self.inner.pending).remove(&doc.id) {
            self.inner.counters.superseded.fetch_add(1, Ordering::Relaxed);
            previous.resolve_early(WriteOutcome::Superseded);
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.commit_with_status(doc, generation).await
    }

    /// Commits the pending write for `id` now. With nothing pending, waits for
    /// any in-flight commit of `id` and returns `None`.
    pub async fn flush(&self, id: &ProjectId) -> Option<WriteOutcome> {
        let write = lock(&self.inner.pending).remove(id);
        match write {
            Some(write) => {
                write.timer.abort();
                let outcome = self.inner.commit_with_status(write.doc, write.generation).await;
                let _ = write.ticket.send(outcome.clone());
                Some(outcome)
            }
            None => {
                drop(self.lock_project(id).await);
                None
            }
        }
    }

    pub async fn flush_all(&self) -> Vec<(ProjectId, WriteOutcome)> {
        let ids: Vec<ProjectId> = lock(&self.inner.pending).keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(outcome) = self.flush(&id).await {
                outcomes.push((id, outcome));
            }
        }
        outcomes
    }

    /// Drops the pending write for `id` and prevents any commit of an earlier
    /// schedule from landing. Returns whether a write was pending.
    pub fn cancel(&self, id: &ProjectId) -> bool {
        let watermark = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.cancel_watermarks).insert(id.clone(), watermark);

        let previous = lock(&self.inner.pending).remove(id);
        match previous {
            Some(previous) => {
                self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                previous.resolve_early(WriteOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Exclusive access to `id`'s commit path.
    pub async fn lock_project(&self, id: &ProjectId) -> OwnedMutexGuard<()> {
        self.inner.commit_lock(id).lock_owned().await
    }
}

impl PersisterInner {
    async fn fire(self: Arc<Self>, id: ProjectId, generation: u64) {
        let write = {
            let mut pending = lock(&self.pending);
            match pending.get(&id) {
                Some(write) if write.generation == generation => pending.remove(&id),
                _ => None,
            }
        };
        let Some(write) = write else {
            return;
        };
        let outcome = self.commit_with_status(write.doc, generation).await;
        let _ = write.ticket.send(outcome);
    }

    fn commit_lock(&self, id: &ProjectId) -> Arc<Mutex<()>> {
        lock(&self.commit_locks)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn is_cancelled(&self, id: &ProjectId, generation: u64) -> bool {
        lock(&self.cancel_watermarks)
            .get(id)
            .is_some_and(|watermark| generation < *watermark)
    }

    async fn commit_with_status(self: &Arc<Self>, doc: ProjectDocument, generation: u64) -> WriteOutcome {
        let commit_lock = self.commit_lock(&doc.id);
        let _guard = commit_lock.lock().await;

        if self.is_cancelled(&doc.id, generation) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            event!(Level::DEBUG, project = %doc.id, "dropping write for cancelled project");
            return WriteOutcome::Cancelled;
        }

        let id = doc.id.clone();
        self.begin_saving();
        let limit = self.policy.max_commit();
        let result = match timeout(limit, self.commit(doc)).await {
            Ok(result) => result,
            Err(_) => Err(VaultError::CommitTimeout(limit.as_millis() as u64)),
        };

        match result {
            Ok(doc) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                self.finish(true);
                event!(Level::DEBUG, project = %id, "commit complete");
                let observer = lock(&self.observer).clone();
                if let Some(observer) = observer {
                    observer.committed(&doc).await;
                }
                WriteOutcome::Committed
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.finish(false);
                event!(Level::ERROR, project = %id, error = %err, "commit failed");
                WriteOutcome::Failed(err.to_string())
            }
        }
    }

    /// Merge guard, document write, index update, notification.
    async fn commit(&self, mut doc: ProjectDocument) -> Result<ProjectDocument> {
        if merge_needed(self.policy.merge, &doc) {
            match self.documents.load(&doc.id).await {
                Ok(Some(stored)) => {
                    let report = merge_with_disk(&mut doc, &stored);
                    if report.changed() {
                        event!(
                            Level::WARN,
                            project = %doc.id,
                            filled = report.filled_fields,
                            restored = report.restored_items,
                            "merge guard restored stored content"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    event!(Level::WARN, project = %doc.id, error = %err, "merge guard skipped; stored copy unreadable");
                }
            }
        }

        self.documents.save(&doc).await?;
        let state = self.documents.update_root(|state| state.upsert(&doc)).await?;
        self.index.replace(state).await;
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.project_saved(&doc.id);
        }
        Ok(doc)
    }

    fn begin_saving(&self) {
        let mut status = lock(&self.status);
        status.in_flight += 1;
        status.epoch += 1;
        self.status_tx.send_replace(SaveStatus::Saving);
    }

    fn finish(self: &Arc<Self>, ok: bool) {
        let mut status = lock(&self.status);
        status.in_flight = status.in_flight.saturating_sub(1);
        let (next, display) = if ok {
            if status.in_flight > 0 {
                return;
            }
            (SaveStatus::Saved, self.policy.saved_display())
        } else {
            (SaveStatus::Error, self.policy.error_display())
        };
        status.epoch += 1;
        let epoch = status.epoch;
        self.status_tx.send_replace(next);
        drop(status);
        self.revert_to_idle(epoch, display);
    }

    /// Returns to idle after `display` unless the status moved on meanwhile.
    fn revert_to_idle(self: &Arc<Self>, epoch: u64, display: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep(display).await;
            let mut status = lock(&inner.status);
            if status.epoch == epoch && status.in_flight == 0 {
                status.epoch += 1;
                inner.status_tx.send_replace(SaveStatus::Idle);
            }
        });
    }
}
