use super::engine::{KvBackend, KvSpace};
use crate::core::{
    BackupPolicy, ProjectDocument, ProjectId, Result, RootState, RootStateEnvelope, SchemaMigrationPlan,
    VaultError,
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Root key holding the `{state, version}` wrapper.
pub const ROOT_STATE_KEY: &str = "vault-state";

const BACKUP_KEY_PREFIX: &str = "vault-state-backup-";

/// Full project documents plus the root state wrapper.
#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn KvBackend>,
    plan: SchemaMigrationPlan,
    backup: BackupPolicy,
    root_lock: Arc<Mutex<()>>,
}

impl DocumentStore {
    pub fn new(backend: Arc<dyn KvBackend>, backup: BackupPolicy) -> Self {
        Self {
            backend,
            plan: SchemaMigrationPlan::documents(),
            backup,
            root_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_migration_plan(mut self, plan: SchemaMigrationPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Migrates and decodes a document read from outside the store.
    pub fn decode(&self, raw: JsonValue) -> Result<ProjectDocument> {
        self.plan.decode_document(raw)
    }

    pub async fn save(&self, doc: &ProjectDocument) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.backend
            .put(KvSpace::Documents, &doc.id.storage_key(), bytes)
            .await
    }

    /// Reads and schema-migrates a document; `None` when absent.
    pub async fn load(&self, id: &ProjectId) -> Result<Option<ProjectDocument>> {
        let Some(bytes) = self.backend.get(KvSpace::Documents, &id.storage_key()).await? else {
            return Ok(None);
        };
        let raw: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|err| VaultError::Serialization(format!("parse project {}: {}", id, err)))?;
        let mut doc = self.plan.decode_document(raw)?;
        if doc.id != *id {
            event!(
                Level::WARN,
                key = %id,
                stored_id = %doc.id,
                "stored document id disagrees with its key; keeping the key"
            );
            doc.id = id.clone();
        }
        Ok(Some(doc))
    }

    pub async fn exists(&self, id: &ProjectId) -> Result<bool> {
        self.backend.contains(KvSpace::Documents, &id.storage_key()).await
    }

    pub async fn remove(&self, id: &ProjectId) -> Result<bool> {
        self.backend.delete(KvSpace::Documents, &id.storage_key()).await
    }

    /// Every stored project, read straight from storage rather than the index.
    pub async fn list_keys(&self) -> Result<BTreeSet<ProjectId>> {
        Ok(self
            .backend
            .keys(KvSpace::Documents)
            .await?
            .iter()
            .filter_map(|key| ProjectId::from_storage_key(key))
            .collect())
    }

    // ------------------------------------------------------------------------
    // Root state
    // ------------------------------------------------------------------------

    pub async fn load_root(&self) -> Result<RootStateEnvelope> {
        let Some(bytes) = self.backend.get(KvSpace::Documents, ROOT_STATE_KEY).await? else {
            return Ok(RootStateEnvelope::default());
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| VaultError::Serialization(format!("parse root state: {}", err)))
    }

    /// Writes the root wrapper, backing up the previous copy when the new one
    /// is suspiciously smaller. Returns the backup key when one was written.
    pub async fn save_root(&self, envelope: &RootStateEnvelope) -> Result<Option<String>> {
        let _guard = self.root_lock.lock().await;
        self.save_root_locked(envelope).await
    }

    /// Read-modify-write of the root state, serialized within this process.
    pub async fn update_root<F>(&self, update: F) -> Result<RootState>
    where
        F: FnOnce(&mut RootState),
    {
        let _guard = self.root_lock.lock().await;
        let mut envelope = self.load_root().await?;
        update(&mut envelope.state);
        self.save_root_locked(&envelope).await?;
        Ok(envelope.state)
    }

    async fn save_root_locked(&self, envelope: &RootStateEnvelope) -> Result<Option<String>> {
        let bytes = serde_json::to_vec(envelope)?;
        let mut backup_key = None;

        if let Some(previous) = self.backend.get(KvSpace::Documents, ROOT_STATE_KEY).await? {
            if self.looks_truncated(previous.len(), bytes.len()) {
                let key = self.next_backup_key().await?;
                event!(
                    Level::WARN,
                    previous_bytes = previous.len(),
                    new_bytes = bytes.len(),
                    backup = %key,
                    "root state shrank sharply; backing up previous copy"
                );
                self.backend.put(KvSpace::Backups, &key, previous).await?;
                self.prune_backups().await?;
                backup_key = Some(key);
            }
        }

        self.backend.put(KvSpace::Documents, ROOT_STATE_KEY, bytes).await?;
        Ok(backup_key)
    }

    /// `vault-state-backup-{millis}`, or `-{millis}-{n}` when that millisecond
    /// already has a backup.
    async fn next_backup_key(&self) -> Result<String> {
        let base = format!("{}{}", BACKUP_KEY_PREFIX, Utc::now().timestamp_millis());
        let mut key = base.clone();
        let mut seq = 0u32;
        while self.backend.contains(KvSpace::Backups, &key).await? {
            seq += 1;
            key = format!("{}-{}", base, seq);
        }
        Ok(key)
    }

    fn looks_truncated(&self, previous_len: usize, new_len: usize) -> bool {
        previous_len >= self.backup.min_bytes
            && (new_len as f64) < previous_len as f64 * self.backup.shrink_ratio
    }

    async fn prune_backups(&self) -> Result<()> {
        let backups = self.list_backups().await?;
        if backups.len() <= self.backup.keep {
            return Ok(());
        }
        let excess = backups.len() - self.backup.keep;
        for key in backups.into_iter().take(excess) {
            self.backend.delete(KvSpace::Backups, &key).await?;
        }
        Ok(())
    }

    /// Backup keys, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<String>> {
        let mut keys: Vec<(i64, u32, String)> = self
            .backend
            .keys(KvSpace::Backups)
            .await?
            .into_iter()
            .filter_map(|key| {
                let stamp = key.strip_prefix(BACKUP_KEY_PREFIX)?;
                let (ts, seq) = match stamp.split_once('-') {
                    Some((ts, seq)) => (ts.parse::<i64>().ok()?, seq.parse::<u32>().ok()?),
                    None => (stamp.parse::<i64>().ok()?, 0),
                };
                Some((ts, seq, key))
            })
            .collect();
        keys.sort();
        Ok(keys.into_iter().map(|(_, _, key)| key).collect())
    }

    pub async fn load_backup(&self, key: &str) -> Result<Option<RootStateEnvelope>> {
        let Some(bytes) = self.backend.get(KvSpace::Backups, key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
