use super::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// When the merge-on-save guard consults the disk copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Only when the in-memory script is empty (the partial-hydration signal).
    #[default]
    WhenPrimaryEmpty,
    /// Before every commit.
    Always,
    /// Never; in-memory state always wins.
    Disabled,
}

/// Write-coalescer timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterPolicy {
    /// Quiet period after the last `schedule` before a commit fires.
    pub debounce_ms: u64,
    /// How long `saved` is shown before reverting to `idle`.
    pub saved_display_ms: u64,
    /// How long `error` is shown before reverting to `idle`.
    pub error_display_ms: u64,
    /// Upper bound for a single commit; exceeding it forces `error`.
    pub max_commit_ms: u64,
    pub merge: MergePolicy,
}

impl Default for PersisterPolicy {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            saved_display_ms: 2_000,
            error_display_ms: 3_000,
            max_commit_ms: 10_000,
            merge: MergePolicy::default(),
        }
    }
}

/// Just-in-time binary migration limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationPolicy {
    /// Inline literals longer than this are moved to the blob store.
    pub threshold_bytes: usize,
    /// Wall-clock budget for one pass; afterwards remaining literals are stripped.
    pub budget_ms: u64,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 50 * 1024,
            budget_ms: 30_000,
        }
    }
}

/// Size-based backup heuristic for the root state write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    /// Previous copies smaller than this are never backed up.
    pub min_bytes: usize,
    /// A new value below `previous * shrink_ratio` counts as suspicious.
    pub shrink_ratio: f64,
    /// Number of backups retained; older ones are pruned.
    pub keep: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            min_bytes: 10 * 1024,
            shrink_ratio: 0.5,
            keep: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MirrorPolicy {
    /// Mirror each project after its commit lands.
    pub auto_sync_on_commit: bool,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub persister: PersisterPolicy,
    pub migration: MigrationPolicy,
    pub backup: BackupPolicy,
    pub mirror: MirrorPolicy,
    /// Capacity of the cross-context notification channel.
    pub broadcast_capacity: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            persister: PersisterPolicy::default(),
            migration: MigrationPolicy::default(),
            backup: BackupPolicy::default(),
            mirror: MirrorPolicy::default(),
            broadcast_capacity: 64,
        }
    }
}

impl VaultConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON config file; missing sections fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| VaultError::IoError(format!("read {}: {}", path.display(), err)))?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.broadcast_capacity = config.broadcast_capacity.max(1);
        Ok(config)
    }

    pub fn debounce(mut self, delay: Duration) -> Self {
        self.persister.debounce_ms = delay.as_millis() as u64;
        self
    }

    pub fn saved_display(mut self, window: Duration) -> Self {
        self.persister.saved_display_ms = window.as_millis() as u64;
        self
    }

    pub fn error_display(mut self, window: Duration) -> Self {
        self.persister.error_display_ms = window.as_millis() as u64;
        self
    }

    pub fn max_commit(mut self, limit: Duration) -> Self {
        self.persister.max_commit_ms = limit.as_millis() as u64;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.persister.merge = policy;
        self
    }

    pub fn migration_threshold(mut self, bytes: usize) -> Self {
        self.migration.threshold_bytes = bytes;
        self
    }

    pub fn migration_budget(mut self, budget: Duration) -> Self {
        self.migration.budget_ms = budget.as_millis() as u64;
        self
    }

    pub fn auto_mirror(mut self, enabled: bool) -> Self {
        self.mirror.auto_sync_on_commit = enabled;
        self
    }
}

impl PersisterPolicy {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn saved_display(&self) -> Duration {
        Duration::from_millis(self.saved_display_ms)
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }

    pub fn max_commit(&self) -> Duration {
        Duration::from_millis(self.max_commit_ms.max(1))
    }
}

impl MigrationPolicy {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}
