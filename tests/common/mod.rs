#![allow(dead_code)]

use async_trait::async_trait;
use projectvault::core::{ProjectId, VaultConfig, VaultError};
use projectvault::storage::{KvBackend, KvSpace, MemoryBackend};
use projectvault::{ProjectVault, SyncBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Memory backend that counts writes, and can be made to fail or stall them.
#[derive(Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    puts: Mutex<HashMap<KvSpace, usize>>,
    project_puts: AtomicU64,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl CountingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn puts_in(&self, space: KvSpace) -> usize {
        self.puts.lock().unwrap().get(&space).copied().unwrap_or(0)
    }

    pub fn total_puts(&self) -> usize {
        self.puts.lock().unwrap().values().sum()
    }

    /// Document writes, excluding the root state wrapper.
    pub fn project_puts(&self) -> u64 {
        self.project_puts.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.puts.lock().unwrap().clear();
        self.project_puts.store(0, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvBackend for CountingBackend {
    async fn get(&self, space: KvSpace, key: &str) -> projectvault::Result<Option<Vec<u8>>> {
        self.inner.get(space, key).await
    }

    async fn put(&self, space: KvSpace, key: &str, value: Vec<u8>) -> projectvault::Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::StorageUnavailable("quota exceeded".to_string()));
        }
        *self.puts.lock().unwrap().entry(space).or_default() += 1;
        if space == KvSpace::Documents && ProjectId::from_storage_key(key).is_some() {
            self.project_puts.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.put(space, key, value).await
    }

    async fn delete(&self, space: KvSpace, key: &str) -> projectvault::Result<bool> {
        self.inner.delete(space, key).await
    }

    async fn keys(&self, space: KvSpace) -> projectvault::Result<Vec<String>> {
        self.inner.keys(space).await
    }
}

pub async fn open_vault(config: VaultConfig, backend: Arc<CountingBackend>) -> ProjectVault {
    ProjectVault::open(config, backend, SyncBus::new(64)).await.unwrap()
}

pub async fn memory_vault(config: VaultConfig) -> ProjectVault {
    ProjectVault::open(config, Arc::new(MemoryBackend::new()), SyncBus::new(64))
        .await
        .unwrap()
}
