use super::engine::{KvBackend, KvSpace};
use crate::core::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Volatile backend; every key space under one lock.
#[derive(Default)]
pub struct MemoryBackend {
    spaces: RwLock<HashMap<KvSpace, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored bytes in `space`.
    pub async fn bytes_in(&self, space: KvSpace) -> usize {
        let spaces = self.spaces.read().await;
        spaces
            .get(&space)
            .map(|entries| entries.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, space: KvSpace, key: &str) -> Result<Option<Vec<u8>>> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(&space).and_then(|entries| entries.get(key)).cloned())
    }

    async fn put(&self, space: KvSpace, key: &str, value: Vec<u8>) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        spaces.entry(space).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, space: KvSpace, key: &str) -> Result<bool> {
        let mut spaces = self.spaces.write().await;
        Ok(spaces
            .get_mut(&space)
            .and_then(|entries| entries.remove(key))
            .is_some())
    }

    async fn keys(&self, space: KvSpace) -> Result<Vec<String>> {
        let spaces = self.spaces.read().await;
        Ok(spaces
            .get(&space)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn contains(&self, space: KvSpace, key: &str) -> Result<bool> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(&space).is_some_and(|entries| entries.contains_key(key)))
    }
}
