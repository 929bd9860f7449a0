use crate::core::{ProjectId, ProjectMetadata, Result, RootState};
use crate::storage::DocumentStore;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// A context's cached view of the root state, used for project listings.
#[derive(Clone, Default)]
pub struct MetadataIndex {
    state: Arc<RwLock<RootState>>,
    refreshes: Arc<AtomicU64>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first.
    pub async fn listing(&self) -> Vec<ProjectMetadata> {
        self.state.read().await.listing()
    }

    pub async fn get(&self, id: &ProjectId) -> Option<ProjectMetadata> {
        self.state.read().await.projects.get(id).cloned()
    }

    pub async fn contains(&self, id: &ProjectId) -> bool {
        self.state.read().await.projects.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.projects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn research_pool(&self) -> JsonValue {
        self.state.read().await.research_pool.clone()
    }

    pub async fn snapshot(&self) -> RootState {
        self.state.read().await.clone()
    }

    /// Swaps in a freshly persisted root state.
    pub async fn replace(&self, state: RootState) {
        *self.state.write().await = state;
    }

    /// Reloads from storage.
    pub async fn refresh_from(&self, documents: &DocumentStore) -> Result<()> {
        let envelope = documents.load_root().await?;
        self.replace(envelope.state).await;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of reloads triggered by storage refreshes.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BackupPolicy, ProjectDocument};
    use crate::storage::MemoryBackend;

    #[tokio::test]
    async fn test_refresh_reads_persisted_root() {
        let documents = DocumentStore::new(Arc::new(MemoryBackend::new()), BackupPolicy::default());
        let index = MetadataIndex::new();
        let doc = ProjectDocument::new(ProjectId::new("p1"), "Pilot");
        documents.update_root(|state| state.upsert(&doc)).await.unwrap();

        assert!(index.is_empty().await);
        index.refresh_from(&documents).await.unwrap();
        assert_eq!(index.refresh_count(), 1);
        assert_eq!(index.get(&doc.id).await.unwrap().title, "Pilot");
        assert_eq!(index.listing().await.len(), 1);
    }
}
