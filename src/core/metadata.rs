use super::document::ProjectDocument;
use super::types::{MediaRef, ProjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Current version of the root state wrapper.
pub const ROOT_STATE_VERSION: u32 = 1;

/// Cached progress figures shown by project listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_cuts: usize,
    pub cuts_with_image: usize,
    pub cuts_with_video: usize,
    pub cuts_with_audio: usize,
    pub confirmed_cuts: usize,
}

/// Denormalized listing entry; always derivable from the full document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub id: ProjectId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    pub last_modified: i64,
    /// Only blob handles and external URLs; inline literals never enter the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub progress: ProgressSummary,
}

impl ProjectMetadata {
    pub fn from_document(doc: &ProjectDocument) -> Self {
        let present = |media: &Option<MediaRef>| media.as_ref().is_some_and(|m| !m.is_empty());
        let progress = ProgressSummary {
            total_cuts: doc.script.len(),
            cuts_with_image: doc.script.iter().filter(|c| present(&c.final_image)).count(),
            cuts_with_video: doc.script.iter().filter(|c| present(&c.video)).count(),
            cuts_with_audio: doc.script.iter().filter(|c| present(&c.audio)).count(),
            confirmed_cuts: doc.script.iter().filter(|c| c.confirmed).count(),
        };

        let thumbnail = doc.thumbnail.as_ref().and_then(|media| match media {
            MediaRef::Inline(_) => None,
            other if other.is_empty() => None,
            other => Some(other.to_string()),
        });

        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            series_name: doc.series_name.clone(),
            episode_name: doc.episode_name.clone(),
            last_modified: doc.last_modified,
            thumbnail,
            progress,
        }
    }
}

/// Root persisted state: metadata index plus cross-project pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootState {
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, ProjectMetadata>,
    /// Cross-project research pool; opaque to the engine.
    #[serde(default)]
    pub research_pool: JsonValue,
}

impl RootState {
    /// Newest first, the order project listings use.
    pub fn listing(&self) -> Vec<ProjectMetadata> {
        let mut entries: Vec<ProjectMetadata> = self.projects.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }

    pub fn upsert(&mut self, doc: &ProjectDocument) {
        self.projects
            .insert(doc.id.clone(), ProjectMetadata::from_document(doc));
    }

    /// Takes `pool` only while the local research pool is blank (null, `{}`
    /// or `[]`). Returns whether it was taken.
    pub fn adopt_research_pool(&mut self, pool: JsonValue) -> bool {
        if pool.is_null() || !is_blank(&self.research_pool) {
            return false;
        }
        self.research_pool = pool;
        true
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// `{state, version}` wrapper stored under the root key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootStateEnvelope {
    pub state: RootState,
    pub version: u32,
}

impl Default for RootStateEnvelope {
    fn default() -> Self {
        Self {
            state: RootState::default(),
            version: ROOT_STATE_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::ScriptCut;
    use crate::core::types::{BlobHandle, BlobKind, InlineMedia};

    #[test]
    fn test_research_pool_is_adopted_only_when_blank() {
        let mut state = RootState::default();
        state.research_pool = serde_json::json!({});
        assert!(state.adopt_research_pool(serde_json::json!({"notes": ["a"]})));
        assert!(!state.adopt_research_pool(serde_json::json!({"notes": ["b"]})));
        assert_eq!(state.research_pool, serde_json::json!({"notes": ["a"]}));

        let mut empty_list = RootState::default();
        empty_list.research_pool = serde_json::json!([]);
        assert!(!empty_list.adopt_research_pool(JsonValue::Null));
        assert!(empty_list.adopt_research_pool(serde_json::json!([1])));
    }

    #[test]
    fn test_metadata_is_derived_from_document() {
        let mut doc = ProjectDocument::new(ProjectId::new("p"), "Pilot");
        doc.series_name = Some("Saga".into());
        let mut cut = ScriptCut::new(1);
        cut.final_image = Some(MediaRef::Blob(BlobHandle::new(BlobKind::Images, "p-1-cut-final")));
        cut.confirmed = true;
        doc.script.push(cut);
        let mut empty = ScriptCut::new(2);
        empty.final_image = Some(MediaRef::External(String::new()));
        doc.script.push(empty);
        doc.thumbnail = Some(MediaRef::Inline(InlineMedia::from_bytes("image/png", &[1])));

        let meta = ProjectMetadata::from_document(&doc);
        assert_eq!(meta.title, "Pilot");
        assert_eq!(meta.series_name.as_deref(), Some("Saga"));
        assert_eq!(meta.progress.total_cuts, 2);
        assert_eq!(meta.progress.cuts_with_image, 1);
        assert_eq!(meta.progress.confirmed_cuts, 1);
        assert_eq!(meta.thumbnail, None);
    }

    #[test]
    fn test_listing_orders_newest_first() {
        let mut state = RootState::default();
        let mut old = ProjectDocument::new(ProjectId::new("a"), "old");
        old.last_modified = 1;
        let mut new = ProjectDocument::new(ProjectId::new("b"), "new");
        new.last_modified = 2;
        state.upsert(&old);
        state.upsert(&new);

        let ids: Vec<String> = state.listing().into_iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
