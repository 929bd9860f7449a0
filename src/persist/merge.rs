//! Merge-on-save guard: fills gaps in an in-memory document from its stored copy.
//!
//! In-memory values always win where present. A field counts as a gap when it
//! is absent, an empty string, an empty list, or `false`.

use crate::core::{AssetDefinition, ItemId, MediaRef, MergePolicy, ProjectDocument, ScriptCut, StyleAnchor};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Counters describing what the guard restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Scalar and media fields taken from the stored copy.
    pub filled_fields: usize,
    /// Whole script cuts or assets restored because memory had none.
    pub restored_items: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.filled_fields > 0 || self.restored_items > 0
    }
}

/// Whether a commit of `memory` should consult the stored copy first.
pub fn merge_needed(policy: MergePolicy, memory: &ProjectDocument) -> bool {
    match policy {
        MergePolicy::Disabled => false,
        MergePolicy::Always => true,
        MergePolicy::WhenPrimaryEmpty => memory.script.is_empty(),
    }
}

/// Gap-fills `memory` from `disk` and reports how much was taken.
pub fn merge_with_disk(memory: &mut ProjectDocument, disk: &ProjectDocument) -> MergeReport {
    let mut report = MergeReport::default();
    memory.fill_gaps_from(disk, &mut report);
    report
}

/// Element-wise gap filling with in-memory precedence.
pub trait FillGaps {
    fn fill_gaps_from(&mut self, stored: &Self, report: &mut MergeReport);
}

impl FillGaps for ProjectDocument {
    fn fill_gaps_from(&mut self, stored: &Self, report: &mut MergeReport) {
        fill_string(&mut self.title, &stored.title, report);
        fill_text(&mut self.series_name, &stored.series_name, report);
        fill_text(&mut self.episode_name, &stored.episode_name, report);
        fill_media(&mut self.thumbnail, &stored.thumbnail, report);
        match (&mut self.style_anchor, &stored.style_anchor) {
            (Some(anchor), Some(stored_anchor)) => anchor.fill_gaps_from(stored_anchor, report),
            (slot @ None, Some(stored_anchor)) => {
                *slot = Some(stored_anchor.clone());
                report.filled_fields += 1;
            }
            _ => {}
        }
        fill_items(&mut self.script, &stored.script, |cut| &cut.id, report);
        fill_items(&mut self.assets, &stored.assets, |asset| &asset.id, report);
        fill_extra(&mut self.extra, &stored.extra, report);
    }
}

impl FillGaps for ScriptCut {
    fn fill_gaps_from(&mut self, stored: &Self, report: &mut MergeReport) {
        fill_text(&mut self.speaker, &stored.speaker, report);
        fill_text(&mut self.dialogue, &stored.dialogue, report);
        fill_text(&mut self.visual_prompt, &stored.visual_prompt, report);
        fill_media(&mut self.final_image, &stored.final_image, report);
        if self.draft_images.is_empty() && !stored.draft_images.is_empty() {
            self.draft_images = stored.draft_images.clone();
            report.filled_fields += 1;
        }
        fill_media(&mut self.video, &stored.video, report);
        fill_media(&mut self.audio, &stored.audio, report);
        if !self.confirmed && stored.confirmed {
            self.confirmed = true;
            report.filled_fields += 1;
        }
        fill_extra(&mut self.extra, &stored.extra, report);
    }
}

impl FillGaps for AssetDefinition {
    fn fill_gaps_from(&mut self, stored: &Self, report: &mut MergeReport) {
        fill_string(&mut self.name, &stored.name, report);
        fill_text(&mut self.kind, &stored.kind, report);
        fill_text(&mut self.description, &stored.description, report);
        fill_media(&mut self.reference_image, &stored.reference_image, report);
        fill_extra(&mut self.extra, &stored.extra, report);
    }
}

impl FillGaps for StyleAnchor {
    fn fill_gaps_from(&mut self, stored: &Self, report: &mut MergeReport) {
        fill_text(&mut self.prompt, &stored.prompt, report);
        fill_media(&mut self.reference_image, &stored.reference_image, report);
        fill_extra(&mut self.extra, &stored.extra, report);
    }
}

/// Matches items by id. Items only on disk come back only when memory has none
/// at all; otherwise their absence is taken as a deliberate removal.
fn fill_items<T, F>(memory: &mut Vec<T>, stored: &[T], id_of: F, report: &mut MergeReport)
where
    T: FillGaps + Clone,
    F: Fn(&T) -> &ItemId,
{
    if memory.is_empty() {
        if !stored.is_empty() {
            memory.extend(stored.iter().cloned());
            report.restored_items += stored.len();
        }
        return;
    }

    let by_id: HashMap<&ItemId, &T> = stored.iter().map(|item| (id_of(item), item)).collect();
    for item in memory.iter_mut() {
        if let Some(stored_item) = by_id.get(id_of(item)) {
            item.fill_gaps_from(stored_item, report);
        }
    }
}

fn fill_string(memory: &mut String, stored: &str, report: &mut MergeReport) {
    if memory.is_empty() && !stored.is_empty() {
        *memory = stored.to_string();
        report.filled_fields += 1;
    }
}

fn fill_text(memory: &mut Option<String>, stored: &Option<String>, report: &mut MergeReport) {
    let gap = memory.as_deref().is_none_or(str::is_empty);
    if let Some(value) = stored.as_deref().filter(|v| !v.is_empty()) {
        if gap {
            *memory = Some(value.to_string());
            report.filled_fields += 1;
        }
    }
}

fn fill_media(memory: &mut Option<MediaRef>, stored: &Option<MediaRef>, report: &mut MergeReport) {
    let gap = memory.as_ref().is_none_or(MediaRef::is_empty);
    if let Some(value) = stored.as_ref().filter(|v| !v.is_empty()) {
        if gap {
            *memory = Some(value.clone());
            report.filled_fields += 1;
        }
    }
}

fn fill_extra(memory: &mut Map<String, JsonValue>, stored: &Map<String, JsonValue>, report: &mut MergeReport) {
    for (key, value) in stored {
        if json_is_empty(value) {
            continue;
        }
        match memory.get_mut(key) {
            Some(current) if !json_is_empty(current) => {}
            Some(current) => {
                *current = value.clone();
                report.filled_fields += 1;
            }
            None => {
                memory.insert(key.clone(), value.clone());
                report.filled_fields += 1;
            }
        }
    }
}

fn json_is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null | JsonValue::Bool(false) => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Number(_) | JsonValue::Bool(true) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlobHandle, BlobKind, ProjectId};
    use serde_json::json;

    fn cut(id: i64, dialogue: &str) -> ScriptCut {
        let mut cut = ScriptCut::new(id);
        cut.dialogue = Some(dialogue.to_string());
        cut
    }

    fn handle(key: &str) -> MediaRef {
        MediaRef::Blob(BlobHandle::new(BlobKind::Images, key))
    }

    #[test]
    fn test_memory_wins_and_gaps_are_filled() {
        let mut disk = ProjectDocument::new(ProjectId::new("p"), "Stored title");
        let mut stored_cut = cut(1, "stored line");
        stored_cut.final_image = Some(handle("p-1-cut-final"));
        stored_cut.confirmed = true;
        disk.script.push(stored_cut);

        let mut memory = ProjectDocument::new(ProjectId::new("p"), "");
        memory.script.push(cut(1, "edited line"));

        let report = merge_with_disk(&mut memory, &disk);
        assert_eq!(memory.title, "Stored title");
        assert_eq!(memory.script[0].dialogue.as_deref(), Some("edited line"));
        assert_eq!(memory.script[0].final_image, Some(handle("p-1-cut-final")));
        assert!(memory.script[0].confirmed);
        assert_eq!(report.filled_fields, 3);
        assert_eq!(report.restored_items, 0);
    }

    #[test]
    fn test_empty_script_is_restored_from_disk() {
        let mut disk = ProjectDocument::new(ProjectId::new("p"), "T");
        disk.script = vec![cut(1, "a"), cut(2, "b")];
        let mut memory = ProjectDocument::new(ProjectId::new("p"), "T");

        let report = merge_with_disk(&mut memory, &disk);
        assert_eq!(memory.script.len(), 2);
        assert_eq!(report.restored_items, 2);
    }

    #[test]
    fn test_items_removed_in_memory_stay_removed() {
        let mut disk = ProjectDocument::new(ProjectId::new("p"), "T");
        disk.script = vec![cut(1, "a"), cut(2, "b")];
        let mut memory = ProjectDocument::new(ProjectId::new("p"), "T");
        memory.script = vec![cut(2, "b2")];

        merge_with_disk(&mut memory, &disk);
        assert_eq!(memory.script.len(), 1);
        assert_eq!(memory.script[0].dialogue.as_deref(), Some("b2"));
    }

    #[test]
    fn test_merge_never_loses_non_empty_fields() {
        let mut disk = ProjectDocument::new(ProjectId::new("p"), "Disk");
        disk.series_name = Some("Series".into());
        disk.thumbnail = Some(handle("p-doc-thumbnail"));
        disk.extra.insert("aspectRatio".into(), json!("9:16"));
        disk.extra.insert("tags".into(), json!(["x"]));

        let mut memory = ProjectDocument::new(ProjectId::new("p"), "Memory");
        memory.thumbnail = Some(MediaRef::External(String::new()));
        memory.extra.insert("aspectRatio".into(), json!("16:9"));
        memory.extra.insert("tags".into(), json!([]));

        merge_with_disk(&mut memory, &disk);
        assert_eq!(memory.title, "Memory");
        assert_eq!(memory.series_name.as_deref(), Some("Series"));
        assert_eq!(memory.thumbnail, Some(handle("p-doc-thumbnail")));
        assert_eq!(memory.extra["aspectRatio"], json!("16:9"));
        assert_eq!(memory.extra["tags"], json!(["x"]));

        // A second merge has nothing left to fill.
        let again = merge_with_disk(&mut memory, &disk);
        assert!(!again.changed());
    }

    #[test]
    fn test_merge_needed_follows_policy() {
        let mut doc = ProjectDocument::new(ProjectId::new("p"), "T");
        assert!(merge_needed(MergePolicy::WhenPrimaryEmpty, &doc));
        assert!(!merge_needed(MergePolicy::Disabled, &doc));
        doc.script.push(cut(1, "a"));
        assert!(!merge_needed(MergePolicy::WhenPrimaryEmpty, &doc));
        assert!(merge_needed(MergePolicy::Always, &doc));
    }
}
