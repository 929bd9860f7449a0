use super::types::{BlobHandle, ItemId, MediaRef, ProjectId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Current on-disk schema version of a project document.
pub const CURRENT_DOCUMENT_VERSION: u32 = 2;

/// Full project record: the store's top-level persisted unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDocument {
    pub id: ProjectId,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default = "default_document_version")]
    pub version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    #[serde(default, rename = "thumbnailUrl", skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<MediaRef>,
    #[serde(default)]
    pub script: Vec<ScriptCut>,
    #[serde(default)]
    pub assets: Vec<AssetDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_anchor: Option<StyleAnchor>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

const fn default_document_version() -> u32 {
    CURRENT_DOCUMENT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCut {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_prompt: Option<String>,
    #[serde(default, rename = "finalImageUrl", skip_serializing_if = "Option::is_none")]
    pub final_image: Option<MediaRef>,
    #[serde(default, rename = "draftImageUrls", skip_serializing_if = "Vec::is_empty")]
    pub draft_images: Vec<MediaRef>,
    #[serde(default, rename = "videoUrl", skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaRef>,
    #[serde(default, rename = "audioUrl", skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaRef>,
    #[serde(default, rename = "isConfirmed")]
    pub confirmed: bool,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ScriptCut {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            speaker: None,
            dialogue: None,
            visual_prompt: None,
            final_image: None,
            draft_images: Vec::new(),
            video: None,
            audio: None,
            confirmed: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDefinition {
    pub id: ItemId,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "referenceImageUrl", skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<MediaRef>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl AssetDefinition {
    pub fn new(id: impl Into<ItemId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: None,
            description: None,
            reference_image: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleAnchor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, rename = "referenceImageUrl", skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<MediaRef>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Where a media field lives; feeds deterministic blob key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSlot {
    pub item: String,
    pub role: String,
}

impl MediaSlot {
    fn document(role: &str) -> Self {
        Self {
            item: "doc".to_string(),
            role: role.to_string(),
        }
    }

    fn item(id: &ItemId, role: impl Into<String>) -> Self {
        Self {
            item: id.key_part(),
            role: role.into(),
        }
    }
}

impl ProjectDocument {
    /// Clean default document.
    pub fn new(id: ProjectId, title: impl Into<String>) -> Self {
        Self {
            id,
            last_modified: Utc::now().timestamp_millis(),
            version: CURRENT_DOCUMENT_VERSION,
            title: title.into(),
            series_name: None,
            episode_name: None,
            thumbnail: None,
            script: Vec::new(),
            assets: Vec::new(),
            style_anchor: None,
            extra: Map::new(),
        }
    }

    /// Bumps `last_modified`, keeping it strictly monotonic.
    pub fn touch(&mut self) {
        let now = Utc::now().timestamp_millis();
        self.last_modified = now.max(self.last_modified + 1);
    }

    /// Every typed media field, paired with its slot.
    pub fn media_slots(&self) -> Vec<(MediaSlot, &MediaRef)> {
        let mut slots = Vec::new();
        if let Some(thumbnail) = &self.thumbnail {
            slots.push((MediaSlot::document("thumbnail"), thumbnail));
        }
        if let Some(reference) = self.style_anchor.as_ref().and_then(|a| a.reference_image.as_ref()) {
            slots.push((MediaSlot::document("style-anchor"), reference));
        }
        for cut in &self.script {
            if let Some(media) = &cut.final_image {
                slots.push((MediaSlot::item(&cut.id, "cut-final"), media));
            }
            for (idx, media) in cut.draft_images.iter().enumerate() {
                slots.push((MediaSlot::item(&cut.id, format!("cut-draft-{}", idx)), media));
            }
            if let Some(media) = &cut.video {
                slots.push((MediaSlot::item(&cut.id, "cut-video"), media));
            }
            if let Some(media) = &cut.audio {
                slots.push((MediaSlot::item(&cut.id, "cut-audio"), media));
            }
        }
        for asset in &self.assets {
            if let Some(media) = &asset.reference_image {
                slots.push((MediaSlot::item(&asset.id, "asset-reference"), media));
            }
        }
        slots
    }

    /// Mutable counterpart of [`ProjectDocument::media_slots`].
    pub fn media_slots_mut(&mut self) -> Vec<(MediaSlot, &mut MediaRef)> {
        let mut slots = Vec::new();
        if let Some(thumbnail) = self.thumbnail.as_mut() {
            slots.push((MediaSlot::document("thumbnail"), thumbnail));
        }
        if let Some(reference) = self.style_anchor.as_mut().and_then(|a| a.reference_image.as_mut()) {
            slots.push((MediaSlot::document("style-anchor"), reference));
        }
        for cut in self.script.iter_mut() {
            let id = &cut.id;
            if let Some(media) = cut.final_image.as_mut() {
                slots.push((MediaSlot::item(id, "cut-final"), media));
            }
            for (idx, media) in cut.draft_images.iter_mut().enumerate() {
                slots.push((MediaSlot::item(id, format!("cut-draft-{}", idx)), media));
            }
            if let Some(media) = cut.video.as_mut() {
                slots.push((MediaSlot::item(id, "cut-video"), media));
            }
            if let Some(media) = cut.audio.as_mut() {
                slots.push((MediaSlot::item(id, "cut-audio"), media));
            }
        }
        for asset in self.assets.iter_mut() {
            if let Some(media) = asset.reference_image.as_mut() {
                slots.push((MediaSlot::item(&asset.id, "asset-reference"), media));
            }
        }
        slots
    }

    /// Untyped extension maps, paired with the slot item that owns them.
    pub(crate) fn extra_maps_mut(&mut self) -> Vec<(String, &mut Map<String, JsonValue>)> {
        let mut maps = vec![("doc".to_string(), &mut self.extra)];
        if let Some(anchor) = self.style_anchor.as_mut() {
            maps.push(("style".to_string(), &mut anchor.extra));
        }
        for cut in self.script.iter_mut() {
            maps.push((cut.id.key_part(), &mut cut.extra));
        }
        for asset in self.assets.iter_mut() {
            maps.push((format!("asset_{}", asset.id.key_part()), &mut asset.extra));
        }
        maps
    }

    /// Every distinct blob handle reachable from typed fields and extension maps.
    pub fn blob_handles(&self) -> Vec<BlobHandle> {
        let mut handles: Vec<BlobHandle> = self
            .media_slots()
            .into_iter()
            .filter_map(|(_, media)| media.as_handle().cloned())
            .collect();

        let mut extras = vec![&self.extra];
        if let Some(anchor) = &self.style_anchor {
            extras.push(&anchor.extra);
        }
        extras.extend(self.script.iter().map(|cut| &cut.extra));
        extras.extend(self.assets.iter().map(|asset| &asset.extra));
        for map in extras {
            for value in map.values() {
                collect_json_handles(value, &mut handles);
            }
        }

        handles.sort();
        handles.dedup();
        handles
    }
}

fn collect_json_handles(value: &JsonValue, out: &mut Vec<BlobHandle>) {
    match value {
        JsonValue::String(s) if BlobHandle::is_handle(s) => {
            if let Ok(handle) = BlobHandle::parse(s) {
                out.push(handle);
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|v| collect_json_handles(v, out)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_json_handles(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlobKind;
    use serde_json::json;

    #[test]
    fn test_document_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "id": "p1",
            "lastModified": 10,
            "version": 2,
            "title": "Pilot",
            "aspectRatio": "16:9",
            "script": [
                {"id": 1, "dialogue": "hi", "finalImageUrl": "blob://images/p1-1-cut-final", "cameraAngle": "low"},
                {"id": "c2", "isConfirmed": true}
            ],
            "assets": [{"id": 5, "name": "Hero", "type": "character"}]
        });

        let doc: ProjectDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.extra.get("aspectRatio"), Some(&json!("16:9")));
        assert_eq!(doc.script[0].id, ItemId::Number(1));
        assert_eq!(doc.script[1].id, ItemId::Text("c2".into()));
        assert!(doc.script[1].confirmed);
        assert_eq!(doc.assets[0].kind.as_deref(), Some("character"));

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["script"][0]["cameraAngle"], json!("low"));
        assert_eq!(back["script"][0]["finalImageUrl"], json!("blob://images/p1-1-cut-final"));
    }

    #[test]
    fn test_media_slots_are_distinct_per_role() {
        let mut doc = ProjectDocument::new(ProjectId::new("p"), "t");
        let mut cut = ScriptCut::new(7);
        cut.final_image = Some(MediaRef::External("a".into()));
        cut.draft_images = vec![MediaRef::External("b".into()), MediaRef::External("c".into())];
        doc.script.push(cut);
        let mut asset = AssetDefinition::new(7, "Hero");
        asset.reference_image = Some(MediaRef::External("d".into()));
        doc.assets.push(asset);

        let slots: Vec<MediaSlot> = doc.media_slots().into_iter().map(|(slot, _)| slot).collect();
        assert_eq!(slots.len(), 4);
        let roles: Vec<&str> = slots.iter().map(|s| s.role.as_str()).collect();
        assert_eq!(roles, vec!["cut-final", "cut-draft-0", "cut-draft-1", "asset-reference"]);
        assert_eq!(doc.media_slots_mut().len(), 4);
    }

    #[test]
    fn test_blob_handles_include_extension_fields() {
        let mut doc = ProjectDocument::new(ProjectId::new("p"), "t");
        doc.thumbnail = Some(MediaRef::Blob(BlobHandle::new(BlobKind::Images, "p-doc-thumbnail")));
        doc.extra.insert(
            "researchBoard".into(),
            json!({"pins": ["blob://images/p-doc-pin", "https://x"]}),
        );
        let mut cut = ScriptCut::new(1);
        cut.final_image = Some(MediaRef::Blob(BlobHandle::new(BlobKind::Images, "p-doc-thumbnail")));
        doc.script.push(cut);

        let handles = doc.blob_handles();
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut doc = ProjectDocument::new(ProjectId::new("p"), "t");
        doc.last_modified = i64::MAX / 2;
        let before = doc.last_modified;
        doc.touch();
        assert!(doc.last_modified > before);
    }
}
