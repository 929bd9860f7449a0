use super::{Result, VaultError};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use chrono::Utc;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// URL scheme used by blob handles (`blob://images/<key>`).
pub const BLOB_SCHEME: &str = "blob";

/// Storage key prefix for full project documents.
pub const PROJECT_KEY_PREFIX: &str = "project-";

const MAX_KEY_LEN: usize = 160;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh id that cannot collide with an existing project.
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("proj_{}_{}", Utc::now().timestamp_millis(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}", PROJECT_KEY_PREFIX, self.0)
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.strip_prefix(PROJECT_KEY_PREFIX)
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }

    /// Key component naming this project; never contains the `-` separator
    /// and differs for every distinct id.
    pub fn key_component(&self) -> String {
        encode_component(&self.0)
    }

    /// Prefix shared by every blob key owned by this project.
    pub fn blob_key_prefix(&self) -> String {
        format!("{}-", self.key_component())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity of an item inside an ordered collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl ItemId {
    /// Key component for this item. Numbers render as digits (`m` for a
    /// leading minus) and text ids as `t` plus their escaped form, so the two
    /// variants never meet and neither meets the fixed `doc`/`style` slots.
    pub fn key_part(&self) -> String {
        match self {
            Self::Number(n) if *n < 0 => format!("m{}", n.unsigned_abs()),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => format!("t{}", encode_component(s)),
        }
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

// ============================================================================
// Blob addressing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    Images,
    Audio,
    Assets,
}

impl BlobKind {
    pub const ALL: [BlobKind; 3] = [BlobKind::Images, BlobKind::Audio, BlobKind::Assets];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Audio => "audio",
            Self::Assets => "assets",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Images
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Assets
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlobKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "images" => Ok(Self::Images),
            "audio" => Ok(Self::Audio),
            "assets" => Ok(Self::Assets),
            other => Err(VaultError::InvalidHandle(format!("unknown blob kind '{}'", other))),
        }
    }
}

/// Opaque reference to a stored blob, rendered as `blob://{kind}/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle {
    pub kind: BlobKind,
    pub key: String,
}

impl BlobHandle {
    pub fn new(kind: BlobKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix(BLOB_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| VaultError::InvalidHandle(raw.to_string()))?;
        let (kind, key) = rest
            .split_once('/')
            .ok_or_else(|| VaultError::InvalidHandle(raw.to_string()))?;
        if key.is_empty() {
            return Err(VaultError::InvalidHandle(raw.to_string()));
        }
        Ok(Self::new(kind.parse()?, key))
    }

    pub fn is_handle(raw: &str) -> bool {
        raw.starts_with(BLOB_SCHEME) && raw[BLOB_SCHEME.len()..].starts_with("://")
    }

    pub fn belongs_to(&self, project_id: &ProjectId) -> bool {
        self.key.starts_with(&project_id.blob_key_prefix())
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", BLOB_SCHEME, self.kind, self.key)
    }
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Over-long keys are truncated and suffixed with a digest of the full input
/// so distinct inputs stay distinct.
pub fn sanitize_key(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.len() <= MAX_KEY_LEN {
        return cleaned;
    }

    let hex = short_digest(raw);
    format!("{}_{}", &cleaned[..MAX_KEY_LEN - hex.len() - 1], hex)
}

const MAX_COMPONENT_LEN: usize = 64;

/// Escapes `raw` into `[A-Za-z0-9_]`: `_` becomes `__` and every other
/// byte outside the alphabet becomes `_xx` (lowercase hex). Distinct inputs
/// give distinct outputs; over-long results keep a prefix plus `_z` and a
/// digest of the raw input.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'_' => out.push_str("__"),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => out.push_str(&format!("_{:02x}", b)),
        }
    }
    if out.len() <= MAX_COMPONENT_LEN {
        return out;
    }
    let digest = short_digest(raw);
    let keep = MAX_COMPONENT_LEN - digest.len() - 2;
    format!("{}_z{}", &out[..keep], digest)
}

fn short_digest(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Deterministic blob key for the artifact `role` of `item` in `project`.
pub fn blob_key(project: &ProjectId, item: &str, role: &str) -> String {
    sanitize_key(&format!("{}-{}-{}", project.key_component(), item, role))
}

/// Binary payload stored in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub mime: String,
    #[serde(with = "raw_bytes")]
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self { mime: mime.into(), data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Re-encodes the payload as a `data:` URL.
    pub fn to_inline(&self) -> InlineMedia {
        InlineMedia::from_bytes(self.mime.clone(), &self.data)
    }
}

/// Encodes `Vec<u8>` as a MessagePack bin instead of an integer array.
mod raw_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

// ============================================================================
// Media references
// ============================================================================

/// How a `data:` literal carries its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineEncoding {
    /// `data:{mime};base64,{payload}`
    Base64,
    /// `data:{mime},{payload}` with `%xx` escapes.
    Percent,
}

/// A `data:` literal embedded in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineMedia {
    /// Media type plus any parameters, e.g. `image/svg+xml;utf8`.
    pub mime: String,
    pub encoding: InlineEncoding,
    pub encoded: String,
}

impl InlineMedia {
    /// Parses a data URL, taking ownership of the payload without copying it.
    pub fn parse(mut raw: String) -> std::result::Result<Self, String> {
        let Some(comma) = raw.find(',') else {
            return Err(raw);
        };
        let header = &raw[..comma];
        let Some(meta) = header.strip_prefix("data:") else {
            return Err(raw);
        };
        let (mime, encoding) = match meta.strip_suffix(";base64") {
            Some(mime) => (mime, InlineEncoding::Base64),
            None => (meta, InlineEncoding::Percent),
        };
        let mime = match (mime.is_empty(), encoding) {
            (false, _) => mime.to_string(),
            (true, InlineEncoding::Base64) => "application/octet-stream".to_string(),
            (true, InlineEncoding::Percent) => "text/plain".to_string(),
        };
        let encoded = raw.split_off(comma + 1);
        Ok(Self { mime, encoding, encoded })
    }

    pub fn from_bytes(mime: impl Into<String>, data: &[u8]) -> Self {
        Self {
            mime: mime.into(),
            encoding: InlineEncoding::Base64,
            encoded: BASE64_STANDARD.encode(data),
        }
    }

    /// Length of the literal as stored in the document.
    pub fn literal_len(&self) -> usize {
        let marker = match self.encoding {
            InlineEncoding::Base64 => ";base64".len(),
            InlineEncoding::Percent => 0,
        };
        "data:,".len() + self.mime.len() + marker + self.encoded.len()
    }

    /// The media type without parameters.
    pub fn media_type(&self) -> &str {
        self.mime.split(';').next().unwrap_or("").trim()
    }

    pub fn kind(&self) -> BlobKind {
        BlobKind::from_mime(self.media_type())
    }

    pub fn decode(&self) -> Result<Blob> {
        let data = match self.encoding {
            InlineEncoding::Base64 => BASE64_STANDARD
                .decode(self.encoded.as_bytes())
                .map_err(|err| VaultError::InvalidInlineMedia(err.to_string()))?,
            InlineEncoding::Percent => percent_decode(&self.encoded)?,
        };
        Ok(Blob::new(self.media_type(), data))
    }
}

fn percent_decode(raw: &str) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'%' {
            out.push(bytes[idx]);
            idx += 1;
            continue;
        }
        let byte = bytes
            .get(idx + 1..idx + 3)
            .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| VaultError::InvalidInlineMedia(format!("bad percent escape at byte {}", idx)))?;
        out.push(byte);
        idx += 3;
    }
    Ok(out)
}

impl fmt::Display for InlineMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encoding {
            InlineEncoding::Base64 => write!(f, "data:{};base64,{}", self.mime, self.encoded),
            InlineEncoding::Percent => write!(f, "data:{},{}", self.mime, self.encoded),
        }
    }
}

/// A media-bearing document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    Inline(InlineMedia),
    Blob(BlobHandle),
    /// Any other URL; passed through untouched. Includes `data:` strings
    /// too malformed to parse.
    External(String),
}

impl MediaRef {
    pub fn parse(raw: String) -> Self {
        if BlobHandle::is_handle(&raw) {
            return match BlobHandle::parse(&raw) {
                Ok(handle) => Self::Blob(handle),
                Err(_) => Self::External(raw),
            };
        }
        if raw.starts_with("data:") {
            return match InlineMedia::parse(raw) {
                Ok(inline) => Self::Inline(inline),
                Err(raw) => Self::External(raw),
            };
        }
        Self::External(raw)
    }

    pub fn as_handle(&self) -> Option<&BlobHandle> {
        match self {
            Self::Blob(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::External(url) if url.is_empty())
    }

    /// Length of an embedded literal, whether or not it parsed; `None` for
    /// handles and ordinary URLs.
    pub fn inline_len(&self) -> Option<usize> {
        match self {
            Self::Inline(inline) => Some(inline.literal_len()),
            Self::External(raw) if raw.starts_with("data:") => Some(raw.len()),
            _ => None,
        }
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(inline) => inline.fmt(f),
            Self::Blob(handle) => handle.fmt(f),
            Self::External(url) => f.write_str(url),
        }
    }
}

impl Serialize for MediaRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MediaRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_parse_and_display() {
        let handle = BlobHandle::parse("blob://images/proj_1-7-cut-final").unwrap();
        assert_eq!(handle.kind, BlobKind::Images);
        assert_eq!(handle.key, "proj_1-7-cut-final");
        assert_eq!(handle.to_string(), "blob://images/proj_1-7-cut-final");

        assert!(BlobHandle::parse("blob://videos/x").is_err());
        assert!(BlobHandle::parse("https://example.com/a.png").is_err());
        assert!(BlobHandle::parse("blob://images/").is_err());
    }

    #[test]
    fn test_blob_key_is_deterministic_and_sanitized() {
        let project = ProjectId::new("proj/1");
        let a = blob_key(&project, "7", "cut-final");
        let b = blob_key(&project, "7", "cut-final");
        assert_eq!(a, b);
        assert_eq!(a, "proj_2f1-7-cut-final");
        assert_eq!(sanitize_key(&a), a);
        assert!(BlobHandle::new(BlobKind::Images, a).belongs_to(&project));
    }

    #[test]
    fn test_project_namespaces_never_alias() {
        let ids = ["a-b", "a_b", "a.b", "a/b", "a__b", "a_2db", "ab"];
        let prefixes: std::collections::HashSet<String> =
            ids.iter().map(|id| ProjectId::new(*id).blob_key_prefix()).collect();
        assert_eq!(prefixes.len(), ids.len());

        let plain = ProjectId::new("a_b");
        let dashed = ProjectId::new("a-b");
        let key = blob_key(&plain, "1", "cut-final");
        assert!(BlobHandle::new(BlobKind::Images, key.clone()).belongs_to(&plain));
        assert!(!BlobHandle::new(BlobKind::Images, key).belongs_to(&dashed));
    }

    #[test]
    fn test_long_project_ids_keep_their_prefix() {
        let a = ProjectId::new("x".repeat(300));
        let b = ProjectId::new(format!("{}y", "x".repeat(299)));
        assert_ne!(a.blob_key_prefix(), b.blob_key_prefix());
        let key = blob_key(&a, &"i".repeat(200), "cut-final");
        assert!(key.len() <= MAX_KEY_LEN);
        assert!(BlobHandle::new(BlobKind::Images, key).belongs_to(&a));
    }

    #[test]
    fn test_item_key_parts_separate_variants() {
        assert_eq!(ItemId::Number(1).key_part(), "1");
        assert_eq!(ItemId::Number(-1).key_part(), "m1");
        assert_eq!(ItemId::from("1").key_part(), "t1");
        assert_eq!(ItemId::from("doc").key_part(), "tdoc");
        assert_ne!(ItemId::from("a-b").key_part(), ItemId::from("a_b").key_part());
    }

    #[test]
    fn test_long_keys_are_shortened_without_collisions() {
        let project = ProjectId::new("p");
        let long_a = "a".repeat(400);
        let long_b = format!("{}b", "a".repeat(399));
        let a = blob_key(&project, &long_a, "r");
        let b = blob_key(&project, &long_b, "r");
        assert!(a.len() <= MAX_KEY_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_media_ref_classification() {
        let inline = MediaRef::parse("data:image/png;base64,AAAA".to_string());
        assert!(matches!(inline, MediaRef::Inline(ref m) if m.mime == "image/png"));
        assert_eq!(inline.to_string(), "data:image/png;base64,AAAA");

        let handle = MediaRef::parse("blob://audio/k".to_string());
        assert!(handle.as_handle().is_some());

        let svg = MediaRef::parse("data:image/svg+xml;utf8,<svg/>".to_string());
        assert!(matches!(svg, MediaRef::Inline(ref m) if m.encoding == InlineEncoding::Percent));
        assert_eq!(svg.to_string(), "data:image/svg+xml;utf8,<svg/>");
        assert_eq!(svg.inline_len(), Some("data:image/svg+xml;utf8,<svg/>".len()));

        let broken = MediaRef::parse("data:image/png;base64".to_string());
        assert!(matches!(broken, MediaRef::External(_)));
        assert_eq!(broken.inline_len(), Some(broken.to_string().len()));

        let url = MediaRef::parse("https://cdn/x.png".to_string());
        assert!(matches!(url, MediaRef::External(_)));
    }

    #[test]
    fn test_inline_decode_round_trip() {
        let inline = InlineMedia::from_bytes("audio/mpeg", &[1, 2, 3, 250]);
        let blob = inline.decode().unwrap();
        assert_eq!(blob.data, vec![1, 2, 3, 250]);
        assert_eq!(inline.kind(), BlobKind::Audio);
        assert_eq!(blob.to_inline(), inline);
    }

    #[test]
    fn test_percent_encoded_literal_decodes() {
        let inline = InlineMedia::parse("data:image/svg+xml;charset=utf-8,%3Csvg%2F%3E".to_string()).unwrap();
        assert_eq!(inline.kind(), BlobKind::Images);
        assert_eq!(inline.literal_len(), inline.to_string().len());
        let blob = inline.decode().unwrap();
        assert_eq!(blob.mime, "image/svg+xml");
        assert_eq!(blob.data, b"<svg/>".to_vec());

        let bad = InlineMedia::parse("data:text/plain,100%zz".to_string()).unwrap();
        assert!(matches!(bad.decode(), Err(VaultError::InvalidInlineMedia(_))));
    }

    #[test]
    fn test_blob_record_messagepack() {
        let blob = Blob::new("image/png", vec![0u8, 200, 255]);
        let bytes = rmp_serde::to_vec(&blob).unwrap();
        let decoded: Blob = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_project_storage_key() {
        let id = ProjectId::new("abc");
        assert_eq!(id.storage_key(), "project-abc");
        assert_eq!(ProjectId::from_storage_key("project-abc"), Some(id));
        assert_eq!(ProjectId::from_storage_key("vault-state"), None);
        assert_eq!(ProjectId::from_storage_key("project-"), None);
    }
}
