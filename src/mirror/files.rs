use crate::core::{Result, VaultError};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
    ("image/svg+xml", "svg"),
    ("image/avif", "avif"),
    ("image/bmp", "bmp"),
    ("audio/mpeg", "mp3"),
    ("audio/wav", "wav"),
    ("audio/ogg", "ogg"),
    ("audio/webm", "weba"),
    ("audio/aac", "aac"),
    ("audio/mp4", "m4a"),
    ("audio/flac", "flac"),
    ("video/quicktime", "mov"),
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
    ("application/json", "json"),
    ("application/pdf", "pdf"),
];

pub fn extension_for(mime: &str) -> &'static str {
    let mime = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match mime.as_str() {
        "image/jpg" => "jpg",
        "audio/x-wav" | "audio/wave" => "wav",
        "audio/mp3" => "mp3",
        other => MIME_EXTENSIONS
            .iter()
            .find(|(m, _)| *m == other)
            .map(|(_, ext)| *ext)
            .unwrap_or("bin"),
    }
}

pub fn mime_for(extension: &str) -> &'static str {
    let extension = extension.to_ascii_lowercase();
    match extension.as_str() {
        "jpeg" => "image/jpeg",
        other => MIME_EXTENSIONS
            .iter()
            .find(|(_, ext)| *ext == other)
            .map(|(mime, _)| *mime)
            .unwrap_or("application/octet-stream"),
    }
}

/// Extension of the sidecar file holding an asset's exact MIME type.
pub const MIME_SIDECAR_EXT: &str = "mime";

/// The MIME type to record beside an asset whose extension would not give it
/// back on restore.
pub fn mime_sidecar(mime: &str) -> Option<&str> {
    (mime_for(extension_for(mime)) != mime).then_some(mime)
}

/// Reads a sidecar body; blank content means no override.
pub fn parse_mime_sidecar(bytes: &[u8]) -> Option<String> {
    let mime = String::from_utf8_lossy(bytes).trim().to_string();
    (!mime.is_empty()).then_some(mime)
}

/// Writes through a temp file in the same directory and renames it in place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| VaultError::IoError(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| VaultError::IoError(format!("invalid file name {}", path.display())))?;
    let tmp_path = dir.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4().simple()));

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mime_extension_mapping() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("IMAGE/JPEG; q=1"), "jpg");
        assert_eq!(extension_for("application/x-unknown"), "bin");
        assert_eq!(mime_for("png"), "image/png");
        assert_eq!(mime_for("JPEG"), "image/jpeg");
        assert_eq!(mime_for("bin"), "application/octet-stream");
        assert_eq!(mime_for(extension_for("audio/aac")), "audio/aac");
    }

    #[test]
    fn test_sidecar_only_for_lossy_extensions() {
        assert_eq!(mime_sidecar("image/png"), None);
        assert_eq!(mime_sidecar("audio/x-wav"), Some("audio/x-wav"));
        assert_eq!(mime_sidecar("model/gltf-binary"), Some("model/gltf-binary"));
        assert_eq!(parse_mime_sidecar(b" model/gltf-binary\n"), Some("model/gltf-binary".to_string()));
        assert_eq!(parse_mime_sidecar(b"  "), None);
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a/b/file.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
