//! Directory-backed key/value backend with atomic writes.

use super::engine::{KvBackend, KvSpace};
use crate::core::{Result, VaultError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Never produced by `encode_key`, so temp files cannot shadow real keys.
const TMP_MARKER: &str = "%%tmp-";

/// One file per key under `root/{space}/`.
///
/// Writes go to a temp file that is synced and renamed over the target, so a
/// crash leaves either the old or the new value, never a torn one.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| VaultError::StorageUnavailable(format!("create {}: {}", root.display(), err)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn space_dir(&self, space: KvSpace) -> PathBuf {
        self.root.join(space.name())
    }

    fn key_path(&self, space: KvSpace, key: &str) -> PathBuf {
        self.space_dir(space).join(encode_key(key))
    }
}

/// Percent-encodes bytes outside `[A-Za-z0-9_.-]` so any key is a safe file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = name.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, space: KvSpace, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(space, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::IoError(err.to_string())),
        }
    }

    async fn put(&self, space: KvSpace, key: &str, value: Vec<u8>) -> Result<()> {
        let dir = self.space_dir(space);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| VaultError::StorageUnavailable(format!("create {}: {}", dir.display(), err)))?;

        let path = self.key_path(space, key);
        let file_name = encode_key(key);
        let tmp_path = dir.join(format!("{}{}{}", file_name, TMP_MARKER, Uuid::new_v4().simple()));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(|err| VaultError::IoError(err.to_string()))?;
        file.write_all(&value)
            .await
            .map_err(|err| VaultError::IoError(err.to_string()))?;
        file.sync_data()
            .await
            .map_err(|err| VaultError::IoError(err.to_string()))?;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VaultError::IoError(err.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, space: KvSpace, key: &str) -> Result<bool> {
        match fs::remove_file(self.key_path(space, key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VaultError::IoError(err.to_string())),
        }
    }

    async fn keys(&self, space: KvSpace) -> Result<Vec<String>> {
        let dir = self.space_dir(space);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(VaultError::IoError(err.to_string())),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| VaultError::IoError(err.to_string()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Leftovers of interrupted writes.
            if name.contains(TMP_MARKER) {
                continue;
            }
            if let Some(key) = decode_key(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, space: KvSpace, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.key_path(space, key)).await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BlobKind;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding_round_trip() {
        for key in ["project-abc", "a/b c", "..", "vault-state", "ünï"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert!(!encoded.starts_with('.'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn test_put_get_delete_and_keys() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).await.unwrap();

        backend.put(KvSpace::Documents, "project-1", b"one".to_vec()).await.unwrap();
        backend.put(KvSpace::Documents, "project-1", b"uno".to_vec()).await.unwrap();
        backend.put(KvSpace::Documents, "project/2", b"two".to_vec()).await.unwrap();
        backend
            .put(KvSpace::Blobs(BlobKind::Audio), "k", vec![9])
            .await
            .unwrap();

        assert_eq!(
            backend.get(KvSpace::Documents, "project-1").await.unwrap(),
            Some(b"uno".to_vec())
        );
        assert_eq!(
            backend.keys(KvSpace::Documents).await.unwrap(),
            vec!["project-1".to_string(), "project/2".to_string()]
        );
        assert!(backend.contains(KvSpace::Blobs(BlobKind::Audio), "k").await.unwrap());

        assert!(backend.delete(KvSpace::Documents, "project-1").await.unwrap());
        assert_eq!(backend.get(KvSpace::Documents, "project-1").await.unwrap(), None);
        assert!(backend.keys(KvSpace::Backups).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_write_leftovers_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).await.unwrap();
        backend.put(KvSpace::Documents, "project-1", b"{}".to_vec()).await.unwrap();

        let stray = temp_dir
            .path()
            .join("documents")
            .join(format!("project-2{}deadbeef", TMP_MARKER));
        std::fs::write(&stray, b"partial").unwrap();

        assert_eq!(
            backend.keys(KvSpace::Documents).await.unwrap(),
            vec!["project-1".to_string()]
        );
    }
}
