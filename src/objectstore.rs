//! Content-addressed object storage.
//!
//! Keys are deterministic: `{tenant}/{YYYY}/{MM}/{sha256}.{ext}`. Storing the
//! same bytes for the same tenant twice yields the same key, and the store
//! returns the existing metadata instead of rewriting.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub file_name: String,
    pub tenant_id: String,
    pub mime_type: String,
    pub deduplicated: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under the content-addressed key. Returns existing metadata
    /// when an object already lives at the computed key.
    async fn store(
        &self,
        tenant_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StorageError>;

    /// Store bytes under an explicit key (export archives, extracted text).
    async fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Presigned read URL valid for `ttl`.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Extension taken from the original filename; empty extension means no
/// suffix on the key.
fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn object_key(tenant_id: &str, sha256: &str, file_name: &str) -> String {
    let now = Utc::now();
    let base = format!("{}/{:04}/{:02}/{}", tenant_id, now.year(), now.month(), sha256);
    match extension_of(file_name) {
        Some(ext) if !ext.is_empty() => format!("{base}.{ext}"),
        _ => base,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    file_name: String,
    sha256: String,
    tenant_id: String,
    mime_type: String,
    size_bytes: u64,
}

/// Filesystem-backed store. Writes are atomic (`.tmp` + rename) so readers
/// never observe partial objects.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }
        let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.tmp"),
            None => "tmp".to_string(),
        });
        std::fs::write(&tmp, bytes).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn store(
        &self,
        tenant_id: &str,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StorageError> {
        let sha256 = sha256_hex(bytes);
        let key = object_key(tenant_id, &sha256, file_name);
        let path = self.path_for(&key);

        if path.exists() {
            debug!(key = %key, "object already stored, returning existing metadata");
            return Ok(StoredObject {
                key,
                sha256,
                size_bytes: bytes.len() as u64,
                file_name: file_name.to_string(),
                tenant_id: tenant_id.to_string(),
                mime_type: mime_type.to_string(),
                deduplicated: true,
            });
        }

        self.write_atomic(&path, bytes)?;
        let meta = ObjectMeta {
            file_name: file_name.to_string(),
            sha256: sha256.clone(),
            tenant_id: tenant_id.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: bytes.len() as u64,
        };
        let meta_path = self.path_for(&format!("{key}.meta.json"));
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        self.write_atomic(&meta_path, &meta_bytes)?;

        Ok(StoredObject {
            key,
            sha256,
            size_bytes: bytes.len() as u64,
            file_name: file_name.to_string(),
            tenant_id: tenant_id.to_string(),
            mime_type: mime_type.to_string(),
            deduplicated: false,
        })
    }

    async fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.write_atomic(&self.path_for(key), bytes)
    }

    async fn retrieve(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key).exists())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                std::fs::remove_file(self.path_for(&format!("{key}.meta.json"))).ok();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("file://{}?expires={}", path.display(), expires))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_bytes_same_tenant_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let first = store
            .store("t1", "order.pdf", "application/pdf", b"pdf-bytes")
            .await
            .unwrap();
        let second = store
            .store("t1", "order.pdf", "application/pdf", b"pdf-bytes")
            .await
            .unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(first.sha256, second.sha256);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
    }

    #[tokio::test]
    async fn key_carries_tenant_date_hash_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let stored = store
            .store("t1", "Bestellung.XLSX", "application/vnd.ms-excel", b"xlsx")
            .await
            .unwrap();
        assert!(stored.key.starts_with("t1/"));
        assert!(stored.key.ends_with(&format!("{}.xlsx", stored.sha256)));
    }

    #[tokio::test]
    async fn retrieve_round_trip_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let stored = store.store("t1", "a.csv", "text/csv", b"a;b;c").await.unwrap();
        assert_eq!(store.retrieve(&stored.key).await.unwrap(), b"a;b;c");
        assert!(matches!(
            store.retrieve("t1/none").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn presign_embeds_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let stored = store.store("t1", "a.csv", "text/csv", b"x").await.unwrap();
        let url = store
            .presign(&stored.key, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("expires="));
    }

    #[tokio::test]
    async fn no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.store("t1", "a.csv", "text/csv", b"x").await.unwrap();
        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(p) = stack.pop() {
            for entry in std::fs::read_dir(&p).unwrap() {
                let entry = entry.unwrap();
                if entry.path().is_dir() {
                    stack.push(entry.path());
                } else {
                    assert!(!entry.path().to_string_lossy().ends_with(".tmp"));
                }
            }
        }
    }
}
