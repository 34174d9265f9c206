//! Object storage for rendered previews.
//!
//! Keys are opaque slash-separated strings. Writes are not transactional
//! with the preview table, so readers must be ready for a blob to vanish
//! between a metadata read and a fetch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::speech::key::hex_digest;
use crate::speech::Bytes;

const META_SUFFIX: &str = ".meta.json";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),

    #[error("blob {0} already exists")]
    AlreadyExists(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("blob io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<BlobMeta, BlobError>;

    async fn get(&self, key: &str) -> Result<(Bytes, BlobMeta), BlobError>;

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<BlobMeta, BlobError>;

    /// First write wins: fails with `AlreadyExists` if the key is taken.
    async fn put_if_absent(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<BlobMeta, BlobError>;

    /// Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    content_type: String,
}

pub fn etag_for(data: &[u8]) -> String {
    hex_digest(&Sha256::digest(data))
}

/// Blob store on the local filesystem, one file per key.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty() || key.starts_with('/') || key.ends_with(META_SUFFIX) {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(BlobError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    async fn write_sidecar(path: &Path, etag: &str, content_type: &str) -> Result<(), BlobError> {
        let sidecar = Sidecar {
            etag: etag.to_string(),
            content_type: content_type.to_string(),
        };
        let json = serde_json::to_vec(&sidecar)
            .map_err(|e| BlobError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        tokio::fs::write(Self::sidecar_path(path), json).await?;
        Ok(())
    }

    async fn read_meta(&self, key: &str, path: &Path) -> Result<BlobMeta, BlobError> {
        let size = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return Err(BlobError::NotFound(key.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let sidecar = match tokio::fs::read(Self::sidecar_path(path)).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw).ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let sidecar = match sidecar {
            Some(s) => s,
            // written by something else, or a crash between the two writes
            None => Sidecar {
                etag: etag_for(&tokio::fs::read(path).await?),
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
            },
        };

        Ok(BlobMeta {
            key: key.to_string(),
            size,
            etag: sidecar.etag,
            content_type: sidecar.content_type,
        })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn head(&self, key: &str) -> Result<BlobMeta, BlobError> {
        let path = self.path_for(key)?;
        self.read_meta(key, &path).await
    }

    async fn get(&self, key: &str) -> Result<(Bytes, BlobMeta), BlobError> {
        let path = self.path_for(key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = self.read_meta(key, &path).await?;
        Ok((Bytes::from(data), meta))
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<BlobMeta, BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let etag = etag_for(&data);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data).await?;
        Self::write_sidecar(&path, &etag, content_type).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Stored blob {key} ({} bytes)", data.len());
        Ok(BlobMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag,
            content_type: content_type.to_string(),
        })
    }

    async fn put_if_absent(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<BlobMeta, BlobError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let etag = etag_for(&data);
        Self::write_sidecar(&path, &etag, content_type).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(BlobMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag,
            content_type: content_type.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(Self::sidecar_path(&path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_head_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let data = Bytes::from_static(b"jpeg-bytes");

        let put = store.put("ns/previews/doc/v.jpg", data.clone(), "image/jpeg").await.unwrap();
        assert_eq!(put.size, 10);
        assert_eq!(put.etag, etag_for(b"jpeg-bytes"));

        let head = store.head("ns/previews/doc/v.jpg").await.unwrap();
        assert_eq!(head, put);

        let (got, meta) = store.get("ns/previews/doc/v.jpg").await.unwrap();
        assert_eq!(got, data);
        assert_eq!(meta.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(store.head("a/b.jpg").await, Err(BlobError::NotFound(_))));
        assert!(matches!(store.get("a/b.jpg").await, Err(BlobError::NotFound(_))));
        assert!(!store.delete("a/b.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn put_if_absent_keeps_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store
            .put_if_absent("k.jpg", Bytes::from_static(b"first"), "image/jpeg")
            .await
            .unwrap();
        let second = store
            .put_if_absent("k.jpg", Bytes::from_static(b"second"), "image/jpeg")
            .await;
        assert!(matches!(second, Err(BlobError::AlreadyExists(_))));
        let (data, _) = store.get("k.jpg").await.unwrap();
        assert_eq!(&data[..], b"first");
    }

    #[tokio::test]
    async fn delete_removes_blob_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("x/y.jpg", Bytes::from_static(b"1"), "image/jpeg").await.unwrap();
        assert!(store.delete("x/y.jpg").await.unwrap());
        assert!(!dir.path().join("x/y.jpg.meta.json").exists());
        assert!(matches!(store.head("x/y.jpg").await, Err(BlobError::NotFound(_))));
    }

    #[test]
    fn rejects_escaping_keys() {
        let store = FsBlobStore::new("/srv/blobs");
        for key in ["", "/etc/passwd", "a/../b", "a//b", "./a", "a/b.meta.json"] {
            assert!(
                matches!(store.path_for(key), Err(BlobError::InvalidKey(_))),
                "{key}"
            );
        }
        assert_eq!(
            store.path_for("ns/previews/d/v.jpg").unwrap(),
            PathBuf::from("/srv/blobs/ns/previews/d/v.jpg")
        );
    }
}
