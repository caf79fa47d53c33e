use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Content to store under a key.
pub enum ObjectBody {
    Bytes(Bytes),
    /// Streamed from disk.
    File(PathBuf),
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ObjectBody::File(p) => write!(f, "File({})", p.display()),
            ObjectBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Overwrites any existing object under `key`.
    async fn put(&self, key: &str, body: ObjectBody) -> Result<(), StorageError>;

    /// Every key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Missing keys are not an error.
    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Download an object to a local path
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn put(&self, key: &str, body: ObjectBody) -> Result<(), StorageError> {
        (**self).put(key, body).await
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        (**self).list(prefix).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        (**self).delete_many(keys).await
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        (**self).download(key, local_path).await
    }
}
