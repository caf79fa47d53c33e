use crate::ports::storage::{ObjectBody, ObjectStore, StorageError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use uuid::Uuid;

const PARTIAL_MARKER: &str = ".partial-";

/// Object store rooted in a local directory. Keys map to relative paths.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with('/')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    async fn write_body(path: &Path, body: ObjectBody) -> Result<(), StorageError> {
        match body {
            ObjectBody::Bytes(bytes) => tokio::fs::write(path, &bytes).await?,
            ObjectBody::File(source) => {
                tokio::fs::copy(&source, path).await?;
            }
            ObjectBody::Stream(stream) => {
                let mut reader = StreamReader::new(stream);
                let mut writer = BufWriter::new(File::create(path).await?);
                tokio::io::copy(&mut reader, &mut writer).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: ObjectBody) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Readers never see a half-written object.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = path.with_file_name(format!("{}{}{}", file_name, PARTIAL_MARKER, Uuid::new_v4()));
        if let Err(e) = Self::write_body(&partial, body).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError> {
        // Walk only the deepest directory the prefix pins down.
        let dir_part = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut keys = BTreeSet::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().contains(PARTIAL_MARKER) {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.insert(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // Drop the directory once it is empty; failure just means it is not.
            if let Some(parent) = path.parent() {
                if parent != self.root {
                    let _ = tokio::fs::remove_dir(parent).await;
                }
            }
        }
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&path, local_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
