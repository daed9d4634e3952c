//! Filesystem object store: one file per key under a root directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use docdiff_core::ObjectKey;
use tracing::debug;

use super::{ObjectStore, ObjectStoreError};

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path, refusing anything that would leave the root.
    fn resolve(&self, key: &ObjectKey) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(key.as_str());
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(ObjectStoreError::Backend(format!("key {key} escapes the store root")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension(format!("partial-{}", uuid::Uuid::now_v7()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, size = bytes.len(), "object stored");
        Ok(key.clone())
    }

    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::copy(&path, dest).await {
            Ok(_) => Ok(dest.to_path_buf()),
            // NotFound may also mean the destination directory is gone.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                    Err(e.into())
                } else {
                    Err(ObjectStoreError::NotFound(key.clone()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
