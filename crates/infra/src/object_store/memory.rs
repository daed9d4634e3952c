//! In-memory object store for tests/dev.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use docdiff_core::ObjectKey;

use super::{ObjectStore, ObjectStoreError};

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectKey, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.read().map(|o| o.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> ObjectStoreError {
    ObjectStoreError::Backend("object store lock poisoned".to_string())
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError> {
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .insert(key.clone(), bytes);
        Ok(key.clone())
    }

    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError> {
        let bytes = self
            .objects
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.clone()))?;

        tokio::fs::write(dest, &bytes).await?;
        Ok(dest.to_path_buf())
    }
}
