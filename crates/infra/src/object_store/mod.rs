//! Object Store: durable blob put/get keyed by opaque strings.
//!
//! The store is not job-aware; callers scope keys per job
//! (see [`ObjectKey::for_upload`](docdiff_core::ObjectKey::for_upload)).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use docdiff_core::ObjectKey;

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store backend error: {0}")]
    Backend(String),
}

impl ObjectStoreError {
    /// `true` when the object does not exist, as opposed to the store being unreachable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound(_))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object. Returns the key.
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError>;

    /// Download the object into `dest` and return `dest`.
    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError>;
}

#[async_trait]
impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError> {
        (**self).put(key, bytes).await
    }

    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError> {
        (**self).get(key, dest).await
    }
}
