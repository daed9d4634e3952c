//! Job Store: durable, TTL-bounded record of job state.
//!
//! All mutation goes through [`JobStore::update`], an atomic
//! read-modify-write that applies a [`JobTransition`] with [`Job::apply`].
//! A transition the stored record refuses (terminal job, live lease, attempts
//! used up) surfaces as [`JobStoreError::Conflict`] and leaves the record
//! untouched; that is what makes redelivered task messages harmless.
//!
//! Every successful write refreshes the record's TTL from the moment of the
//! write. An expired record reads as `NotFound` regardless of its status.

use std::sync::Arc;

use async_trait::async_trait;
use docdiff_core::{Job, JobId, JobTransition, TransitionError};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use redis::RedisJobStore;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflicting update for job {id}: {reason}")]
    Conflict { id: JobId, reason: TransitionError },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn read(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Atomically apply `transition` to the stored record and return the new state.
    async fn update(&self, id: JobId, transition: &JobTransition) -> Result<Job, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn read(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).read(id).await
    }

    async fn update(&self, id: JobId, transition: &JobTransition) -> Result<Job, JobStoreError> {
        (**self).update(id, transition).await
    }
}
