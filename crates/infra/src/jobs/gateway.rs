//! Submission gateway and status projector.
//!
//! The only write path into the pipeline: validate, store inputs, create the
//! `Queued` job record, and only then enqueue its task message. Status and
//! result queries are pure reads of the job store.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use docdiff_core::{
    ComparisonResult, Job, JobId, JobInputs, JobStatus, JobTransition, JobView, ObjectKey, RetryPolicy, TaskMessage,
};
use docdiff_queue::{QueueError, TaskQueue};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::job_store::{JobStore, JobStoreError};
use crate::object_store::{ObjectStore, ObjectStoreError};

/// 50 MiB per file.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// One uploaded document, as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl Upload {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            bytes: bytes.into(),
        }
    }

    fn looks_like_pdf(&self) -> bool {
        let by_extension = self.filename.to_ascii_lowercase().ends_with(".pdf");
        let by_type = self
            .content_type
            .as_deref()
            .is_some_and(|t| t.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("application/pdf"));
        by_extension || by_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_bytes: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// Rejected submission. Nothing has been stored when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("two files are required")]
    MissingFiles,

    #[error("file {filename} is empty")]
    EmptyFile { filename: String },

    #[error("file {filename} is {size} bytes; the limit is {limit}")]
    TooLarge { filename: String, size: usize, limit: usize },

    #[error("file {filename} is not a PDF")]
    UnsupportedFormat { filename: String },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} is {status}; no result available")]
    NotCompleted { id: JobId, status: JobStatus },

    #[error("job store error: {0}")]
    Store(JobStoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("object store error: {0}")]
    Objects(#[from] ObjectStoreError),
}

impl From<JobStoreError> for SubmitError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => SubmitError::NotFound(id),
            other => SubmitError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct SubmissionGateway {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    max_attempts: u32,
    limits: UploadLimits,
}

impl SubmissionGateway {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            queue,
            objects,
            max_attempts: RetryPolicy::default().max_attempts,
            limits: UploadLimits::default(),
        }
    }

    /// Jobs submitted from here carry the policy's attempt bound on their record.
    pub fn with_retry_policy(mut self, policy: &RetryPolicy) -> Self {
        self.max_attempts = policy.max_attempts.max(1);
        self
    }

    pub fn with_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> UploadLimits {
        self.limits
    }

    pub fn validate(&self, upload: &Upload) -> Result<(), ValidationError> {
        if upload.bytes.is_empty() {
            return Err(ValidationError::EmptyFile {
                filename: upload.filename.clone(),
            });
        }
        if upload.bytes.len() > self.limits.max_bytes {
            return Err(ValidationError::TooLarge {
                filename: upload.filename.clone(),
                size: upload.bytes.len(),
                limit: self.limits.max_bytes,
            });
        }
        if !upload.looks_like_pdf() {
            return Err(ValidationError::UnsupportedFormat {
                filename: upload.filename.clone(),
            });
        }
        Ok(())
    }

    /// Validate and store both documents, then submit a job over them.
    #[instrument(skip_all, fields(left = %left.filename, right = %right.filename))]
    pub async fn submit_documents(&self, left: Upload, right: Upload) -> Result<JobView, SubmitError> {
        self.validate(&left)?;
        self.validate(&right)?;

        let id = JobId::new();
        let left_key = ObjectKey::for_upload(id, 1, &left.filename);
        let right_key = ObjectKey::for_upload(id, 2, &right.filename);

        self.objects.put(&left_key, left.bytes).await?;
        self.objects.put(&right_key, right.bytes).await?;

        self.submit_as(id, JobInputs::new(left_key, right_key)).await
    }

    /// Submit a job over inputs already in the object store.
    pub async fn submit(&self, inputs: JobInputs) -> Result<JobView, SubmitError> {
        self.submit_as(JobId::new(), inputs).await
    }

    async fn submit_as(&self, id: JobId, inputs: JobInputs) -> Result<JobView, SubmitError> {
        let now = Utc::now();
        let job = Job::new(id, inputs.clone(), self.max_attempts, now);

        // The record must exist before any worker can see the message.
        self.store.create(&job).await?;

        if let Err(e) = self.queue.enqueue(TaskMessage::new(id, inputs, now)).await {
            error!(job_id = %id, error = %e, "enqueue failed; failing job");
            let fail = JobTransition::Fail {
                attempt: 0,
                error: format!("could not schedule job: {e}"),
            };
            if let Err(store_err) = self.store.update(id, &fail).await {
                error!(job_id = %id, error = %store_err, "could not mark unscheduled job failed");
            }
            return Err(e.into());
        }

        info!(job_id = %id, status = %job.status, max_attempts = job.max_attempts, "job queued");
        Ok(JobView::from(&job))
    }

    /// Externally visible state of a job. Never mutates anything.
    pub async fn status(&self, id: JobId) -> Result<JobView, SubmitError> {
        let job = self.store.read(id).await?;
        Ok(JobView::from(&job))
    }

    /// The comparison result of a completed job.
    pub async fn result(&self, id: JobId) -> Result<ComparisonResult, SubmitError> {
        let job = self.store.read(id).await?;
        match (job.status, job.result) {
            (JobStatus::Completed, Some(result)) => Ok(result),
            (status, _) => Err(SubmitError::NotCompleted { id, status }),
        }
    }
}
