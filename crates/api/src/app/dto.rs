use chrono::{DateTime, Utc};
use serde::Serialize;

use docdiff_core::{JobId, JobStatus, JobView};

// -------------------------
// Response DTOs
// -------------------------

/// Body of a 202 answer to an upload.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&JobView> for SubmitResponse {
    fn from(view: &JobView) -> Self {
        Self {
            job_id: view.job_id,
            status: view.status,
            created_at: view.created_at,
        }
    }
}
