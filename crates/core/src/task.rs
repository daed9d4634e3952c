use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::JobInputs;

/// Payload carried by the task queue: "run job X on inputs Y".
///
/// Inputs ride along so a worker can log what it is about to fetch before it
/// has read the job record; the record remains the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub inputs: JobInputs,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(job_id: JobId, inputs: JobInputs, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            inputs,
            enqueued_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
