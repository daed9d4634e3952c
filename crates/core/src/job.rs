//! The job record and its lifecycle state machine.
//!
//! ```text
//! Queued ──start──▶ Processing ──complete──▶ Completed
//!   ▲                 │   │
//!   └─────retry───────┘   └──────fail──────▶ Failed
//! ```
//!
//! `Processing ─start─▶ Processing` is allowed only once the processing lease
//! has expired (the previous owner is presumed dead). Outcome transitions name
//! the attempt they settle, so a presumed-dead owner that wakes up later cannot
//! overwrite the attempt that took over. `Completed` and `Failed` are absorbing:
//! every transition out of them is refused.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comparison::ComparisonResult;
use crate::error::DomainError;
use crate::id::JobId;

/// Externally visible lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque object-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    const MAX_LEN: usize = 1024;

    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        if key.is_empty() {
            return Err(DomainError::validation("object key must not be empty"));
        }
        if key.len() > Self::MAX_LEN {
            return Err(DomainError::validation("object key is too long"));
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return Err(DomainError::validation(format!("object key {key:?} is not a relative path")));
        }
        Ok(Self(key))
    }

    /// Key for the `slot`-th uploaded document of a job: `{job_id}/{slot}-{filename}`.
    pub fn for_upload(job_id: JobId, slot: u8, filename: &str) -> Self {
        Self(format!("{}/{}-{}", job_id, slot, sanitize_filename(filename)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce a client-supplied filename to a safe basename.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned.chars().take(200).collect()
    }
}

/// Ordered pair of documents being compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInputs {
    pub left: ObjectKey,
    pub right: ObjectKey,
}

impl JobInputs {
    pub fn new(left: ObjectKey, right: ObjectKey) -> Self {
        Self { left, right }
    }
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A state change requested against a stored job.
///
/// Stores apply these through [`Job::apply`] inside their atomic
/// read-modify-write, so a refused transition never overwrites anything.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// `Queued | Processing(lease expired) → Processing`, `attempt_count += 1`.
    Start { lease: Duration },
    /// `Processing → Completed`.
    Complete { attempt: u32, result: ComparisonResult },
    /// `Processing → Queued`; the message is redelivered at `retry_at`.
    Retry {
        attempt: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    /// `Queued | Processing → Failed`.
    Fail { attempt: u32, error: String },
}

impl JobTransition {
    pub fn name(&self) -> &'static str {
        match self {
            JobTransition::Start { .. } => "start",
            JobTransition::Complete { .. } => "complete",
            JobTransition::Retry { .. } => "retry",
            JobTransition::Fail { .. } => "fail",
        }
    }

    /// The attempt an outcome transition settles; `None` for `Start`.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            JobTransition::Start { .. } => None,
            JobTransition::Complete { attempt, .. }
            | JobTransition::Retry { attempt, .. }
            | JobTransition::Fail { attempt, .. } => Some(*attempt),
        }
    }
}

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobStatus),

    #[error("job is being processed under a lease held until {until}")]
    LeaseHeld { until: DateTime<Utc> },

    #[error("job has used all {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("attempt {attempt} was superseded by attempt {current}")]
    StaleAttempt { attempt: u32, current: u32 },

    #[error("cannot {transition} a job that is {from}")]
    Invalid {
        from: JobStatus,
        transition: &'static str,
    },
}

/// Durable state of one comparison request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub inputs: JobInputs,
    /// Attempts started so far; never decreases, never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on entering `Completed` or `Failed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Present iff `status == Completed`.
    pub result: Option<ComparisonResult>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    /// Most recent transient failure while the job is still being retried.
    pub last_error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
    /// Absolute expiry; refreshed by the store on every write.
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job (`Queued`, no attempts).
    pub fn new(id: JobId, inputs: JobInputs, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            inputs,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            last_error: None,
            lease_expires_at: None,
            attempt_started_at: None,
            next_attempt_at: None,
            history: Vec::new(),
            expires_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Push the expiry out to `now + ttl`.
    pub fn refresh_expiry(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    }

    /// Apply a transition, or refuse it without touching the record.
    pub fn apply(&mut self, transition: &JobTransition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if let Some(attempt) = transition.attempt() {
            if attempt != self.attempt_count {
                return Err(TransitionError::StaleAttempt {
                    attempt,
                    current: self.attempt_count,
                });
            }
        }

        match transition {
            JobTransition::Start { lease } => {
                if self.status == JobStatus::Processing {
                    if let Some(until) = self.lease_expires_at.filter(|until| *until > now) {
                        return Err(TransitionError::LeaseHeld { until });
                    }
                }
                if !self.attempts_remaining() {
                    return Err(TransitionError::AttemptsExhausted {
                        attempts: self.attempt_count,
                    });
                }

                if self.status == JobStatus::Processing {
                    self.record_attempt(now, false, Some("attempt abandoned: lease expired".to_string()));
                }

                self.status = JobStatus::Processing;
                self.attempt_count += 1;
                self.attempt_started_at = Some(now);
                self.lease_expires_at =
                    Some(now + chrono::Duration::from_std(*lease).unwrap_or(chrono::Duration::MAX));
                self.next_attempt_at = None;
            }
            JobTransition::Complete { result, .. } => {
                self.require_processing(transition)?;
                self.record_attempt(now, true, None);

                self.status = JobStatus::Completed;
                self.result = Some(result.clone());
                self.error = None;
                self.last_error = None;
                self.completed_at = Some(now);
                self.lease_expires_at = None;
            }
            JobTransition::Retry { error, retry_at, .. } => {
                self.require_processing(transition)?;
                if !self.attempts_remaining() {
                    return Err(TransitionError::AttemptsExhausted {
                        attempts: self.attempt_count,
                    });
                }
                self.record_attempt(now, false, Some(error.clone()));

                self.status = JobStatus::Queued;
                self.last_error = Some(error.clone());
                self.next_attempt_at = Some(*retry_at);
                self.lease_expires_at = None;
            }
            JobTransition::Fail { error, .. } => {
                if self.status == JobStatus::Processing {
                    self.record_attempt(now, false, Some(error.clone()));
                }

                self.status = JobStatus::Failed;
                self.error = Some(error.clone());
                self.result = None;
                self.completed_at = Some(now);
                self.lease_expires_at = None;
                self.next_attempt_at = None;
            }
        }

        self.updated_at = now.max(self.updated_at);
        Ok(())
    }

    fn require_processing(&self, transition: &JobTransition) -> Result<(), TransitionError> {
        if self.status == JobStatus::Processing {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.status,
                transition: transition.name(),
            })
        }
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, success: bool, error: Option<String>) {
        let started_at = self.attempt_started_at.take().unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt_count,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Read-only projection of a job, as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ComparisonResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            attempt_count: job.attempt_count,
            result: job.result.clone().filter(|_| job.status == JobStatus::Completed),
            error: job.error.clone().filter(|_| job.status == JobStatus::Failed),
        }
    }
}
