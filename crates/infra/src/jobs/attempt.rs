//! Outcome classification for one execution attempt.

use std::time::Duration;

use docdiff_engine::EngineError;
use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Why an attempt did not produce a result.
///
/// The executor retries `Transient` failures while attempts remain and fails
/// the job outright on `Permanent` ones. Anything not positively known to be
/// permanent is transient.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl AttemptError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, AttemptError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AttemptError::Transient(msg) | AttemptError::Permanent(msg) => msg,
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        AttemptError::Transient(format!("attempt timed out after {}s", after.as_secs_f64()))
    }
}

impl From<EngineError> for AttemptError {
    fn from(err: EngineError) -> Self {
        if err.is_permanent() {
            AttemptError::Permanent(err.to_string())
        } else {
            AttemptError::Transient(err.to_string())
        }
    }
}

/// Storage errors are all transient. A missing input may be a volume or
/// replica that has not caught up yet; the retry bound still ends the job.
impl From<ObjectStoreError> for AttemptError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(key) => AttemptError::Transient(format!("input document missing: {key}")),
            other => AttemptError::Transient(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        AttemptError::Transient(format!("IO error: {err}"))
    }
}
