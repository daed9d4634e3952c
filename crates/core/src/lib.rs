//! `docdiff-core`: domain building blocks for the document comparison pipeline.
//!
//! This crate contains **pure domain** types (no IO, no async):
//! the job record and its state machine, the retry policy, the task message
//! carried by the queue, and the comparison result payload.

pub mod comparison;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod task;

pub use comparison::{ComparisonResult, Difference, DifferenceKind, DifferenceLocation, PageDifferences};
pub use error::DomainError;
pub use id::JobId;
pub use job::{
    Job, JobAttemptRecord, JobInputs, JobStatus, JobTransition, JobView, ObjectKey, TransitionError,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use task::TaskMessage;
