//! Background comparison jobs: submission, execution, retry.
//!
//! ## Components
//!
//! - `SubmissionGateway`: validates uploads, creates `Queued` jobs, enqueues
//!   task messages; answers status/result queries from the job store
//! - `JobExecutor`: worker loops that claim jobs, run the comparison engine
//!   and write terminal state back
//! - `AttemptError`: transient vs permanent classification of a failed attempt
//!
//! Delivery is at-least-once, so the executor treats every message as a
//! possible duplicate and relies on the job store's atomic update to decide
//! whether it actually owns the job.

pub mod attempt;
pub mod executor;
pub mod gateway;

pub use attempt::AttemptError;
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, ProcessOutcome};
pub use gateway::{SubmissionGateway, SubmitError, Upload, UploadLimits, ValidationError};
