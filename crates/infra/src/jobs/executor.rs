//! Job executor: drives dequeued task messages through the job state machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use docdiff_core::{ComparisonResult, Job, JobInputs, JobTransition, RetryPolicy, TransitionError};
use docdiff_engine::ComparisonEngine;
use docdiff_queue::{AckHandle, Delivery, QueueError, TaskQueue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::attempt::AttemptError;
use crate::job_store::{JobStore, JobStoreError};
use crate::object_store::ObjectStore;

/// Margin added to the attempt timeout to form the processing lease.
pub const DEFAULT_LEASE_SLACK: Duration = Duration::from_secs(30);

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Name for logging
    pub name: String,
    /// Concurrent worker loops
    pub concurrency: usize,
    /// How long one dequeue waits before re-checking for shutdown
    pub poll_wait: Duration,
    /// Upper bound on download + engine for one attempt
    pub attempt_timeout: Duration,
    /// Added to `attempt_timeout` to form the processing lease
    pub lease_slack: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            concurrency: 2,
            poll_wait: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(300),
            lease_slack: DEFAULT_LEASE_SLACK,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// How long a started attempt owns its job before a redelivery may take over.
    pub fn lease(&self) -> Duration {
        self.attempt_timeout + self.lease_slack
    }
}

/// What `process` did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Engine succeeded; job is `Completed`.
    Completed,
    /// Permanent failure or retries exhausted; job is `Failed`.
    Failed,
    /// Transient failure; job is back to `Queued` and the message was nacked with backoff.
    Retried,
    /// Job already terminal or owned by another worker; message acked, nothing changed.
    Duplicate,
    /// Job record unknown or expired; message acked.
    Missing,
    /// The job store was unreachable; message nacked without touching the job.
    Deferred,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub duplicates: u64,
    pub missing: u64,
    pub deferred: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Completed => self.completed += 1,
            ProcessOutcome::Failed => self.failed += 1,
            ProcessOutcome::Retried => self.retried += 1,
            ProcessOutcome::Duplicate => self.duplicates += 1,
            ProcessOutcome::Missing => self.missing += 1,
            ProcessOutcome::Deferred => self.deferred += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Stop taking new deliveries, let in-flight jobs finish, then return.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "job executor loop ended abnormally");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background job executor.
///
/// Pulls task messages from the queue and, for each one, claims the job in the
/// store, downloads both inputs into a scratch directory, runs the comparison
/// engine and writes the outcome back. The job store's atomic update is the
/// only coordination between executors, so any number may share one queue.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    objects: Arc<dyn ObjectStore>,
    engine: Arc<dyn ComparisonEngine>,
    policy: RetryPolicy,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        objects: Arc<dyn ObjectStore>,
        engine: Arc<dyn ComparisonEngine>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            objects,
            engine,
            policy,
            config: JobExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Spawn `config.concurrency` worker loops on the current tokio runtime.
    pub fn spawn(self) -> JobExecutorHandle {
        let executor = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let joins = (0..executor.config.concurrency.max(1))
            .map(|slot| {
                tokio::spawn(executor_loop(
                    Arc::clone(&executor),
                    slot,
                    shutdown_rx.clone(),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        JobExecutorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }

    /// Handle one delivery end to end and settle it with the queue.
    ///
    /// Only queue failures (ack/nack) are returned as errors; everything else
    /// is folded into the job record or the returned outcome.
    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.message.job_id, delivery_count = delivery.delivery_count)
    )]
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome, QueueError> {
        let job_id = delivery.message.job_id;
        let handle = &delivery.handle;

        let job = match self.store.read(job_id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => return self.drop_missing(handle).await,
            Err(e) => return self.defer(handle, &e).await,
        };
        if job.is_terminal() {
            debug!(status = %job.status, "redelivered message for finished job; acking");
            self.queue.ack(handle).await?;
            return Ok(ProcessOutcome::Duplicate);
        }

        let start = JobTransition::Start {
            lease: self.config.lease(),
        };
        let job = match self.store.update(job_id, &start).await {
            Ok(job) => job,
            Err(JobStoreError::Conflict {
                reason: TransitionError::AttemptsExhausted { attempts },
                ..
            }) => {
                let mut error = format!("attempts exhausted after {attempts} attempts");
                if let Some(last) = &job.last_error {
                    error.push_str(": ");
                    error.push_str(last);
                }
                let fail = JobTransition::Fail {
                    attempt: job.attempt_count,
                    error,
                };
                return self.settle(handle, &job, fail).await;
            }
            Err(JobStoreError::Conflict { reason, .. }) => {
                debug!(reason = %reason, "job not claimable; acking duplicate delivery");
                self.queue.ack(handle).await?;
                return Ok(ProcessOutcome::Duplicate);
            }
            Err(JobStoreError::NotFound(_)) => return self.drop_missing(handle).await,
            Err(e) => return self.defer(handle, &e).await,
        };
        info!(
            status = %job.status,
            attempt = job.attempt_count,
            max_attempts = job.max_attempts,
            "job processing"
        );

        let attempt = job.attempt_count;
        let transition = match self.run_attempt(&job).await {
            Ok(result) => JobTransition::Complete { attempt, result },
            Err(err) if err.is_permanent() => JobTransition::Fail {
                attempt,
                error: err.message().to_string(),
            },
            Err(err) if self.may_retry(&job) => {
                let delay = self.policy.delay_for_attempt(job.attempt_count);
                warn!(
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; retrying"
                );
                JobTransition::Retry {
                    attempt,
                    error: err.message().to_string(),
                    retry_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX),
                }
            }
            Err(err) => JobTransition::Fail {
                attempt,
                error: format!("{} (gave up after {} attempts)", err.message(), job.attempt_count),
            },
        };

        self.settle(handle, &job, transition).await
    }

    /// The policy decides; a record submitted under a tighter bound keeps it.
    fn may_retry(&self, job: &Job) -> bool {
        self.policy.should_retry(job.attempt_count) && job.attempts_remaining()
    }

    /// Fetch both inputs into a scratch directory and run the engine, bounded by
    /// the attempt timeout. The scratch directory is removed on every exit path.
    async fn run_attempt(&self, job: &Job) -> Result<ComparisonResult, AttemptError> {
        let objects = Arc::clone(&self.objects);
        let engine = Arc::clone(&self.engine);
        let inputs = job.inputs.clone();

        // A panicking engine surfaces as a JoinError instead of killing the loop.
        let task = tokio::spawn(async move { compare_inputs(objects, engine, inputs).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.attempt_timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(AttemptError::Transient(format!("attempt aborted: {join}"))),
            Err(_) => {
                abort.abort();
                Err(AttemptError::timed_out(self.config.attempt_timeout))
            }
        }
    }

    /// Write the attempt's outcome to the store, then ack or nack accordingly.
    async fn settle(
        &self,
        handle: &AckHandle,
        job: &Job,
        transition: JobTransition,
    ) -> Result<ProcessOutcome, QueueError> {
        let retry_delay = match &transition {
            JobTransition::Retry { .. } => self.policy.delay_for_attempt(job.attempt_count),
            _ => Duration::ZERO,
        };

        match self.store.update(job.id, &transition).await {
            Ok(updated) => match transition {
                JobTransition::Complete { result, .. } => {
                    info!(
                        status = %updated.status,
                        attempt = updated.attempt_count,
                        total_differences = result.total_differences,
                        "job completed"
                    );
                    self.queue.ack(handle).await?;
                    Ok(ProcessOutcome::Completed)
                }
                JobTransition::Retry { .. } => {
                    info!(status = %updated.status, attempt = updated.attempt_count, "job requeued");
                    self.queue.nack(handle, retry_delay).await?;
                    Ok(ProcessOutcome::Retried)
                }
                JobTransition::Fail { error, .. } => {
                    error!(status = %updated.status, attempt = updated.attempt_count, error = %error, "job failed");
                    self.queue.ack(handle).await?;
                    Ok(ProcessOutcome::Failed)
                }
                JobTransition::Start { .. } => Ok(ProcessOutcome::Deferred),
            },
            Err(JobStoreError::Conflict {
                reason: reason @ TransitionError::StaleAttempt { .. },
                ..
            }) => {
                // The message now belongs to the attempt that took over.
                debug!(reason = %reason, transition = transition.name(), "attempt superseded; leaving message to new owner");
                Ok(ProcessOutcome::Duplicate)
            }
            Err(JobStoreError::Conflict { reason, .. }) => {
                debug!(reason = %reason, transition = transition.name(), "job changed underneath attempt; acking");
                self.queue.ack(handle).await?;
                Ok(ProcessOutcome::Duplicate)
            }
            Err(JobStoreError::NotFound(_)) => self.drop_missing(handle).await,
            Err(e) => {
                // The lease is still ours; come back once it has lapsed.
                let delay = retry_delay.max(self.config.lease());
                error!(error = %e, delay_ms = delay.as_millis() as u64, "could not record attempt outcome");
                self.queue.nack(handle, delay).await?;
                Ok(ProcessOutcome::Deferred)
            }
        }
    }

    async fn drop_missing(&self, handle: &AckHandle) -> Result<ProcessOutcome, QueueError> {
        warn!("task message for unknown or expired job; dropping");
        self.queue.ack(handle).await?;
        Ok(ProcessOutcome::Missing)
    }

    async fn defer(&self, handle: &AckHandle, err: &JobStoreError) -> Result<ProcessOutcome, QueueError> {
        let delay = self.policy.base_delay;
        warn!(error = %err, delay_ms = delay.as_millis() as u64, "job store unavailable; deferring message");
        self.queue.nack(handle, delay).await?;
        Ok(ProcessOutcome::Deferred)
    }
}

async fn compare_inputs(
    objects: Arc<dyn ObjectStore>,
    engine: Arc<dyn ComparisonEngine>,
    inputs: JobInputs,
) -> Result<ComparisonResult, AttemptError> {
    let scratch = tempfile::Builder::new().prefix("docdiff-").tempdir()?;

    let left = objects.get(&inputs.left, &scratch.path().join("left.pdf")).await?;
    let right = objects.get(&inputs.right, &scratch.path().join("right.pdf")).await?;
    debug!(left = %inputs.left, right = %inputs.right, "inputs downloaded");

    Ok(engine.compare(&left, &right).await?)
}

async fn executor_loop(
    executor: Arc<JobExecutor>,
    slot: usize,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    let name = executor.config.name.clone();
    info!(executor = %name, slot, "job executor started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = executor.queue.dequeue(executor.config.poll_wait) => next,
        };

        match next {
            Ok(Some(delivery)) => {
                if let Ok(mut s) = stats.lock() {
                    s.current_running += 1;
                }

                // Not raced against shutdown: a started job runs to its outcome.
                let outcome = executor.process(delivery).await;

                if let Ok(mut s) = stats.lock() {
                    s.current_running = s.current_running.saturating_sub(1);
                    if let Ok(outcome) = &outcome {
                        s.record(*outcome);
                    }
                }
                if let Err(e) = outcome {
                    error!(executor = %name, slot, error = %e, "failed to settle delivery with the queue");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(executor = %name, slot, error = %e, "failed to dequeue");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(executor.config.poll_wait) => {}
                }
            }
        }
    }

    info!(executor = %name, slot, "job executor stopped");
}
