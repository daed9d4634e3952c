//! Integration tests for the full comparison pipeline.
//!
//! Tests: Gateway → JobStore + TaskQueue → JobExecutor → JobStore
//!
//! Verifies:
//! - Submitted jobs are visible as `Queued` before any worker runs
//! - Transient failures are retried up to `max_attempts`, permanent ones are not
//! - Redelivered messages never change a finished job

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use docdiff_core::{
    ComparisonResult, Difference, DifferenceKind, DifferenceLocation, JobId, JobInputs, JobStatus, JobTransition,
    ObjectKey, PageDifferences, RetryPolicy, TaskMessage, TransitionError,
};
use docdiff_engine::{ComparisonEngine, EngineError, PdfTextEngine};
use docdiff_queue::{InMemoryTaskQueue, TaskQueue};
use proptest::prelude::*;

use crate::job_store::{InMemoryJobStore, JobStore, JobStoreError};
use crate::jobs::{JobExecutor, JobExecutorConfig, ProcessOutcome, SubmissionGateway, SubmitError, Upload};
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::testing::{FlakyObjectStore, PDF_BYTES, ScriptedEngine};

struct Pipeline {
    store: Arc<InMemoryJobStore>,
    queue: Arc<InMemoryTaskQueue>,
    gateway: SubmissionGateway,
    executor: JobExecutor,
}

impl Pipeline {
    fn new(objects: Arc<dyn ObjectStore>, engine: Arc<dyn ComparisonEngine>, max_attempts: u32) -> Self {
        Self::with_policy(objects, engine, RetryPolicy::fixed(max_attempts, Duration::from_millis(5)))
    }

    fn with_policy(objects: Arc<dyn ObjectStore>, engine: Arc<dyn ComparisonEngine>, policy: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryJobStore::default());
        let queue = Arc::new(InMemoryTaskQueue::default());
        let gateway = SubmissionGateway::new(store.clone(), queue.clone(), objects.clone()).with_retry_policy(&policy);
        let executor = JobExecutor::new(store.clone(), queue.clone(), objects, engine, policy)
            .with_config(
            JobExecutorConfig::default()
                .with_poll_wait(Duration::from_millis(20))
                .with_attempt_timeout(Duration::from_secs(5)),
        );
        Self {
            store,
            queue,
            gateway,
            executor,
        }
    }

    async fn submit(&self) -> JobId {
        self.submit_pair(pdf("left.pdf"), pdf("right.pdf")).await
    }

    async fn submit_pair(&self, left: Upload, right: Upload) -> JobId {
        self.gateway.submit_documents(left, right).await.unwrap().job_id
    }

    /// Process deliveries until the queue stays empty.
    async fn drain(&self) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        while let Some(delivery) = self.queue.dequeue(Duration::from_millis(200)).await.unwrap() {
            outcomes.push(self.executor.process(delivery).await.unwrap());
        }
        outcomes
    }
}

fn pdf(name: &str) -> Upload {
    Upload::new(name, Some("application/pdf".into()), Bytes::from_static(PDF_BYTES))
}

fn one_change() -> ComparisonResult {
    let mut page = PageDifferences::new(1);
    page.push(Difference {
        id: "diff_1_0".into(),
        kind: DifferenceKind::Modification,
        location: DifferenceLocation {
            x: 36.0,
            y: 36.0,
            width: 120.0,
            height: 12.0,
        },
        content: Some("Total: 42".into()),
        confidence: 100,
    });
    ComparisonResult::from_pages([page], Utc::now())
}

#[tokio::test]
async fn submitted_job_reads_as_queued_before_any_worker() {
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), Arc::new(ScriptedEngine::default()), 3);
    let id = p.submit().await;

    let view = p.gateway.status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);
    assert_eq!(view.attempt_count, 0);
    assert!(view.result.is_none());
    assert!(view.error.is_none());
}

#[tokio::test]
async fn scenario_a_identical_documents_complete_with_no_differences() {
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), Arc::new(ScriptedEngine::default()), 3);
    let id = p.submit().await;

    assert_eq!(p.drain().await, vec![ProcessOutcome::Completed]);

    let view = p.gateway.status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.attempt_count, 1);
    assert!(view.completed_at.is_some());
    assert!(view.error.is_none());
    assert_eq!(view.result.unwrap().total_differences, 0);
}

#[tokio::test]
async fn scenario_b_corrupted_input_fails_on_first_attempt() {
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), Arc::new(PdfTextEngine::default()), 3);
    let corrupt = Upload::new("right.pdf", Some("application/pdf".into()), Bytes::from_static(b"\x00\x01garbage"));
    let id = p.submit_pair(pdf("left.pdf"), corrupt).await;

    assert_eq!(p.drain().await, vec![ProcessOutcome::Failed]);

    let job = p.store.read(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
    assert!(job.result.is_none());
    let error = job.error.unwrap();
    assert!(error.contains("missing %PDF- header"), "{error}");
}

#[tokio::test]
async fn scenario_c_storage_outage_recovers_on_third_attempt() {
    let engine = Arc::new(ScriptedEngine::default());
    engine.push_ok(one_change());
    let p = Pipeline::new(Arc::new(FlakyObjectStore::failing_first(2)), engine.clone(), 3);
    let id = p.submit().await;

    assert_eq!(
        p.drain().await,
        vec![ProcessOutcome::Retried, ProcessOutcome::Retried, ProcessOutcome::Completed]
    );

    let job = p.store.read(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.result.unwrap().total_differences, 1);
    assert!(job.error.is_none());
    assert_eq!(engine.calls(), 1);

    let successes: Vec<bool> = job.history.iter().map(|a| a.success).collect();
    assert_eq!(successes, vec![false, false, true]);
    assert_eq!(job.history[0].error.as_deref(), Some("object store backend error: storage unavailable"));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let policy = RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(60));
    let p = Pipeline::with_policy(
        Arc::new(FlakyObjectStore::failing_first(2)),
        Arc::new(ScriptedEngine::default()),
        policy,
    );
    let id = p.submit().await;

    let first = p.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(p.executor.process(first).await.unwrap(), ProcessOutcome::Retried);
    assert_eq!(p.queue.depth().unwrap().delayed, 1);

    // After attempt 1 the message stays hidden for base * 2^1.
    assert!(p.queue.dequeue(Duration::from_millis(1990)).await.unwrap().is_none());
    let second = p.queue.dequeue(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(second.delivery_count, 2);
    assert_eq!(p.executor.process(second).await.unwrap(), ProcessOutcome::Retried);

    // After attempt 2, base * 2^2.
    assert!(p.queue.dequeue(Duration::from_millis(3990)).await.unwrap().is_none());
    let third = p.queue.dequeue(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(third.delivery_count, 3);
    assert_eq!(p.executor.process(third).await.unwrap(), ProcessOutcome::Completed);

    let job = p.store.read(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 3);
}

#[tokio::test]
async fn scenario_d_replayed_message_after_completion_changes_nothing() {
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), Arc::new(ScriptedEngine::default()), 3);
    let id = p.submit().await;
    p.drain().await;
    let finished = p.store.read(id).await.unwrap();

    // The broker redelivers the message that already succeeded.
    p.queue
        .enqueue(TaskMessage::new(id, finished.inputs.clone(), Utc::now()))
        .await
        .unwrap();
    assert_eq!(p.drain().await, vec![ProcessOutcome::Duplicate]);

    // A stale worker replaying its success write is refused.
    let replay = p
        .store
        .update(
            id,
            &JobTransition::Complete {
                attempt: 1,
                result: one_change(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        replay,
        JobStoreError::Conflict {
            reason: TransitionError::Terminal(JobStatus::Completed),
            ..
        }
    ));

    assert_eq!(p.store.read(id).await.unwrap(), finished);
}

#[tokio::test]
async fn permanent_failure_short_circuits_retries() {
    let engine = Arc::new(ScriptedEngine::default());
    engine.push_err(EngineError::Unparseable("xref table damaged".into()));
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), engine.clone(), 5);
    let id = p.submit().await;

    assert_eq!(p.drain().await, vec![ProcessOutcome::Failed]);

    let view = p.gateway.status(id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert_eq!(view.attempt_count, 1);
    assert!(view.result.is_none());
    assert!(!view.error.unwrap().is_empty());
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn missing_input_is_retried_until_attempts_run_out() {
    let engine = Arc::new(ScriptedEngine::default());
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), engine.clone(), 2);
    let id = JobId::new();
    let inputs = JobInputs::new(ObjectKey::for_upload(id, 1, "a.pdf"), ObjectKey::for_upload(id, 2, "b.pdf"));
    let id = p.gateway.submit(inputs).await.unwrap().job_id;

    assert_eq!(p.drain().await, vec![ProcessOutcome::Retried, ProcessOutcome::Failed]);

    let job = p.store.read(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert!(job.error.unwrap().starts_with("input document missing"));
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn duplicate_delivery_before_processing_runs_once() {
    let engine = Arc::new(ScriptedEngine::default());
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), engine.clone(), 3);
    let id = p.submit().await;
    let inputs = p.store.read(id).await.unwrap().inputs;
    p.queue.enqueue(TaskMessage::new(id, inputs, Utc::now())).await.unwrap();

    assert_eq!(
        p.drain().await,
        vec![ProcessOutcome::Completed, ProcessOutcome::Duplicate]
    );
    assert_eq!(p.store.read(id).await.unwrap().attempt_count, 1);
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn result_is_served_only_once_completed() {
    let engine = Arc::new(ScriptedEngine::default());
    engine.push_ok(one_change());
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), engine, 3);
    let id = p.submit().await;

    assert!(matches!(p.gateway.result(id).await, Err(SubmitError::NotCompleted { .. })));
    p.drain().await;

    let result = p.gateway.result(id).await.unwrap();
    assert_eq!(result.pages_affected, 1);
    assert_eq!(result.differences_by_page[&1].modifications.len(), 1);
}

#[tokio::test]
async fn spawned_executor_completes_gateway_submissions() {
    let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), Arc::new(ScriptedEngine::default()), 3);
    let Pipeline {
        store: _,
        queue: _,
        gateway,
        executor,
    } = p;
    let handle = executor.spawn();

    let id = gateway.submit_documents(pdf("a.pdf"), pdf("b.pdf")).await.unwrap().job_id;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let view = gateway.status(id).await.unwrap();
        if view.status == JobStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job stuck in {}", view.status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn records_expire_after_ttl_regardless_of_status() {
    let store = Arc::new(InMemoryJobStore::new(Duration::from_secs(60)));
    let queue = Arc::new(InMemoryTaskQueue::default());
    let gateway = SubmissionGateway::new(store.clone(), queue, Arc::new(InMemoryObjectStore::default()));

    let queued = gateway.submit_documents(pdf("a.pdf"), pdf("b.pdf")).await.unwrap().job_id;
    let failed = gateway.submit_documents(pdf("a.pdf"), pdf("b.pdf")).await.unwrap().job_id;
    store
        .update(
            failed,
            &JobTransition::Fail {
                attempt: 0,
                error: "bad input".into(),
            },
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(gateway.status(queued).await.is_ok());

    tokio::time::advance(Duration::from_secs(2)).await;
    for id in [queued, failed] {
        assert!(matches!(gateway.status(id).await, Err(SubmitError::NotFound(_))));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn always_transient_jobs_fail_after_exactly_max_attempts(max_attempts in 1u32..=4) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let engine = Arc::new(ScriptedEngine::default());
            for _ in 0..max_attempts {
                engine.push_err(EngineError::ToolNotFound("pdftotext".into()));
            }
            let p = Pipeline::new(Arc::new(InMemoryObjectStore::default()), engine.clone(), max_attempts);
            let id = p.submit().await;

            let outcomes = p.drain().await;
            assert_eq!(outcomes.len(), max_attempts as usize);
            assert_eq!(outcomes.last(), Some(&ProcessOutcome::Failed));

            let job = p.store.read(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempt_count, max_attempts);
            assert!(job.result.is_none());
            assert!(job.error.unwrap().contains("gave up after"));
            assert_eq!(engine.calls(), max_attempts as usize);
        });
    }
}
