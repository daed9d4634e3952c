//! Scripted collaborators for executor and pipeline tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use docdiff_core::{ComparisonResult, Job, JobId, JobInputs, ObjectKey, TaskMessage};
use docdiff_engine::{ComparisonEngine, EngineError};
use docdiff_queue::{AckHandle, Delivery, QueueError, TaskQueue};

use crate::job_store::JobStore;
use crate::object_store::{InMemoryObjectStore, ObjectStore, ObjectStoreError};

pub const PDF_BYTES: &[u8] = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF\n";

enum Step {
    Ok(ComparisonResult),
    Err(EngineError),
    Panic,
}

/// Engine that replays queued outcomes, then reports "identical" forever.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn push_ok(&self, result: ComparisonResult) {
        self.script.lock().unwrap().push_back(Step::Ok(result));
    }

    pub fn push_err(&self, err: EngineError) {
        self.script.lock().unwrap().push_back(Step::Err(err));
    }

    pub fn push_panic(&self) {
        self.script.lock().unwrap().push_back(Step::Panic);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComparisonEngine for ScriptedEngine {
    async fn compare(&self, left: &Path, right: &Path) -> Result<ComparisonResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Inputs must have been downloaded before the engine runs.
        tokio::fs::metadata(left).await?;
        tokio::fs::metadata(right).await?;

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Ok(result)) => Ok(result),
            Some(Step::Err(err)) => Err(err),
            Some(Step::Panic) => panic!("engine blew up"),
            None => Ok(ComparisonResult::identical(Utc::now())),
        }
    }
}

/// In-memory object store whose first `n` downloads fail as a storage outage.
#[derive(Default)]
pub struct FlakyObjectStore {
    inner: InMemoryObjectStore,
    failing_gets: AtomicUsize,
}

impl FlakyObjectStore {
    pub fn failing_first(n: usize) -> Self {
        Self {
            inner: InMemoryObjectStore::default(),
            failing_gets: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: Bytes) -> Result<ObjectKey, ObjectStoreError> {
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &ObjectKey, dest: &Path) -> Result<PathBuf, ObjectStoreError> {
        let outage = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(ObjectStoreError::Backend("storage unavailable".into()));
        }
        self.inner.get(key, dest).await
    }
}

/// Queue that refuses every operation.
pub struct UnavailableQueue;

#[async_trait]
impl TaskQueue for UnavailableQueue {
    async fn enqueue(&self, _message: TaskMessage) -> Result<(), QueueError> {
        Err(QueueError::Backend("broker unreachable".into()))
    }

    async fn dequeue(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
        Err(QueueError::Backend("broker unreachable".into()))
    }

    async fn ack(&self, _handle: &AckHandle) -> Result<(), QueueError> {
        Err(QueueError::Backend("broker unreachable".into()))
    }

    async fn nack(&self, _handle: &AckHandle, _retry_after: Duration) -> Result<(), QueueError> {
        Err(QueueError::Backend("broker unreachable".into()))
    }
}

/// Store two PDF inputs, create a `Queued` job and enqueue its task message.
pub async fn submit_job(
    store: &dyn JobStore,
    queue: &dyn TaskQueue,
    objects: &dyn ObjectStore,
    max_attempts: u32,
) -> JobId {
    let id = JobId::new();
    let inputs = JobInputs::new(
        ObjectKey::for_upload(id, 1, "left.pdf"),
        ObjectKey::for_upload(id, 2, "right.pdf"),
    );
    objects.put(&inputs.left, Bytes::from_static(PDF_BYTES)).await.unwrap();
    objects.put(&inputs.right, Bytes::from_static(PDF_BYTES)).await.unwrap();

    store
        .create(&Job::new(id, inputs.clone(), max_attempts, Utc::now()))
        .await
        .unwrap();
    queue.enqueue(TaskMessage::new(id, inputs, Utc::now())).await.unwrap();
    id
}
