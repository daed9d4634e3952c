//! Task queue abstraction (mechanics only).
//!
//! A `TaskQueue` carries [`TaskMessage`]s from the submission path to the
//! workers. Delivery is **at-least-once**:
//!
//! - a dequeued message stays owned by the broker until it is acked
//! - a message that is neither acked nor nacked within the broker's visibility
//!   window is redelivered, possibly to another worker
//! - `nack(handle, retry_after)` asks for redelivery no earlier than `retry_after`
//!
//! Consumers must therefore be idempotent with respect to job state. The job
//! store's atomic update is what makes that hold; the queue makes no attempt
//! at deduplication and no ordering promise between messages.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let queue: Arc<dyn TaskQueue> = ...;
//!
//! while let Some(delivery) = queue.dequeue(Duration::from_secs(1)).await? {
//!     match run(&delivery.message).await {
//!         Ok(()) => queue.ack(&delivery.handle).await?,
//!         Err(_) => queue.nack(&delivery.handle, Duration::from_secs(2)).await?,
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docdiff_core::TaskMessage;

/// Broker-issued receipt for one delivery; pass it back to `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle(String);

impl AckHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AckHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a task message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: TaskMessage,
    pub handle: AckHandle,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue lock poisoned")]
    Poisoned,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("malformed task message: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// At-least-once task broker.
///
/// Implementations must be safe to share across tasks; workers usually hold an
/// `Arc<dyn TaskQueue>`.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably enqueue a message. Returns once the broker has accepted it; never
    /// waits for a consumer.
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message. `Ok(None)` means nothing arrived
    /// in time, so the caller can check for shutdown and poll again.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove the delivered message for good. Acking a handle the broker no
    /// longer tracks is a no-op.
    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    /// Give the message back for redelivery after `retry_after`.
    async fn nack(&self, handle: &AckHandle, retry_after: Duration) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> TaskQueue for Arc<Q>
where
    Q: TaskQueue + ?Sized,
{
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        (**self).enqueue(message).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(wait).await
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        (**self).ack(handle).await
    }

    async fn nack(&self, handle: &AckHandle, retry_after: Duration) -> Result<(), QueueError> {
        (**self).nack(handle, retry_after).await
    }
}
