//! In-memory task broker for tests/dev.
//!
//! - single process, nothing survives a restart
//! - honours the visibility window and delayed redelivery
//! - clock is `tokio::time`, so paused-time tests can drive it

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use docdiff_core::TaskMessage;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{AckHandle, Delivery, QueueError, TaskQueue};

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    message: TaskMessage,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<u64, (Instant, Entry)>,
}

impl Inner {
    /// Remove an in-flight entry, but only for the delivery the handle was issued for.
    fn take_in_flight(&mut self, id: u64, delivery_count: u32) -> Option<Entry> {
        match self.in_flight.get(&id) {
            Some((_, entry)) if entry.delivery_count == delivery_count => {
                self.in_flight.remove(&id).map(|(_, entry)| entry)
            }
            _ => None,
        }
    }

    /// Move due delayed entries and expired in-flight entries back to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, entry)| {
            if *at <= now {
                due.push((*at, entry.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, entry)| (*at, entry.id));
        self.ready.extend(due.into_iter().map(|(_, entry)| entry));

        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            if let Some((_, entry)) = self.in_flight.remove(&id) {
                tracing::debug!(
                    job_id = %entry.message.job_id,
                    delivery_count = entry.delivery_count,
                    "visibility timeout elapsed; redelivering"
                );
                self.ready.push_back(entry);
            }
        }
    }

    /// Earliest instant at which something becomes deliverable.
    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let in_flight = self.in_flight.values().map(|(deadline, _)| *deadline);
        delayed.chain(in_flight).min()
    }
}

/// Snapshot of where messages currently sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

#[derive(Debug)]
pub struct InMemoryTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.lock()?;
        Ok(QueueDepth {
            ready: inner.ready.len(),
            delayed: inner.delayed.len(),
            in_flight: inner.in_flight.len(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Handles are `{entry id}:{delivery count}`, so a receipt from an earlier
    /// delivery of the same message never settles the current one.
    fn parse_handle(handle: &AckHandle) -> Option<(u64, u32)> {
        let (id, count) = handle.as_str().split_once(':')?;
        Some((id.parse().ok()?, count.parse().ok()?))
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        {
            let mut inner = self.lock()?;
            let id = inner.next_id;
            inner.next_id += 1;
            inner.ready.push_back(Entry {
                id,
                message,
                delivery_count: 0,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();

            let wake_at = {
                let now = Instant::now();
                let mut inner = self.lock()?;
                inner.promote(now);

                if let Some(mut entry) = inner.ready.pop_front() {
                    entry.delivery_count += 1;
                    let delivery = Delivery {
                        message: entry.message.clone(),
                        handle: AckHandle::new(format!("{}:{}", entry.id, entry.delivery_count)),
                        delivery_count: entry.delivery_count,
                    };
                    inner
                        .in_flight
                        .insert(entry.id, (now + self.visibility_timeout, entry));
                    return Ok(Some(delivery));
                }

                if now >= give_up_at {
                    return Ok(None);
                }
                inner.next_wake().map_or(give_up_at, |at| at.min(give_up_at))
            };

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let Some((id, count)) = Self::parse_handle(handle) else {
            return Ok(());
        };
        let mut inner = self.lock()?;
        if inner.take_in_flight(id, count).is_none() {
            tracing::debug!(handle = %handle, "ack for a delivery that is no longer in flight");
        }
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle, retry_after: Duration) -> Result<(), QueueError> {
        let Some((id, count)) = Self::parse_handle(handle) else {
            return Ok(());
        };
        {
            let mut inner = self.lock()?;
            match inner.take_in_flight(id, count) {
                Some(entry) => {
                    let due = Instant::now() + retry_after;
                    inner.delayed.push((due, entry));
                }
                None => {
                    tracing::debug!(handle = %handle, "nack for a delivery that is no longer in flight");
                    return Ok(());
                }
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docdiff_core::{JobId, JobInputs, ObjectKey};
    use std::sync::Arc;

    fn message() -> TaskMessage {
        let id = JobId::new();
        TaskMessage::new(
            id,
            JobInputs::new(
                ObjectKey::for_upload(id, 1, "a.pdf"),
                ObjectKey::for_upload(id, 2, "b.pdf"),
            ),
            Utc::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_then_acks() {
        let queue = InMemoryTaskQueue::new(Duration::from_secs(30));
        let msg = message();
        queue.enqueue(msg.clone()).await.unwrap();

        let delivery = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.message, msg);
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(queue.depth().unwrap().in_flight, 1);

        queue.ack(&delivery.handle).await.unwrap();
        assert_eq!(queue.depth().unwrap().total(), 0);

        // Ack is idempotent.
        queue.ack(&delivery.handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_times_out() {
        let queue = InMemoryTaskQueue::default();
        let started = Instant::now();
        let got = queue.dequeue(Duration::from_millis(250)).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_visibility_timeout() {
        let queue = InMemoryTaskQueue::new(Duration::from_secs(10));
        queue.enqueue(message()).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_secs(5)).await.unwrap().is_none());

        let second = queue.dequeue(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(second.message, first.message);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_delays_redelivery() {
        let queue = InMemoryTaskQueue::new(Duration::from_secs(600));
        queue.enqueue(message()).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.nack(&first.handle, Duration::from_secs(4)).await.unwrap();
        assert_eq!(queue.depth().unwrap().delayed, 1);

        assert!(queue.dequeue(Duration::from_secs(3)).await.unwrap().is_none());

        let again = queue.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.delivery_count, 2);
        assert_eq!(again.message.job_id, first.message.job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_from_an_earlier_delivery_is_ignored() {
        let queue = InMemoryTaskQueue::new(Duration::from_secs(10));
        queue.enqueue(message()).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_secs(11)).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.handle, second.handle);

        queue.ack(&first.handle).await.unwrap();
        queue.nack(&first.handle, Duration::ZERO).await.unwrap();
        let depth = queue.depth().unwrap();
        assert_eq!(depth.in_flight, 1);
        assert_eq!(depth.delayed, 0);

        queue.ack(&second.handle).await.unwrap();
        assert_eq!(queue.depth().unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_consumer_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryTaskQueue::default());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        let msg = message();
        queue.enqueue(msg.clone()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message, msg);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_delivered_once_each_while_in_flight() {
        let queue = InMemoryTaskQueue::default();
        for _ in 0..3 {
            queue.enqueue(message()).await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let d = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
            assert!(seen.insert(d.message.job_id));
        }
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());
    }
}
