//! Redis Streams-backed task queue (durable, at-least-once delivery).
//!
//! - **Stream**: `docdiff:tasks`, one entry per task message (`XADD`)
//! - **Consumer group**: `docdiff-workers`; every worker process is a named
//!   consumer, so each entry goes to one worker (`XREADGROUP`)
//! - **Visibility**: an entry stays in the group's pending list until acked;
//!   entries idle longer than the visibility timeout are taken over by the
//!   next consumer that asks (`XPENDING IDLE` + `XCLAIM`)
//! - **Delayed redelivery**: `nack` parks the message in the `docdiff:tasks:delayed`
//!   sorted set (score = due time in ms) and acks the stream entry in one script;
//!   due members are moved back into the stream atomically before every read
//! - **Dead-letter queue**: `docdiff:tasks:dlq`, for entries that cannot be
//!   parsed or were delivered more than `max_deliveries` times

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docdiff_core::TaskMessage;
use docdiff_queue::{AckHandle, Delivery, QueueError, TaskQueue};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default stream key for task messages
const DEFAULT_STREAM_KEY: &str = "docdiff:tasks";

/// Default dead-letter stream key
const DEFAULT_DLQ_KEY: &str = "docdiff:tasks:dlq";

/// Default sorted set holding nacked messages until they are due
const DEFAULT_DELAYED_KEY: &str = "docdiff:tasks:delayed";

const DEFAULT_GROUP: &str = "docdiff-workers";

/// Hard ceiling on deliveries of one message before it is dead-lettered.
/// The executor's own retry bound is far lower; this only catches poison messages.
const DEFAULT_MAX_DELIVERIES: u32 = 20;

/// Longest single `XREADGROUP BLOCK`, so due delayed messages are noticed promptly.
const MAX_BLOCK: Duration = Duration::from_secs(1);

const PROMOTE_BATCH: usize = 100;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local entry = cjson.decode(member)
    redis.call('XADD', KEYS[2], '*',
      'job_id', entry['job_id'],
      'prior_deliveries', tostring(entry['delivery_count']),
      'payload', entry['payload'])
  end
end
return #due
"#;

const NACK_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('XACK', KEYS[2], ARGV[3], ARGV[4])
return redis.call('XDEL', KEYS[2], ARGV[4])
"#;

/// What `nack` parks in the delayed set.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    message_id: String,
    job_id: String,
    delivery_count: u32,
    payload: String,
}

#[derive(Debug, Clone)]
struct InFlight {
    job_id: String,
    delivery_count: u32,
    payload: String,
}

/// A stream entry as read, before it is admitted as a `Delivery`.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    /// `None` when the entry was deleted while pending.
    fields: Option<HashMap<String, String>>,
}

fn backend(e: redis::RedisError) -> QueueError {
    QueueError::Backend(e.to_string())
}

pub struct RedisStreamsTaskQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
    /// Dedicated connections for blocking reads, so `BLOCK` never stalls acks.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    stream_key: String,
    dlq_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    max_deliveries: u32,
    in_flight: Mutex<HashMap<String, InFlight>>,
    promote: redis::Script,
    nack: redis::Script,
}

impl std::fmt::Debug for RedisStreamsTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsTaskQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsTaskQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// * `redis_url` - Redis connection URL (e.g. "redis://localhost:6379/0")
    /// * `visibility_timeout` - how long a delivered, unacked message stays invisible
    pub async fn connect(redis_url: impl AsRef<str>, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        let conn = client.get_multiplexed_tokio_connection().await.map_err(backend)?;

        let queue = Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            delayed_key: DEFAULT_DELAYED_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            in_flight: Mutex::new(HashMap::new()),
            promote: redis::Script::new(PROMOTE_SCRIPT),
            nack: redis::Script::new(NACK_SCRIPT),
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// Use a distinct key namespace (`{prefix}:tasks`, ...), e.g. for tests.
    pub async fn with_namespace(mut self, prefix: &str) -> Result<Self, QueueError> {
        self.stream_key = format!("{prefix}:tasks");
        self.dlq_key = format!("{prefix}:tasks:dlq");
        self.delayed_key = format!("{prefix}:tasks:delayed");
        self.ensure_consumer_group().await?;
        Ok(self)
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Create the consumer group (and stream) if missing. Idempotent.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis().max(1) as u64
    }

    fn lock_in_flight(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, InFlight>>, QueueError> {
        self.in_flight.lock().map_err(|_| QueueError::Poisoned)
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection, QueueError> {
        let pooled = self.blocking.lock().map_err(|_| QueueError::Poisoned)?.pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self.client.get_multiplexed_tokio_connection().await.map_err(backend),
        }
    }

    fn release_blocking_conn(&self, conn: MultiplexedConnection) {
        if let Ok(mut pool) = self.blocking.lock() {
            pool.push(conn);
        }
    }

    /// Move due delayed messages back into the stream.
    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .promote
            .key(&self.delayed_key)
            .key(&self.stream_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        if moved > 0 {
            debug!(moved, "delayed task messages promoted");
        }
        Ok(())
    }

    /// Take over one entry whose consumer has sat on it past the visibility timeout.
    async fn claim_stale(&self) -> Result<Option<(StreamEntry, u32)>, QueueError> {
        let mut conn = self.conn.clone();
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let Some((id, owner, idle_ms, delivered)) = pending.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may win the claim; XCLAIM then returns nothing.
        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_ms())
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let entry = parse_entries(claimed)?.into_iter().next();
        if entry.is_some() {
            debug!(message_id = %id, previous_owner = %owner, idle_ms, "reclaimed stale task message");
        }
        Ok(entry.map(|e| (e, delivered as u32 + 1)))
    }

    /// Read one never-delivered entry, blocking up to `block`.
    async fn read_new(&self, block: Duration) -> Result<Option<StreamEntry>, QueueError> {
        let mut conn = self.blocking_conn().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer).arg("COUNT").arg(1);
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: redis::RedisResult<redis::Value> = cmd.query_async(&mut conn).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if e.code() == Some("NOGROUP") => {
                warn!(stream_key = %self.stream_key, "consumer group missing; recreating");
                self.release_blocking_conn(conn);
                self.ensure_consumer_group().await?;
                return Ok(None);
            }
            Err(e) => return Err(backend(e)),
        };
        self.release_blocking_conn(conn);

        // Reply: [[stream_key, [entry, ...]]], or nil on timeout.
        let streams = match reply {
            redis::Value::Nil => return Ok(None),
            redis::Value::Bulk(streams) => streams,
            other => {
                return Err(QueueError::Backend(format!("unexpected XREADGROUP reply: {other:?}")));
            }
        };
        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() == 2 {
                    let entries = parts.remove(1);
                    return Ok(parse_entries(entries)?.into_iter().next());
                }
            }
        }
        Ok(None)
    }

    /// Turn a raw entry into a `Delivery`, dead-lettering it if it is unusable.
    async fn admit(&self, entry: StreamEntry, times_delivered: u32) -> Result<Option<Delivery>, QueueError> {
        let Some(fields) = entry.fields else {
            self.ack_ids(&entry.id).await?;
            return Ok(None);
        };

        let prior = fields
            .get("prior_deliveries")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let delivery_count = prior + times_delivered;
        let payload = fields.get("payload").cloned().unwrap_or_default();

        let message = match TaskMessage::from_json(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.dead_letter(&entry.id, &payload, delivery_count, &format!("malformed payload: {e}"))
                    .await?;
                return Ok(None);
            }
        };

        if delivery_count > self.max_deliveries {
            self.dead_letter(&entry.id, &payload, delivery_count, "delivery limit exceeded")
                .await?;
            return Ok(None);
        }

        self.lock_in_flight()?.insert(
            entry.id.clone(),
            InFlight {
                job_id: message.job_id.to_string(),
                delivery_count,
                payload,
            },
        );

        Ok(Some(Delivery {
            message,
            handle: AckHandle::new(entry.id),
            delivery_count,
        }))
    }

    /// Send a message to the dead-letter stream and drop it from the work stream.
    async fn dead_letter(
        &self,
        message_id: &str,
        payload: &str,
        delivery_count: u32,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(message_id)
            .arg("delivery_count")
            .arg(delivery_count)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("DLQ XADD failed: {e}")))?;

        warn!(message_id, delivery_count, reason, "task message sent to dead-letter queue");
        self.ack_ids(message_id).await
    }

    async fn ack_ids(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(message_id)
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(message_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

/// Parse `[[id, [field, value, ...]], ...]`.
fn parse_entries(value: redis::Value) -> Result<Vec<StreamEntry>, QueueError> {
    let items = match value {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(items) => items,
        other => return Err(QueueError::Backend(format!("invalid stream entries: {other:?}"))),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let parts = match item {
            redis::Value::Bulk(parts) if parts.len() == 2 => parts,
            // XCLAIM yields nil for entries deleted while pending
            redis::Value::Nil => continue,
            other => return Err(QueueError::Backend(format!("invalid stream entry: {other:?}"))),
        };

        let id = match &parts[0] {
            redis::Value::Data(data) => String::from_utf8_lossy(data).into_owned(),
            other => return Err(QueueError::Backend(format!("invalid message id: {other:?}"))),
        };

        let fields = match &parts[1] {
            redis::Value::Bulk(kv) => Some(
                kv.chunks(2)
                    .filter_map(|pair| match pair {
                        [redis::Value::Data(k), redis::Value::Data(v)] => Some((
                            String::from_utf8_lossy(k).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        };

        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}

#[async_trait]
impl TaskQueue for RedisStreamsTaskQueue {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, job_id = %message.job_id), err)]
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        let payload = message.to_json()?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XADD failed: {e}")))?;

        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            self.promote_due().await?;

            if let Some((entry, times_delivered)) = self.claim_stale().await? {
                if let Some(delivery) = self.admit(entry, times_delivered).await? {
                    return Ok(Some(delivery));
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(entry) = self.read_new(remaining.min(MAX_BLOCK)).await? {
                if let Some(delivery) = self.admit(entry, 1).await? {
                    return Ok(Some(delivery));
                }
                continue;
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        self.lock_in_flight()?.remove(handle.as_str());
        self.ack_ids(handle.as_str()).await
    }

    async fn nack(&self, handle: &AckHandle, retry_after: Duration) -> Result<(), QueueError> {
        let Some(in_flight) = self.lock_in_flight()?.remove(handle.as_str()) else {
            // Not ours (or already settled); the visibility timeout will redeliver it.
            warn!(message_id = %handle, "nack for unknown delivery; leaving it pending");
            return Ok(());
        };

        let member = serde_json::to_string(&DelayedEntry {
            message_id: handle.as_str().to_string(),
            job_id: in_flight.job_id,
            delivery_count: in_flight.delivery_count,
            payload: in_flight.payload,
        })?;
        let due_ms = Utc::now().timestamp_millis() + retry_after.as_millis() as i64;

        let mut conn = self.conn.clone();
        let _: i64 = self
            .nack
            .key(&self.delayed_key)
            .key(&self.stream_key)
            .arg(due_ms)
            .arg(member)
            .arg(&self.group)
            .arg(handle.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        debug!(message_id = %handle, delay_ms = retry_after.as_millis() as u64, "task message parked for redelivery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Need a live Redis: `REDIS_URL=redis://127.0.0.1:6379/15 cargo test --features redis -- --ignored`

    use super::*;
    use docdiff_core::{JobId, JobInputs, ObjectKey};

    async fn queue(visibility: Duration) -> RedisStreamsTaskQueue {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
        RedisStreamsTaskQueue::connect(url, visibility)
            .await
            .unwrap()
            .with_namespace(&format!("docdiff:test:{}", uuid::Uuid::now_v7()))
            .await
            .unwrap()
    }

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

    #[test]
    fn parses_stream_entries() {
        let value = redis::Value::Bulk(vec![
            redis::Value::Bulk(vec![
                redis::Value::Data(b"1-0".to_vec()),
                redis::Value::Bulk(vec![
                    redis::Value::Data(b"payload".to_vec()),
                    redis::Value::Data(b"{}".to_vec()),
                ]),
            ]),
            redis::Value::Nil,
            redis::Value::Bulk(vec![redis::Value::Data(b"2-0".to_vec()), redis::Value::Nil]),
        ]);

        let entries = parse_entries(value).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields.as_ref().unwrap()["payload"], "{}");
        assert!(entries[1].fields.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn enqueue_dequeue_ack() {
        let queue = queue(Duration::from_secs(30)).await;
        let msg = message();
        queue.enqueue(msg.clone()).await.unwrap();

        let delivery = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.message, msg);
        assert_eq!(delivery.delivery_count, 1);
        queue.ack(&delivery.handle).await.unwrap();

        assert!(queue.dequeue(Duration::from_millis(200)).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn nack_redelivers_after_delay() {
        let queue = queue(Duration::from_secs(30)).await;
        queue.enqueue(message()).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        queue.nack(&first.handle, Duration::from_millis(300)).await.unwrap();
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        let again = queue.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.message, first.message);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn unacked_message_is_reclaimed() {
        let queue = queue(Duration::from_millis(200)).await;
        queue.enqueue(message()).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let again = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.message, first.message);
        assert_eq!(again.delivery_count, 2);
    }
}
