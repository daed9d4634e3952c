//! Redis-backed job store.
//!
//! One JSON string per job under `docdiff:job:{id}`, written with `PX` so Redis
//! enforces the TTL natively. `update` is optimistic: read the raw value, apply
//! the transition locally, then swap it in with a compare-and-set script that
//! only writes if the stored string is still the one that was read.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docdiff_core::{Job, JobId, JobTransition};
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use super::{JobStore, JobStoreError};

const DEFAULT_KEY_PREFIX: &str = "docdiff:job:";

/// Attempts at the compare-and-set before giving up under contention.
const MAX_CAS_ATTEMPTS: usize = 16;

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    ttl: Duration,
    cas: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn storage(e: redis::RedisError) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

impl RedisJobStore {
    /// Connect to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(redis_url: impl AsRef<str>, ttl: Duration) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(storage)?;
        let conn = client.get_multiplexed_tokio_connection().await.map_err(storage)?;
        Ok(Self::with_connection(conn, ttl))
    }

    pub fn with_connection(conn: MultiplexedConnection, ttl: Duration) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl,
            cas: redis::Script::new(CAS_SCRIPT),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, id: JobId) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis().max(1) as u64
    }

    fn encode(job: &Job) -> Result<String, JobStoreError> {
        serde_json::to_string(job).map_err(|e| JobStoreError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> Result<Job, JobStoreError> {
        serde_json::from_str(raw).map_err(|e| JobStoreError::Serialization(e.to_string()))
    }

    async fn get_raw(&self, id: JobId) -> Result<String, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        raw.ok_or(JobStoreError::NotFound(id))
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut job = job.clone();
        job.refresh_expiry(Utc::now(), self.ttl);
        let payload = Self::encode(&job)?;

        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(job.id))
            .arg(payload)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await
            .map_err(storage)?;

        match set {
            Some(_) => Ok(()),
            None => Err(JobStoreError::AlreadyExists(job.id)),
        }
    }

    async fn read(&self, id: JobId) -> Result<Job, JobStoreError> {
        let raw = self.get_raw(id).await?;
        Self::decode(&raw)
    }

    #[instrument(skip(self, transition), fields(job_id = %id, transition = transition.name()), err)]
    async fn update(&self, id: JobId, transition: &JobTransition) -> Result<Job, JobStoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get_raw(id).await?;
            let mut job = Self::decode(&current)?;

            let now = Utc::now();
            job.apply(transition, now)
                .map_err(|reason| JobStoreError::Conflict { id, reason })?;
            job.refresh_expiry(now, self.ttl);
            let next = Self::encode(&job)?;

            let mut conn = self.conn.clone();
            let swapped: i64 = self
                .cas
                .key(self.key(id))
                .arg(&current)
                .arg(&next)
                .arg(self.ttl_ms())
                .invoke_async(&mut conn)
                .await
                .map_err(storage)?;

            if swapped == 1 {
                return Ok(job);
            }
            debug!(attempt, "job record changed underneath update; retrying");
        }

        Err(JobStoreError::Storage(format!(
            "update of job {id} lost {MAX_CAS_ATTEMPTS} compare-and-set races"
        )))
    }
}
