//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docdiff_core::{Job, JobId, JobTransition};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{JobStore, JobStoreError};

/// Records expire this long after their last write unless configured otherwise.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct Entry {
    job: Job,
    expires_at: Instant,
}

/// Process-local job store.
///
/// Expiry runs on `tokio::time`, so paused-clock tests can step past the TTL.
/// Expired records are invisible immediately; [`purge_expired`](Self::purge_expired)
/// reclaims their memory.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
    ttl: Duration,
}

impl InMemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn arc(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.jobs
            .read()
            .map(|jobs| jobs.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired records; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, JobStoreError> {
        let now = Instant::now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let before = jobs.len();
        jobs.retain(|_, e| e.expires_at > now);
        Ok(before - jobs.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "expired job records purged"),
                    Err(e) => tracing::error!(error = %e, "job ttl sweep failed"),
                }
            }
        })
    }

    fn entry(&self, job: Job) -> Entry {
        Entry {
            job,
            expires_at: Instant::now() + self.ttl,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TTL)
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let now = Instant::now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.get(&job.id).is_some_and(|e| e.expires_at > now) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }

        let mut job = job.clone();
        job.refresh_expiry(Utc::now(), self.ttl);
        jobs.insert(job.id, self.entry(job));
        Ok(())
    }

    async fn read(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = Instant::now();
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        match jobs.get(&id) {
            Some(e) if e.expires_at > now => Ok(e.job.clone()),
            _ => Err(JobStoreError::NotFound(id)),
        }
    }

    async fn update(&self, id: JobId, transition: &JobTransition) -> Result<Job, JobStoreError> {
        let now = Instant::now();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let entry = match jobs.get(&id) {
            Some(e) if e.expires_at > now => e,
            _ => return Err(JobStoreError::NotFound(id)),
        };

        let mut job = entry.job.clone();
        let wall_now = Utc::now();
        job.apply(transition, wall_now)
            .map_err(|reason| JobStoreError::Conflict { id, reason })?;
        job.refresh_expiry(wall_now, self.ttl);

        jobs.insert(id, self.entry(job.clone()));
        Ok(job)
    }
}
