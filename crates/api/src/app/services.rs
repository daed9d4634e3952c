use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docdiff_engine::{ComparisonEngine, PdfTextEngine};
use docdiff_infra::config::{AppConfig, Backend, ObjectStoreKind};
use docdiff_infra::job_store::{InMemoryJobStore, JobStore};
use docdiff_infra::jobs::{JobExecutor, SubmissionGateway};
use docdiff_infra::object_store::{InMemoryObjectStore, LocalObjectStore, ObjectStore};
use docdiff_queue::{InMemoryTaskQueue, TaskQueue};
use tokio::task::JoinHandle;

#[cfg(feature = "redis")]
use docdiff_infra::{job_store::RedisJobStore, queue::RedisStreamsTaskQueue};
#[cfg(feature = "s3")]
use docdiff_infra::object_store::S3ObjectStore;

/// How often the in-memory job store drops expired records.
const TTL_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// What request handlers get to see.
#[derive(Clone)]
pub struct AppServices {
    pub gateway: SubmissionGateway,
}

/// The shared job store, task queue and object store, built from config.
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub objects: Arc<dyn ObjectStore>,
    sweeper: Option<JoinHandle<()>>,
}

impl Backends {
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let objects = build_object_store(config).await?;

        match config.backend {
            Backend::Memory => Ok(Self::in_memory(config, objects)),
            Backend::Redis => build_redis(config, objects).await,
        }
    }

    /// Process-local store and queue. Must be called inside a tokio runtime.
    pub fn in_memory(config: &AppConfig, objects: Arc<dyn ObjectStore>) -> Self {
        let store = InMemoryJobStore::arc(config.job_ttl);
        let sweeper = store.spawn_sweeper(TTL_SWEEP_EVERY);
        Self {
            store,
            queue: Arc::new(InMemoryTaskQueue::new(config.visibility_timeout)),
            objects,
            sweeper: Some(sweeper),
        }
    }

    pub fn gateway(&self, config: &AppConfig) -> SubmissionGateway {
        SubmissionGateway::new(self.store.clone(), self.queue.clone(), self.objects.clone())
            .with_retry_policy(&config.retry_policy())
            .with_limits(config.upload_limits())
    }

    pub fn executor(&self, config: &AppConfig, engine: Arc<dyn ComparisonEngine>) -> JobExecutor {
        JobExecutor::new(
            self.store.clone(),
            self.queue.clone(),
            self.objects.clone(),
            engine,
            config.retry_policy(),
        )
        .with_config(config.executor_config("docdiff-worker"))
    }

    pub fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// The default engine: `pdftotext` + line diff.
pub fn pdf_engine(config: &AppConfig) -> Arc<dyn ComparisonEngine> {
    Arc::new(PdfTextEngine::new(&config.pdftotext_bin))
}

async fn build_object_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match &config.object_store {
        ObjectStoreKind::Local { root } => {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("failed to create object store directory {}", root.display()))?;
            tracing::info!(root = %root.display(), "using local object store");
            Ok(Arc::new(LocalObjectStore::new(root.clone())))
        }
        ObjectStoreKind::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        #[cfg(feature = "s3")]
        ObjectStoreKind::S3 { bucket, endpoint_url } => {
            tracing::info!(bucket = %bucket, endpoint = ?endpoint_url, "using S3 object store");
            Ok(Arc::new(S3ObjectStore::new(bucket.clone(), endpoint_url.clone()).await))
        }
        #[cfg(not(feature = "s3"))]
        ObjectStoreKind::S3 { .. } => anyhow::bail!("OBJECT_STORE=s3 requires the `s3` feature"),
    }
}

#[cfg(feature = "redis")]
async fn build_redis(config: &AppConfig, objects: Arc<dyn ObjectStore>) -> anyhow::Result<Backends> {
    let store = RedisJobStore::connect(&config.redis_url, config.job_ttl)
        .await
        .context("failed to connect Redis job store")?;
    let queue = RedisStreamsTaskQueue::connect(&config.redis_url, config.visibility_timeout)
        .await
        .context("failed to connect Redis Streams task queue")?;
    tracing::info!(consumer = queue.consumer_name(), "using Redis job store and task queue");

    Ok(Backends {
        store: Arc::new(store),
        queue: Arc::new(queue),
        objects,
        sweeper: None,
    })
}

#[cfg(not(feature = "redis"))]
async fn build_redis(_config: &AppConfig, _objects: Arc<dyn ObjectStore>) -> anyhow::Result<Backends> {
    anyhow::bail!("DOCDIFF_BACKEND=redis requires the `redis` feature")
}
