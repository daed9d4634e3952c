//! Process configuration, read from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docdiff_core::RetryPolicy;
use thiserror::Error;

use crate::jobs::executor::DEFAULT_LEASE_SLACK;
use crate::jobs::{JobExecutorConfig, UploadLimits};

/// Which parts of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// HTTP gateway only
    Serve,
    /// Executor loops only
    Worker,
    /// Both, sharing one process
    All,
}

impl Role {
    pub fn runs_gateway(self) -> bool {
        matches!(self, Role::Serve | Role::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Role::Serve => "serve",
            Role::Worker => "worker",
            Role::All => "all",
        })
    }
}

/// Job store + task queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreKind {
    Local { root: PathBuf },
    Memory,
    S3 { bucket: String, endpoint_url: Option<String> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("MAX_ATTEMPTS must be at least 1")]
    NoAttempts,

    #[error(
        "visibility timeout ({visibility:?}) must exceed the processing lease ({lease:?}); \
         raise VISIBILITY_TIMEOUT_SECS or lower ATTEMPT_TIMEOUT_SECS"
    )]
    VisibilityTooShort { visibility: Duration, lease: Duration },

    #[error("the memory backend cannot be shared across processes; role {0} needs DOCDIFF_BACKEND=redis")]
    MemoryBackendNeedsAllRole(Role),

    #[error("{what} requires building with the `{feature}` feature")]
    FeatureDisabled { what: &'static str, feature: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: Backend,
    pub redis_url: String,
    pub object_store: ObjectStoreKind,
    pub job_ttl: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    pub visibility_timeout: Duration,
    pub worker_concurrency: usize,
    pub max_upload_bytes: usize,
    pub bind_addr: SocketAddr,
    pub pdftotext_bin: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let backend = match get("DOCDIFF_BACKEND").as_deref().map(str::trim) {
            None | Some("memory") => Backend::Memory,
            Some("redis") => Backend::Redis,
            Some(other) => return Err(invalid("DOCDIFF_BACKEND", other, "expected `memory` or `redis`")),
        };

        let object_store = match get("OBJECT_STORE").as_deref().map(str::trim) {
            None | Some("local") => ObjectStoreKind::Local {
                root: get("OBJECT_STORE_DIR").unwrap_or_else(|| "./data/objects".into()).into(),
            },
            Some("memory") => ObjectStoreKind::Memory,
            Some("s3") => ObjectStoreKind::S3 {
                bucket: get("S3_BUCKET").unwrap_or_else(|| "pdf-uploads".into()),
                endpoint_url: get("S3_ENDPOINT_URL"),
            },
            Some(other) => return Err(invalid("OBJECT_STORE", other, "expected `local`, `memory` or `s3`")),
        };

        Ok(Self {
            backend,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/0".into()),
            object_store,
            job_ttl: Duration::from_secs(parse(&get, "JOB_TTL_SECS", 86_400)?),
            max_attempts: parse(&get, "MAX_ATTEMPTS", 3)?,
            backoff_base: Duration::from_millis(parse(&get, "BACKOFF_BASE_MS", 1_000)?),
            backoff_max: Duration::from_millis(parse(&get, "BACKOFF_MAX_MS", 60_000)?),
            attempt_timeout: Duration::from_secs(parse(&get, "ATTEMPT_TIMEOUT_SECS", 300)?),
            visibility_timeout: Duration::from_secs(parse(&get, "VISIBILITY_TIMEOUT_SECS", 600)?),
            worker_concurrency: parse(&get, "WORKER_CONCURRENCY", 2)?,
            max_upload_bytes: parse(&get, "MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            bind_addr: parse(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            pdftotext_bin: get("PDFTOTEXT_BIN").unwrap_or_else(|| "pdftotext".into()),
        })
    }

    /// Check the settings hang together for a process running `role`.
    pub fn validate(&self, role: Role) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.visibility_timeout <= self.lease() {
            return Err(ConfigError::VisibilityTooShort {
                visibility: self.visibility_timeout,
                lease: self.lease(),
            });
        }
        if self.backend == Backend::Memory && role != Role::All {
            return Err(ConfigError::MemoryBackendNeedsAllRole(role));
        }
        if self.object_store == ObjectStoreKind::Memory && role != Role::All {
            return Err(invalid("OBJECT_STORE", "memory", "only usable with the `all` role"));
        }
        if self.backend == Backend::Redis && !cfg!(feature = "redis") {
            return Err(ConfigError::FeatureDisabled {
                what: "DOCDIFF_BACKEND=redis",
                feature: "redis",
            });
        }
        if matches!(self.object_store, ObjectStoreKind::S3 { .. }) && !cfg!(feature = "s3") {
            return Err(ConfigError::FeatureDisabled {
                what: "OBJECT_STORE=s3",
                feature: "s3",
            });
        }
        Ok(())
    }

    /// Processing lease taken by each attempt.
    pub fn lease(&self) -> Duration {
        self.attempt_timeout + DEFAULT_LEASE_SLACK
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base, self.backoff_max)
    }

    pub fn executor_config(&self, name: impl Into<String>) -> JobExecutorConfig {
        JobExecutorConfig {
            lease_slack: DEFAULT_LEASE_SLACK,
            ..JobExecutorConfig::default()
        }
        .with_name(name)
        .with_concurrency(self.worker_concurrency)
        .with_attempt_timeout(self.attempt_timeout)
    }

    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_bytes: self.max_upload_bytes,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(
            cfg.object_store,
            ObjectStoreKind::Local {
                root: "./data/objects".into()
            }
        );
        assert_eq!(cfg.job_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.max_upload_bytes, 52_428_800);
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert!(cfg.validate(Role::All).is_ok());
    }

    #[test]
    fn overrides_and_derived_settings() {
        let cfg = config(&[
            ("MAX_ATTEMPTS", "5"),
            ("BACKOFF_BASE_MS", "250"),
            ("WORKER_CONCURRENCY", "8"),
            ("ATTEMPT_TIMEOUT_SECS", "10"),
            ("OBJECT_STORE", "s3"),
            ("S3_ENDPOINT_URL", "http://minio:9000"),
        ])
        .unwrap();

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));

        let exec = cfg.executor_config("worker-1");
        assert_eq!(exec.concurrency, 8);
        assert_eq!(exec.lease(), Duration::from_secs(40));

        assert_eq!(
            cfg.object_store,
            ObjectStoreKind::S3 {
                bucket: "pdf-uploads".into(),
                endpoint_url: Some("http://minio:9000".into())
            }
        );
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config(&[("MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MAX_ATTEMPTS", .. }));

        let err = config(&[("DOCDIFF_BACKEND", "postgres")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "DOCDIFF_BACKEND", .. }));
    }

    #[test]
    fn visibility_must_outlast_the_lease() {
        let cfg = config(&[("ATTEMPT_TIMEOUT_SECS", "600"), ("VISIBILITY_TIMEOUT_SECS", "600")]).unwrap();
        assert!(matches!(
            cfg.validate(Role::All),
            Err(ConfigError::VisibilityTooShort { .. })
        ));
    }

    #[test]
    fn memory_backend_is_single_process_only() {
        let cfg = config(&[]).unwrap();
        assert_eq!(
            cfg.validate(Role::Worker),
            Err(ConfigError::MemoryBackendNeedsAllRole(Role::Worker))
        );
        assert!(cfg.validate(Role::Serve).is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let cfg = config(&[("MAX_ATTEMPTS", "0")]).unwrap();
        assert_eq!(cfg.validate(Role::All), Err(ConfigError::NoAttempts));
    }

    #[test]
    fn redis_backend_follows_the_feature_flag() {
        let cfg = config(&[("DOCDIFF_BACKEND", "redis")]).unwrap();
        let checked = cfg.validate(Role::Worker);
        if cfg!(feature = "redis") {
            assert!(checked.is_ok());
        } else {
            assert!(matches!(checked, Err(ConfigError::FeatureDisabled { feature: "redis", .. })));
        }
    }
}
