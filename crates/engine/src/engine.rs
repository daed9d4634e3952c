use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use docdiff_core::ComparisonResult;
use thiserror::Error;

/// Errors raised by a comparison engine.
///
/// Each variant is either *permanent* (the input itself is bad; retrying cannot
/// help) or *transient* (the environment failed; a later attempt may succeed).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input is not a document the engine understands.
    #[error("malformed input {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// The document looked valid but could not be parsed.
    #[error("unparseable document: {0}")]
    Unparseable(String),

    #[error("external tool not found: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine failure: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// `true` when retrying the same inputs cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, EngineError::Malformed { .. } | EngineError::Unparseable(_))
    }
}

/// Computes the differences between two local documents.
#[async_trait]
pub trait ComparisonEngine: Send + Sync {
    async fn compare(&self, left: &Path, right: &Path) -> Result<ComparisonResult, EngineError>;
}

#[async_trait]
impl<E> ComparisonEngine for Arc<E>
where
    E: ComparisonEngine + ?Sized,
{
    async fn compare(&self, left: &Path, right: &Path) -> Result<ComparisonResult, EngineError> {
        (**self).compare(left, right).await
    }
}
