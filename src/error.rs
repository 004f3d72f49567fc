//! Engine error taxonomy.
//!
//! Only genuinely exceptional conditions travel through [`EngineError`]:
//! expected non-success outcomes (match not ready, already settled) are
//! returned as typed values by the services instead.

use std::fmt;
use std::future::Future;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

/// Errors raised by stores, services and job processors.
#[derive(Debug)]
pub enum EngineError {
    /// Optimistic-lock mismatch or a contended lock. Always retryable.
    Conflict { entity: &'static str, id: String },

    /// Work that cannot happen yet; re-checked later.
    NotReady(String),

    /// The side effect was already applied. Callers treat this as success.
    AlreadyDone(String),

    /// A referenced row does not exist. Fatal for the job instance.
    NotFound { entity: &'static str, id: String },

    /// Database/Redis unavailable, timeouts, anything unforeseen.
    Unexpected(anyhow::Error),
}

impl EngineError {
    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        EngineError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn match_not_found(id: Uuid) -> Self {
        Self::not_found("match", id)
    }

    pub fn unexpected(msg: impl fmt::Display) -> Self {
        EngineError::Unexpected(anyhow::anyhow!("{msg}"))
    }

    /// Whether the job layer should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::NotReady(_) | EngineError::Unexpected(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotReady(_) => "not_ready",
            EngineError::AlreadyDone(_) => "already_done",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Unexpected(_) => "unexpected",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Conflict { entity, id } => {
                write!(f, "Version conflict on {} {}", entity, id)
            }
            EngineError::NotReady(reason) => write!(f, "Not ready: {}", reason),
            EngineError::AlreadyDone(what) => write!(f, "Already done: {}", what),
            EngineError::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            EngineError::Unexpected(e) => write!(f, "Unexpected error: {:#}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Unexpected(e.into())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Unexpected(e.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Unexpected(e.into())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Unexpected(e)
    }
}

impl From<tokio::time::error::Elapsed> for EngineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        EngineError::unexpected("operation timed out")
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Re-run `op` a few times in-process while it fails with
/// [`EngineError::Conflict`]. Other errors return immediately.
pub async fn retry_on_conflict<T, F, Fut>(op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(5).map(jitter).take(3);
    RetryIf::spawn(strategy, op, |e: &EngineError| e.is_conflict()).await
}
