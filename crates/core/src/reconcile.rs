//! Contract between the engine and the business logic it drives.

use std::sync::Arc;
use std::time::Duration;

/// Successful reconcile. Optionally asks for a timed requeue and carries a
/// status body for the status sub-resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
    pub status: Option<serde_json::Value>,
}

impl Action {
    /// Converged; wait for the next triggering event.
    pub fn done() -> Self { Self::default() }

    pub fn requeue_after(delay: Duration) -> Self {
        Self { requeue_after: Some(delay), status: None }
    }

    pub fn with_status(mut self, status: serde_json::Value) -> Self {
        self.status = Some(status);
        self
    }
}

/// Failure reported by a reconcile function.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Retryable, e.g. a dependent resource is not ready yet.
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying without a new trigger cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ReconcileError {
    pub fn transient(e: impl std::fmt::Display) -> Self { Self::Transient(e.to_string()) }
    pub fn permanent(e: impl std::fmt::Display) -> Self { Self::Permanent(e.to_string()) }
}

/// Externally supplied reconcile function, called with a fresh read of the
/// primary object.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, obj: Arc<serde_json::Value>) -> Result<Action, ReconcileError>;
}
