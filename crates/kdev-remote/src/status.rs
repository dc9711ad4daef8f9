//! Session state persistence and user-facing status.

use async_trait::async_trait;
use kdev_core::{Result, SessionPhase, WorkloadRef};
use tracing::debug;

/// Persists the session phase for other tools to poll.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn update(&self, workload: &WorkloadRef, phase: SessionPhase) -> Result<()>;
}

/// Sink for progress and outcome messages.
pub trait StatusReporter: Send + Sync {
    /// A long-running step started or changed.
    fn progress(&self, message: &str);

    fn success(&self, message: &str);

    fn warning(&self, message: &str);

    fn information(&self, message: &str);

    /// Records the outcome of a session for metrics.
    fn record_outcome(&self, event: &str, success: bool) {
        debug!(event, success, "Outcome recorded");
    }
}
