//! Status reporter that writes to the tracing log.

use kdev_remote::StatusReporter;
use tracing::{info, warn};

/// Reports everything through `tracing`.
///
/// Used when there is no interactive terminal, and as the default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn progress(&self, message: &str) {
        info!(target: "kdev::status", "{message}");
    }

    fn success(&self, message: &str) {
        info!(target: "kdev::status", success = true, "{message}");
    }

    fn warning(&self, message: &str) {
        warn!(target: "kdev::status", "{message}");
    }

    fn information(&self, message: &str) {
        info!(target: "kdev::status", "{message}");
    }

    fn record_outcome(&self, event: &str, success: bool) {
        info!(target: "kdev::metrics", event, success, "Outcome recorded");
    }
}
