//! Ordered teardown of one attempt.
//!
//! Runs after every attempt, successful or not, and at most once per attempt.
//! Each step is best-effort: a failing step is logged and the next one still
//! runs.
//!
//! 1. restore the local terminal
//! 2. record a failure metric if the session never got to serve
//! 3. cancel the attempt
//! 4. stop the sync engine, bounded by `sync_stop`
//! 5. stop the forwarder (and with it the global forwards)
//! 6. terminate the local process tree of the user's command
//! 7. signal completion

use kdev_core::Result;
use tracing::{debug, info, warn};

use crate::attempt::Attempt;
use crate::proctree;
use crate::session::Session;
use crate::terminal;

impl Session {
    /// Tears the attempt down. A second call is a no-op.
    pub async fn shutdown(&self, attempt: &mut Attempt) {
        let Some(completion) = attempt.begin_shutdown() else {
            debug!("Shutdown already ran for this attempt");
            return;
        };
        info!("Starting shutdown sequence");

        terminal::restore();

        if !self.retry.has_succeeded() {
            self.collab.reporter.record_outcome("up", false);
        }

        attempt.cancel.cancel();
        debug!("Sent cancellation signal");

        if attempt.sync_started {
            self.stop_sync().await;
        }

        if let Some(mut forwarder) = attempt.forwarder.take() {
            debug!(mode = forwarder.mode(), "Stopping forwarder");
            forwarder.stop().await;
        }

        if let Some(root) = self.collab.runner.root_pid() {
            if let Err(e) = terminate_command(root).await {
                warn!(pid = root, error = %e, "Failed to terminate command process tree");
            }
        }

        let _ = completion.send(());
        info!("Completed shutdown sequence");
    }

    async fn stop_sync(&self) {
        let timeout = self.config.timeouts.sync_stop();
        match tokio::time::timeout(timeout, self.collab.sync.stop()).await {
            Ok(Ok(())) => debug!("Synchronization service stopped"),
            Ok(Err(e)) => info!(error = %e, "Failed to stop synchronization service"),
            Err(_) => warn!(timeout_secs = timeout.as_secs(), "Synchronization service stop timed out"),
        }
    }
}

async fn terminate_command(root: u32) -> Result<()> {
    debug!(pid = root, "Terminating command process tree");
    tokio::task::spawn_blocking(move || proctree::terminate_tree(root))
        .await
        .map_err(|e| kdev_core::UpError::Other(format!("process tree task failed: {e}")))??;
    Ok(())
}
