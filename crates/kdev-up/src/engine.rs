//! Top-level entry: claim the session, run the loop, release.

use std::path::PathBuf;

use kdev_core::{Result, SessionPhase, UpConfig, UpError, WorkloadRef};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pid;
use crate::session::{Collaborators, Session};

/// Runs one `up` session to completion.
pub struct UpEngine {
    session: Session,
    home: PathBuf,
    handle_signals: bool,
}

impl UpEngine {
    /// Validates `config` and prepares a session.
    pub fn new(
        workload: WorkloadRef,
        config: UpConfig,
        collab: Collaborators,
        home: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let home = home.into();
        Ok(Self {
            session: Session::new(workload, config, collab, home.clone()),
            home,
            handle_signals: true,
        })
    }

    /// Writes the SSH host entry to `path` instead of `~/.ssh/config`.
    pub fn with_ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.session = self.session.with_ssh_config_path(path);
        self
    }

    /// Leaves SIGINT/SIGTERM alone; callers stop the session through
    /// [`UpEngine::cancel_token`].
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Cancelling this token ends the session after a final shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.session.cancel_token()
    }

    /// Claims the pid marker and runs attempts until the session ends.
    ///
    /// A signal or a takeover by another instance cancels the session; the
    /// running attempt still shuts down before this returns. The marker is
    /// released last, and only if this process still owns it.
    pub async fn start(self) -> Result<()> {
        let UpEngine {
            mut session,
            home,
            handle_signals,
        } = self;
        let workload = session.workload().clone();
        let cancel = session.cancel_token();

        let marker = pid::claim(&home, &workload.namespace, &workload.name)?;
        info!(workload = %workload, pid = marker.pid(), "Session started");

        let watch_cancel = CancellationToken::new();
        let mut takeover = match pid::watch_for_takeover(&marker, watch_cancel.clone()) {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(error = %e, "Not watching pid marker");
                None
            }
        };

        let result = {
            let run = session.run();
            tokio::pin!(run);

            tokio::select! {
                biased;

                result = &mut run => result,

                _ = wait_for_shutdown_signal(), if handle_signals => {
                    info!("Shutdown signal received");
                    cancel.cancel();
                    log_interrupted(run.await);
                    Ok(())
                }

                Some(err) = async {
                    match takeover.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!(error = %err, "Session taken over");
                    cancel.cancel();
                    log_interrupted(run.await);
                    Err(err)
                }
            }
        };

        watch_cancel.cancel();
        // A taken-over session leaves the state file to its new owner.
        if let Err(e) = &result {
            if !matches!(e, UpError::Cancelled | UpError::Deactivated) {
                session.note_phase(SessionPhase::Failed).await;
            }
        }
        pid::release(&marker);

        match &result {
            Ok(()) => info!(workload = %workload, "Session ended"),
            Err(e) => info!(workload = %workload, error = %e, "Session ended with error"),
        }
        result
    }
}

/// Records how the loop ended once the session was stopped from outside.
fn log_interrupted(result: Result<()>) {
    match result {
        Ok(()) | Err(UpError::Cancelled) => debug!("Activation loop stopped"),
        Err(e) => debug!(error = %e, "Activation loop stopped with error"),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
