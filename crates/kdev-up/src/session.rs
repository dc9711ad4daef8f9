//! Session-wide state shared by every attempt.

use std::path::PathBuf;
use std::sync::Arc;

use kdev_core::{RetryState, SessionPhase, UpConfig, WorkloadRef};
use kdev_remote::{
    Cluster, CommandRunner, StateStore, StatusReporter, SyncEngine, WorkloadMutator,
    WorkloadResolver,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::paths;

/// Everything the engine drives but does not implement.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn Cluster>,
    pub resolver: Arc<dyn WorkloadResolver>,
    pub mutator: Arc<dyn WorkloadMutator>,
    pub sync: Arc<dyn SyncEngine>,
    pub runner: Arc<dyn CommandRunner>,
    pub state: Arc<dyn StateStore>,
    pub reporter: Arc<dyn StatusReporter>,
}

/// One `up` session: identity, configuration and retry bookkeeping.
///
/// Owned by the activation loop. Helper tasks get clones of what they need
/// at spawn time and report back through the attempt's channels.
pub struct Session {
    pub(crate) workload: WorkloadRef,
    pub(crate) config: UpConfig,
    pub(crate) collab: Collaborators,
    pub(crate) home: PathBuf,
    pub(crate) ssh_config_path: PathBuf,
    /// Process-wide token, parent of every attempt token.
    pub(crate) cancel: CancellationToken,
    pub(crate) retry: RetryState,
    /// Set after the first successful mutation.
    pub(crate) is_retry: bool,
}

impl Session {
    pub fn new(
        workload: WorkloadRef,
        config: UpConfig,
        collab: Collaborators,
        home: impl Into<PathBuf>,
    ) -> Self {
        let retry = RetryState::new(config.max_unhandled_retries);
        Self {
            workload,
            config,
            collab,
            home: home.into(),
            ssh_config_path: paths::ssh_config_file(),
            cancel: CancellationToken::new(),
            retry,
            is_retry: false,
        }
    }

    /// Writes the SSH host entry to `path` instead of `~/.ssh/config`.
    pub fn with_ssh_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_config_path = path.into();
        self
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    pub fn config(&self) -> &UpConfig {
        &self.config
    }

    /// Token whose cancellation ends the session for good.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn has_succeeded(&self) -> bool {
        self.retry.has_succeeded()
    }

    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    pub(crate) async fn set_phase(&self, phase: SessionPhase) -> kdev_core::Result<()> {
        self.collab.state.update(&self.workload, phase).await
    }

    /// Phase updates whose failure must not end the attempt.
    pub(crate) async fn note_phase(&self, phase: SessionPhase) {
        if let Err(e) = self.set_phase(phase).await {
            info!(phase = %phase, error = %e, "Failed to update session state");
        }
    }
}
