//! File synchronization engine.

use async_trait::async_trait;
use kdev_core::{Result, UpError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::SyncPorts;

/// Controls the sync engine pair (local and remote).
///
/// `local` selects the local instance; otherwise the instance in the dev
/// pod is addressed.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Starts the local instance.
    async fn start(&self) -> Result<()>;

    async fn wait_for_ping(&self, cancel: &CancellationToken, local: bool) -> Result<()>;

    async fn wait_for_scanning(&self, cancel: &CancellationToken, local: bool) -> Result<()>;

    async fn wait_for_connected(&self, cancel: &CancellationToken) -> Result<()>;

    /// Waits for the initial synchronization, reporting percentages.
    ///
    /// Fails with `LostSync`, `InsufficientSpace`, `NeedsSyncReset` or
    /// `UnknownSync`.
    async fn wait_for_completion(
        &self,
        cancel: &CancellationToken,
        progress: mpsc::Sender<f64>,
    ) -> Result<()>;

    /// Restarts both instances in bidirectional mode.
    async fn restart(&self, cancel: &CancellationToken) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn ping(&self, local: bool) -> bool;

    /// Watches the connection and sends one error on `disconnect` when it
    /// is lost. Returns when `cancel` fires.
    async fn monitor(&self, cancel: CancellationToken, disconnect: mpsc::Sender<UpError>);

    fn ports(&self) -> SyncPorts;
}
