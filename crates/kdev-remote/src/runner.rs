//! User command execution.

use async_trait::async_trait;
use kdev_core::Result;
use tokio_util::sync::CancellationToken;

/// Runs the user's command against the dev pod.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs until the command exits or `cancel` fires.
    ///
    /// A non-zero exit is `UpError::CommandFailed`.
    async fn run(&self, cancel: CancellationToken, command: Vec<String>) -> Result<()>;

    /// Pid of the local process running the command, if there is one.
    fn root_pid(&self) -> Option<u32>;
}
