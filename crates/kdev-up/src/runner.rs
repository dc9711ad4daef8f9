//! Runs the user's command through a local process.
//!
//! In tunneled mode the command runs through the local `ssh` client against
//! the `Host <name>.kdev` entry written by [`crate::tunnel::ssh_config`]. The
//! process is left running on cancellation; the shutdown sequencer owns its
//! termination so that the whole process tree is signalled while it is still
//! intact.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kdev_core::{Result, UpError};
use kdev_remote::CommandRunner;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Exit code of the OpenSSH client when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

/// [`CommandRunner`] spawning a local process.
#[derive(Debug, Clone)]
pub struct LocalCommandRunner {
    prefix: Vec<String>,
    root_pid: Arc<AtomicU32>,
    inherit_stdio: bool,
}

impl LocalCommandRunner {
    /// Runs commands as-is.
    pub fn new() -> Self {
        Self::with_prefix(Vec::new())
    }

    /// Runs commands behind `prefix`, e.g. `["ssh", "api.kdev"]`.
    pub fn with_prefix(prefix: Vec<String>) -> Self {
        Self {
            prefix,
            root_pid: Arc::new(AtomicU32::new(0)),
            inherit_stdio: true,
        }
    }

    /// Runs commands in the dev pod through the SSH config entry `host`.
    pub fn over_ssh(host: &str) -> Self {
        Self::with_prefix(vec!["ssh".to_string(), "-t".to_string(), host.to_string()])
    }

    /// Discards the command's output instead of sharing the terminal.
    pub fn quiet(mut self) -> Self {
        self.inherit_stdio = false;
        self
    }

    fn is_ssh(&self) -> bool {
        self.prefix.first().map(String::as_str) == Some("ssh")
    }
}

impl Default for LocalCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn run(&self, cancel: CancellationToken, command: Vec<String>) -> Result<()> {
        let mut argv = self.prefix.iter().chain(command.iter());
        let Some(program) = argv.next() else {
            return Err(UpError::user("no command to run", "Set 'command' in your configuration"));
        };

        let mut cmd = Command::new(program);
        cmd.args(argv);
        if !self.inherit_stdio {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        self.root_pid.store(pid, Ordering::SeqCst);
        info!(pid, command = ?command, "Running command");

        let root_pid = Arc::clone(&self.root_pid);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            root_pid.store(0, Ordering::SeqCst);
            let _ = done_tx.send(status);
        });

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(pid, "Command run cancelled");
                Err(UpError::Cancelled)
            }

            status = done_rx => match status {
                Ok(Ok(status)) if status.success() => {
                    info!(pid, "Command completed");
                    Ok(())
                }
                Ok(Ok(status)) if self.is_ssh() && status.code() == Some(SSH_CONNECTION_FAILED) => {
                    Err(UpError::Transport(
                        "ssh: command exited without exit status or exit signal".to_string(),
                    ))
                }
                Ok(Ok(status)) => Err(UpError::CommandFailed {
                    code: status.code(),
                    message: status.to_string(),
                }),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(UpError::Other("command waiter stopped".to_string())),
            },
        }
    }

    fn root_pid(&self) -> Option<u32> {
        match self.root_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_success() {
        let runner = LocalCommandRunner::new().quiet();
        runner.run(CancellationToken::new(), sh("exit 0")).await.unwrap();
        assert_eq!(runner.root_pid(), None);
    }

    #[tokio::test]
    async fn test_failure_carries_exit_code() {
        let runner = LocalCommandRunner::new().quiet();
        let err = runner
            .run(CancellationToken::new(), sh("exit 3"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpError::CommandFailed { code: Some(3), .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_cancel_leaves_process_for_shutdown() {
        let runner = LocalCommandRunner::new().quiet();
        let cancel = CancellationToken::new();

        let task = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel, sh("sleep 30")).await })
        };

        let mut pid = None;
        for _ in 0..50 {
            pid = runner.root_pid();
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.unwrap();

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(UpError::Cancelled)));
        assert_eq!(runner.root_pid(), Some(pid));

        crate::proctree::terminate_tree(pid).unwrap();
        for _ in 0..50 {
            if runner.root_pid().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runner.root_pid(), None);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let runner = LocalCommandRunner::new();
        let err = runner.run(CancellationToken::new(), Vec::new()).await.unwrap_err();
        assert!(err.hint().is_some());
    }
}
