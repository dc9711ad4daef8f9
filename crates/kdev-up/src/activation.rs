//! The activation loop.
//!
//! ```text
//!  ┌─► Init ─► ResolveWorkload ─► AwaitWake ─► MutateToDevMode ─┐
//!  │                                                             │
//!  │   Serve ◄─ StartSync ◄─ EstablishTunnel ◄───────────────────┘
//!  │     │
//!  │     ▼
//!  │  Shutdown ─► classify ─┬─ lost sync ────────► loop now
//!  │                        ├─ retryable ────────► wait retry tick
//!  └────────────────────────┘  fatal / ok ───────► return
//! ```
//!
//! Every step runs under the attempt's token, so cancelling it unblocks
//! whatever the attempt is waiting on.

use std::sync::Arc;
use std::time::Duration;

use kdev_core::error::DOWN_COMMAND;
use kdev_core::forward::{SYNC_CLUSTER_PORT, SYNC_GUI_PORT};
use kdev_core::{is_retryable, ErrorKind, ForwardRule, Result, SessionPhase, UpError};
use kdev_remote::{PodInfo, Variant, WorkloadHandle};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attempt::Attempt;
use crate::readiness::ReadinessWatcher;
use crate::session::Session;
use crate::tunnel::ssh_config::{self, SshHostEntry};
use crate::tunnel::{
    parse_interface, Forwarder, GlobalForwarder, PortForwardManager, SshForwardManager,
    TunnelContext,
};

/// Initial synchronizations slower than this get an ignore-file warning.
const LONG_SYNC: Duration = Duration::from_secs(60);

/// Bound on the liveness ping after the user's command fails.
const SYNC_PING_TIMEOUT: Duration = Duration::from_secs(5);

const RECONNECT_NOTICE: &str = "Connection lost to your development container, reconnecting...";

impl Session {
    /// Runs attempts until one ends the session.
    ///
    /// Returns `Ok(())` when the user's command completes or the dev
    /// container was deactivated, and the error that ended the session
    /// otherwise.
    pub async fn run(&mut self) -> Result<()> {
        let retry_interval = self.config.timeouts.retry_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + retry_interval, retry_interval);
        let mut iteration: u64 = 0;
        let mut notified = false;

        loop {
            iteration += 1;
            let mut attempt = Attempt::new(&self.cancel);
            let completion = attempt.completion();

            let result = self.activate(&mut attempt).await;
            self.shutdown(&mut attempt).await;
            if let Some(done) = completion {
                let _ = done.await;
            }

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            info!(iteration, error = %err, "Activation attempt failed");

            if self.cancel.is_cancelled() {
                debug!("Session cancelled, not retrying");
                return Err(UpError::Cancelled);
            }
            if attempt.served {
                notified = false;
            }

            if matches!(err, UpError::LostSync) {
                self.retry.reset_unhandled();
                continue;
            }

            if !is_retryable(&mut self.retry, Some(&err)) {
                return Err(err);
            }
            if !notified {
                self.collab.reporter.warning(RECONNECT_NOTICE);
                notified = true;
            }
            debug!(
                iteration,
                unhandled = self.retry.unhandled_retries(),
                "Waiting before next attempt"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(UpError::Cancelled),
                _ = ticker.tick() => {}
            }
        }
    }

    /// One attempt, from `Init` to the end of `Serve`.
    pub(crate) async fn activate(&mut self, attempt: &mut Attempt) -> Result<()> {
        let result = self.activate_steps(attempt).await;
        match result {
            Err(UpError::LostSync) => {
                if !self.config.persistent_volume {
                    if let Some(pod) = &attempt.pod {
                        info!(pod = %pod.name, "Destroying dev pod after losing sync");
                        self.collab
                            .cluster
                            .destroy_pod(&self.workload.namespace, &pod.name)
                            .await?;
                    }
                }
                Err(UpError::LostSync)
            }
            other => other,
        }
    }

    async fn activate_steps(&mut self, attempt: &mut Attempt) -> Result<()> {
        info!(retry = self.is_retry, workload = %self.workload, "Activating development container");
        self.set_phase(SessionPhase::Activating).await?;

        let cancel = attempt.cancel.clone();
        let resolved = self
            .collab
            .resolver
            .resolve(&cancel, &self.workload, self.config.autocreate, self.is_retry)
            .await?;
        let handle = resolved.handle;
        let created = resolved.created;

        if created && handle.name_taken && !self.is_retry {
            return Err(self.ownership_error());
        }
        if self.is_retry && !handle.dev_mode_on {
            self.collab
                .reporter
                .information("Development container has been deactivated");
            return Ok(());
        }
        if handle.dev_mode_on && handle.modified_externally {
            return Err(self.drift_error());
        }

        if handle.sleeping && !created {
            self.await_wake(&cancel, &handle).await?;
        }

        attempt.reapply = self
            .collab
            .resolver
            .watch_drift(cancel.clone(), &handle)
            .await?;

        let pod = self
            .mutate(attempt, &handle, created)
            .await
            .map_err(activation_error)?;
        if self.is_retry {
            self.collab.reporter.record_outcome("reconnect", true);
        }
        self.is_retry = true;

        self.establish_tunnel(attempt, &pod).await?;
        self.start_sync(attempt).await?;

        self.retry.mark_success();
        self.serve(attempt).await
    }

    // ========================================================================
    // ResolveWorkload / AwaitWake
    // ========================================================================

    fn ownership_error(&self) -> UpError {
        UpError::user(
            format!(
                "{} '{}' already exists in namespace '{}'",
                self.workload.kind, self.workload.name, self.workload.namespace
            ),
            "Use a different name for your development container, or deploy the existing one before running 'kdev up'",
        )
    }

    fn drift_error(&self) -> UpError {
        UpError::user(
            format!(
                "{} '{}' has been modified while your development container was active",
                self.workload.kind, self.workload.name
            ),
            format!(
                "Follow these steps:\n      \
                 1. Execute '{DOWN_COMMAND}'\n      \
                 2. Apply your manifest changes again: 'kubectl apply'\n      \
                 3. Execute 'kdev up' again"
            ),
        )
    }

    /// Polls until the workload is no longer sleeping. Running out of time
    /// only warns; the attempt carries on.
    async fn await_wake(&self, cancel: &CancellationToken, handle: &WorkloadHandle) -> Result<()> {
        self.collab
            .reporter
            .progress("Waking up your development container...");
        let deadline = Instant::now() + self.config.timeouts.wake();
        let poll = self.config.timeouts.wake_poll();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(workload = %self.workload, "Workload still sleeping after wake timeout");
                    self.collab.reporter.warning(
                        "Your development container is taking too long to wake up, continuing anyway",
                    );
                    return Ok(());
                }
                _ = tokio::time::sleep(poll) => {}
            }

            let current = self.collab.resolver.refresh(cancel, handle).await?;
            if !current.sleeping {
                debug!(workload = %self.workload, "Workload woke up");
                return Ok(());
            }
        }
    }

    // ========================================================================
    // MutateToDevMode
    // ========================================================================

    async fn mutate(
        &self,
        attempt: &mut Attempt,
        handle: &WorkloadHandle,
        created: bool,
    ) -> Result<PodInfo> {
        let cancel = attempt.cancel.clone();
        self.set_phase(SessionPhase::Starting).await?;
        self.collab
            .reporter
            .progress("Activating your development container...");

        if self.config.persistent_volume {
            self.collab.mutator.create_volume(&cancel, &self.workload).await?;
        }

        let reset = self.config.reset_sync || !self.config.persistent_volume;
        let set = self
            .collab
            .mutator
            .compute_dev_mode_translations(&cancel, handle, reset)
            .await?;
        self.collab.mutator.apply_dev_mode(&set).await?;
        for translation in &set.translations {
            debug!(translation = translation.name(), "Deploying dev variant");
            translation.deploy(&cancel, Variant::Dev).await?;
        }

        let pod = self
            .collab
            .cluster
            .get_dev_pod(&cancel, &self.workload, created)
            .await?;
        attempt.pod = Some(pod.clone());

        let watcher = ReadinessWatcher::new(
            Arc::clone(&self.collab.cluster),
            Arc::clone(&self.collab.state),
            Arc::clone(&self.collab.reporter),
            self.workload.clone(),
            self.config.persistent_volume,
            self.config.timeouts.clone(),
        );
        watcher.wait_until_running(&cancel, &pod).await?;
        Ok(pod)
    }

    // ========================================================================
    // EstablishTunnel
    // ========================================================================

    fn tunnel_context(&self) -> Result<TunnelContext> {
        Ok(TunnelContext {
            cluster: Arc::clone(&self.collab.cluster),
            reporter: Arc::clone(&self.collab.reporter),
            namespace: self.workload.namespace.clone(),
            interface: parse_interface(&self.config.interface)?,
        })
    }

    async fn establish_tunnel(&self, attempt: &mut Attempt, pod: &PodInfo) -> Result<()> {
        let ctx = self.tunnel_context()?;
        let ports = self.collab.sync.ports();
        let mut forwards = vec![
            ForwardRule::new(ports.local_data, SYNC_CLUSTER_PORT),
            ForwardRule::new(ports.local_gui, SYNC_GUI_PORT),
        ];
        forwards.extend(self.config.forward.iter().cloned());

        let forwarder = if self.config.remote_mode {
            let mut manager = SshForwardManager::new(
                ctx.clone(),
                self.config.ssh.clone(),
                self.config.timeouts.clone(),
                &self.home,
            );
            manager.add_all(forwards, self.config.reverse.clone())?;
            Forwarder::Ssh(manager)
        } else {
            if !self.config.reverse.is_empty() {
                return Err(UpError::user(
                    "reverse forwards need an SSH tunnel",
                    "Set 'remote_mode = true' in your configuration",
                ));
            }
            let mut manager = PortForwardManager::new(ctx.clone(), self.config.timeouts.clone());
            manager.add_all(forwards)?;
            Forwarder::Direct(manager)
        };

        let forwarder = attempt.forwarder.insert(forwarder);
        forwarder.start(&attempt.cancel, &pod.name).await?;
        info!(mode = forwarder.mode(), pod = %pod.name, "Tunnel established");

        if let Forwarder::Ssh(manager) = &*forwarder {
            if let Some(port) = manager.ssh_port() {
                let entry = SshHostEntry {
                    host: SshHostEntry::host_for(&self.workload.name),
                    interface: ctx.interface,
                    port,
                    user: self.config.ssh.user.clone(),
                    identity_file: manager.key_path().display().to_string(),
                };
                if let Err(e) = ssh_config::add_entry(&self.ssh_config_path, &entry) {
                    warn!(error = %e, "Failed to write SSH config entry");
                }
            }
        }

        if !self.config.global_forward.is_empty() {
            if let Some(registrar) = forwarder.registrar() {
                let global = GlobalForwarder::new(
                    ctx,
                    self.config.global_forward.clone(),
                    &self.workload.name,
                    self.config.timeouts.global_forward_poll(),
                );
                tokio::spawn(global.run(attempt.cancel.clone(), registrar, attempt.global_tx.clone()));
            }
        }
        Ok(())
    }

    // ========================================================================
    // StartSync
    // ========================================================================

    async fn start_sync(&self, attempt: &mut Attempt) -> Result<()> {
        let cancel = attempt.cancel.clone();
        let sync = Arc::clone(&self.collab.sync);
        let reporter = Arc::clone(&self.collab.reporter);

        self.set_phase(SessionPhase::StartingSync).await?;
        reporter.progress("Starting the file synchronization service...");
        sync.start().await?;
        attempt.sync_started = true;

        sync.wait_for_ping(&cancel, true).await?;
        if let Err(e) = sync.wait_for_ping(&cancel, false).await {
            info!(error = %e, "Remote synchronization service did not answer");
            if e.is_transient() || matches!(e, UpError::Cancelled) {
                return Err(e);
            }
            return Err(self.sync_start_error(attempt));
        }

        reporter.progress("Scanning file system...");
        sync.wait_for_scanning(&cancel, true).await?;
        sync.wait_for_scanning(&cancel, false).await?;
        sync.wait_for_connected(&cancel).await?;

        self.set_phase(SessionPhase::Synchronizing).await?;
        let started = Instant::now();
        self.synchronize(&cancel).await?;
        reporter.success("Files synchronized");

        let elapsed = started.elapsed();
        if elapsed > LONG_SYNC {
            reporter.warning(&format!(
                "File synchronization took {}s\n    \
                 Consider updating your '.stignore' to optimize the file synchronization",
                elapsed.as_secs()
            ));
        }

        let monitor_sync = Arc::clone(&sync);
        let monitor_cancel = cancel.clone();
        let disconnect = attempt.disconnect_tx.clone();
        tokio::spawn(async move { monitor_sync.monitor(monitor_cancel, disconnect).await });

        debug!("Restarting synchronization service in send-receive mode");
        sync.restart(&cancel).await
    }

    async fn synchronize(&self, cancel: &CancellationToken) -> Result<()> {
        self.collab.reporter.progress("Synchronizing your files...");

        let (progress_tx, mut progress_rx) = mpsc::channel::<f64>(16);
        let reporter = Arc::clone(&self.collab.reporter);
        let progress = tokio::spawn(async move {
            while let Some(value) = progress_rx.recv().await {
                let percent = value as i64;
                if percent > 0 && percent < 100 {
                    reporter.progress(&format!("Synchronizing your files [{percent}]..."));
                }
            }
        });

        let result = self
            .collab
            .sync
            .wait_for_completion(cancel, progress_tx)
            .await;
        let _ = progress.await;
        result.map_err(|e| self.sync_error(e))
    }

    /// Maps sync engine failures onto what the user can do about them.
    fn sync_error(&self, err: UpError) -> UpError {
        match err {
            UpError::LostSync | UpError::Cancelled => err,
            UpError::InsufficientSpace => self.insufficient_space_error(),
            UpError::NeedsSyncReset => UpError::user(
                "the synchronization service state is inconsistent",
                "Try running 'kdev up --reset' to reset the synchronization service",
            ),
            UpError::User(_) => err,
            e if e.is_transient() => e,
            e => UpError::user(
                e.to_string(),
                format!("Try to run '{DOWN_COMMAND}' + 'kdev up' again"),
            ),
        }
    }

    fn insufficient_space_error(&self) -> UpError {
        let hint = if self.config.persistent_volume {
            format!(
                "Increase the size of your persistent volume or exclude large files in your '.stignore', \
                 then run '{DOWN_COMMAND} -v' and try again"
            )
        } else {
            "Free disk space in your development container or exclude large files in your '.stignore'"
                .to_string()
        };
        UpError::user(UpError::InsufficientSpace.to_string(), hint)
    }

    fn sync_start_error(&self, attempt: &Attempt) -> UpError {
        let pod = attempt
            .pod
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("<pod>");
        UpError::user(
            "Failed to connect to the synchronization service",
            format!(
                "Check your development container logs: 'kubectl logs {pod}'\n    \
                 Run '{DOWN_COMMAND} -v' to reset the synchronization service and try again."
            ),
        )
    }

    // ========================================================================
    // Serve
    // ========================================================================

    async fn serve(&self, attempt: &mut Attempt) -> Result<()> {
        attempt.served = true;
        self.note_phase(SessionPhase::Ready).await;
        self.print_summary(attempt);

        let runner = Arc::clone(&self.collab.runner);
        let command = self.config.command.clone();
        let command_cancel = attempt.cancel.clone();
        let command_tx = attempt.command_tx.clone();
        tokio::spawn(async move {
            let result = runner.run(command_cancel, command).await;
            let _ = command_tx.send(result).await;
        });

        let cancel = attempt.cancel.clone();
        let command_rx = &mut attempt.command_rx;
        let disconnect_rx = &mut attempt.disconnect_rx;
        let global_rx = &mut attempt.global_rx;
        let reapply = &mut attempt.reapply;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(UpError::Cancelled),

            Some(result) = command_rx.recv() => match result {
                Ok(()) => {
                    info!("Command completed");
                    Ok(())
                }
                Err(UpError::Cancelled) => Err(UpError::Cancelled),
                Err(e) => {
                    info!(error = %e, "Command failed");
                    if self.remote_sync_alive(&cancel).await? {
                        Err(e)
                    } else {
                        warn!("Synchronization service lost after command failure");
                        Err(UpError::LostSync)
                    }
                }
            },

            Some(err) = disconnect_rx.recv() => {
                info!(error = %err, "Synchronization service disconnected");
                Err(err)
            }

            Some(err) = global_rx.recv() => Err(err),

            Some(()) = async {
                match reapply.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                info!("Workload changed, re-applying development container");
                Err(UpError::ForceReapply)
            }
        }
    }

    /// Pings the remote sync engine. No answer within `SYNC_PING_TIMEOUT`
    /// counts as lost.
    async fn remote_sync_alive(&self, cancel: &CancellationToken) -> Result<bool> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpError::Cancelled),
            alive = tokio::time::timeout(SYNC_PING_TIMEOUT, self.collab.sync.ping(false)) => {
                Ok(alive.unwrap_or_else(|_| {
                    debug!(timeout_secs = SYNC_PING_TIMEOUT.as_secs(), "Remote sync ping timed out");
                    false
                }))
            }
        }
    }

    fn print_summary(&self, attempt: &Attempt) {
        let reporter = &self.collab.reporter;
        reporter.information(&format!("    Namespace: {}", self.workload.namespace));
        reporter.information(&format!("    Name:      {}", self.workload.name));
        if let Some(Forwarder::Ssh(manager)) = &attempt.forwarder {
            if let Some(port) = manager.ssh_port() {
                reporter.information(&format!(
                    "    SSH:       {port} -> {}",
                    self.config.ssh.server_port
                ));
            }
        }
        for (i, rule) in self.config.forward.iter().enumerate() {
            let label = if i == 0 { "Forward:" } else { "" };
            reporter.information(&format!("    {label:<10} {rule}"));
        }
        for (i, rule) in self.config.reverse.iter().enumerate() {
            let label = if i == 0 { "Reverse:" } else { "" };
            reporter.information(&format!("    {label:<10} {rule}"));
        }
    }
}

/// Wraps mutation failures that carry no meaning of their own.
fn activation_error(err: UpError) -> UpError {
    match err.kind() {
        ErrorKind::Transient | ErrorKind::User | ErrorKind::Cancelled => err,
        _ => match err {
            UpError::Api(_) | UpError::Io(_) | UpError::Other(_) => UpError::Other(format!(
                "couldn't activate your development container\n    {err}"
            )),
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_error_wraps_raw_failures() {
        let err = activation_error(UpError::Api("admission webhook denied the request".to_string()));
        assert!(err
            .to_string()
            .starts_with("couldn't activate your development container"));
    }

    #[test]
    fn test_activation_error_keeps_meaningful_failures() {
        let err = activation_error(UpError::Api("connection refused".to_string()));
        assert!(matches!(err, UpError::Api(_)));

        let err = activation_error(UpError::DevPodDeleted);
        assert!(matches!(err, UpError::DevPodDeleted));

        let err = activation_error(UpError::Scheduling("0/3 nodes are available".to_string()));
        assert!(matches!(err, UpError::Scheduling(_)));

        let err = activation_error(UpError::user("insufficient resources", "add nodes"));
        assert!(err.hint().is_some());
    }
}
