//! Waits for the dev pod to reach Running.
//!
//! Two watches are consumed at once, plus a tick that only logs:
//!
//! ```text
//!   pod watch ─────┐
//!   event watch ───┼──► select! ──► Running | error
//!   tick ──────────┤
//!   deadline ──────┤   (armed while scheduling is blocked)
//!   cancel ────────┘
//! ```
//!
//! Event reasons are normalized by [`kdev_core::readiness`]. A watch that
//! closes or yields something malformed is re-subscribed after a short
//! backoff, events resuming after the last seen resource version.

use std::sync::Arc;

use kdev_core::readiness::{scheduling_timeout_error, volume_full_error, ReadinessEvent};
use kdev_core::{Result, SessionPhase, Timeouts, UpError, WorkloadRef};
use kdev_remote::{
    Cluster, ClusterEvent, PodInfo, PodPhase, StateStore, StatusReporter, WatchEvent, WatchStream,
};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the wait currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    WaitingForEvents,
    SchedulingBlocked,
    VolumeAttaching,
    ImagePulling,
    /// A stateful pod is being restarted in place; events are ignored.
    Restarting,
}

/// What to do after one event.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Done,
}

/// Watches one dev pod until it runs.
pub struct ReadinessWatcher {
    cluster: Arc<dyn Cluster>,
    state: Arc<dyn StateStore>,
    reporter: Arc<dyn StatusReporter>,
    workload: WorkloadRef,
    persistent_volume: bool,
    timeouts: Timeouts,
}

/// Mutable part of one wait.
struct Wait {
    state: WaitState,
    deadline: Option<Instant>,
    last_scheduling: String,
    resource_version: Option<String>,
}

impl ReadinessWatcher {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        state: Arc<dyn StateStore>,
        reporter: Arc<dyn StatusReporter>,
        workload: WorkloadRef,
        persistent_volume: bool,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            cluster,
            state,
            reporter,
            workload,
            persistent_volume,
            timeouts,
        }
    }

    /// Blocks until `pod` is Running.
    ///
    /// # Errors
    ///
    /// - `DevPodDeleted` if the pod is deleted first, or killed while it
    ///   belongs to a workload that does not restart in place
    /// - a user error when scheduling stays blocked on CPU or memory past the
    ///   resources timeout, the raw scheduler message otherwise
    /// - `Cancelled` when `cancel` fires
    pub async fn wait_until_running(&self, cancel: &CancellationToken, pod: &PodInfo) -> Result<()> {
        if pod.phase == PodPhase::Running {
            return Ok(());
        }
        if pod.deleting {
            return Err(UpError::DevPodDeleted);
        }

        let initial = if self.persistent_volume {
            self.set_phase(SessionPhase::Attaching).await;
            self.reporter.progress("Attaching persistent volume...");
            WaitState::VolumeAttaching
        } else {
            self.reporter.progress("Pulling images...");
            WaitState::WaitingForEvents
        };

        let ns = self.workload.namespace.as_str();
        let mut pods = self.cluster.watch_pod(ns, &pod.name).await?;
        let mut events = self.cluster.watch_events(ns, &pod.name, None).await?;
        let mut wait = Wait {
            state: initial,
            deadline: None,
            last_scheduling: String::new(),
            resource_version: None,
        };

        let tick = self.timeouts.readiness_tick();
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);

        loop {
            let deadline = wait.deadline;
            let blocked = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(pod = %pod.name, "Readiness wait cancelled");
                    return Err(UpError::Cancelled);
                }

                _ = blocked => {
                    warn!(pod = %pod.name, message = %wait.last_scheduling, "Scheduling deadline exceeded");
                    return Err(scheduling_timeout_error(&wait.last_scheduling));
                }

                update = pods.recv() => match update {
                    Some(WatchEvent::Item(current)) => {
                        if current.uid != pod.uid {
                            continue;
                        }
                        debug!(pod = %current.name, phase = %current.phase, "Dev pod updated");
                        if current.phase == PodPhase::Running {
                            self.reporter.success("Images successfully pulled");
                            info!(pod = %current.name, "Dev pod is running");
                            return Ok(());
                        }
                        if current.deleting {
                            return Err(UpError::DevPodDeleted);
                        }
                    }
                    Some(WatchEvent::Malformed(reason)) => {
                        warn!(pod = %pod.name, reason = %reason, "Malformed pod update");
                        pods = self.resubscribe_pod(cancel, &pod.name).await?;
                    }
                    None => {
                        debug!(pod = %pod.name, "Pod watch closed");
                        pods = self.resubscribe_pod(cancel, &pod.name).await?;
                    }
                },

                event = events.recv() => match event {
                    Some(WatchEvent::Item(event)) => {
                        if self.on_event(&mut wait, pod, event).await? == Step::Done {
                            return Ok(());
                        }
                    }
                    Some(WatchEvent::Malformed(reason)) => {
                        warn!(pod = %pod.name, reason = %reason, "Malformed pod event");
                        events = self.resubscribe_events(cancel, &pod.name, wait.resource_version.as_deref()).await?;
                    }
                    None => {
                        debug!(pod = %pod.name, "Event watch closed");
                        events = self.resubscribe_events(cancel, &pod.name, wait.resource_version.as_deref()).await?;
                    }
                },

                _ = ticker.tick() => {
                    debug!(pod = %pod.name, state = ?wait.state, "Waiting for dev pod");
                }
            }
        }
    }

    async fn on_event(&self, wait: &mut Wait, pod: &PodInfo, event: ClusterEvent) -> Result<Step> {
        if event.involved_uid != pod.uid {
            return Ok(Step::Continue);
        }
        wait.resource_version = Some(event.resource_version.clone());
        if wait.state == WaitState::Restarting {
            return Ok(Step::Continue);
        }
        debug!(reason = %event.reason, message = %event.message, "Pod event");

        match ReadinessEvent::normalize(&event.reason, &event.message) {
            ReadinessEvent::SchedulingRetry { message } => {
                self.block_scheduling(wait, message);
            }
            ReadinessEvent::ResourceInsufficient { message } => {
                self.reporter
                    .progress("Insufficient cpu/memory in the cluster. Waiting for new nodes to come up...");
                self.block_scheduling(wait, message);
            }
            ReadinessEvent::ScaleUp => {
                wait.deadline = None;
                wait.state = WaitState::WaitingForEvents;
                self.reporter.progress("Scaling up the cluster...");
            }
            ReadinessEvent::VolumeAttached => {
                wait.deadline = None;
                wait.state = WaitState::ImagePulling;
                self.reporter.success("Persistent volume successfully attached");
                self.reporter.progress("Pulling images...");
            }
            ReadinessEvent::InitializingVolume => {
                self.reporter.progress("Initializing persistent volume content...");
            }
            ReadinessEvent::ImagePulling { message } => {
                wait.state = WaitState::ImagePulling;
                self.reporter.progress(&format!("{message}..."));
                self.set_phase(SessionPhase::Pulling).await;
            }
            ReadinessEvent::Eviction { message } => {
                if self.workload.kind.restarts_in_place() {
                    info!(message = %message, "Stateful dev pod restarting");
                    wait.state = WaitState::Restarting;
                } else {
                    return Err(UpError::DevPodDeleted);
                }
            }
            ReadinessEvent::Running => return Ok(Step::Done),
            ReadinessEvent::BenignRace | ReadinessEvent::Ignored => {}
            ReadinessEvent::VolumeFull { message } => {
                warn!(message = %message, "Persistent volume full");
                return Err(volume_full_error());
            }
            ReadinessEvent::Fatal { message } => {
                return Err(UpError::Scheduling(message));
            }
        }
        Ok(Step::Continue)
    }

    /// Arms the scheduling deadline unless it is already running.
    fn block_scheduling(&self, wait: &mut Wait, message: String) {
        if wait.deadline.is_none() {
            wait.deadline = Some(Instant::now() + self.timeouts.resources());
        }
        wait.state = WaitState::SchedulingBlocked;
        wait.last_scheduling = message;
    }

    async fn set_phase(&self, phase: SessionPhase) {
        if let Err(e) = self.state.update(&self.workload, phase).await {
            info!(error = %e, "Failed to update session state");
        }
    }

    async fn backoff(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpError::Cancelled),
            _ = tokio::time::sleep(self.timeouts.resubscribe_backoff()) => Ok(()),
        }
    }

    async fn resubscribe_pod(&self, cancel: &CancellationToken, pod: &str) -> Result<WatchStream<PodInfo>> {
        self.backoff(cancel).await?;
        self.cluster.watch_pod(&self.workload.namespace, pod).await
    }

    async fn resubscribe_events(
        &self,
        cancel: &CancellationToken,
        pod: &str,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<ClusterEvent>> {
        self.backoff(cancel).await?;
        self.cluster
            .watch_events(&self.workload.namespace, pod, resource_version)
            .await
    }
}

