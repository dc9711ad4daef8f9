//! Best-effort global forwards.
//!
//! Global forwards reach services shared by the whole namespace. They are
//! registered in the background once per poll interval until all of them are
//! up. A port the session already serves counts as registered. The first
//! other registration failure is reported on the status channel and ends the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use kdev_core::{ForwardRule, Result, UpError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ForwardRegistrar, TunnelContext};

/// A global forward rule and whether it has been registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalForward {
    pub rule: ForwardRule,
    pub added: bool,
}

impl GlobalForward {
    pub fn new(rule: ForwardRule) -> Self {
        Self { rule, added: false }
    }
}

/// True while at least one global forward still has to be registered.
pub fn is_needed_global_forwarder(forwards: &[GlobalForward]) -> bool {
    forwards.iter().any(|f| !f.added)
}

pub struct GlobalForwarder {
    ctx: TunnelContext,
    forwards: Vec<GlobalForward>,
    poll: Duration,
}

impl GlobalForwarder {
    /// Rules naming neither a service nor labels target the service named
    /// after the workload.
    pub fn new(ctx: TunnelContext, rules: Vec<ForwardRule>, workload: &str, poll: Duration) -> Self {
        let forwards = rules
            .into_iter()
            .map(|mut rule| {
                if !rule.is_service() {
                    rule.service_name = Some(workload.to_string());
                }
                GlobalForward::new(rule)
            })
            .collect();
        Self { ctx, forwards, poll }
    }

    pub fn forwards(&self) -> &[GlobalForward] {
        &self.forwards
    }

    pub fn is_needed(&self) -> bool {
        is_needed_global_forwarder(&self.forwards)
    }

    /// Registers pending forwards every poll interval until all are added,
    /// the first hard failure, or cancellation.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        registrar: Arc<dyn ForwardRegistrar>,
        status: mpsc::Sender<UpError>,
    ) {
        if !self.is_needed() {
            return;
        }

        let mut ticker = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.step(registrar.as_ref()).await {
                warn!(error = %e, "Global forwarder stopped");
                let _ = status.send(e).await;
                return;
            }
            if !self.is_needed() {
                info!(forwards = self.forwards.len(), "Serving global forwards");
                return;
            }
        }
    }

    /// One pass over the pending forwards.
    pub async fn step(&mut self, registrar: &dyn ForwardRegistrar) -> Result<()> {
        for forward in self.forwards.iter_mut().filter(|f| !f.added) {
            if forward.rule.needs_resolution() {
                let selector = forward.rule.label_selector();
                match self.ctx.cluster.service_for_labels(&self.ctx.namespace, &selector).await {
                    Ok(service) => {
                        forward.rule.resolve(service);
                    }
                    Err(e) => {
                        debug!(selector = %selector, error = %e, "Global forward not resolved yet");
                        continue;
                    }
                }
            }

            match registrar.register(&forward.rule).await {
                Ok(()) => {
                    debug!(rule = %forward.rule, "Global forward added");
                    forward.added = true;
                }
                Err(UpError::PortAlreadyAllocated(port)) => {
                    debug!(port, "Global forward port already served");
                    forward.added = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
