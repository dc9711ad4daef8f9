//! Direct mode: one cluster port-forward per rule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kdev_core::forward::validate_unique_ports;
use kdev_core::{ForwardRule, Result, Timeouts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{explain_port_error, resolve_selectors, Allocations, ForwardRegistrar, TunnelContext};

/// Forwards local ports straight to the dev pod or to services.
///
/// Rules to a service are retried in the background every
/// `service_forward_retry` until the service has a running pod. Every other
/// rule must bind on start.
pub struct PortForwardManager {
    ctx: TunnelContext,
    timeouts: Timeouts,
    forwards: Vec<ForwardRule>,
    cancel: Option<CancellationToken>,
    registrar: Option<Arc<DirectRegistrar>>,
}

impl PortForwardManager {
    pub fn new(ctx: TunnelContext, timeouts: Timeouts) -> Self {
        Self {
            ctx,
            timeouts,
            forwards: Vec::new(),
            cancel: None,
            registrar: None,
        }
    }

    /// Adds a rule, rejecting local ports that are already listed.
    pub fn add(&mut self, rule: ForwardRule) -> Result<()> {
        self.add_all(vec![rule])
    }

    /// Adds rules all-or-nothing.
    pub fn add_all(&mut self, rules: Vec<ForwardRule>) -> Result<()> {
        let mut candidate = self.forwards.clone();
        candidate.extend(rules);
        validate_unique_ports(&candidate, &[])?;
        self.forwards = candidate;
        Ok(())
    }

    pub fn rules(&self) -> &[ForwardRule] {
        &self.forwards
    }

    pub async fn start(&mut self, cancel: &CancellationToken, pod: &str) -> Result<()> {
        let token = cancel.child_token();
        self.cancel = Some(token.clone());

        resolve_selectors(
            &self.ctx,
            &token,
            &mut self.forwards,
            self.timeouts.ports_poll(),
            self.timeouts.ports(),
        )
        .await?;

        let registrar = Arc::new(DirectRegistrar {
            ctx: self.ctx.clone(),
            pod: pod.to_string(),
            cancel: token.clone(),
            allocations: Allocations::default(),
        });
        self.registrar = Some(Arc::clone(&registrar));

        for rule in &self.forwards {
            if rule.is_service() {
                tokio::spawn(forward_service(
                    Arc::clone(&registrar),
                    rule.clone(),
                    token.clone(),
                    self.timeouts.service_forward_retry(),
                ));
                continue;
            }
            registrar.register(rule).await?;
        }

        info!(pod = %pod, rules = self.forwards.len(), "Port forwards started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!("Port forwards stopped");
        }
        self.registrar = None;
    }

    pub fn registrar(&self) -> Option<Arc<dyn ForwardRegistrar>> {
        self.registrar
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn ForwardRegistrar>)
    }
}

/// Retries a service forward until it is established or cancelled.
async fn forward_service(
    registrar: Arc<DirectRegistrar>,
    rule: ForwardRule,
    cancel: CancellationToken,
    retry: Duration,
) {
    let mut ticker = tokio::time::interval(retry);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match registrar.register(&rule).await {
            Ok(()) => return,
            Err(e) => warn!(rule = %rule, error = %e, "Service forward not ready, retrying"),
        }
    }
}

/// Registers rules as cluster port-forwards.
pub(crate) struct DirectRegistrar {
    ctx: TunnelContext,
    pod: String,
    cancel: CancellationToken,
    allocations: Allocations,
}

#[async_trait]
impl ForwardRegistrar for DirectRegistrar {
    async fn register(&self, rule: &ForwardRule) -> Result<()> {
        self.allocations.reserve(rule.local)?;

        let result = async {
            let pod = match &rule.service_name {
                Some(service) => self.ctx.cluster.pod_for_service(&self.ctx.namespace, service).await?,
                None => self.pod.clone(),
            };
            self.ctx
                .cluster
                .open_port_forward(
                    self.cancel.child_token(),
                    &self.ctx.namespace,
                    &pod,
                    rule.remote,
                    self.ctx.local_addr(rule.local),
                )
                .await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(rule = %rule, "Port forward registered");
                Ok(())
            }
            Err(e) => {
                self.allocations.release(rule.local);
                Err(explain_port_error(e))
            }
        }
    }

    fn allocated(&self) -> Vec<u16> {
        self.allocations.snapshot()
    }
}
