//! Tunnel / forwarder supervision.
//!
//! Two ways to reach the dev pod:
//!
//! ```text
//!  direct:    local port ──── cluster port-forward ────► pod port
//!
//!  tunneled:  local port ──► ssh channel ─┐
//!             ssh server ◄── cluster port-forward ◄─────┘──► pod / service
//!             pod port   ──► ssh reverse channel ──► local port
//! ```
//!
//! Both modes register rules through a [`ForwardRegistrar`] that tracks the
//! local ports it has bound, so the background global-forward loop can share
//! it with the session's own rules.

pub mod direct;
pub mod global;
pub mod ssh;
pub mod ssh_config;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kdev_core::forward::port_unavailable_hint;
use kdev_core::{ForwardRule, Result, ReverseRule, UpError};
use kdev_remote::{Cluster, StatusReporter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use direct::PortForwardManager;
pub use global::{is_needed_global_forwarder, GlobalForward, GlobalForwarder};
pub use ssh::SshForwardManager;

/// What every forwarder needs from the session.
#[derive(Clone)]
pub struct TunnelContext {
    pub cluster: Arc<dyn Cluster>,
    pub reporter: Arc<dyn StatusReporter>,
    pub namespace: String,
    /// Address local forwards bind to.
    pub interface: IpAddr,
}

impl TunnelContext {
    pub fn local_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.interface, port)
    }
}

/// Registers a single forward rule against a running tunnel.
#[async_trait]
pub trait ForwardRegistrar: Send + Sync {
    /// Binds the rule's local port and starts forwarding until the
    /// forwarder stops.
    ///
    /// Fails with `UpError::PortAlreadyAllocated` when this registrar
    /// already bound the port.
    async fn register(&self, rule: &ForwardRule) -> Result<()>;

    /// Local ports bound so far.
    fn allocated(&self) -> Vec<u16>;
}

/// Registers reverse rules against a running tunnel.
#[async_trait]
pub trait ReverseRegistrar: Send + Sync {
    /// Asks the remote end to forward `rule.remote` back to the local port.
    async fn register_reverse(&self, rule: &ReverseRule) -> Result<()>;
}

/// The active forwarder of an attempt.
pub enum Forwarder {
    Direct(PortForwardManager),
    Ssh(SshForwardManager),
}

impl Forwarder {
    /// Starts forwarding to `pod`. Hard failures abort the attempt.
    pub async fn start(&mut self, cancel: &CancellationToken, pod: &str) -> Result<()> {
        match self {
            Forwarder::Direct(manager) => manager.start(cancel, pod).await,
            Forwarder::Ssh(manager) => manager.start(cancel, pod).await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            Forwarder::Direct(manager) => manager.stop(),
            Forwarder::Ssh(manager) => manager.stop().await,
        }
    }

    /// Registrar for rules added after start, `None` before start.
    pub fn registrar(&self) -> Option<Arc<dyn ForwardRegistrar>> {
        match self {
            Forwarder::Direct(manager) => manager.registrar(),
            Forwarder::Ssh(manager) => manager.registrar(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Forwarder::Direct(_) => "direct",
            Forwarder::Ssh(_) => "ssh",
        }
    }
}

/// Resolves label selectors of `rules` to service names.
///
/// Lookups are retried every `poll` until `timeout`. The last lookup error is
/// returned on timeout, `PortsNotAvailable` if there was none.
pub(crate) async fn resolve_selectors(
    ctx: &TunnelContext,
    cancel: &CancellationToken,
    rules: &mut [ForwardRule],
    poll: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut last_error = None;
    loop {
        for rule in rules.iter_mut().filter(|r| r.needs_resolution()) {
            let selector = rule.label_selector();
            match ctx.cluster.service_for_labels(&ctx.namespace, &selector).await {
                Ok(service) => {
                    debug!(selector = %selector, service = %service, "Resolved forward selector");
                    rule.resolve(service);
                }
                Err(e) => {
                    debug!(selector = %selector, error = %e, "Selector not resolved yet");
                    last_error = Some(e);
                }
            }
        }
        if !rules.iter().any(ForwardRule::needs_resolution) {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(last_error.unwrap_or(UpError::PortsNotAvailable));
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Registers every forward and reverse, retrying failed rules every `poll`.
///
/// Label selectors are resolved in the same loop. Rules are tracked by local
/// port, so a rule is registered at most once. A user error or cancellation
/// ends the loop at once. Other failures are retried until `timeout`, which
/// returns the latest failure, `PortsNotAvailable` if none was recorded.
pub async fn register_until_ready<R>(
    ctx: &TunnelContext,
    cancel: &CancellationToken,
    registrar: &R,
    forwards: &mut [ForwardRule],
    reverses: &[ReverseRule],
    poll: Duration,
    timeout: Duration,
) -> Result<()>
where
    R: ForwardRegistrar + ReverseRegistrar + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut registered: HashSet<u16> = HashSet::new();
    let mut last_error = None;
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        for rule in forwards.iter_mut() {
            if registered.contains(&rule.local) {
                continue;
            }
            if rule.needs_resolution() {
                let selector = rule.label_selector();
                match ctx.cluster.service_for_labels(&ctx.namespace, &selector).await {
                    Ok(service) => {
                        debug!(selector = %selector, service = %service, "Resolved forward selector");
                        rule.resolve(service);
                    }
                    Err(e) => {
                        debug!(selector = %selector, error = %e, "Selector not resolved yet");
                        last_error = Some(e);
                        continue;
                    }
                }
            }
            match registrar.register(rule).await {
                Ok(()) | Err(UpError::PortAlreadyAllocated(_)) => {
                    registered.insert(rule.local);
                }
                Err(e) => note_failure(&rule.to_string(), e, &mut last_error)?,
            }
        }

        for rule in reverses {
            if registered.contains(&rule.local) {
                continue;
            }
            match registrar.register_reverse(rule).await {
                Ok(()) => {
                    registered.insert(rule.local);
                }
                Err(e) => note_failure(&rule.to_string(), e, &mut last_error)?,
            }
        }

        let pending = forwards
            .iter()
            .map(|r| r.local)
            .chain(reverses.iter().map(|r| r.local))
            .filter(|port| !registered.contains(port))
            .count();
        if pending == 0 {
            info!(polls, rules = registered.len(), "All tunnel rules registered");
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(polls, pending, "Tunnel rules not registered before deadline");
                return Err(last_error.unwrap_or(UpError::PortsNotAvailable));
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Keeps a retryable registration failure, rejects the rest.
fn note_failure(rule: &str, err: UpError, last_error: &mut Option<UpError>) -> Result<()> {
    if matches!(err, UpError::User(_) | UpError::Cancelled) {
        return Err(err);
    }
    debug!(rule, error = %err, "Registration failed, retrying");
    *last_error = Some(err);
    Ok(())
}

/// Parses the configured interface. `localhost` maps to the IPv4 loopback.
pub fn parse_interface(interface: &str) -> Result<IpAddr> {
    let interface = interface.trim();
    if interface.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    interface.parse().map_err(|_| {
        UpError::user(
            format!("invalid interface '{interface}'"),
            "Set 'interface' to an IP address such as 127.0.0.1 or 0.0.0.0",
        )
    })
}

/// Adds the privileged-port hint to a port-in-use failure.
pub(crate) fn explain_port_error(err: UpError) -> UpError {
    match err {
        UpError::PortInUse(port) => match port_unavailable_hint(port) {
            Some(hint) => UpError::user(format!("local port {port} is privileged"), hint),
            None => UpError::PortInUse(port),
        },
        other => other,
    }
}

/// Local ports bound by a registrar.
#[derive(Debug, Default)]
pub(crate) struct Allocations {
    ports: Mutex<HashSet<u16>>,
}

impl Allocations {
    /// Reserves `port`, failing if it is already reserved.
    pub(crate) fn reserve(&self, port: u16) -> Result<()> {
        let mut ports = self
            .ports
            .lock()
            .map_err(|_| UpError::Other("port allocations poisoned".to_string()))?;
        if !ports.insert(port) {
            return Err(UpError::PortAlreadyAllocated(port));
        }
        Ok(())
    }

    /// Drops a reservation after a failed registration.
    pub(crate) fn release(&self, port: u16) {
        if let Ok(mut ports) = self.ports.lock() {
            ports.remove(&port);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .lock()
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interface() {
        assert_eq!(
            parse_interface("localhost").unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            parse_interface("0.0.0.0").unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert!(parse_interface("my-laptop").is_err());
    }

    #[test]
    fn test_allocations() {
        let allocations = Allocations::default();
        allocations.reserve(8080).unwrap();
        assert!(matches!(
            allocations.reserve(8080),
            Err(UpError::PortAlreadyAllocated(8080))
        ));
        allocations.release(8080);
        allocations.reserve(8080).unwrap();
        allocations.reserve(22000).unwrap();
        assert_eq!(allocations.snapshot(), vec![8080, 22000]);
    }

    #[test]
    fn test_privileged_port_error() {
        let err = explain_port_error(UpError::PortInUse(80));
        assert!(err.hint().is_some());
        let err = explain_port_error(UpError::PortInUse(8080));
        assert!(matches!(err, UpError::PortInUse(8080)));
    }
}
