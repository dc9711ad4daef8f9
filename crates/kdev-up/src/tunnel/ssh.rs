//! Tunneled mode: an SSH session to the dev pod carries every forward.
//!
//! The pod's SSH server is reached through a single cluster port-forward.
//! Local forwards open `direct-tcpip` channels, reverse forwards ask the
//! server for `tcpip-forward` and answer its `forwarded-tcpip` channels by
//! dialing the local port.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kdev_core::forward::validate_unique_ports;
use kdev_core::{ForwardRule, Result, ReverseRule, SshSettings, Timeouts, UpError};
use russh::client::{self, Config, Handle, Handler, Msg, Session};
use russh::keys::{load_secret_key, Algorithm, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    explain_port_error, register_until_ready, Allocations, ForwardRegistrar, ReverseRegistrar,
    TunnelContext,
};
use crate::paths;

/// Host dialed inside the pod for rules to the pod itself.
const POD_HOST: &str = "localhost";

/// Address reverse forwards listen on inside the pod.
const REVERSE_BIND: &str = "0.0.0.0";

// ============================================================================
// Errors
// ============================================================================

/// Failures of the SSH session.
#[derive(Debug, Error)]
pub enum SshError {
    /// TCP or handshake failure.
    #[error("ssh connection failed: {0}")]
    Connection(String),

    /// Key rejected by the server.
    #[error("ssh authentication failed: {0}")]
    Authentication(String),

    /// Private key could not be read.
    #[error("failed to load ssh key {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    /// Server refused a channel or a forward request.
    #[error("ssh channel error: {0}")]
    Channel(String),

    #[error("ssh protocol error: {0}")]
    Protocol(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

impl From<SshError> for UpError {
    fn from(e: SshError) -> Self {
        UpError::Transport(e.to_string())
    }
}

// ============================================================================
// Session
// ============================================================================

/// Reverse forward targets keyed by the port the server listens on.
type ReverseTargets = Arc<Mutex<HashMap<u32, SocketAddr>>>;

/// Client handler: accepts the pod's host key and serves reverse channels.
struct TunnelHandler {
    reverses: ReverseTargets,
}

impl Handler for TunnelHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        // The pod's host key is generated at start, there is nothing to pin.
        async move { Ok(true) }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        let target = self
            .reverses
            .lock()
            .ok()
            .and_then(|reverses| reverses.get(&connected_port).copied());
        let originator = format!("{originator_address}:{originator_port}");

        async move {
            let Some(target) = target else {
                warn!(port = connected_port, "Reverse channel for unknown port");
                return Ok(());
            };
            debug!(port = connected_port, originator = %originator, "Reverse connection");
            tokio::spawn(async move {
                match TcpStream::connect(target).await {
                    Ok(mut local) => {
                        let mut remote = channel.into_stream();
                        if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                            debug!(target = %target, error = %e, "Reverse connection closed");
                        }
                    }
                    Err(e) => warn!(target = %target, error = %e, "Reverse target unreachable"),
                }
            });
            Ok(())
        }
    }
}

/// Authenticated SSH session to the dev pod.
pub(crate) struct SshTunnel {
    handle: tokio::sync::Mutex<Handle<TunnelHandler>>,
    reverses: ReverseTargets,
}

impl SshTunnel {
    async fn connect(
        addr: SocketAddr,
        settings: &SshSettings,
        key_path: &std::path::Path,
        timeout: Duration,
    ) -> std::result::Result<Self, SshError> {
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(settings.keepalive_secs)),
            keepalive_max: 3,
            ..Default::default()
        };
        let reverses: ReverseTargets = Arc::default();
        let handler = TunnelHandler {
            reverses: Arc::clone(&reverses),
        };

        debug!(addr = %addr, "Connecting to dev pod ssh server");
        let mut handle = tokio::time::timeout(timeout, client::connect(Arc::new(config), addr, handler))
            .await
            .map_err(|_| SshError::Connection("connection timed out".to_string()))?
            .map_err(|e| SshError::Connection(e.to_string()))?;

        let key = load_secret_key(key_path, None).map_err(|e| SshError::KeyLoad {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
            handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| SshError::Authentication(e.to_string()))?
                .flatten()
        } else {
            None
        };
        let auth = handle
            .authenticate_publickey(
                settings.user.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| SshError::Authentication(e.to_string()))?;
        if !auth.success() {
            return Err(SshError::Authentication(format!(
                "key {} rejected for user {}",
                key_path.display(),
                settings.user
            )));
        }

        info!(addr = %addr, "SSH session established");
        Ok(Self {
            handle: tokio::sync::Mutex::new(handle),
            reverses,
        })
    }

    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> std::result::Result<Channel<Msg>, SshError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| SshError::Channel(format!("{host}:{port}: {e}")))
    }

    async fn reverse(&self, rule: ReverseRule, target: SocketAddr) -> std::result::Result<(), SshError> {
        if let Ok(mut reverses) = self.reverses.lock() {
            reverses.insert(u32::from(rule.remote), target);
        }
        let mut handle = self.handle.lock().await;
        handle
            .tcpip_forward(REVERSE_BIND, u32::from(rule.remote))
            .await
            .map_err(|e| SshError::Channel(format!("reverse {rule}: {e}")))?;
        debug!(rule = %rule, "Reverse forward registered");
        Ok(())
    }

    async fn disconnect(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Forwards and reverse forwards over one SSH session.
///
/// Rules are validated all-or-nothing when added, so a port collision never
/// leaves part of the rules registered.
pub struct SshForwardManager {
    ctx: TunnelContext,
    settings: SshSettings,
    timeouts: Timeouts,
    key_path: PathBuf,
    forwards: Vec<ForwardRule>,
    reverses: Vec<ReverseRule>,
    ssh_port: Option<u16>,
    cancel: Option<CancellationToken>,
    tunnel: Option<Arc<SshTunnel>>,
    registrar: Option<Arc<SshRegistrar>>,
}

impl SshForwardManager {
    pub fn new(ctx: TunnelContext, settings: SshSettings, timeouts: Timeouts, home: &std::path::Path) -> Self {
        let key_path = settings
            .key_path
            .clone()
            .unwrap_or_else(|| paths::ssh_key_file(home));
        Self {
            ctx,
            settings,
            timeouts,
            key_path,
            forwards: Vec::new(),
            reverses: Vec::new(),
            ssh_port: None,
            cancel: None,
            tunnel: None,
            registrar: None,
        }
    }

    /// Adds rules all-or-nothing.
    pub fn add_all(&mut self, forwards: Vec<ForwardRule>, reverses: Vec<ReverseRule>) -> Result<()> {
        let mut candidate_forwards = self.forwards.clone();
        candidate_forwards.extend(forwards);
        let mut candidate_reverses = self.reverses.clone();
        candidate_reverses.extend(reverses);
        validate_unique_ports(&candidate_forwards, &candidate_reverses)?;

        self.forwards = candidate_forwards;
        self.reverses = candidate_reverses;
        Ok(())
    }

    pub fn add(&mut self, rule: ForwardRule) -> Result<()> {
        self.add_all(vec![rule], Vec::new())
    }

    pub fn add_reverse(&mut self, rule: ReverseRule) -> Result<()> {
        self.add_all(Vec::new(), vec![rule])
    }

    pub fn rules(&self) -> (&[ForwardRule], &[ReverseRule]) {
        (&self.forwards, &self.reverses)
    }

    /// Local port of the pod's SSH server, once started.
    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    pub fn key_path(&self) -> &std::path::Path {
        &self.key_path
    }

    pub async fn start(&mut self, cancel: &CancellationToken, pod: &str) -> Result<()> {
        let token = cancel.child_token();
        self.cancel = Some(token.clone());

        let ssh_port = match self.settings.local_port {
            0 => free_port(self.ctx.interface).await?,
            port => port,
        };
        let ssh_addr = self.ctx.local_addr(ssh_port);
        self.ctx
            .cluster
            .open_port_forward(
                token.child_token(),
                &self.ctx.namespace,
                pod,
                self.settings.server_port,
                ssh_addr,
            )
            .await
            .map_err(explain_port_error)?;
        self.ssh_port = Some(ssh_port);

        let tunnel = Arc::new(
            SshTunnel::connect(ssh_addr, &self.settings, &self.key_path, self.timeouts.ports()).await?,
        );
        self.tunnel = Some(Arc::clone(&tunnel));

        let registrar = Arc::new(SshRegistrar {
            tunnel: Arc::clone(&tunnel),
            interface: self.ctx.interface,
            cancel: token.clone(),
            allocations: Allocations::default(),
        });
        self.registrar = Some(Arc::clone(&registrar));

        register_until_ready(
            &self.ctx,
            &token,
            registrar.as_ref(),
            &mut self.forwards,
            &self.reverses,
            self.timeouts.ports_poll(),
            self.timeouts.ports(),
        )
        .await?;

        info!(
            pod = %pod,
            ssh_port,
            forwards = self.forwards.len(),
            reverses = self.reverses.len(),
            "SSH forwards started"
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.registrar = None;
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.disconnect().await;
            debug!("SSH forwards stopped");
        }
    }

    pub fn registrar(&self) -> Option<Arc<dyn ForwardRegistrar>> {
        self.registrar
            .as_ref()
            .map(|r| Arc::clone(r) as Arc<dyn ForwardRegistrar>)
    }
}

/// Asks the OS for an unused port on `interface`.
async fn free_port(interface: IpAddr) -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(interface, 0)).await?;
    Ok(listener.local_addr()?.port())
}

// ============================================================================
// Registrar
// ============================================================================

/// Registers rules as local listeners feeding `direct-tcpip` channels.
pub(crate) struct SshRegistrar {
    tunnel: Arc<SshTunnel>,
    interface: IpAddr,
    cancel: CancellationToken,
    allocations: Allocations,
}

#[async_trait]
impl ForwardRegistrar for SshRegistrar {
    async fn register(&self, rule: &ForwardRule) -> Result<()> {
        self.allocations.reserve(rule.local)?;

        let addr = SocketAddr::new(self.interface, rule.local);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.allocations.release(rule.local);
                debug!(addr = %addr, error = %e, "Local bind failed");
                return Err(explain_port_error(UpError::PortInUse(rule.local)));
            }
        };

        let host = rule
            .service_name
            .clone()
            .unwrap_or_else(|| POD_HOST.to_string());
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.tunnel),
            host,
            rule.remote,
            self.cancel.clone(),
        ));
        debug!(rule = %rule, "SSH forward registered");
        Ok(())
    }

    fn allocated(&self) -> Vec<u16> {
        self.allocations.snapshot()
    }
}

#[async_trait]
impl ReverseRegistrar for SshRegistrar {
    async fn register_reverse(&self, rule: &ReverseRule) -> Result<()> {
        let target = SocketAddr::new(self.interface, rule.local);
        self.tunnel.reverse(*rule, target).await?;
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    tunnel: Arc<SshTunnel>,
    host: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(host = %host, port, error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let tunnel = Arc::clone(&tunnel);
        let host = host.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let channel = match tunnel.open_direct(&host, port, peer).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(error = %e, "Forward channel refused");
                    return;
                }
            };
            let mut remote = channel.into_stream();
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = tokio::io::copy_bidirectional(&mut stream, &mut remote) => {
                    if let Err(e) = result {
                        debug!(host = %host, port, error = %e, "Forward connection closed");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_error_is_transport() {
        let err: UpError = SshError::Connection("connection reset by peer".to_string()).into();
        assert!(matches!(err, UpError::Transport(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_free_port() {
        let port = free_port(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        assert_ne!(port, 0);
    }
}
