//! Session configuration.
//!
//! Everything the engine needs besides the collaborators themselves:
//! forwarding rules, SSH settings, timeouts and intervals. Loaded from a TOML
//! file; every field has a default so an empty file is a valid config.
//!
//! ```toml
//! remote_mode = true
//! forward = ["8080:80"]
//!
//! [timeouts]
//! resources_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::UpError;
use crate::forward::{validate_unique_ports, ForwardRule, ReverseRule};
use crate::retry::DEFAULT_MAX_UNHANDLED_RETRIES;

/// Environment variable overriding the kdev home directory.
pub const HOME_ENV: &str = "KDEV_HOME";

/// Errors raised while loading a config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Two rules share a local port.
    #[error(transparent)]
    Ports(UpError),
}

impl From<ConfigError> for UpError {
    /// Port conflicts keep their own message; everything else becomes a
    /// user error pointing at the config.
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Ports(err) => err,
            other => UpError::user(other.to_string(), "Fix your kdev configuration and try again"),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// SSH tunnel settings for tunneled mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    /// Port of the SSH server inside the dev pod.
    pub server_port: u16,
    /// Local port the SSH server is exposed on. Zero picks a free port.
    pub local_port: u16,
    pub user: String,
    /// Private key. Defaults to `<home>/id_rsa_kdev`.
    pub key_path: Option<PathBuf>,
    pub keepalive_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            server_port: 2222,
            local_port: 0,
            user: "root".to_string(),
            key_path: None,
            keepalive_secs: 30,
        }
    }
}

/// Deadlines and polling intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// How long scheduling may stay blocked.
    pub resources_secs: u64,
    /// How long to wait for a sleeping workload to wake up.
    pub wake_secs: u64,
    /// How long forwards may take to register in tunneled mode.
    pub ports_secs: u64,
    /// Grace period for stopping the sync engine.
    pub sync_stop_secs: u64,
    /// Delay between attempts after a non lost-sync failure.
    pub retry_interval_secs: u64,
    pub wake_poll_ms: u64,
    pub ports_poll_ms: u64,
    pub global_forward_poll_ms: u64,
    /// Period of the readiness watcher log tick.
    pub readiness_tick_secs: u64,
    /// Pause before re-subscribing to a closed watch.
    pub resubscribe_backoff_ms: u64,
    /// Period of per-service forward retries in direct mode.
    pub service_forward_retry_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resources_secs: 120,
            wake_secs: 300,
            ports_secs: 10,
            sync_stop_secs: 5,
            retry_interval_secs: 3,
            wake_poll_ms: 1000,
            ports_poll_ms: 500,
            global_forward_poll_ms: 1000,
            readiness_tick_secs: 10,
            resubscribe_backoff_ms: 500,
            service_forward_retry_secs: 3,
        }
    }
}

impl Timeouts {
    pub fn resources(&self) -> Duration {
        Duration::from_secs(self.resources_secs)
    }

    pub fn wake(&self) -> Duration {
        Duration::from_secs(self.wake_secs)
    }

    pub fn ports(&self) -> Duration {
        Duration::from_secs(self.ports_secs)
    }

    pub fn sync_stop(&self) -> Duration {
        Duration::from_secs(self.sync_stop_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn wake_poll(&self) -> Duration {
        Duration::from_millis(self.wake_poll_ms)
    }

    pub fn ports_poll(&self) -> Duration {
        Duration::from_millis(self.ports_poll_ms)
    }

    pub fn global_forward_poll(&self) -> Duration {
        Duration::from_millis(self.global_forward_poll_ms)
    }

    pub fn readiness_tick(&self) -> Duration {
        Duration::from_secs(self.readiness_tick_secs)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    pub fn service_forward_retry(&self) -> Duration {
        Duration::from_secs(self.service_forward_retry_secs)
    }

    fn intervals(&self) -> [(&'static str, u64); 7] {
        [
            ("retry_interval_secs", self.retry_interval_secs),
            ("wake_poll_ms", self.wake_poll_ms),
            ("ports_poll_ms", self.ports_poll_ms),
            ("global_forward_poll_ms", self.global_forward_poll_ms),
            ("readiness_tick_secs", self.readiness_tick_secs),
            ("resubscribe_backoff_ms", self.resubscribe_backoff_ms),
            ("service_forward_retry_secs", self.service_forward_retry_secs),
        ]
    }
}

// ============================================================================
// Up Config
// ============================================================================

/// Configuration of one `up` session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpConfig {
    /// Address local forwards bind to.
    pub interface: String,
    /// Tunnel forwards through SSH instead of direct port-forwards.
    pub remote_mode: bool,
    /// The dev pod keeps its data on a persistent volume.
    pub persistent_volume: bool,
    /// Create the workload when it does not exist.
    pub autocreate: bool,
    /// Reset the sync engine database on the first attempt.
    pub reset_sync: bool,
    /// Command run in the dev pod once sync is ready.
    pub command: Vec<String>,
    pub forward: Vec<ForwardRule>,
    pub reverse: Vec<ReverseRule>,
    /// Forwards to cluster services, registered in the background.
    pub global_forward: Vec<ForwardRule>,
    pub ssh: SshSettings,
    pub timeouts: Timeouts,
    /// Retries of unclassified errors after the first success.
    pub max_unhandled_retries: u32,
}

impl Default for UpConfig {
    fn default() -> Self {
        Self {
            interface: "127.0.0.1".to_string(),
            remote_mode: false,
            persistent_volume: false,
            autocreate: false,
            reset_sync: false,
            command: vec!["sh".to_string()],
            forward: Vec::new(),
            reverse: Vec::new(),
            global_forward: Vec::new(),
            ssh: SshSettings::default(),
            timeouts: Timeouts::default(),
            max_unhandled_retries: DEFAULT_MAX_UNHANDLED_RETRIES,
        }
    }
}

impl UpConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: UpConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&input)?;
        debug!(
            path = %path.display(),
            forwards = config.forward.len(),
            reverses = config.reverse.len(),
            remote_mode = config.remote_mode,
            "Loaded config"
        );
        Ok(config)
    }

    /// Checks intervals and port uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in self.timeouts.intervals() {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.command.is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".to_string()));
        }
        if self.interface.trim().is_empty() {
            return Err(ConfigError::Invalid("interface must not be empty".to_string()));
        }
        validate_unique_ports(&self.forward, &self.reverse).map_err(ConfigError::Ports)?;
        Ok(())
    }
}
