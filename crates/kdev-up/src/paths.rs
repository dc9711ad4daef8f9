//! Locations of kdev files on the local machine.

use std::env;
use std::path::{Path, PathBuf};

use kdev_core::config::HOME_ENV;

/// Name of the marker file inside a workload directory.
pub const MARKER_FILE: &str = "kdev.pid";

/// Name of the state file inside a workload directory.
pub const STATE_FILE: &str = "state.json";

/// Returns the kdev home directory.
///
/// `KDEV_HOME` wins; otherwise `~/.kdev`.
pub fn kdev_home() -> PathBuf {
    if let Ok(home) = env::var(HOME_ENV) {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kdev")
}

/// Directory holding the files of one workload's session.
pub fn workload_dir(home: &Path, namespace: &str, name: &str) -> PathBuf {
    home.join(namespace).join(name)
}

pub fn marker_path(home: &Path, namespace: &str, name: &str) -> PathBuf {
    workload_dir(home, namespace, name).join(MARKER_FILE)
}

pub fn state_path(home: &Path, namespace: &str, name: &str) -> PathBuf {
    workload_dir(home, namespace, name).join(STATE_FILE)
}

pub fn log_file(home: &Path) -> PathBuf {
    home.join("kdev.log")
}

/// Default private key for the SSH tunnel.
pub fn ssh_key_file(home: &Path) -> PathBuf {
    home.join("id_rsa_kdev")
}

/// The user's SSH client config.
pub fn ssh_config_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("config")
}
