//! Port forwarding rules.
//!
//! A [`ForwardRule`] maps a local port to a port on the dev pod or on a
//! cluster service. Services can be named directly or through a label
//! selector that is resolved to a service name once, the first time the
//! rule is registered. A [`ReverseRule`] maps a port on the dev pod back to
//! the local machine.
//!
//! Rules are written in config files either as strings or as tables:
//!
//! ```toml
//! forward = ["8080:80", "5432:db:5432", { local = 9090, remote = 90, labels = { app = "api" } }]
//! reverse = ["9000:8000"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpError;

/// Port of the sync engine data channel inside the dev pod.
pub const SYNC_CLUSTER_PORT: u16 = 22000;

/// Port of the sync engine GUI inside the dev pod.
pub const SYNC_GUI_PORT: u16 = 8384;

/// Highest port that needs elevated privileges on most systems.
pub const MAX_PRIVILEGED_PORT: u16 = 1024;

// ============================================================================
// Forward Rule
// ============================================================================

/// Local port forwarded to the dev pod or to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleRepr")]
pub struct ForwardRule {
    pub local: u16,
    pub remote: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ForwardRule {
    /// Forward to the dev pod itself.
    pub fn new(local: u16, remote: u16) -> Self {
        Self {
            local,
            remote,
            service_name: None,
            labels: BTreeMap::new(),
        }
    }

    /// Forward to a named service.
    pub fn to_service(local: u16, service: impl Into<String>, remote: u16) -> Self {
        Self {
            service_name: Some(service.into()),
            ..Self::new(local, remote)
        }
    }

    /// Forward to the service matching a label selector.
    pub fn with_labels(local: u16, labels: BTreeMap<String, String>, remote: u16) -> Self {
        Self {
            labels,
            ..Self::new(local, remote)
        }
    }

    /// True when the rule targets a service rather than the dev pod.
    pub fn is_service(&self) -> bool {
        self.service_name.is_some() || !self.labels.is_empty()
    }

    /// True while the label selector has not been resolved to a name.
    pub fn needs_resolution(&self) -> bool {
        self.service_name.is_none() && !self.labels.is_empty()
    }

    /// Stores the resolved service name.
    ///
    /// Returns false and leaves the rule untouched if it was already
    /// resolved or never needed resolution.
    pub fn resolve(&mut self, service_name: impl Into<String>) -> bool {
        if !self.needs_resolution() {
            return false;
        }
        self.service_name = Some(service_name.into());
        true
    }

    /// Selector in `key=value,key=value` form.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.service_name, self.labels.is_empty()) {
            (Some(service), _) => write!(f, "{} -> {}:{}", self.local, service, self.remote),
            (None, false) => write!(
                f,
                "{} -> [{}]:{}",
                self.local,
                self.label_selector(),
                self.remote
            ),
            (None, true) => write!(f, "{} -> {}", self.local, self.remote),
        }
    }
}

impl FromStr for ForwardRule {
    type Err = UpError;

    /// Parses `local:remote` or `local:service:remote`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [local, remote] => Ok(Self::new(parse_port(local, s)?, parse_port(remote, s)?)),
            [local, service, remote] if !service.is_empty() => Ok(Self::to_service(
                parse_port(local, s)?,
                *service,
                parse_port(remote, s)?,
            )),
            _ => Err(invalid_rule(s, "expected 'local:remote' or 'local:service:remote'")),
        }
    }
}

// ============================================================================
// Reverse Rule
// ============================================================================

/// Port on the dev pod forwarded back to the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ReverseRepr")]
pub struct ReverseRule {
    pub remote: u16,
    pub local: u16,
}

impl ReverseRule {
    pub fn new(remote: u16, local: u16) -> Self {
        Self { remote, local }
    }
}

impl fmt::Display for ReverseRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.local, self.remote)
    }
}

impl FromStr for ReverseRule {
    type Err = UpError;

    /// Parses `remote:local`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((remote, local)) => Ok(Self::new(parse_port(remote, s)?, parse_port(local, s)?)),
            None => Err(invalid_rule(s, "expected 'remote:local'")),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Rejects a local port used by more than one rule.
///
/// Runs before anything is registered so a failure never leaves half of the
/// rules active.
pub fn validate_unique_ports(
    forwards: &[ForwardRule],
    reverses: &[ReverseRule],
) -> Result<(), UpError> {
    let mut seen = HashSet::new();
    let locals = forwards
        .iter()
        .map(|f| f.local)
        .chain(reverses.iter().map(|r| r.local));
    for port in locals {
        if !seen.insert(port) {
            return Err(UpError::DuplicatePort(port));
        }
    }
    Ok(())
}

/// Hint for a local port that cannot be bound.
pub fn port_unavailable_hint(port: u16) -> Option<String> {
    if port > MAX_PRIVILEGED_PORT {
        return None;
    }
    if cfg!(windows) {
        Some(format!(
            "Port {port} may be reserved by the system, pick a port above {MAX_PRIVILEGED_PORT}"
        ))
    } else {
        Some(format!(
            "Binding to port {port} requires root privileges, pick a port above {MAX_PRIVILEGED_PORT}"
        ))
    }
}

// ============================================================================
// Serde Representations
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleRepr {
    Short(String),
    Long {
        local: u16,
        remote: u16,
        #[serde(default)]
        service_name: Option<String>,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
}

impl TryFrom<RuleRepr> for ForwardRule {
    type Error = UpError;

    fn try_from(repr: RuleRepr) -> Result<Self, Self::Error> {
        match repr {
            RuleRepr::Short(s) => s.parse(),
            RuleRepr::Long {
                local,
                remote,
                service_name,
                labels,
            } => {
                if service_name.is_some() && !labels.is_empty() {
                    return Err(invalid_rule(
                        &local.to_string(),
                        "service_name and labels are mutually exclusive",
                    ));
                }
                Ok(Self {
                    local,
                    remote,
                    service_name,
                    labels,
                })
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReverseRepr {
    Short(String),
    Long { remote: u16, local: u16 },
}

impl TryFrom<ReverseRepr> for ReverseRule {
    type Error = UpError;

    fn try_from(repr: ReverseRepr) -> Result<Self, Self::Error> {
        match repr {
            ReverseRepr::Short(s) => s.parse(),
            ReverseRepr::Long { remote, local } => Ok(Self::new(remote, local)),
        }
    }
}

fn parse_port(value: &str, rule: &str) -> Result<u16, UpError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid_rule(rule, &format!("'{value}' is not a valid port"))),
        Ok(port) => Ok(port),
    }
}

fn invalid_rule(rule: &str, reason: &str) -> UpError {
    UpError::user(
        format!("invalid port rule '{rule}': {reason}"),
        "Check the forward and reverse sections of your configuration",
    )
}
