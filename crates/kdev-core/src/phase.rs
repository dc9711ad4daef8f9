//! Session phases published to the state store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Externally visible progress of a dev session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Activating,
    Starting,
    Attaching,
    Pulling,
    StartingSync,
    Synchronizing,
    Ready,
    Failed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Activating => "activating",
            SessionPhase::Starting => "starting",
            SessionPhase::Attaching => "attaching",
            SessionPhase::Pulling => "pulling",
            SessionPhase::StartingSync => "startingSync",
            SessionPhase::Synchronizing => "synchronizing",
            SessionPhase::Ready => "ready",
            SessionPhase::Failed => "failed",
        }
    }

    /// True once the session stopped progressing, successfully or not.
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionPhase::Ready | SessionPhase::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activating" => Ok(SessionPhase::Activating),
            "starting" => Ok(SessionPhase::Starting),
            "attaching" => Ok(SessionPhase::Attaching),
            "pulling" => Ok(SessionPhase::Pulling),
            "startingSync" => Ok(SessionPhase::StartingSync),
            "synchronizing" => Ok(SessionPhase::Synchronizing),
            "ready" => Ok(SessionPhase::Ready),
            "failed" => Ok(SessionPhase::Failed),
            other => Err(format!("unknown session phase: {other}")),
        }
    }
}
