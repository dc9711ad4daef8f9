//! Normalization of raw cluster events into readiness events.
//!
//! The readiness watcher only ever sees [`ReadinessEvent`]s. This module owns
//! the tables mapping cluster event reasons and messages onto them, including
//! the known benign races that must not fail a session.

use crate::error::{UpError, DOWN_COMMAND};

/// Message of the `Started` event for the volume initialization container.
pub const INIT_VOLUME_STARTED: &str = "Started container kdev-init-data";

/// Scheduler messages caused by caches lagging behind; retried by the cluster.
const BENIGN_RACES: &[&str] = &[
    "pod has unbound immediate PersistentVolumeClaims",
    "is in the cache, so can't be assumed",
];

const INSUFFICIENT_RESOURCES: &[&str] = &["Insufficient cpu", "Insufficient memory"];

const SUBPATH_FAILURE: &str = "failed to create subPath directory";

/// Reasons that fail the dev pod unless the message is a benign race.
const FAILURE_REASONS: &[&str] = &[
    "Failed",
    "FailedCreatePodSandBox",
    "ErrImageNeverPull",
    "InspectFailed",
    "FailedCreatePodContainer",
];

/// Normalized cluster event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    /// The scheduler could not place the pod yet.
    SchedulingRetry { message: String },
    /// The scheduler could not place the pod for lack of CPU or memory.
    ResourceInsufficient { message: String },
    /// The cluster autoscaler is adding capacity.
    ScaleUp,
    /// The container image is being pulled.
    ImagePulling { message: String },
    /// A volume was attached to the node.
    VolumeAttached,
    /// The volume initialization container started.
    InitializingVolume,
    /// The pod is being killed.
    Eviction { message: String },
    /// The pod is running.
    Running,
    /// A known race that resolves on its own.
    BenignRace,
    /// The persistent volume is out of space.
    VolumeFull { message: String },
    /// Unrecoverable pod failure.
    Fatal { message: String },
    /// Nothing the watcher cares about.
    Ignored,
}

impl ReadinessEvent {
    /// Maps an event reason and message onto a readiness event.
    pub fn normalize(reason: &str, message: &str) -> Self {
        match reason {
            "FailedScheduling" => {
                if is_benign_race(message) {
                    ReadinessEvent::BenignRace
                } else if is_insufficient_resources(message) {
                    ReadinessEvent::ResourceInsufficient {
                        message: message.to_string(),
                    }
                } else {
                    ReadinessEvent::SchedulingRetry {
                        message: message.to_string(),
                    }
                }
            }
            r if FAILURE_REASONS.contains(&r) => {
                if is_benign_race(message) {
                    ReadinessEvent::BenignRace
                } else if message.contains(SUBPATH_FAILURE) {
                    ReadinessEvent::VolumeFull {
                        message: message.to_string(),
                    }
                } else {
                    ReadinessEvent::Fatal {
                        message: message.to_string(),
                    }
                }
            }
            "TriggeredScaleUp" => ReadinessEvent::ScaleUp,
            "SuccessfulAttachVolume" => ReadinessEvent::VolumeAttached,
            "Killing" => ReadinessEvent::Eviction {
                message: message.to_string(),
            },
            "Pulling" => ReadinessEvent::ImagePulling {
                message: pulling_message(message),
            },
            "Started" if message.contains(INIT_VOLUME_STARTED) => {
                ReadinessEvent::InitializingVolume
            }
            _ => ReadinessEvent::Ignored,
        }
    }
}

/// True for scheduler and sandbox messages that the cluster retries itself.
pub fn is_benign_race(message: &str) -> bool {
    BENIGN_RACES.iter().any(|m| message.contains(m))
        || (message.contains("veth") && message.contains("already exists"))
}

/// True when a scheduling message blames CPU or memory.
pub fn is_insufficient_resources(message: &str) -> bool {
    INSUFFICIENT_RESOURCES.iter().any(|m| message.contains(m))
}

/// Error returned when scheduling stays blocked past its deadline.
pub fn scheduling_timeout_error(last_message: &str) -> UpError {
    if is_insufficient_resources(last_message) {
        UpError::user(
            "insufficient resources",
            "Increase cluster resources or timeout of resources. More information is available here: https://kdev.sh/docs/reference/timeouts",
        )
    } else {
        UpError::Scheduling(last_message.to_string())
    }
}

/// Error returned when the persistent volume has no room left.
pub fn volume_full_error() -> UpError {
    UpError::user(
        "persistent volume has reached its capacity",
        format!(
            "Run '{DOWN_COMMAND} -v' to remove your persistent volume and try again, or increase its size"
        ),
    )
}

/// Shortens `Pulling image "registry/app:tag"` to a progress line.
fn pulling_message(message: &str) -> String {
    match message.split_once("Pulling image ") {
        Some((_, image)) => format!("Pulling image {}", image.trim_matches('"')),
        None => "Pulling images".to_string(),
    }
}
