//! Value types crossing the collaborator interfaces.

use std::fmt;

use kdev_core::WorkloadRef;
use tokio::sync::mpsc;

/// Lifecycle phase reported by the cluster for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Snapshot of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub uid: String,
    pub phase: PodPhase,
    /// A deletion timestamp is set.
    pub deleting: bool,
}

/// Event recorded by the cluster about an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub reason: String,
    pub message: String,
    /// UID of the object the event is about.
    pub involved_uid: String,
    /// Resume point for re-subscribing.
    pub resource_version: String,
}

/// Item delivered by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Item(T),
    /// The watch delivered something that is not a `T`; the subscriber
    /// should re-subscribe.
    Malformed(String),
}

/// Receiving end of a watch. A closed channel means the watch ended.
pub type WatchStream<T> = mpsc::Receiver<WatchEvent<T>>;

/// Current state of the target workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    pub workload: WorkloadRef,
    /// The workload is currently in dev mode.
    pub dev_mode_on: bool,
    /// The workload was changed by someone else while in dev mode.
    pub modified_externally: bool,
    /// The workload carries the sleeping marker.
    pub sleeping: bool,
    /// The workload was created by kdev rather than taken over.
    pub auto_created: bool,
    /// Synthesizing from scratch found a same-named object not owned by kdev.
    pub name_taken: bool,
}

impl WorkloadHandle {
    pub fn new(workload: WorkloadRef) -> Self {
        Self {
            workload,
            dev_mode_on: false,
            modified_externally: false,
            sleeping: false,
            auto_created: false,
            name_taken: false,
        }
    }
}

/// Outcome of workload resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWorkload {
    pub handle: WorkloadHandle,
    /// The workload does not exist yet and will be created by deploying.
    pub created: bool,
}

/// Which form of a workload to deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Dev,
    Original,
}

/// Local ports used by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPorts {
    /// Local end of the sync data channel.
    pub local_data: u16,
    /// Local end of the sync GUI.
    pub local_gui: u16,
}
