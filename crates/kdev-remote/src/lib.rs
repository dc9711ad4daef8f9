//! kdev Remote - Interfaces to everything outside the engine
//!
//! The engine never talks to the cluster, the sync engine or the user's
//! terminal directly. It drives these traits instead:
//! - `cluster` - pods, events, services and port-forwards
//! - `workload` - resolution and dev-mode translation of the target workload
//! - `sync` - the file synchronization engine
//! - `runner` - the user's command
//! - `status` - session state persistence and user-facing messages
//!
//! Every trait is object safe and `Send + Sync` so the engine can hold them
//! as `Arc<dyn ...>` and hand clones to background tasks.

pub mod cluster;
pub mod runner;
pub mod status;
pub mod sync;
pub mod types;
pub mod workload;

pub use cluster::Cluster;
pub use runner::CommandRunner;
pub use status::{StateStore, StatusReporter};
pub use sync::SyncEngine;
pub use types::{
    ClusterEvent, PodInfo, PodPhase, ResolvedWorkload, SyncPorts, Variant, WatchEvent,
    WatchStream, WorkloadHandle,
};
pub use workload::{Translation, TranslationSet, WorkloadMutator, WorkloadResolver};
