//! kdev Up - The activation engine
//!
//! Turns a workload into a running dev session and keeps it alive:
//!
//! ```text
//!  UpEngine::start
//!    │
//!    ├─ pid          claim the session marker, watch for takeover
//!    │
//!    └─ activation   retry loop, one Attempt per iteration
//!         ├─ readiness   wait for the dev pod to run
//!         ├─ tunnel      direct port-forwards or an SSH tunnel
//!         ├─ (sync engine, user command: kdev-remote traits)
//!         └─ shutdown    ordered teardown, proctree for the local command
//! ```
//!
//! Cluster, sync engine and workload mutation are reached through the
//! `kdev-remote` traits; this crate owns the orchestration only.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod activation;
pub mod attempt;
pub mod engine;
pub mod paths;
pub mod pid;
pub mod proctree;
pub mod readiness;
pub mod reporter;
pub mod runner;
pub mod session;
pub mod shutdown;
pub mod state_file;
pub mod terminal;
pub mod tunnel;

// Re-exports for convenience
pub use attempt::Attempt;
pub use engine::UpEngine;
pub use pid::PidMarker;
pub use readiness::{ReadinessWatcher, WaitState};
pub use reporter::TracingReporter;
pub use runner::LocalCommandRunner;
pub use session::{Collaborators, Session};
pub use state_file::{FileStateStore, StateRecord};
pub use tunnel::{is_needed_global_forwarder, Forwarder, TunnelContext};
