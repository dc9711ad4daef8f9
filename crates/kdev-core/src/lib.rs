//! kdev Core - Shared domain types for dev sessions
//!
//! This crate provides the pure, runtime-free pieces shared by the engine
//! (`kdev-up`), the collaborator interfaces (`kdev-remote`) and the CLI:
//! - `error` - the `UpError` taxonomy and its `ErrorKind` classification
//! - `retry` - the retry verdict for failed activation attempts
//! - `forward` - forward and reverse port rules
//! - `readiness` - normalization of cluster events
//! - `config` - session configuration
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod forward;
pub mod phase;
pub mod readiness;
pub mod retry;
pub mod workload;

// Re-exports for convenience
pub use config::{ConfigError, SshSettings, Timeouts, UpConfig};
pub use error::{ErrorKind, Result, UpError, UserError};
pub use forward::{ForwardRule, ReverseRule};
pub use phase::SessionPhase;
pub use readiness::ReadinessEvent;
pub use retry::{is_retryable, RetryState};
pub use workload::{WorkloadKind, WorkloadRef};
