//! Error taxonomy for dev sessions.
//!
//! Every failure that can end an activation attempt is an [`UpError`]. The
//! retry loop never inspects error text directly; it asks for the
//! [`ErrorKind`] instead. Variants produced by this workspace are classified
//! structurally, and only the variants that carry raw text from outside
//! (cluster API messages, transport errors, I/O) fall back to matching known
//! message fragments.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Command a user runs to tear the dev session down, referenced in hints.
pub const DOWN_COMMAND: &str = "kdev down";

// ============================================================================
// Message Fragments
// ============================================================================

/// Fragments of network-level failures that are worth retrying.
const TRANSIENT_FRAGMENTS: &[&str] = &[
    "operation time out",
    "operation timed out",
    "i/o timeout",
    "can't assign requested address",
    "command exited without exit status or exit signal",
    "connection refused",
    "connection reset by peer",
    "network is unreachable",
    "broken pipe",
];

/// Fragments meaning the sync engine stopped answering but may come back.
const UNRESPONSIVE_FRAGMENTS: &[&str] = &[
    "synchronization service is unresponsive",
    "syncthing is unresponsive",
];

/// Fragments that end a session even after it worked once.
const FATAL_AFTER_SUCCESS_FRAGMENTS: &[&str] = &[
    "deactivated by another instance",
    "is forbidden",
    "forbidden:",
    "unauthorized",
];

// ============================================================================
// User Error
// ============================================================================

/// An error the user can act on, with a remediation hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError {
    /// What went wrong.
    pub message: String,
    /// What to do about it.
    pub hint: String,
}

impl UserError {
    pub fn new(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: hint.into(),
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ============================================================================
// Error Kind
// ============================================================================

/// Closed classification of [`UpError`] used by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network blips, deadlines and the lost-sync/re-apply sentinels.
    Transient,
    /// The sync engine stopped answering.
    Unresponsive,
    /// Ownership lost or access revoked; ends the session unconditionally.
    Ownership,
    /// Cluster or local resources ran out.
    ResourceExhaustion,
    /// Structured error carrying a remediation hint.
    User,
    /// The user's own command failed.
    UserCommand,
    /// The attempt or the process was cancelled.
    Cancelled,
    /// Anything else.
    Other,
}

// ============================================================================
// Up Error
// ============================================================================

/// Errors that can end an activation attempt.
#[derive(Error, Debug)]
pub enum UpError {
    /// User-actionable failure with a hint.
    #[error("{0}")]
    User(UserError),

    /// Connectivity with the sync engine was lost.
    #[error("synchronization service is disconnected")]
    LostSync,

    /// The dev-mode workload must be applied again.
    #[error("development container must be re-applied")]
    ForceReapply,

    /// The sync engine is alive but not answering.
    #[error("synchronization service is unresponsive")]
    SyncBusy,

    /// The sync engine database is inconsistent.
    #[error("synchronization database corrupted")]
    NeedsSyncReset,

    /// Not enough disk space to synchronize files.
    #[error("there isn't enough disk space available to synchronize your files")]
    InsufficientSpace,

    /// The sync engine reported an error it could not classify.
    #[error("unknown synchronization error: {0}")]
    UnknownSync(String),

    /// The user's command exited unsuccessfully.
    #[error("Command execution failed: {message}")]
    CommandFailed {
        /// Exit code of the command, when it exited normally.
        code: Option<i32>,
        /// Description of the failure.
        message: String,
    },

    /// The dev pod was removed while waiting for it.
    #[error("development container has been removed")]
    DevPodDeleted,

    /// Another process took over the session marker.
    #[error("development container has been deactivated by another instance")]
    Deactivated,

    /// Raw scheduling message from the cluster, surfaced verbatim.
    #[error("{0}")]
    Scheduling(String),

    /// Two rules share a local port.
    #[error("port {0} is listed multiple times, please check your configuration")]
    DuplicatePort(u16),

    /// The port was already registered by a previous registration pass.
    #[error("port {0} is already allocated")]
    PortAlreadyAllocated(u16),

    /// Something else on the local machine is bound to the port.
    #[error("port {0} is already in use in your local machine, please check your configuration")]
    PortInUse(u16),

    /// Port registration did not finish before its deadline.
    #[error("ports are not available")]
    PortsNotAvailable,

    /// An operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The attempt was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Raw message from the cluster API.
    #[error("{0}")]
    Api(String),

    /// Raw message from a tunnel or port-forward transport.
    #[error("{0}")]
    Transport(String),

    /// The pid marker does not contain a pid.
    #[error("pid marker {} is corrupted: {content:?}", path.display())]
    CorruptMarker {
        /// Marker location.
        path: PathBuf,
        /// What was found instead of a pid.
        content: String,
    },

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failure wrapped with context by the activation loop.
    #[error("{0}")]
    Other(String),
}

impl UpError {
    /// Builds a user error.
    pub fn user(message: impl Into<String>, hint: impl Into<String>) -> Self {
        UpError::User(UserError::new(message, hint))
    }

    /// Returns the remediation hint for user errors.
    pub fn hint(&self) -> Option<&str> {
        match self {
            UpError::User(e) => Some(e.hint.as_str()),
            _ => None,
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpError::LostSync | UpError::ForceReapply | UpError::Timeout(_) => {
                ErrorKind::Transient
            }
            UpError::SyncBusy => ErrorKind::Unresponsive,
            UpError::Deactivated => ErrorKind::Ownership,
            UpError::InsufficientSpace => ErrorKind::ResourceExhaustion,
            UpError::User(_) => ErrorKind::User,
            UpError::CommandFailed { .. } => ErrorKind::UserCommand,
            UpError::Cancelled => ErrorKind::Cancelled,
            UpError::Api(msg) | UpError::Transport(msg) | UpError::Other(msg) => {
                classify_message(msg)
            }
            UpError::Io(e) => classify_message(&e.to_string()),
            _ => ErrorKind::Other,
        }
    }

    /// Returns true for the well-known transient set.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Process exit code for an error that ends the session.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpError::CommandFailed { code: Some(code), .. } => *code,
            UpError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<UserError> for UpError {
    fn from(e: UserError) -> Self {
        UpError::User(e)
    }
}

/// Maps raw error text onto a kind.
///
/// Only used for messages that originate outside this workspace.
fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if TRANSIENT_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return ErrorKind::Transient;
    }
    if UNRESPONSIVE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return ErrorKind::Unresponsive;
    }
    if FATAL_AFTER_SUCCESS_FRAGMENTS.iter().any(|f| lower.contains(f))
        || is_namespace_deleted(&lower)
    {
        return ErrorKind::Ownership;
    }
    ErrorKind::Other
}

/// `namespaces "dev" not found` and the terminating variant.
fn is_namespace_deleted(lower: &str) -> bool {
    lower.contains("namespaces \"")
        && (lower.contains("not found") || lower.contains("being terminated"))
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, UpError>;

// ============================================================================
// Tests
// ============================================================================
