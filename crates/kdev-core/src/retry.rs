//! Retry verdicts for failed activation attempts.
//!
//! [`is_retryable`] is the only place that decides whether an error ends the
//! session. It is a pure function of the error and a small [`RetryState`];
//! the only side effect is incrementing the bounded unhandled-retry counter.
//!
//! Order of checks:
//!
//! ```text
//!  None ───────────────────────────────► false
//!  transient (network, deadline,
//!             lost sync, re-apply) ────► true
//!  never succeeded ────────────────────► false
//!  sync engine unresponsive ───────────► true
//!  user error / user command failed /
//!  ownership lost ─────────────────────► false
//!  counter < max ──────────► counter += 1, true
//!  otherwise ──────────────────────────► false
//! ```

use crate::error::{ErrorKind, UpError};

/// Default cap for retries of unclassified errors after a first success.
pub const DEFAULT_MAX_UNHANDLED_RETRIES: u32 = 5;

/// Per-session inputs of the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    success: bool,
    unhandled_retries: u32,
    max_unhandled_retries: u32,
}

impl RetryState {
    pub fn new(max_unhandled_retries: u32) -> Self {
        Self {
            success: false,
            unhandled_retries: 0,
            max_unhandled_retries,
        }
    }

    /// Records that the session reached `Serve` at least once.
    ///
    /// Never goes back to false.
    pub fn mark_success(&mut self) {
        self.success = true;
    }

    pub fn has_succeeded(&self) -> bool {
        self.success
    }

    pub fn unhandled_retries(&self) -> u32 {
        self.unhandled_retries
    }

    pub fn max_unhandled_retries(&self) -> u32 {
        self.max_unhandled_retries
    }

    /// Clears the counter. Only the lost-sync reconnect path calls this.
    pub fn reset_unhandled(&mut self) {
        self.unhandled_retries = 0;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNHANDLED_RETRIES)
    }
}

/// Decides whether the session should run another attempt after `err`.
pub fn is_retryable(state: &mut RetryState, err: Option<&UpError>) -> bool {
    let Some(err) = err else {
        return false;
    };

    let kind = err.kind();
    if kind == ErrorKind::Transient {
        return true;
    }

    if !state.success {
        return false;
    }

    match kind {
        ErrorKind::Unresponsive => true,
        ErrorKind::Ownership
        | ErrorKind::User
        | ErrorKind::UserCommand
        | ErrorKind::Cancelled => false,
        _ => {
            if state.unhandled_retries < state.max_unhandled_retries {
                state.unhandled_retries += 1;
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::strategy::LazyJust;

    const NETWORK_FRAGMENTS: &[&str] = &[
        "operation timed out",
        "i/o timeout",
        "can't assign requested address",
        "command exited without exit status or exit signal",
        "connection refused",
        "connection reset by peer",
        "network is unreachable",
    ];

    fn transient_error() -> impl Strategy<Value = UpError> {
        prop_oneof![
            LazyJust::new(|| UpError::LostSync),
            LazyJust::new(|| UpError::ForceReapply),
            "[a-z ]{0,16}".prop_map(UpError::Timeout),
            ("[a-z:. ]{0,16}", 0..NETWORK_FRAGMENTS.len(), "[a-z ]{0,16}").prop_map(
                |(prefix, idx, suffix)| {
                    UpError::Transport(format!("{prefix}{}{suffix}", NETWORK_FRAGMENTS[idx]))
                }
            ),
        ]
    }

    fn non_transient_error() -> impl Strategy<Value = UpError> {
        prop_oneof![
            LazyJust::new(|| UpError::SyncBusy),
            LazyJust::new(|| UpError::DevPodDeleted),
            LazyJust::new(|| UpError::Deactivated),
            LazyJust::new(|| UpError::InsufficientSpace),
            LazyJust::new(|| UpError::PortsNotAvailable),
            any::<u16>().prop_map(UpError::DuplicatePort),
            ("[a-z ]{1,24}", "[a-z ]{1,24}").prop_map(|(m, h)| UpError::user(m, h)),
            (any::<Option<i32>>(), "[a-z ]{0,16}")
                .prop_map(|(code, message)| UpError::CommandFailed { code, message }),
            "[a-z]{1,24}".prop_map(UpError::Api),
        ]
        .prop_filter("must not be transient", |e| !e.is_transient())
    }

    proptest! {
        #[test]
        fn test_transient_errors_always_retry(
            err in transient_error(),
            success in any::<bool>(),
            used in 0u32..10,
        ) {
            let mut state = RetryState::new(5);
            if success {
                state.mark_success();
            }
            state.unhandled_retries = used;
            prop_assert!(is_retryable(&mut state, Some(&err)));
            prop_assert_eq!(state.unhandled_retries(), used);
        }

        #[test]
        fn test_fail_fast_before_first_success(err in non_transient_error()) {
            let mut state = RetryState::new(5);
            prop_assert!(!is_retryable(&mut state, Some(&err)));
            prop_assert_eq!(state.unhandled_retries(), 0);
        }

        #[test]
        fn test_counter_is_monotone_and_capped(max in 0u32..8, calls in 0usize..20) {
            let mut state = RetryState::new(max);
            state.mark_success();
            let err = UpError::Other("remote command stalled".to_string());
            let mut previous = 0;
            for _ in 0..calls {
                let retried = is_retryable(&mut state, Some(&err));
                let now = state.unhandled_retries();
                prop_assert!(now >= previous);
                prop_assert!(now <= max);
                prop_assert_eq!(retried, now > previous);
                previous = now;
            }
        }
    }

    #[test]
    fn test_no_error_is_not_retryable() {
        let mut state = RetryState::default();
        state.mark_success();
        assert!(!is_retryable(&mut state, None));
    }

    #[test]
    fn test_unresponsive_sync_retries_after_success_without_counting() {
        let mut state = RetryState::new(1);
        assert!(!is_retryable(&mut state, Some(&UpError::SyncBusy)));

        state.mark_success();
        for _ in 0..3 {
            assert!(is_retryable(&mut state, Some(&UpError::SyncBusy)));
        }
        assert_eq!(state.unhandled_retries(), 0);
    }

    #[test]
    fn test_ownership_loss_is_fatal_after_success() {
        let mut state = RetryState::default();
        state.mark_success();
        assert!(!is_retryable(&mut state, Some(&UpError::Deactivated)));
        let err = UpError::Api("namespaces \"dev\" not found".to_string());
        assert!(!is_retryable(&mut state, Some(&err)));
        assert_eq!(state.unhandled_retries(), 0);
    }

    #[test]
    fn test_user_errors_are_returned_as_is() {
        let mut state = RetryState::default();
        state.mark_success();
        let err = UpError::user("image not found", "check the image name");
        assert!(!is_retryable(&mut state, Some(&err)));
        assert_eq!(state.unhandled_retries(), 0);
    }

    #[test]
    fn test_failed_command_is_not_retried() {
        let mut state = RetryState::default();
        state.mark_success();
        let err = UpError::CommandFailed {
            code: Some(2),
            message: "exit status: 2".to_string(),
        };
        assert!(!is_retryable(&mut state, Some(&err)));
        assert_eq!(state.unhandled_retries(), 0);
    }

    #[test]
    fn test_reset_unhandled() {
        let mut state = RetryState::new(2);
        state.mark_success();
        let err = UpError::DevPodDeleted;
        assert!(is_retryable(&mut state, Some(&err)));
        assert!(is_retryable(&mut state, Some(&err)));
        assert!(!is_retryable(&mut state, Some(&err)));

        state.reset_unhandled();
        assert!(state.has_succeeded());
        assert!(is_retryable(&mut state, Some(&err)));
    }
}
