//! Integration tests for the activation loop and its shutdown sequence.
//!
//! Every collaborator is an in-memory fake; time is paused so retry ticks
//! run instantly.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod support;

use std::time::Duration;

use kdev_core::{ReverseRule, SessionPhase, UpConfig, UpError, WorkloadKind};
use kdev_up::Session;
use support::{test_config, workload, Harness, RunScript, POD};
use tempfile::TempDir;
use tokio::time::Instant;

// ============================================================================
// Constants
// ============================================================================

const RECONNECT_NOTICE: &str = "Connection lost to your development container, reconnecting...";

const DEACTIVATED_NOTICE: &str = "Development container has been deactivated";

/// Bound on the liveness ping after a command failure
const SYNC_PING_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestSession {
    harness: Harness,
    session: Session,
    _home: TempDir,
}

impl TestSession {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: UpConfig) -> Self {
        let harness = Harness::new();
        let home = tempfile::tempdir().expect("create temp dir");
        let session = Session::new(
            workload(WorkloadKind::Deployment),
            config,
            harness.collaborators(),
            home.path(),
        )
        .with_ssh_config_path(home.path().join("ssh_config"));
        Self {
            harness,
            session,
            _home: home,
        }
    }

    /// Journal entries about resolving and destroying, in order.
    fn lifecycle(&self) -> Vec<String> {
        self.harness
            .journal
            .entries()
            .into_iter()
            .filter(|e| e == "resolve" || e.starts_with("destroy:"))
            .collect()
    }

    fn count(&self, entry: &str) -> usize {
        self.harness
            .journal
            .entries()
            .iter()
            .filter(|e| e.as_str() == entry)
            .count()
    }
}

// ============================================================================
// Reconnect Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lost_sync_reconnects_immediately_and_destroys_pod() {
    let mut t = TestSession::new();
    t.harness.sync.disconnect_next(UpError::LostSync);
    t.harness.runner.then(RunScript::Block);
    t.harness.runner.then(RunScript::Succeed);

    let start = Instant::now();
    t.session.run().await.expect("second attempt completes");

    assert_eq!(
        t.lifecycle(),
        vec![
            "resolve".to_string(),
            format!("destroy:{POD}"),
            "resolve".to_string(),
        ]
    );
    // No retry tick between the attempts.
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(t.harness.reporter.count(RECONNECT_NOTICE), 0);
    assert!(t
        .harness
        .reporter
        .outcomes()
        .contains(&("reconnect".to_string(), true)));
    assert_eq!(t.harness.sync.stops(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lost_sync_keeps_pod_with_persistent_volume() {
    let mut config = test_config();
    config.persistent_volume = true;
    let mut t = TestSession::with_config(config);
    t.harness.sync.disconnect_next(UpError::LostSync);
    t.harness.runner.then(RunScript::Block);

    t.session.run().await.expect("second attempt completes");

    assert_eq!(t.lifecycle(), vec!["resolve", "resolve"]);
    assert_eq!(t.count("create_volume"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_waits_for_retry_tick() {
    let mut t = TestSession::new();
    t.harness.sync.disconnect_next(UpError::Timeout("sync heartbeat".to_string()));
    t.harness.runner.then(RunScript::Block);
    t.harness.runner.then(RunScript::Succeed);

    let start = Instant::now();
    t.session.run().await.expect("second attempt completes");

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(t.harness.reporter.count(RECONNECT_NOTICE), 1);
    assert_eq!(t.lifecycle(), vec!["resolve", "resolve"]);
}

#[tokio::test(start_paused = true)]
async fn test_deactivated_on_retry_ends_session() {
    let mut t = TestSession::new();
    t.harness.resolver.deactivate();
    t.harness.sync.disconnect_next(UpError::LostSync);
    t.harness.runner.then(RunScript::Block);

    t.session.run().await.expect("deactivation ends the session cleanly");

    assert_eq!(t.harness.reporter.count(DEACTIVATED_NOTICE), 1);
    assert_eq!(t.count("apply"), 1);
    assert_eq!(t.count("resolve"), 2);
}

// ============================================================================
// Command Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_command_failure_with_live_sync_ends_session() {
    let mut t = TestSession::new();
    t.harness.runner.then(RunScript::Fail(3));

    let err = t.session.run().await.expect_err("command failed");

    assert!(matches!(err, UpError::CommandFailed { code: Some(3), .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(t.count("resolve"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_command_failure_with_dead_sync_is_lost_sync() {
    let mut t = TestSession::new();
    t.harness.sync.set_remote_alive(false);
    t.harness.runner.then(RunScript::Fail(3));
    t.harness.runner.then(RunScript::Succeed);

    t.session.run().await.expect("reconnected attempt completes");

    assert_eq!(
        t.lifecycle(),
        vec![
            "resolve".to_string(),
            format!("destroy:{POD}"),
            "resolve".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_command_failure_with_silent_sync_is_lost_sync() {
    let mut t = TestSession::new();
    t.harness.sync.hang_ping();
    t.harness.runner.then(RunScript::Fail(3));
    t.harness.runner.then(RunScript::Succeed);

    let start = Instant::now();
    t.session.run().await.expect("reconnected attempt completes");

    assert!(start.elapsed() >= SYNC_PING_TIMEOUT);
    assert_eq!(t.count(&format!("destroy:{POD}")), 1);
    assert_eq!(t.count("resolve"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_sync_ping_ends_session() {
    let mut t = TestSession::new();
    t.harness.sync.hang_ping();
    t.harness.runner.then(RunScript::Fail(3));

    let cancel = t.session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let err = t.session.run().await.expect_err("cancelled");

    assert!(matches!(err, UpError::Cancelled));
    assert!(start.elapsed() < SYNC_PING_TIMEOUT);
    assert_eq!(t.harness.sync.stops(), 1);
}

// ============================================================================
// Failure and Shutdown Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_error_before_first_success_is_fatal() {
    let mut config = test_config();
    config.reverse = vec![ReverseRule::new(3000, 3000)];
    let mut t = TestSession::with_config(config);

    let err = t.session.run().await.expect_err("direct mode has no reverses");

    assert!(matches!(err, UpError::User(_)));
    assert_eq!(t.count("resolve"), 1);
    assert!(!t.session.has_succeeded());
    assert_eq!(t.harness.sync.stops(), 0);
    assert!(t.harness.reporter.outcomes().contains(&("up".to_string(), false)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_serving_runs_shutdown() {
    let mut t = TestSession::new();
    t.harness.runner.then(RunScript::Block);

    let cancel = t.session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let err = t.session.run().await.expect_err("cancelled");

    assert!(matches!(err, UpError::Cancelled));
    assert_eq!(t.harness.sync.stops(), 1);
    assert!(t.session.has_succeeded());
    assert!(t.harness.state.phases().contains(&SessionPhase::Ready));
    assert!(t.harness.reporter.outcomes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_served_session_prints_summary() {
    let mut config = test_config();
    config.forward = vec![kdev_core::ForwardRule::new(8080, 80)];
    let mut t = TestSession::with_config(config);

    t.session.run().await.expect("command completes");

    let messages = t.harness.reporter.messages();
    assert!(messages.iter().any(|m| m.contains("Namespace: dev")));
    assert!(messages.iter().any(|m| m.contains("8080")));
    assert!(messages.contains(&"Files synchronized".to_string()));
    assert!(t
        .harness
        .cluster
        .forwards()
        .contains(&(POD.to_string(), 22000, 60001)));
}
