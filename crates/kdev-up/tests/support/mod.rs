//! In-memory fakes of the collaborator traits.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kdev_core::{ForwardRule, Result, ReverseRule, SessionPhase, UpConfig, UpError, WorkloadKind, WorkloadRef};
use kdev_remote::{
    Cluster, ClusterEvent, CommandRunner, PodInfo, PodPhase, ResolvedWorkload, StateStore,
    StatusReporter, SyncEngine, SyncPorts, TranslationSet, WatchEvent, WatchStream,
    WorkloadHandle, WorkloadMutator, WorkloadResolver,
};
use kdev_up::session::Collaborators;
use kdev_up::tunnel::{ForwardRegistrar, ReverseRegistrar};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "dev";
pub const WORKLOAD: &str = "api";
pub const POD: &str = "api-dev-0";
pub const POD_UID: &str = "uid-1";

/// Maximum time to wait for a fake to observe a call
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between checks while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Journal
// ============================================================================

/// Ordered record of calls across fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub fn workload(kind: WorkloadKind) -> WorkloadRef {
    WorkloadRef::new(NAMESPACE, WORKLOAD, kind)
}

pub fn pod(phase: PodPhase) -> PodInfo {
    PodInfo {
        name: POD.to_string(),
        uid: POD_UID.to_string(),
        phase,
        deleting: false,
    }
}

pub fn event(reason: &str, message: &str, version: &str) -> WatchEvent<ClusterEvent> {
    WatchEvent::Item(ClusterEvent {
        reason: reason.to_string(),
        message: message.to_string(),
        involved_uid: POD_UID.to_string(),
        resource_version: version.to_string(),
    })
}

// ============================================================================
// Cluster
// ============================================================================

/// One registered port-forward: (pod, remote, local).
pub type PortForward = (String, u16, u16);

pub struct FakeCluster {
    journal: Journal,
    dev_pod: Mutex<PodInfo>,
    pod_tx: Mutex<Option<mpsc::Sender<WatchEvent<PodInfo>>>>,
    event_tx: Mutex<Option<mpsc::Sender<WatchEvent<ClusterEvent>>>>,
    event_versions: Mutex<Vec<Option<String>>>,
    services: Mutex<HashMap<String, String>>,
    forwards: Mutex<Vec<PortForward>>,
    taken: Mutex<HashSet<u16>>,
}

impl FakeCluster {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            dev_pod: Mutex::new(pod(PodPhase::Running)),
            pod_tx: Mutex::new(None),
            event_tx: Mutex::new(None),
            event_versions: Mutex::new(Vec::new()),
            services: Mutex::new(HashMap::new()),
            forwards: Mutex::new(Vec::new()),
            taken: Mutex::new(HashSet::new()),
        })
    }

    pub fn set_dev_pod(&self, pod: PodInfo) {
        *self.dev_pod.lock().unwrap() = pod;
    }

    pub fn add_service(&self, selector: &str, service: &str) {
        self.services
            .lock()
            .unwrap()
            .insert(selector.to_string(), service.to_string());
    }

    /// Makes the local port unavailable.
    pub fn take_port(&self, port: u16) {
        self.taken.lock().unwrap().insert(port);
    }

    pub fn forwards(&self) -> Vec<PortForward> {
        self.forwards.lock().unwrap().clone()
    }

    /// Resource versions passed to each `watch_events` call.
    pub fn event_versions(&self) -> Vec<Option<String>> {
        self.event_versions.lock().unwrap().clone()
    }

    /// Waits for the readiness watcher to subscribe and returns the feeds.
    pub async fn feeds(
        &self,
    ) -> (
        mpsc::Sender<WatchEvent<PodInfo>>,
        mpsc::Sender<WatchEvent<ClusterEvent>>,
    ) {
        let start = tokio::time::Instant::now();
        loop {
            let pods = self.pod_tx.lock().unwrap().clone();
            let events = self.event_tx.lock().unwrap().clone();
            if let (Some(pods), Some(events)) = (pods, events) {
                return (pods, events);
            }
            assert!(start.elapsed() < WAIT_TIMEOUT, "watcher never subscribed");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drops the cluster's side of the event watch so the stream closes
    /// once the test drops its clones.
    pub fn close_events(&self) {
        self.event_tx.lock().unwrap().take();
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_dev_pod(
        &self,
        _cancel: &CancellationToken,
        _workload: &WorkloadRef,
        _created: bool,
    ) -> Result<PodInfo> {
        Ok(self.dev_pod.lock().unwrap().clone())
    }

    async fn destroy_pod(&self, _namespace: &str, pod: &str) -> Result<()> {
        self.journal.push(format!("destroy:{pod}"));
        Ok(())
    }

    async fn watch_pod(&self, _namespace: &str, _pod: &str) -> Result<WatchStream<PodInfo>> {
        let (tx, rx) = mpsc::channel(16);
        *self.pod_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn watch_events(
        &self,
        _namespace: &str,
        _pod: &str,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<ClusterEvent>> {
        self.event_versions
            .lock()
            .unwrap()
            .push(resource_version.map(str::to_string));
        let (tx, rx) = mpsc::channel(16);
        *self.event_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn service_for_labels(&self, _namespace: &str, selector: &str) -> Result<String> {
        self.services
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .ok_or_else(|| UpError::Api(format!("no service matches {selector}")))
    }

    async fn pod_for_service(&self, _namespace: &str, service: &str) -> Result<String> {
        Ok(format!("{service}-pod"))
    }

    async fn open_port_forward(
        &self,
        _cancel: CancellationToken,
        _namespace: &str,
        pod: &str,
        remote: u16,
        local: SocketAddr,
    ) -> Result<()> {
        if self.taken.lock().unwrap().contains(&local.port()) {
            return Err(UpError::PortInUse(local.port()));
        }
        self.forwards
            .lock()
            .unwrap()
            .push((pod.to_string(), remote, local.port()));
        Ok(())
    }
}

// ============================================================================
// Workload
// ============================================================================

pub struct FakeResolver {
    journal: Journal,
    deactivated: AtomicBool,
}

impl FakeResolver {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            deactivated: AtomicBool::new(false),
        })
    }

    /// Retries find the workload out of dev mode.
    pub fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkloadResolver for FakeResolver {
    async fn resolve(
        &self,
        _cancel: &CancellationToken,
        workload: &WorkloadRef,
        _autocreate: bool,
        is_retry: bool,
    ) -> Result<ResolvedWorkload> {
        self.journal.push("resolve");
        let mut handle = WorkloadHandle::new(workload.clone());
        handle.dev_mode_on = is_retry && !self.deactivated.load(Ordering::SeqCst);
        Ok(ResolvedWorkload {
            handle,
            created: false,
        })
    }

    async fn refresh(
        &self,
        _cancel: &CancellationToken,
        handle: &WorkloadHandle,
    ) -> Result<WorkloadHandle> {
        let mut handle = handle.clone();
        handle.sleeping = false;
        Ok(handle)
    }

    async fn watch_drift(
        &self,
        _cancel: CancellationToken,
        _handle: &WorkloadHandle,
    ) -> Result<Option<mpsc::Receiver<()>>> {
        Ok(None)
    }
}

pub struct FakeMutator {
    journal: Journal,
}

impl FakeMutator {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self { journal })
    }
}

#[async_trait]
impl WorkloadMutator for FakeMutator {
    async fn create_volume(&self, _cancel: &CancellationToken, _workload: &WorkloadRef) -> Result<()> {
        self.journal.push("create_volume");
        Ok(())
    }

    async fn compute_dev_mode_translations(
        &self,
        _cancel: &CancellationToken,
        _handle: &WorkloadHandle,
        _reset_sync: bool,
    ) -> Result<TranslationSet> {
        Ok(TranslationSet::default())
    }

    async fn apply_dev_mode(&self, _set: &TranslationSet) -> Result<()> {
        self.journal.push("apply");
        Ok(())
    }
}

// ============================================================================
// Sync
// ============================================================================

pub struct FakeSync {
    journal: Journal,
    disconnects: Mutex<VecDeque<UpError>>,
    remote_alive: AtomicBool,
    ping_hangs: AtomicBool,
    stops: AtomicUsize,
}

impl FakeSync {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            disconnects: Mutex::new(VecDeque::new()),
            remote_alive: AtomicBool::new(true),
            ping_hangs: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        })
    }

    /// The next monitor reports `err` right away.
    pub fn disconnect_next(&self, err: UpError) {
        self.disconnects.lock().unwrap().push_back(err);
    }

    pub fn set_remote_alive(&self, alive: bool) {
        self.remote_alive.store(alive, Ordering::SeqCst);
    }

    /// Pings never answer.
    pub fn hang_ping(&self) {
        self.ping_hangs.store(true, Ordering::SeqCst);
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncEngine for FakeSync {
    async fn start(&self) -> Result<()> {
        self.journal.push("sync_start");
        Ok(())
    }

    async fn wait_for_ping(&self, _cancel: &CancellationToken, _local: bool) -> Result<()> {
        Ok(())
    }

    async fn wait_for_scanning(&self, _cancel: &CancellationToken, _local: bool) -> Result<()> {
        Ok(())
    }

    async fn wait_for_connected(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        _cancel: &CancellationToken,
        progress: mpsc::Sender<f64>,
    ) -> Result<()> {
        let _ = progress.send(50.0).await;
        Ok(())
    }

    async fn restart(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _local: bool) -> bool {
        if self.ping_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.remote_alive.load(Ordering::SeqCst)
    }

    async fn monitor(&self, cancel: CancellationToken, disconnect: mpsc::Sender<UpError>) {
        let next = self.disconnects.lock().unwrap().pop_front();
        match next {
            Some(err) => {
                let _ = disconnect.send(err).await;
            }
            None => cancel.cancelled().await,
        }
    }

    fn ports(&self) -> SyncPorts {
        SyncPorts {
            local_data: 60001,
            local_gui: 60002,
        }
    }
}

// ============================================================================
// Runner, state and reporter
// ============================================================================

/// What the next command run does.
#[derive(Debug, Clone, Copy)]
pub enum RunScript {
    Succeed,
    Fail(i32),
    /// Runs until cancelled.
    Block,
}

pub struct FakeRunner {
    journal: Journal,
    script: Mutex<VecDeque<RunScript>>,
}

impl FakeRunner {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            script: Mutex::new(VecDeque::new()),
        })
    }

    pub fn then(&self, step: RunScript) {
        self.script.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cancel: CancellationToken, _command: Vec<String>) -> Result<()> {
        self.journal.push("run");
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunScript::Succeed);
        match step {
            RunScript::Succeed => Ok(()),
            RunScript::Fail(code) => Err(UpError::CommandFailed {
                code: Some(code),
                message: format!("exit status: {code}"),
            }),
            RunScript::Block => {
                cancel.cancelled().await;
                Err(UpError::Cancelled)
            }
        }
    }

    fn root_pid(&self) -> Option<u32> {
        None
    }
}

#[derive(Default)]
pub struct FakeState {
    phases: Mutex<Vec<SessionPhase>>,
}

impl FakeState {
    pub fn phases(&self) -> Vec<SessionPhase> {
        self.phases.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for FakeState {
    async fn update(&self, _workload: &WorkloadRef, phase: SessionPhase) -> Result<()> {
        self.phases.lock().unwrap().push(phase);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    messages: Mutex<Vec<String>>,
    outcomes: Mutex<Vec<(String, bool)>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self, message: &str) -> usize {
        self.messages().iter().filter(|m| m.as_str() == message).count()
    }

    pub fn outcomes(&self) -> Vec<(String, bool)> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl StatusReporter for RecordingReporter {
    fn progress(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn success(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn warning(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn information(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn record_outcome(&self, event: &str, success: bool) {
        self.outcomes.lock().unwrap().push((event.to_string(), success));
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Registrar answering from a table of per-port results.
#[derive(Default)]
pub struct ScriptedRegistrar {
    /// Failure per local port, with how many more times it fails (`None`: always).
    failures: Mutex<HashMap<u16, (fn(u16) -> UpError, Option<usize>)>>,
    attempts: Mutex<HashMap<u16, usize>>,
    registered: Mutex<Vec<ForwardRule>>,
    reverses: Mutex<Vec<ReverseRule>>,
}

impl ScriptedRegistrar {
    /// Registrations of `port` always fail with `err`.
    pub fn fail(&self, port: u16, err: fn(u16) -> UpError) {
        self.failures.lock().unwrap().insert(port, (err, None));
    }

    /// The first `times` registrations of `port` fail with `err`.
    pub fn fail_times(&self, port: u16, times: usize, err: fn(u16) -> UpError) {
        self.failures.lock().unwrap().insert(port, (err, Some(times)));
    }

    pub fn registered(&self) -> Vec<ForwardRule> {
        self.registered.lock().unwrap().clone()
    }

    pub fn reverses(&self) -> Vec<ReverseRule> {
        self.reverses.lock().unwrap().clone()
    }

    /// Registration attempts for a local port, successful or not.
    pub fn attempts(&self, port: u16) -> usize {
        self.attempts.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    fn scripted_failure(&self, port: u16) -> Option<UpError> {
        *self.attempts.lock().unwrap().entry(port).or_default() += 1;
        let mut failures = self.failures.lock().unwrap();
        let (err, remaining) = failures.get_mut(&port)?;
        match remaining {
            None => Some((*err)(port)),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some((*err)(port))
            }
        }
    }
}

#[async_trait]
impl ForwardRegistrar for ScriptedRegistrar {
    async fn register(&self, rule: &ForwardRule) -> Result<()> {
        if let Some(err) = self.scripted_failure(rule.local) {
            return Err(err);
        }
        self.registered.lock().unwrap().push(rule.clone());
        Ok(())
    }

    fn allocated(&self) -> Vec<u16> {
        self.registered().iter().map(|r| r.local).collect()
    }
}

#[async_trait]
impl ReverseRegistrar for ScriptedRegistrar {
    async fn register_reverse(&self, rule: &ReverseRule) -> Result<()> {
        if let Some(err) = self.scripted_failure(rule.local) {
            return Err(err);
        }
        self.reverses.lock().unwrap().push(*rule);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// All fakes wired together.
pub struct Harness {
    pub journal: Journal,
    pub cluster: Arc<FakeCluster>,
    pub resolver: Arc<FakeResolver>,
    pub mutator: Arc<FakeMutator>,
    pub sync: Arc<FakeSync>,
    pub runner: Arc<FakeRunner>,
    pub state: Arc<FakeState>,
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            cluster: FakeCluster::new(journal.clone()),
            resolver: FakeResolver::new(journal.clone()),
            mutator: FakeMutator::new(journal.clone()),
            sync: FakeSync::new(journal.clone()),
            runner: FakeRunner::new(journal.clone()),
            state: Arc::new(FakeState::default()),
            reporter: Arc::new(RecordingReporter::default()),
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cluster: self.cluster.clone(),
            resolver: self.resolver.clone(),
            mutator: self.mutator.clone(),
            sync: self.sync.clone(),
            runner: self.runner.clone(),
            state: self.state.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

/// Direct-mode config with short intervals.
pub fn test_config() -> UpConfig {
    let mut config = UpConfig::default();
    config.timeouts.retry_interval_secs = 1;
    config.timeouts.resubscribe_backoff_ms = 50;
    config
}
