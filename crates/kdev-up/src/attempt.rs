//! Per-attempt state.
//!
//! Every activation attempt gets a fresh cancellation token, child of the
//! process-wide one, and fresh channels. Background tasks receive clones of
//! the senders at spawn time; the `Serve` step owns the receivers.

use kdev_core::{Result, UpError};
use kdev_remote::PodInfo;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::tunnel::Forwarder;

/// Buffer of the attempt channels. Each carries at most a handful of values.
const CHANNEL_CAPACITY: usize = 4;

pub struct Attempt {
    /// Cancels everything started by this attempt.
    pub cancel: CancellationToken,

    pub command_tx: mpsc::Sender<Result<()>>,
    pub command_rx: mpsc::Receiver<Result<()>>,
    pub disconnect_tx: mpsc::Sender<UpError>,
    pub disconnect_rx: mpsc::Receiver<UpError>,
    /// Failures of the background global-forward loop.
    pub global_tx: mpsc::Sender<UpError>,
    pub global_rx: mpsc::Receiver<UpError>,
    /// Fires when the workload must be applied again.
    pub reapply: Option<mpsc::Receiver<()>>,

    pub pod: Option<PodInfo>,
    pub forwarder: Option<Forwarder>,
    pub sync_started: bool,
    /// True once the attempt reached `Serve`.
    pub served: bool,

    completion_tx: Option<oneshot::Sender<()>>,
    completion_rx: Option<oneshot::Receiver<()>>,
}

impl Attempt {
    pub fn new(parent: &CancellationToken) -> Self {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (global_tx, global_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = oneshot::channel();
        Self {
            cancel: parent.child_token(),
            command_tx,
            command_rx,
            disconnect_tx,
            disconnect_rx,
            global_tx,
            global_rx,
            reapply: None,
            pod: None,
            forwarder: None,
            sync_started: false,
            served: false,
            completion_tx: Some(completion_tx),
            completion_rx: Some(completion_rx),
        }
    }

    /// Receiver signalled once shutdown has finished. Only the first call
    /// gets it.
    pub fn completion(&mut self) -> Option<oneshot::Receiver<()>> {
        self.completion_rx.take()
    }

    /// Claims the right to run shutdown. Only the first call gets it.
    pub(crate) fn begin_shutdown(&mut self) -> Option<oneshot::Sender<()>> {
        self.completion_tx.take()
    }

    pub fn is_shut_down(&self) -> bool {
        self.completion_tx.is_none()
    }
}
