//! Single-instance coordination through a pid marker file.
//!
//! Each (namespace, workload) pair has one marker holding the pid of the
//! process that owns the dev session. A new `up` simply overwrites it; the
//! previous owner notices through [`watch_for_takeover`] and ends its session.
//!
//! ```text
//!   process A                marker              process B
//!   ─────────                ──────              ─────────
//!   claim ──────────────────► "5"
//!   watch ◄─ fs events ─┐
//!                       └──── "10" ◄──────────── claim
//!   re-read: 10 != 5
//!   emit Deactivated
//!   release: 10 != 5, keep ──► "10"
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Watcher errors stop the watch instead of propagating
//! - Channel closure is handled gracefully

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use kdev_core::{Result, UpError};
use notify::event::{MetadataKind, ModifyKind};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paths;

/// A claimed marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidMarker {
    path: PathBuf,
    pid: u32,
}

impl PidMarker {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid written by this instance.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Claims the marker of a workload for the current process.
pub fn claim(home: &Path, namespace: &str, name: &str) -> Result<PidMarker> {
    claim_as(paths::marker_path(home, namespace, name), process::id())
}

/// Writes `pid` to the marker at `path`, creating parent directories.
///
/// Last writer wins.
pub fn claim_as(path: PathBuf, pid: u32) -> Result<PidMarker> {
    write_pid(&path, pid)?;
    info!(path = %path.display(), pid, "Claimed pid marker");
    Ok(PidMarker { path, pid })
}

/// Reads the pid currently stored in a marker.
pub fn current_owner_pid(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<u32>()
        .map_err(|_| UpError::CorruptMarker {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        })
}

/// Deletes the marker if it still belongs to this instance.
pub fn release(marker: &PidMarker) {
    match current_owner_pid(&marker.path) {
        Ok(owner) if owner != marker.pid => {
            info!(
                path = %marker.path.display(),
                owner,
                pid = marker.pid,
                "Pid marker owned by another instance, leaving it in place"
            );
            return;
        }
        Ok(_) => {}
        Err(UpError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %marker.path.display(), "Pid marker already gone");
            return;
        }
        Err(e) => {
            warn!(path = %marker.path.display(), error = %e, "Failed to read pid marker");
            return;
        }
    }

    match fs::remove_file(&marker.path) {
        Ok(()) => debug!(path = %marker.path.display(), "Released pid marker"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %marker.path.display(), error = %e, "Failed to remove pid marker"),
    }
}

/// Watches the marker and reports when another instance takes it over.
///
/// The returned channel yields `UpError::Deactivated` at most once. It
/// closes without a value when watching stops for any other reason or
/// `cancel` fires.
pub fn watch_for_takeover(
    marker: &PidMarker,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<UpError>> {
    let dir = marker
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = event_tx.send(res);
    })
    .map_err(|e| UpError::Other(format!("failed to watch pid marker: {e}")))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| UpError::Other(format!("failed to watch pid marker: {e}")))?;

    let (takeover_tx, takeover_rx) = mpsc::channel(1);
    let marker = marker.clone();

    tokio::spawn(async move {
        // Dropping the watcher ends the event stream.
        let _watcher = watcher;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Pid marker watch cancelled");
                    break;
                }

                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match handle_event(&marker, event) {
                        WatchStep::Continue => {}
                        WatchStep::Stop => break,
                        WatchStep::Takeover => {
                            let _ = takeover_tx.send(UpError::Deactivated).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(takeover_rx)
}

enum WatchStep {
    Continue,
    Stop,
    Takeover,
}

fn handle_event(marker: &PidMarker, event: notify::Result<Event>) -> WatchStep {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Pid marker watcher failed, no longer watching");
            return WatchStep::Stop;
        }
    };

    if !event.paths.iter().any(|p| p == &marker.path) {
        return WatchStep::Continue;
    }

    match event.kind {
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)) => {
            info!(path = %marker.path.display(), "Pid marker permissions changed");
            WatchStep::Continue
        }
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => WatchStep::Continue,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            if !marker.path.exists() =>
        {
            self_heal(marker)
        }
        EventKind::Remove(_) | EventKind::Create(_) | EventKind::Modify(_) => check_owner(marker),
        _ => WatchStep::Continue,
    }
}

/// Rewrites a marker that disappeared.
fn self_heal(marker: &PidMarker) -> WatchStep {
    match write_pid(&marker.path, marker.pid) {
        Ok(()) => {
            info!(path = %marker.path.display(), "Pid marker removed, recreated it");
            WatchStep::Continue
        }
        Err(e) => {
            warn!(path = %marker.path.display(), error = %e, "Failed to recreate pid marker, no longer watching");
            WatchStep::Stop
        }
    }
}

fn check_owner(marker: &PidMarker) -> WatchStep {
    match current_owner_pid(&marker.path) {
        Ok(owner) if owner == marker.pid => WatchStep::Continue,
        Ok(owner) => {
            info!(owner, pid = marker.pid, "Development container taken over by another instance");
            WatchStep::Takeover
        }
        // Mid-write or already removed; a later event settles it.
        Err(e) => {
            debug!(error = %e, "Pid marker not readable yet");
            WatchStep::Continue
        }
    }
}

fn write_pid(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_creates_parents() {
        let home = TempDir::new().unwrap();
        let marker = claim(home.path(), "dev", "api").unwrap();
        assert!(marker.path().ends_with("dev/api/kdev.pid"));
        assert_eq!(current_owner_pid(marker.path()).unwrap(), process::id());
    }

    #[test]
    fn test_corrupt_marker() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("kdev.pid");
        fs::write(&path, "not-a-pid\n").unwrap();
        match current_owner_pid(&path) {
            Err(UpError::CorruptMarker { content, .. }) => assert_eq!(content, "not-a-pid"),
            other => panic!("expected corrupt marker, got {other:?}"),
        }
    }

    #[test]
    fn test_release_only_by_owner() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("kdev.pid");

        let first = claim_as(path.clone(), 5).unwrap();
        let second = claim_as(path.clone(), 10).unwrap();

        release(&first);
        assert_eq!(current_owner_pid(&path).unwrap(), 10);

        release(&second);
        assert!(!path.exists());

        // Already gone is fine.
        release(&second);
    }

    #[test]
    fn test_release_keeps_corrupt_marker() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("kdev.pid");
        let marker = claim_as(path.clone(), 5).unwrap();
        fs::write(&path, "garbage").unwrap();
        release(&marker);
        assert!(path.exists());
    }
}
