//! Session state file.
//!
//! Other tools poll `<home>/<namespace>/<name>/state.json` to follow a
//! session. The file is replaced atomically so readers never see a partial
//! record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kdev_core::{Result, SessionPhase, UpError, WorkloadRef};
use kdev_remote::StateStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths;

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub phase: SessionPhase,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

/// [`StateStore`] backed by JSON files under the kdev home.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    home: PathBuf,
}

impl FileStateStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn path_for(&self, workload: &WorkloadRef) -> PathBuf {
        paths::state_path(&self.home, &workload.namespace, &workload.name)
    }

    /// Writes a record for `workload`.
    pub fn write(&self, workload: &WorkloadRef, phase: SessionPhase) -> Result<()> {
        let record = StateRecord {
            phase,
            pid: process::id(),
            updated_at: Utc::now(),
        };
        write_atomic(&self.path_for(workload), &record)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn update(&self, workload: &WorkloadRef, phase: SessionPhase) -> Result<()> {
        let store = self.clone();
        let workload = workload.clone();
        tokio::task::spawn_blocking(move || store.write(&workload, phase))
            .await
            .map_err(|e| UpError::Other(format!("state file task failed: {e}")))??;
        debug!(phase = %phase, "Session state updated");
        Ok(())
    }
}

/// Reads the state record of a workload, `None` if there is none.
pub fn read_state(home: &Path, namespace: &str, name: &str) -> Result<Option<StateRecord>> {
    let path = paths::state_path(home, namespace, name);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| UpError::Other(format!("invalid state file {}: {e}", path.display())))
}

fn write_atomic(path: &Path, record: &StateRecord) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| UpError::Other(format!("invalid state path {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| UpError::Other(format!("failed to encode state: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
