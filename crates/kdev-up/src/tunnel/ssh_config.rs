//! `Host <name>.kdev` entries in the user's SSH config.
//!
//! The entry lets `ssh <name>.kdev` and editors reach the dev pod through the
//! tunnel. Entries are fenced by marker comments so they can be replaced or
//! removed without touching the rest of the file.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use kdev_core::Result;
use tracing::debug;

const BEGIN_MARKER: &str = "# kdev begin";
const END_MARKER: &str = "# kdev end";

/// One SSH config host block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHostEntry {
    pub host: String,
    pub interface: IpAddr,
    pub port: u16,
    pub user: String,
    pub identity_file: String,
}

impl SshHostEntry {
    /// SSH host alias of a workload.
    pub fn host_for(name: &str) -> String {
        format!("{name}.kdev")
    }

    pub fn render(&self) -> String {
        format!(
            "{BEGIN_MARKER} {host}\n\
             Host {host}\n  \
             HostName {interface}\n  \
             Port {port}\n  \
             StrictHostKeyChecking no\n  \
             UserKnownHostsFile /dev/null\n  \
             IdentityFile {identity}\n  \
             User {user}\n\
             {END_MARKER} {host}\n",
            host = self.host,
            interface = self.interface,
            port = self.port,
            identity = self.identity_file,
            user = self.user,
        )
    }
}

/// Adds `entry` to the config at `path`, replacing an older entry for the
/// same host.
pub fn add_entry(path: &Path, entry: &SshHostEntry) -> Result<()> {
    let current = read_or_empty(path)?;
    let mut updated = strip_entry(&current, &entry.host);
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry.render());
    write_atomic(path, &updated)?;
    debug!(host = %entry.host, path = %path.display(), "SSH config entry written");
    Ok(())
}

/// Removes the entry for `host`. Returns whether one was present.
pub fn remove_entry(path: &Path, host: &str) -> Result<bool> {
    let current = read_or_empty(path)?;
    let updated = strip_entry(&current, host);
    if updated == current {
        return Ok(false);
    }
    write_atomic(path, &updated)?;
    debug!(host = %host, path = %path.display(), "SSH config entry removed");
    Ok(true)
}

/// Returns the fenced block for `host`, markers included.
pub fn find_entry(path: &Path, host: &str) -> Result<Option<String>> {
    let current = read_or_empty(path)?;
    let begin = format!("{BEGIN_MARKER} {host}");
    let end = format!("{END_MARKER} {host}");

    let mut block = String::new();
    let mut inside = false;
    for line in current.lines() {
        let trimmed = line.trim();
        if !inside && trimmed == begin {
            inside = true;
        }
        if inside {
            block.push_str(line);
            block.push('\n');
            if trimmed == end {
                return Ok(Some(block));
            }
        }
    }
    Ok(None)
}

fn strip_entry(config: &str, host: &str) -> String {
    let begin = format!("{BEGIN_MARKER} {host}");
    let end = format!("{END_MARKER} {host}");

    let mut out = String::with_capacity(config.len());
    let mut inside = false;
    for line in config.lines() {
        let trimmed = line.trim();
        if !inside && trimmed == begin {
            inside = true;
            continue;
        }
        if inside {
            if trimmed == end {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !config.ends_with('\n') && out.ends_with('\n') && !config.is_empty() && !inside {
        out.pop();
    }
    out
}

fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("kdev.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
