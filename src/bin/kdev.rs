//! kdev - Operator commands for local dev sessions
//!
//! Inspects and cleans up the files an `up` session leaves under the kdev
//! home (`KDEV_HOME`, default `~/.kdev`).
//!
//! # Usage
//!
//! ```bash
//! # Show the phase and owner of a session
//! kdev status --namespace dev --name api
//!
//! # Remove the marker and state of a session whose owner has exited
//! kdev clean --namespace dev --name api
//!
//! # Print (or remove) the SSH config entry of a tunneled session
//! kdev ssh-config --name api
//! kdev ssh-config --name api --remove
//!
//! # Enable debug logging (written to <home>/kdev.log)
//! RUST_LOG=kdev_up=debug kdev status --namespace dev --name api
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::process;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kdev_core::UpError;
use kdev_up::tunnel::ssh_config::{self, SshHostEntry};
use kdev_up::{paths, pid, state_file};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Arguments
// ============================================================================

/// kdev - synchronized development containers
#[derive(Parser, Debug)]
#[command(name = "kdev", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the state of a dev session
    Status {
        #[arg(short, long)]
        namespace: String,
        #[arg(long)]
        name: String,
    },
    /// Remove the files of a session whose owner has exited
    Clean {
        #[arg(short, long)]
        namespace: String,
        #[arg(long)]
        name: String,
    },
    /// Print the SSH config entry of a tunneled session
    SshConfig {
        #[arg(long)]
        name: String,
        /// Remove the entry instead of printing it
        #[arg(long)]
        remove: bool,
    },
}

// ============================================================================
// Logging
// ============================================================================

/// Logs to `<home>/kdev.log`, falling back to stderr.
fn init_logging(home: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kdev=info,kdev_up=info"));

    let log_path = paths::log_file(home);
    let file = fs::create_dir_all(home)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&log_path));

    match file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!("Warning: Failed to open log file {}: {e}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
}

// ============================================================================
// Process Helpers
// ============================================================================

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks existence and permissions.
        let result = unsafe { libc::kill(pid, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Owner of a session marker, `None` when there is no marker.
fn marker_owner(home: &Path, namespace: &str, name: &str) -> Result<Option<u32>> {
    let path = paths::marker_path(home, namespace, name);
    match pid::current_owner_pid(&path) {
        Ok(owner) => Ok(Some(owner)),
        Err(UpError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn status(home: &Path, namespace: &str, name: &str) -> Result<()> {
    println!("Workload: {namespace}/{name}");

    match state_file::read_state(home, namespace, name)? {
        Some(record) => println!(
            "Phase:    {} (updated {})",
            record.phase,
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Phase:    unknown"),
    }

    match marker_owner(home, namespace, name) {
        Ok(Some(owner)) if is_process_running(owner) => println!("Owner:    PID {owner} (running)"),
        Ok(Some(owner)) => println!("Owner:    PID {owner} (exited, run 'kdev clean')"),
        Ok(None) => println!("Owner:    none"),
        Err(e) => println!("Owner:    unreadable ({e:#})"),
    }
    Ok(())
}

fn clean(home: &Path, namespace: &str, name: &str) -> Result<()> {
    let owner = match marker_owner(home, namespace, name) {
        Ok(owner) => owner,
        Err(e) => {
            // A corrupt marker has no live owner to protect.
            debug!(error = %e, "Removing unreadable marker");
            None
        }
    };
    if let Some(owner) = owner {
        if is_process_running(owner) {
            bail!("Session {namespace}/{name} is still running (PID {owner})");
        }
    }

    let mut removed = 0;
    for path in [
        paths::marker_path(home, namespace, name),
        paths::state_path(home, namespace, name),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed session file");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    if removed == 0 {
        println!("Nothing to clean for {namespace}/{name}.");
    } else {
        println!("Cleaned session {namespace}/{name}.");
    }
    Ok(())
}

fn ssh_config(name: &str, remove: bool) -> Result<()> {
    let path = paths::ssh_config_file();
    let host = SshHostEntry::host_for(name);

    if remove {
        if ssh_config::remove_entry(&path, &host)? {
            println!("Removed {host} from {}", path.display());
        } else {
            println!("No entry for {host} in {}", path.display());
        }
        return Ok(());
    }

    match ssh_config::find_entry(&path, &host)? {
        Some(block) => {
            print!("{block}");
            Ok(())
        }
        None => {
            eprintln!("No entry for {host} in {}", path.display());
            process::exit(1);
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    let home = paths::kdev_home();
    init_logging(&home);
    debug!(home = %home.display(), command = ?args.command, "kdev started");

    match args.command {
        Command::Status { namespace, name } => status(&home, &namespace, &name),
        Command::Clean { namespace, name } => clean(&home, &namespace, &name),
        Command::SshConfig { name, remove } => ssh_config(&name, remove),
    }
}
