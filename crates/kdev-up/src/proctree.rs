//! Termination of a local process tree.
//!
//! The user's command may run through a local process (an `ssh` client in
//! tunneled mode) that spawns children of its own. Shutdown signals the
//! whole tree, deepest processes first, then the root.
//!
//! Two passes: [`ProcessTree::snapshot`] builds a parent → children index from
//! the OS process table in one read, then [`terminate_tree`] walks it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use sysinfo::System;
use tracing::{debug, warn};

/// Parent → children index of the process table.
#[derive(Debug, Default, Clone)]
pub struct ProcessTree {
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTree {
    /// Reads the current OS process table.
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_all();
        Self::from_edges(
            system
                .processes()
                .iter()
                .filter_map(|(pid, process)| {
                    process.parent().map(|parent| (pid.as_u32(), parent.as_u32()))
                }),
        )
    }

    /// Builds the index from `(child, parent)` pairs.
    pub fn from_edges(edges: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child, parent) in edges {
            if child != parent {
                children.entry(parent).or_default().push(child);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }
        Self { children }
    }

    /// All descendants of `root`, deepest first. `root` itself is excluded.
    pub fn descendants_deepest_first(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut found = Vec::new();
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((pid, depth)) = queue.pop_front() {
            for &child in self.children.get(&pid).into_iter().flatten() {
                if seen.insert(child) {
                    found.push((child, depth + 1));
                    queue.push_back((child, depth + 1));
                }
            }
        }

        found.sort_by_key(|&(_, depth)| Reverse(depth));
        found.into_iter().map(|(pid, _)| pid).collect()
    }
}

/// Signals every descendant of `root`, deepest first, then `root`.
///
/// Processes that already exited count as terminated. Other failures are
/// logged and the walk continues; the first one is returned.
pub fn terminate_tree(root: u32) -> io::Result<()> {
    let tree = ProcessTree::snapshot();
    let mut order = tree.descendants_deepest_first(root);
    order.push(root);
    debug!(root, processes = order.len(), "Terminating local process tree");

    let mut first_error = None;
    for pid in order {
        if let Err(e) = terminate(pid) {
            warn!(pid, error = %e, "Failed to terminate process");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "Process already exited");
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> io::Result<()> {
    let mut system = System::new();
    system.refresh_all();
    match system.process(sysinfo::Pid::from_u32(pid)) {
        Some(process) => {
            if process.kill() {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "kill failed"))
            }
        }
        None => Ok(()),
    }
}
