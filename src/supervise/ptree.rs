// src/supervise/ptree.rs

//! Process tree inspection and termination.
//!
//! The controller never talks to the OS process table directly; it goes
//! through the [`ProcessTree`] capability so per-platform details (and test
//! doubles) stay at this boundary. Enumeration is built on `sysinfo`,
//! termination on `kill(2)` on Unix and `taskkill /t /f` on Windows.
//!
//! Every snapshot is computed freshly on demand. A target that has already
//! exited yields an empty (or partial) list, never an error.

use std::collections::HashMap;
use std::path::Path;

use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, warn};

/// Capability interface for walking and terminating process trees.
pub trait ProcessTree: Send + Sync {
    /// Direct and transitive children of `pid`, captured at this instant.
    fn children_of(&self, pid: u32) -> Vec<u32>;

    /// Recover descendants whose parent is already gone by scanning for
    /// processes whose working directory sits under the execution sandbox.
    /// A dead parent cannot be asked for its children through
    /// [`ProcessTree::children_of`].
    fn dig_for_orphans(&self, working_dir: &Path) -> Vec<u32>;

    /// Deliver `signal` to `pid`. "No such process" is nothing to do.
    fn send_signal(&self, pid: u32, signal: i32);

    /// Forcibly kill `pid`. "No such process" is nothing to do.
    fn kill(&self, pid: u32);
}

/// The real, OS-backed implementation.
#[derive(Debug, Default)]
pub struct SystemProcessTree;

impl SystemProcessTree {
    pub fn new() -> Self {
        SystemProcessTree
    }
}

impl ProcessTree for SystemProcessTree {
    fn children_of(&self, pid: u32) -> Vec<u32> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new());

        let mut by_parent: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child, proc_) in sys.processes() {
            if let Some(parent) = proc_.parent() {
                by_parent
                    .entry(parent.as_u32())
                    .or_default()
                    .push(child.as_u32());
            }
        }

        let mut found = Vec::new();
        let mut stack = vec![pid];
        while let Some(next) = stack.pop() {
            if let Some(kids) = by_parent.get(&next) {
                for &kid in kids {
                    found.push(kid);
                    stack.push(kid);
                }
            }
        }
        found
    }

    fn dig_for_orphans(&self, working_dir: &Path) -> Vec<u32> {
        let own = std::process::id();
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cwd(UpdateKind::Always),
        );

        let orphans: Vec<u32> = sys
            .processes()
            .iter()
            .filter_map(|(pid, proc_)| {
                let pid = pid.as_u32();
                if pid == own {
                    return None;
                }
                match proc_.cwd() {
                    Some(cwd) if cwd.starts_with(working_dir) => Some(pid),
                    _ => None,
                }
            })
            .collect();

        if !orphans.is_empty() {
            debug!(?working_dir, count = orphans.len(), "dug up orphaned processes");
        }
        orphans
    }

    fn send_signal(&self, pid: u32, signal: i32) {
        deliver(pid, signal);
    }

    fn kill(&self, pid: u32) {
        force_kill(pid);
    }
}

#[cfg(unix)]
fn deliver(pid: u32, signal: i32) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal, error = %err, "failed to signal process");
        }
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    deliver(pid, libc::SIGKILL);
}

#[cfg(windows)]
fn deliver(pid: u32, _signal: i32) {
    // No signal numbers on Windows; the closest graceful-ish option is the
    // same tree kill taskkill provides.
    force_kill(pid);
}

#[cfg(windows)]
fn force_kill(pid: u32) {
    match std::process::Command::new("taskkill")
        .args(["/t", "/f", "/pid", &pid.to_string()])
        .output()
    {
        Ok(output) if !output.status.success() => {
            warn!(pid, code = ?output.status.code(), "taskkill failed");
        }
        Ok(_) => {}
        Err(err) => warn!(pid, error = %err, "failed to run taskkill"),
    }
}

/// Kill every pid in `pids` (deduplicated, own pid excluded), logging each.
pub fn kill_children(tree: &dyn ProcessTree, identifier: &str, pids: &[u32]) {
    let own = std::process::id();
    let mut seen: Vec<u32> = Vec::with_capacity(pids.len());
    for &pid in pids {
        if pid == own || seen.contains(&pid) {
            continue;
        }
        seen.push(pid);
        debug!(identifier = %identifier, pid, "killing child process");
        tree.kill(pid);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use super::*;

    #[test]
    fn children_of_sees_direct_child() {
        let mut child = Command::new("sleep")
            .arg("5")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        // The process table needs a moment on some platforms.
        let tree = SystemProcessTree::new();
        let mut found = false;
        for _ in 0..10 {
            if tree.children_of(std::process::id()).contains(&pid) {
                found = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        child.kill().ok();
        child.wait().ok();
        assert!(found, "direct child not found in process tree");
    }

    #[test]
    fn dig_for_orphans_finds_processes_by_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        // /tmp may be a symlink (macOS); sysinfo reports the resolved cwd.
        let sandbox = dir.path().canonicalize().expect("canonicalize");

        let mut child = Command::new("sleep")
            .arg("5")
            .current_dir(&sandbox)
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        let tree = SystemProcessTree::new();
        let mut found = false;
        for _ in 0..10 {
            if tree.dig_for_orphans(&sandbox).contains(&pid) {
                found = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        child.kill().ok();
        child.wait().ok();
        assert!(found, "process with sandbox cwd not dug up");
    }

    #[test]
    fn children_of_gone_process_is_empty() {
        let tree = SystemProcessTree::new();
        // Pid max on Linux defaults to well below this.
        assert!(tree.children_of(u32::MAX - 7).is_empty());
    }

    #[test]
    fn kill_tolerates_missing_process() {
        let tree = SystemProcessTree::new();
        tree.kill(u32::MAX - 7);
        tree.send_signal(u32::MAX - 7, libc::SIGTERM);
    }
}
