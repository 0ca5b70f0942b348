//! Process tree enumeration and forced kills.
//!
//! The worker may spawn processes of its own. Forced termination enumerates the
//! whole tree before signalling anything (killing the parent first would
//! reparent its children out of reach), kills every descendant, then the
//! worker itself.

use std::collections::{HashMap, HashSet};
use std::io;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Finds the processes spawned (directly or transitively) by a process.
pub trait ProcessTreeLookup: Send + Sync {
    /// All descendants of `pid`, excluding `pid` itself.
    fn descendants(&self, pid: u32) -> Vec<u32>;
}

/// Delivers a forced kill to a single process.
pub trait ProcessKiller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<(), KillError>;
}

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    /// Already exited; callers treat this as success.
    #[error("no such process: {pid}")]
    NotFound { pid: u32 },
    #[error("failed to kill process {pid}: {source}")]
    Failed {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Process table lookup backed by sysinfo.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessTree;

impl ProcessTreeLookup for SysinfoProcessTree {
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (proc_pid, process) in system.processes() {
            // Threads show up as tasks of their process; only real children count.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*proc_pid);
            }
        }

        let root = Pid::from_u32(pid);
        let mut stack = vec![root];
        let mut seen: HashSet<Pid> = HashSet::new();
        let mut found = Vec::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if current != root {
                found.push(current.as_u32());
            }
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)));
            }
        }
        found
    }
}

/// Sends SIGKILL (Unix) or terminates the process (elsewhere).
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalKiller;

#[cfg(unix)]
impl ProcessKiller for SignalKiller {
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid as NixPid;

        let raw = i32::try_from(pid).map_err(|_| KillError::Failed {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"),
        })?;
        match kill(NixPid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(KillError::NotFound { pid }),
            Err(errno) => Err(KillError::Failed {
                pid,
                source: io::Error::from(errno),
            }),
        }
    }
}

#[cfg(not(unix))]
impl ProcessKiller for SignalKiller {
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        let target = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match system.process(target) {
            None => Err(KillError::NotFound { pid }),
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(KillError::Failed {
                pid,
                source: io::Error::other("terminate request rejected"),
            }),
        }
    }
}

/// What a tree kill did to each process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillReport {
    pub killed: Vec<u32>,
    pub already_gone: Vec<u32>,
    pub failed: Vec<u32>,
}

impl KillReport {
    /// Number of processes a kill was attempted on.
    pub fn attempted(&self) -> usize {
        self.killed.len() + self.already_gone.len() + self.failed.len()
    }
}

/// Kill `pid` and all of its descendants, the parent last.
///
/// Each process is signalled at most once. Processes that are already gone
/// count as success; other failures are logged and reported, never retried.
pub fn kill_process_tree(
    pid: u32,
    tree: &dyn ProcessTreeLookup,
    killer: &dyn ProcessKiller,
) -> KillReport {
    let mut seen = HashSet::from([pid]);
    let descendants: Vec<u32> = tree
        .descendants(pid)
        .into_iter()
        .filter(|child| seen.insert(*child))
        .collect();
    tracing::debug!(pid, ?descendants, "Killing process tree");

    let mut report = KillReport::default();
    for target in descendants.into_iter().chain(std::iter::once(pid)) {
        match killer.kill(target) {
            Ok(()) => report.killed.push(target),
            Err(KillError::NotFound { .. }) => {
                tracing::trace!(pid = target, "Process already gone");
                report.already_gone.push(target);
            }
            Err(e) => {
                tracing::error!(pid = target, error = %e, "Failed to kill process");
                report.failed.push(target);
            }
        }
    }
    report
}
