//! Operating-system process table access.

use std::collections::HashSet;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::{debug, trace};

/// Signals the escalation logic knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Polite termination request (`SIGTERM`).
    Terminate,
    /// Forced kill (`SIGKILL`).
    Kill,
}

/// A process observed in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent: Option<u32>,
    /// Start time in seconds since the epoch; tells a reused pid apart.
    pub started_at: u64,
    /// Command line joined with single spaces.
    pub command_line: String,
}

/// Read/signal access to the process table.
///
/// Implementations cache a snapshot; `refresh` updates it.
pub trait ProcessTable: Send {
    /// Re-read the process table.
    fn refresh(&mut self);

    /// All live descendants of `root` (children, grandchildren, ...).
    fn descendants(&self, root: u32) -> Vec<ProcessEntry>;

    /// Whether `pid` is present in the last snapshot and not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver a signal. Returns `false` if the process is gone or the
    /// signal could not be sent.
    fn signal(&mut self, pid: u32, signal: ProcessSignal) -> bool;
}

/// Pid of the running program.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        let mut table = Self {
            system: System::new(),
        };
        table.refresh();
        table
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet)
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn refresh(&mut self) {
        let updated = self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            Self::refresh_kind(),
        );
        trace!(updated, "Refreshed process table");
    }

    fn descendants(&self, root: u32) -> Vec<ProcessEntry> {
        let processes = self.system.processes();
        let mut family: HashSet<Pid> = HashSet::from([Pid::from_u32(root)]);
        let mut result = Vec::new();

        // Parents may be listed after their children, so iterate until the
        // family stops growing.
        loop {
            let mut grew = false;
            for (pid, process) in processes {
                if family.contains(pid) || process.thread_kind().is_some() {
                    continue;
                }
                let Some(parent) = process.parent() else {
                    continue;
                };
                if family.contains(&parent) {
                    family.insert(*pid);
                    grew = true;
                    result.push(ProcessEntry {
                        pid: pid.as_u32(),
                        parent: Some(parent.as_u32()),
                        started_at: process.start_time(),
                        command_line: process
                            .cmd()
                            .iter()
                            .map(|arg| arg.to_string_lossy())
                            .collect::<Vec<_>>()
                            .join(" "),
                    });
                }
            }
            if !grew {
                break;
            }
        }

        result
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn signal(&mut self, pid: u32, signal: ProcessSignal) -> bool {
        let Some(process) = self.system.process(Pid::from_u32(pid)) else {
            return false;
        };
        let sent = match signal {
            ProcessSignal::Terminate => process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()),
            ProcessSignal::Kill => process.kill(),
        };
        debug!(pid, ?signal, sent, "Signalled process");
        sent
    }
}
