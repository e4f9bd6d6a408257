//! Subprocess monitor.
//!
//! Fetchers run external tools, which may spawn further processes. The
//! monitor periodically walks the descendants of this program, attributes
//! them to slots by the output file name each slot reports, and reaps the
//! ones that outlive the subprocess timeout or stop making progress. It never touches channel state; it only
//! emits slot transitions on the bus.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use process_utils::{ProcessEntry, ProcessTable, Termination, terminate_with_grace};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Consumer, Control, Destination, FileInfo, FinishOrigin, Notice, Payload};
use crate::config::Settings;
use crate::utils::fs::file_size;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Root of the process tree to watch.
    pub root_pid: u32,
    /// Lifetime of a captured process, counted from capture.
    pub hang_timeout: Duration,
    /// Time without output growth after which a captured process is reaped.
    pub stall_timeout: Option<Duration>,
    /// Wait between terminate and kill.
    pub kill_grace: Duration,
    /// Interval between scans.
    pub scan_interval: Duration,
}

impl MonitorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            root_pid: process_utils::current_pid(),
            hang_timeout: settings.subprocess_timeout,
            stall_timeout: settings.stall_timeout,
            kill_grace: settings.kill_grace,
            scan_interval: settings.poll_interval * settings.monitor_scan_ticks,
        }
    }
}

/// A descendant process under observation.
#[derive(Debug, Clone)]
pub struct CapturedProcess {
    pub pid: u32,
    pub started_at: u64,
    /// Owning slot, once attributed.
    pub slot: Option<usize>,
    /// Fetch cycle of the owning slot at attribution time.
    pub cycle: Option<u64>,
    /// Correlation token: the process command line.
    pub command_line: String,
    /// Discovery time, then attribution time.
    pub captured_at: Instant,
    pub last_growth: Instant,
    pub size: Option<u64>,
}

pub struct SubprocessMonitor {
    bus: Arc<Bus>,
    table: Box<dyn ProcessTable>,
    config: MonitorConfig,
    tracked: HashMap<u32, CapturedProcess>,
    /// Processes already handled, by pid and start time. Dropped once the
    /// process leaves the table.
    tombstones: HashSet<(u32, u64)>,
    /// Latest output file reported per slot.
    files: HashMap<usize, FileInfo>,
}

impl SubprocessMonitor {
    pub fn new(bus: Arc<Bus>, table: Box<dyn ProcessTable>, config: MonitorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            tracked: HashMap::new(),
            tombstones: HashSet::new(),
            files: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> impl Iterator<Item = &CapturedProcess> {
        self.tracked.values()
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.tracked.contains_key(&pid)
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let poll = self.bus.poll_interval();
        let mut scan = tokio::time::interval(self.config.scan_interval.max(poll));
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            root_pid = self.config.root_pid,
            hang_timeout_secs = self.config.hang_timeout.as_secs(),
            "Subprocess monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = scan.tick() => self.scan().await,
                payload = self.bus.consume(Consumer::Monitor, poll) => {
                    if let Some(payload) = payload {
                        self.handle_payload(payload).await;
                    }
                }
            }
        }
        info!("Subprocess monitor stopped");
    }

    /// React to one slot-control message.
    pub async fn handle_payload(&mut self, payload: Payload) {
        match payload {
            Payload::FileInfo(info) => {
                debug!(slot = info.slot, file = %info.path.display(), "Slot output file");
                self.files.insert(info.slot, info);
            }
            Payload::Control(Control::KillSlot(slot)) => self.kill_slot(slot).await,
            Payload::Control(Control::FetchEnded(slot)) => self.forget_slot(slot),
            other => debug!(kind = other.kind(), "Ignoring message"),
        }
    }

    /// Discovery, attribution and liveness passes.
    pub async fn scan(&mut self) {
        self.table.refresh();
        let entries = self.table.descendants(self.config.root_pid);
        let started: HashMap<u32, u64> = entries.iter().map(|e| (e.pid, e.started_at)).collect();
        self.discover(entries);
        self.attribute();
        self.check_liveness(&started).await;
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn discover(&mut self, entries: Vec<ProcessEntry>) {
        let live: HashSet<(u32, u64)> = entries.iter().map(|e| (e.pid, e.started_at)).collect();
        self.tombstones.retain(|key| live.contains(key));

        let now = Instant::now();
        for entry in entries {
            // A tracked pid with a new start time is handled as an exit first.
            if self.tombstones.contains(&(entry.pid, entry.started_at))
                || self.tracked.contains_key(&entry.pid)
            {
                continue;
            }
            debug!(pid = entry.pid, command = %entry.command_line, "Discovered child process");
            self.tracked.insert(
                entry.pid,
                CapturedProcess {
                    pid: entry.pid,
                    started_at: entry.started_at,
                    slot: None,
                    cycle: None,
                    command_line: entry.command_line,
                    captured_at: now,
                    last_growth: now,
                    size: None,
                },
            );
        }
    }

    fn attribute(&mut self) {
        let mut captured = Vec::new();
        for process in self.tracked.values_mut().filter(|p| p.slot.is_none()) {
            let owner = self.files.values().find(|info| {
                correlation_token(&info.path)
                    .is_some_and(|token| process.command_line.contains(&token))
            });
            if let Some(info) = owner {
                process.slot = Some(info.slot);
                process.cycle = Some(info.cycle);
                process.captured_at = Instant::now();
                process.last_growth = process.captured_at;
                captured.push((info.slot, process.pid));
            }
        }

        for (slot, pid) in captured {
            info!(slot, pid, "Captured process");
            self.bus.publish(Destination::Slot(slot), Payload::Recording);
            self.notice(format!("Captured Process PID {pid} (Slot {})", slot + 1));
        }
    }

    async fn check_liveness(&mut self, started: &HashMap<u32, u64>) {
        let now = Instant::now();
        let mut gone = Vec::new();
        let mut hung = Vec::new();
        let mut unattributed_gone = Vec::new();

        let pids: Vec<u32> = self.tracked.keys().copied().collect();
        for pid in pids {
            let Some(process) = self.tracked.get(&pid) else {
                continue;
            };
            let alive = self.table.is_alive(pid)
                && started
                    .get(&pid)
                    .is_none_or(|started_at| *started_at == process.started_at);
            let Some(slot) = process.slot else {
                if !alive {
                    unattributed_gone.push(pid);
                }
                continue;
            };
            if !alive {
                gone.push(pid);
                continue;
            }

            let size = match self.files.get(&slot) {
                Some(info) => observed_size(&info.path).await,
                None => None,
            };
            let Some(process) = self.tracked.get_mut(&pid) else {
                continue;
            };
            if size.is_some_and(|size| Some(size) > process.size) {
                process.size = size;
                process.last_growth = now;
                if let Some(info) = self.files.get(&slot) {
                    self.bus.publish(
                        Destination::Display,
                        Payload::FileInfo(FileInfo {
                            size,
                            ..info.clone()
                        }),
                    );
                }
            }

            let age = now.duration_since(process.captured_at);
            let idle = now.duration_since(process.last_growth);
            if age > self.config.hang_timeout {
                warn!(slot, pid, age_secs = age.as_secs(), "Process exceeded its lifetime");
                hung.push(pid);
            } else if self.config.stall_timeout.is_some_and(|limit| idle > limit) {
                warn!(slot, pid, idle_secs = idle.as_secs(), "Process stopped responding");
                hung.push(pid);
            }
        }

        for pid in unattributed_gone {
            self.untrack(pid);
        }

        let mut released = BTreeSet::new();
        for pid in gone {
            if let Some(process) = self.untrack(pid) {
                debug!(pid, slot = ?process.slot, "Process exited");
                released.extend(process.slot.zip(process.cycle));
            }
        }
        for pid in hung {
            if let Some(owner) = self.reap(pid).await {
                released.insert(owner);
            }
        }
        for (slot, cycle) in released {
            if !self.tracked.values().any(|p| p.slot == Some(slot)) {
                self.release_slot(slot, cycle);
            }
        }
    }

    /// Terminate, wait, kill. Returns the owner of the process.
    async fn reap(&mut self, pid: u32) -> Option<(usize, u64)> {
        let outcome = terminate_with_grace(self.table.as_mut(), pid, self.config.kill_grace).await;
        if outcome == Termination::Survived {
            warn!(pid, "Process survived kill; no longer tracked");
        }
        let process = self.untrack(pid)?;
        info!(pid, slot = ?process.slot, ?outcome, "Process reaped");
        process.slot.zip(process.cycle)
    }

    fn untrack(&mut self, pid: u32) -> Option<CapturedProcess> {
        let process = self.tracked.remove(&pid)?;
        self.tombstones.insert((pid, process.started_at));
        Some(process)
    }

    async fn kill_slot(&mut self, slot: usize) {
        let pids: Vec<u32> = self
            .tracked
            .values()
            .filter(|p| p.slot == Some(slot))
            .map(|p| p.pid)
            .collect();
        if pids.is_empty() {
            self.notice(format!("No process captured (Slot {})", slot + 1));
            return;
        }

        info!(slot, count = pids.len(), "Killing slot processes");
        let mut owner = None;
        for pid in pids {
            owner = self.reap(pid).await.or(owner);
        }
        if let Some((slot, cycle)) = owner {
            self.release_slot(slot, cycle);
        }
    }

    fn forget_slot(&mut self, slot: usize) {
        self.files.remove(&slot);
        let pids: Vec<u32> = self
            .tracked
            .values()
            .filter(|p| p.slot == Some(slot))
            .map(|p| p.pid)
            .collect();
        for pid in pids {
            self.untrack(pid);
        }
    }

    fn release_slot(&self, slot: usize, cycle: u64) {
        self.bus.publish(Destination::Slot(slot), Payload::Unresponsive);
        self.bus.publish(
            Destination::Slot(slot),
            Payload::Finished(FinishOrigin::Monitor { cycle }),
        );
        self.notice(format!("Released process (Slot {})", slot + 1));
    }

    fn notice(&self, text: String) {
        self.bus
            .publish(Destination::Display, Payload::Notice(Notice::notice(text)));
    }
}

/// The file name component that identifies a slot's processes.
fn correlation_token(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Size of the output file or its `.part` sibling, whichever is larger.
async fn observed_size(path: &Path) -> Option<u64> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    match (file_size(path).await, file_size(&part).await) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
