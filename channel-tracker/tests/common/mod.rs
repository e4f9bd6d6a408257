#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use process_utils::{ProcessEntry, ProcessSignal, ProcessTable};
use tokio_util::sync::CancellationToken;

use channel_tracker::bus::{Bus, StatusMessage};
use channel_tracker::domain::Channel;
use channel_tracker::fetcher::{FetchContext, FetchError, Fetcher};
use channel_tracker::gate::PostprocessGate;
use channel_tracker::health::{Connectivity, DriveHealth, DriveId, FetcherVersion, Health};
use channel_tracker::slot::SlotShared;

/// Health that always reports a healthy host.
pub struct QuietHealth;

#[async_trait]
impl Health for QuietHealth {
    async fn disk_health(&mut self) -> BTreeMap<DriveId, DriveHealth> {
        BTreeMap::new()
    }

    async fn connectivity(&mut self) -> Connectivity {
        Connectivity {
            local_address: Some("10.0.0.2".into()),
            link_up: true,
            error: None,
        }
    }

    async fn fetcher_version(&mut self) -> FetcherVersion {
        FetcherVersion::default()
    }
}

#[derive(Default)]
struct TableState {
    processes: HashMap<u32, (String, bool, u64)>,
    signals: Vec<(u32, ProcessSignal)>,
    clock: u64,
}

/// In-memory process table. Processes flagged `stubborn` ignore terminate.
#[derive(Clone, Default)]
pub struct FakeTable(Arc<Mutex<TableState>>);

impl FakeTable {
    pub fn spawn(&self, pid: u32, command_line: &str, stubborn: bool) {
        let mut state = self.0.lock();
        state.clock += 1;
        let started_at = state.clock;
        state
            .processes
            .insert(pid, (command_line.to_string(), stubborn, started_at));
    }

    pub fn alive(&self, pid: u32) -> bool {
        self.0.lock().processes.contains_key(&pid)
    }

    pub fn signals(&self) -> Vec<(u32, ProcessSignal)> {
        self.0.lock().signals.clone()
    }
}

impl ProcessTable for FakeTable {
    fn refresh(&mut self) {}

    fn descendants(&self, _root: u32) -> Vec<ProcessEntry> {
        self.0
            .lock()
            .processes
            .iter()
            .map(|(pid, (command_line, _, started_at))| ProcessEntry {
                pid: *pid,
                parent: Some(1),
                started_at: *started_at,
                command_line: command_line.clone(),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive(pid)
    }

    fn signal(&mut self, pid: u32, signal: ProcessSignal) -> bool {
        let mut state = self.0.lock();
        state.signals.push((pid, signal));
        let dies = match state.processes.get(&pid) {
            Some((_, stubborn, _)) => signal == ProcessSignal::Kill || !*stubborn,
            None => return false,
        };
        if dies {
            state.processes.remove(&pid);
        }
        true
    }
}

/// Channels currently inside a fetcher, across every slot.
#[derive(Clone, Default)]
pub struct ActiveSet {
    names: Arc<Mutex<HashSet<String>>>,
    violations: Arc<AtomicUsize>,
    cycles: Arc<AtomicUsize>,
}

impl ActiveSet {
    fn enter(&self, name: &str) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        if !self.names.lock().insert(name.to_string()) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, name: &str) {
        self.names.lock().remove(name);
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }
}

/// What a scripted fetcher does.
#[derive(Clone)]
pub enum Script {
    /// Fetch until cancelled.
    Park,
    /// Download "for" `elapsed`, then finalize.
    Finish { elapsed: Duration },
    /// Fail after a short fetch, tracking overlap in `active`.
    Churn { active: ActiveSet },
    /// Start a stubborn child process writing `file` and wait for it to die.
    Hang {
        table: FakeTable,
        pid: u32,
        file: PathBuf,
    },
}

pub struct ScriptedFetcher {
    script: Script,
    channel: Option<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn extract(
        &mut self,
        channel: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if let Script::Churn { active } = &self.script {
            active.enter(channel);
        }
        self.channel = Some(channel.to_string());
        Ok(())
    }

    async fn fetch(&mut self, ctx: &FetchContext) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Park => {
                ctx.cancellation().cancelled().await;
                Err(FetchError::Cancelled)
            }
            Script::Finish { elapsed } => {
                ctx.begin_finalize(*elapsed).await?;
                Ok(())
            }
            Script::Churn { active } => {
                tokio::time::sleep(Duration::from_millis(5 + (ctx.slot() as u64 * 3))).await;
                active.leave(ctx.channel());
                Err(FetchError::Rejected("offline".into()))
            }
            Script::Hang { table, pid, file } => {
                table.spawn(*pid, &format!("ffmpeg -i pipe: -c copy {}", file.display()), true);
                ctx.set_filename(file);
                loop {
                    if !table.alive(*pid) {
                        return Err(FetchError::Exited {
                            binary: "ffmpeg".into(),
                            code: None,
                        });
                    }
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                    }
                }
            }
        }
    }

    fn current_filename(&self) -> Option<PathBuf> {
        match &self.script {
            Script::Hang { file, .. } => Some(file.clone()),
            _ => None,
        }
    }

    fn last_error(&self) -> Option<StatusMessage> {
        None
    }

    fn resolution(&self) -> Option<String> {
        Some("1920x1080".into())
    }

    fn bitrate(&self) -> Option<String> {
        Some("6000".into())
    }
}

/// Slot collaborators whose fetchers follow `script_for(slot)`.
pub fn scripted_slots(
    bus: Arc<Bus>,
    gate: PostprocessGate,
    minimum_duration: Duration,
    calls: Arc<AtomicUsize>,
    script_for: impl Fn(usize) -> Script + Send + Sync + 'static,
) -> SlotShared {
    let factory = move |slot: usize| -> Box<dyn Fetcher> {
        Box::new(ScriptedFetcher {
            script: script_for(slot),
            channel: None,
            calls: calls.clone(),
        })
    };
    SlotShared {
        bus,
        gate,
        factory: Arc::new(factory),
        minimum_duration,
    }
}

pub fn roster(names: &[&str]) -> Vec<Channel> {
    names.iter().map(|name| Channel::new(*name)).collect()
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
