use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::resolve::{ResolutionConfig, next_channel};
use super::SchedulerError;
use crate::bus::{Bus, Consumer, Control, Destination, Notice, Payload};
use crate::config::Settings;
use crate::domain::{Channel, RankTier};
use crate::health::{Health, HealthReport};
use crate::monitor::SubprocessMonitor;
use crate::roster::RosterStore;
use crate::slot::{Slot, SlotShared};
use crate::utils::time;
use crate::Result;

/// Default time slots get to wind down on stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Manager timing.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub health_interval: Duration,
    /// Roster checkpoint interval; the cursor restarts at the top afterwards.
    pub checkpoint_interval: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub resolution: ResolutionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(50),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            resolution: ResolutionConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            health_interval: settings.health_interval,
            checkpoint_interval: settings.offline_window,
            poll_interval: settings.poll_interval,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            resolution: ResolutionConfig {
                backoff_depth: settings.resolution_backoff_depth,
                backoff: settings.resolution_backoff,
                max_depth: settings.resolution_max_depth,
            },
        }
    }
}

/// Why the manager stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown requested from the console.
    Shutdown,
    /// Completion mode finished: every slot went idle.
    Completed,
    /// The stop token fired (Ctrl+C).
    Interrupted,
}

struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the roster and the slot pool.
pub struct Manager {
    config: ManagerConfig,
    roster: Vec<Channel>,
    store: RosterStore,
    bus: Arc<Bus>,
    health: Box<dyn Health>,
    slots: Vec<Slot>,
    slots_token: CancellationToken,
    monitor: Option<MonitorHandle>,
    cursor: usize,
    next_health: Instant,
    next_checkpoint: Instant,
    completing: bool,
    stop_reason: Option<StopReason>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        roster: Vec<Channel>,
        store: RosterStore,
        bus: Arc<Bus>,
        health: Box<dyn Health>,
    ) -> std::result::Result<Self, SchedulerError> {
        if roster.is_empty() {
            return Err(SchedulerError::EmptyRoster);
        }
        let now = Instant::now();
        let next_checkpoint = now + config.checkpoint_interval;
        Ok(Self {
            config,
            roster,
            store,
            bus,
            health,
            slots: Vec::new(),
            slots_token: CancellationToken::new(),
            monitor: None,
            cursor: 0,
            next_health: now,
            next_checkpoint,
            completing: false,
            stop_reason: None,
        })
    }

    /// Start `count` slots sharing `shared`.
    pub fn spawn_slots(&mut self, count: usize, shared: SlotShared) {
        let first = self.slots.len();
        for index in first..first + count {
            let slot = Slot::spawn(index, shared.clone(), self.slots_token.child_token());
            self.slots.push(slot);
        }
        info!(slots = self.slots.len(), "Slots started");
    }

    /// Run the subprocess monitor until the manager stops.
    pub fn spawn_monitor(&mut self, monitor: SubprocessMonitor) {
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));
        self.monitor = Some(MonitorHandle { token, task });
    }

    pub fn roster(&self) -> &[Channel] {
        &self.roster
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// `(slot, channel)` for every slot holding a channel.
    pub fn assignments(&self) -> Vec<(usize, String)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.active_channel().map(|name| (slot.index(), name)))
            .collect()
    }

    /// Run until stopped, then wind the slots down and persist the roster.
    pub async fn run(mut self, stop: CancellationToken) -> Result<StopReason> {
        info!(
            channels = self.roster.len(),
            slots = self.slots.len(),
            "Manager started"
        );

        let result = self.run_loop(&stop).await;
        if let Err(e) = &result {
            error!("Manager stopped on error: {}", e);
        }

        let persisted = self.stop().await;
        match (result, persisted) {
            (Ok(reason), Ok(())) => {
                info!(?reason, "OK");
                Ok(reason)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(persist)) => {
                error!("Failed to persist roster: {}", persist);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn run_loop(&mut self, stop: &CancellationToken) -> Result<StopReason> {
        loop {
            if stop.is_cancelled() {
                return Ok(StopReason::Interrupted);
            }

            if Instant::now() >= self.next_health {
                self.health_check().await;
                self.next_health = Instant::now() + self.config.health_interval;
            }

            self.drain_updates().await;
            if let Some(reason) = self.stop_reason {
                return Ok(reason);
            }

            if self.completing {
                if self.slots.iter().all(|slot| !slot.busy()) {
                    return Ok(StopReason::Completed);
                }
            } else {
                self.assign_free_slots(stop).await?;
            }

            if Instant::now() >= self.next_checkpoint {
                self.checkpoint().await?;
            }
        }
    }

    /// Publish the health summary and its warnings to the console.
    pub async fn health_check(&mut self) {
        let report = HealthReport::collect(self.health.as_mut()).await;
        let (notices, bar) = report.summarize(self.roster.len());
        for notice in notices {
            warn!("{}", notice.text);
            self.bus.publish(Destination::Display, Payload::Notice(notice));
        }
        self.bus.publish(Destination::Display, Payload::Health(bar));
    }

    /// Consume pending channel-state messages, waiting at most one poll
    /// interval per message.
    async fn drain_updates(&mut self) {
        let budget = self.slots.len() * 2 + 4;
        for _ in 0..budget {
            match self
                .bus
                .consume(Consumer::Manager, self.config.poll_interval)
                .await
            {
                Some(payload) => self.handle_payload(payload),
                None => break,
            }
        }
    }

    fn handle_payload(&mut self, payload: Payload) {
        match payload {
            Payload::ChannelUpdate(channel) => self.apply_update(channel),
            Payload::Control(Control::Shutdown) => {
                info!("Shutdown requested");
                self.stop_reason = Some(StopReason::Shutdown);
            }
            Payload::Control(Control::Complete) => {
                if !self.completing {
                    info!("Completing active recordings, no new assignments");
                    self.completing = true;
                    self.bus.publish(
                        Destination::Display,
                        Payload::Notice(Notice::notice("Completing active recordings")),
                    );
                }
            }
            other => debug!(kind = other.kind(), "Ignoring message"),
        }
    }

    fn apply_update(&mut self, channel: Channel) {
        match self.roster.iter_mut().find(|c| c.name == channel.name) {
            Some(entry) => *entry = channel,
            None => {
                warn!(channel = %channel.name, "Update for unknown channel, adding it");
                self.roster.push(channel);
            }
        }
    }

    /// Assign the next eligible channel to every free slot, in pool order.
    ///
    /// Returns the assignments made.
    pub async fn assign_free_slots(
        &mut self,
        stop: &CancellationToken,
    ) -> std::result::Result<Vec<(usize, String)>, SchedulerError> {
        let mut assigned = Vec::new();

        for position in 0..self.slots.len() {
            if self.slots[position].busy() {
                continue;
            }

            let now = time::now();
            let slots = &self.slots;
            let found = next_channel(
                &self.roster,
                self.cursor,
                &now,
                &self.config.resolution,
                stop,
                |name| slots.iter().any(|slot| slot.check_name(name)),
            )
            .await?;
            let Some(index) = found else {
                break;
            };

            let mut channel = self.roster[index].clone();
            channel.rank = Some(RankTier::from_position(index));
            channel.last_attempt = Some(now);
            let name = channel.name.clone();
            if !self.slots[position].process(channel.clone()) {
                warn!(slot = position, channel = %name, "Slot refused the assignment");
                continue;
            }

            self.roster[index] = channel;
            self.cursor = (index + 1) % self.roster.len();
            if !self.verify_exclusive() {
                return Err(SchedulerError::DuplicateAssignment { channel: name });
            }
            assigned.push((position, name));
        }

        Ok(assigned)
    }

    /// Log loudly if two slots ever hold the same channel.
    fn verify_exclusive(&self) -> bool {
        let mut names: Vec<String> = self
            .assignments()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        if names.len() != total {
            error!(assignments = ?self.assignments(), "Channel assigned to more than one slot");
            return false;
        }
        true
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.store.save(&self.roster).await?;
        self.cursor = 0;
        self.next_checkpoint = Instant::now() + self.config.checkpoint_interval;
        info!(channels = self.roster.len(), "Roster checkpoint saved");
        Ok(())
    }

    /// Stop slots and monitor, absorb final outcomes and persist.
    async fn stop(&mut self) -> Result<()> {
        info!("Stopping slots");
        self.slots_token.cancel();
        let deadline = Instant::now() + self.config.shutdown_grace;
        for slot in &self.slots {
            slot.shutdown();
            slot.join(deadline.saturating_duration_since(Instant::now()))
                .await;
        }

        // Keep everyone else's envelopes; only channel state is ours.
        for envelope in self.bus.drain() {
            if Consumer::Manager.accepts(&envelope) {
                self.handle_payload(envelope.payload);
            } else {
                self.bus.publish(envelope.destination, envelope.payload);
            }
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.token.cancel();
            let mut task = monitor.task;
            if tokio::time::timeout(self.config.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!("Subprocess monitor did not stop in time, aborting");
                task.abort();
            }
        }

        self.store.save(&self.roster).await
    }
}
