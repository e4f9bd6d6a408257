//! Worker slots.
//!
//! A slot runs one fetch cycle at a time on its own worker task. The
//! scheduler hands it a copy of a [`Channel`]; the updated copy comes back on
//! the bus as a channel-state message, followed by the final status and the
//! terminal sentinel. A second task consumes that sentinel and flips the
//! slot back to idle, and handles halt requests for the current cycle.

mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{
    Bus, Consumer, Control, Destination, FinishOrigin, Notice, Payload, SlotStatus, StatusMessage,
};
use crate::domain::Channel;
use crate::fetcher::{FetchContext, FetchError, Fetcher, FetcherFactory};
use crate::gate::PostprocessGate;
use crate::utils::time;

pub use state::SlotState;

/// Collaborators every slot shares.
#[derive(Clone)]
pub struct SlotShared {
    pub bus: Arc<Bus>,
    pub gate: PostprocessGate,
    pub factory: Arc<dyn FetcherFactory>,
    pub minimum_duration: Duration,
}

#[derive(Debug, Default)]
struct SlotInner {
    state: SlotState,
    active: Option<String>,
    cycle: u64,
    /// Cancels the running cycle.
    cycle_token: Option<CancellationToken>,
    cycle_task: Option<AbortHandle>,
}

/// Time an aborted cycle gets to report before its worker is aborted too.
const ABORT_SETTLE: Duration = Duration::from_millis(200);

impl SlotInner {
    fn transition(&mut self, index: usize, next: SlotState) {
        if !self.state.can_transition_to(next) {
            warn!(slot = index, from = %self.state, to = %next, "Unexpected slot transition");
        }
        self.state = next;
    }
}

/// Result of one cycle, published by the worker.
struct CycleOutcome {
    channel: Channel,
    status: SlotStatus,
}

struct Cycle {
    index: usize,
    cycle: u64,
    channel: Channel,
    inner: Arc<Mutex<SlotInner>>,
    shared: SlotShared,
    sequence: Arc<AtomicU64>,
    token: CancellationToken,
}

/// Handle to one worker slot.
pub struct Slot {
    index: usize,
    inner: Arc<Mutex<SlotInner>>,
    assignments: mpsc::UnboundedSender<Channel>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Slot {
    /// Start the worker and callback tasks of slot `index`.
    pub fn spawn(index: usize, shared: SlotShared, shutdown: CancellationToken) -> Self {
        let inner = Arc::new(Mutex::new(SlotInner::default()));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(worker_loop(
            index,
            inner.clone(),
            shared.clone(),
            rx,
            shutdown.clone(),
        ));
        let callback = tokio::spawn(callback_loop(
            index,
            inner.clone(),
            shared.bus.clone(),
            shutdown.clone(),
        ));
        debug!(slot = index, "Slot started");

        Self {
            index,
            inner,
            assignments: tx,
            shutdown,
            tasks: Mutex::new(vec![worker, callback]),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// True from assignment until the terminal sentinel is consumed.
    pub fn busy(&self) -> bool {
        self.inner.lock().state.is_busy()
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// Name of the channel this slot is working on.
    pub fn active_channel(&self) -> Option<String> {
        self.inner.lock().active.clone()
    }

    pub fn check_name(&self, name: &str) -> bool {
        self.inner.lock().active.as_deref() == Some(name)
    }

    /// Hand a channel to the slot. Returns `false` if the slot is busy or
    /// its worker is gone.
    pub fn process(&self, channel: Channel) -> bool {
        let name = channel.name.clone();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_busy() || self.shutdown.is_cancelled() {
                return false;
            }
            inner.transition(self.index, SlotState::Assigned);
            inner.active = Some(name.clone());
        }

        if self.assignments.send(channel).is_err() {
            error!(slot = self.index, channel = %name, "Slot worker is not running");
            let mut inner = self.inner.lock();
            inner.state = SlotState::Idle;
            inner.active = None;
            return false;
        }
        info!(slot = self.index, channel = %name, "Assigned");
        true
    }

    /// Cancel the current cycle, leaving the slot running. Returns `false`
    /// when no cycle is in flight.
    pub fn halt(&self) -> bool {
        halt_cycle(self.index, &self.inner)
    }

    /// Ask the worker to stop. An in-flight fetch sees its cancellation
    /// token fire and is expected to return on its own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the slot's tasks, aborting whatever outlives `grace`.
    pub async fn join(&self, grace: Duration) {
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_ok() {
                continue;
            }
            // Abort the cycle first so the worker still reports its outcome.
            let cycle = self.inner.lock().cycle_task.take();
            if let Some(cycle) = cycle {
                warn!(slot = self.index, "Fetch cycle did not stop in time, aborting");
                cycle.abort();
                if tokio::time::timeout(ABORT_SETTLE, &mut handle).await.is_ok() {
                    continue;
                }
            }
            warn!(slot = self.index, "Slot task did not stop in time, aborting");
            handle.abort();
        }
    }
}

async fn worker_loop(
    index: usize,
    inner: Arc<Mutex<SlotInner>>,
    shared: SlotShared,
    mut assignments: mpsc::UnboundedReceiver<Channel>,
    shutdown: CancellationToken,
) {
    let sequence = Arc::new(AtomicU64::new(0));
    let mut fetcher: Option<Box<dyn Fetcher>> = None;

    loop {
        let channel = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            channel = assignments.recv() => match channel {
                Some(channel) => channel,
                None => break,
            },
        };

        let (cycle, token) = {
            let mut inner = inner.lock();
            inner.cycle += 1;
            let token = shutdown.child_token();
            inner.cycle_token = Some(token.clone());
            inner.transition(index, SlotState::Extracting);
            (inner.cycle, token)
        };

        let backup = channel.clone();
        let job = Cycle {
            index,
            cycle,
            channel,
            inner: inner.clone(),
            shared: shared.clone(),
            sequence: sequence.clone(),
            token,
        };
        let current = fetcher
            .take()
            .unwrap_or_else(|| shared.factory.create(index));

        // A panicking fetcher takes only its own task down.
        let task = tokio::spawn(run_cycle(current, job));
        inner.lock().cycle_task = Some(task.abort_handle());
        let joined = task.await;
        inner.lock().cycle_task = None;

        let outcome = match joined {
            Ok((returned, outcome)) => {
                fetcher = Some(returned);
                outcome
            }
            Err(e) if e.is_cancelled() => {
                warn!(slot = index, channel = %backup.name, "Fetch cycle aborted");
                inner.lock().state = SlotState::Failing;
                aborted_outcome(index, backup, &sequence, FetchError::Cancelled.to_status())
            }
            Err(e) => {
                error!(slot = index, channel = %backup.name, "Fetch cycle crashed: {}", e);
                inner.lock().state = SlotState::Failing;
                aborted_outcome(index, backup, &sequence, StatusMessage::text("Fetch cycle crashed"))
            }
        };

        publish_outcome(index, &shared.bus, outcome);
    }

    // Assignments handed over just before shutdown still get an outcome.
    assignments.close();
    while let Ok(channel) = assignments.try_recv() {
        info!(slot = index, channel = %channel.name, "Assignment cancelled before start");
        inner.lock().transition(index, SlotState::Failing);
        let outcome = aborted_outcome(index, channel, &sequence, FetchError::Cancelled.to_status());
        publish_outcome(index, &shared.bus, outcome);
    }

    debug!(slot = index, "Slot worker stopped");
}

fn base_status(index: usize, channel: &Channel) -> SlotStatus {
    SlotStatus {
        slot: index,
        channel_name: channel.name.clone(),
        rank: channel.rank.unwrap_or_default(),
        previous_completion: channel.last_complete,
        is_downloading: true,
        is_active: true,
        is_complete: false,
        has_error: None,
        message: StatusMessage::default(),
        sequence: 0,
    }
}

fn failure_message(error: &FetchError, fetcher: &dyn Fetcher) -> StatusMessage {
    if error.prefers_tool_message() {
        if let Some(message) = fetcher.last_error() {
            return message;
        }
    }
    error.to_status()
}

fn next_sequence(sequence: &AtomicU64) -> u64 {
    sequence.fetch_add(1, Ordering::SeqCst) + 1
}

async fn run_cycle(mut fetcher: Box<dyn Fetcher>, job: Cycle) -> (Box<dyn Fetcher>, CycleOutcome) {
    let Cycle {
        index,
        cycle,
        mut channel,
        inner,
        shared,
        sequence,
        token,
    } = job;
    let mut status = base_status(index, &channel);

    let result = match fetcher.extract(&channel.name, &token).await {
        Err(e) => {
            status.is_downloading = false;
            Err(e)
        }
        Ok(()) => {
            channel.last_download = Some(time::now());
            channel.last_resolution = fetcher.resolution();
            channel.last_bitrate = fetcher.bitrate();
            inner.lock().transition(index, SlotState::Fetching);

            let mut started = status.clone();
            started.sequence = next_sequence(&sequence);
            shared
                .bus
                .publish(Destination::Slot(index), Payload::Status(started));

            let ctx = FetchContext::new(
                index,
                cycle,
                channel.name.clone(),
                shared.bus.clone(),
                shared.gate.clone(),
                token,
            )
            .with_minimum_duration(shared.minimum_duration)
            .with_sequence(sequence.clone());

            let result = fetcher.fetch(&ctx).await;
            ctx.release_gate();
            result
        }
    };

    let now = time::now();
    match result {
        Ok(()) => {
            inner.lock().transition(index, SlotState::Completing);
            channel.record_complete(now, fetcher.resolution(), fetcher.bitrate());
            status.is_complete = true;
            status.has_error = Some(false);
            status.message = StatusMessage::new("", channel.name.clone(), "Complete");
            info!(slot = index, channel = %channel.name, "Recording complete");
        }
        Err(e) => {
            inner.lock().transition(index, SlotState::Failing);
            let message = failure_message(&e, fetcher.as_ref());
            channel.record_error(now, message.text.clone());
            status.has_error = Some(true);
            status.message = message;
            info!(slot = index, channel = %channel.name, "Cycle failed: {}", status.message);
        }
    }
    status.sequence = next_sequence(&sequence);

    (fetcher, CycleOutcome { channel, status })
}

/// Outcome of a cycle that never reached the fetcher's own result.
fn aborted_outcome(
    index: usize,
    mut channel: Channel,
    sequence: &AtomicU64,
    message: StatusMessage,
) -> CycleOutcome {
    channel.record_error(time::now(), message.text.clone());
    let mut status = base_status(index, &channel);
    status.is_downloading = false;
    status.has_error = Some(true);
    status.message = message;
    status.sequence = next_sequence(sequence);
    CycleOutcome { channel, status }
}

fn publish_outcome(index: usize, bus: &Bus, outcome: CycleOutcome) {
    bus.publish(
        Destination::ChannelState,
        Payload::ChannelUpdate(outcome.channel),
    );
    bus.publish(Destination::Slot(index), Payload::Status(outcome.status));
    bus.publish(
        Destination::SlotControl,
        Payload::Control(Control::FetchEnded(index)),
    );
    bus.publish(
        Destination::Slot(index),
        Payload::Finished(FinishOrigin::Worker),
    );
}

async fn callback_loop(
    index: usize,
    inner: Arc<Mutex<SlotInner>>,
    bus: Arc<Bus>,
    shutdown: CancellationToken,
) {
    let consumer = Consumer::Slot(index);
    let poll = bus.poll_interval();
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = bus.consume(consumer, poll) => payload,
        };
        match payload {
            Some(Payload::Finished(origin)) => on_finished(index, &inner, origin),
            Some(Payload::Control(Control::Halt)) => {
                if halt_cycle(index, &inner) {
                    // Escalate to the monitor for processes that ignore the token.
                    bus.publish(
                        Destination::SlotControl,
                        Payload::Control(Control::KillSlot(index)),
                    );
                } else {
                    let text = format!("Nothing to halt (Slot {})", index + 1);
                    bus.publish(Destination::Display, Payload::Notice(Notice::notice(text)));
                }
            }
            _ => {}
        }
    }
    debug!(slot = index, "Slot callback stopped");
}

fn halt_cycle(index: usize, inner: &Mutex<SlotInner>) -> bool {
    let inner = inner.lock();
    match &inner.cycle_token {
        Some(token) if inner.state.is_running() => {
            info!(slot = index, cycle = inner.cycle, "Halting cycle");
            token.cancel();
            true
        }
        _ => false,
    }
}

fn on_finished(index: usize, inner: &Mutex<SlotInner>, origin: FinishOrigin) {
    let mut inner = inner.lock();
    match origin {
        FinishOrigin::Worker => {
            if inner.state.is_ending() {
                inner.transition(index, SlotState::Idle);
                inner.active = None;
                inner.cycle_token = None;
                debug!(slot = index, "Slot free");
            } else {
                warn!(slot = index, state = %inner.state, "Finished while not ending a cycle");
            }
        }
        // Process termination is the monitor's job; the fetch returns once
        // its child is gone and the worker ends the cycle itself.
        FinishOrigin::Monitor { cycle } if cycle == inner.cycle && inner.state.is_running() => {
            info!(slot = index, cycle, "Monitor released the slot's process");
        }
        FinishOrigin::Monitor { cycle } => {
            debug!(slot = index, cycle, current = inner.cycle, "Stale monitor notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::time::Instant;

    struct ScriptedFetcher {
        extract_ok: bool,
        park_extract: bool,
        fetch: Result<(), &'static str>,
        hold: Duration,
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn extract(
            &mut self,
            _channel: &str,
            cancel: &CancellationToken,
        ) -> Result<(), FetchError> {
            if self.park_extract {
                cancel.cancelled().await;
                return Err(FetchError::Cancelled);
            }
            if self.extract_ok {
                Ok(())
            } else {
                Err(FetchError::Tool {
                    extractor: "generic".into(),
                    channel: "alpha".into(),
                    message: "offline".into(),
                })
            }
        }

        async fn fetch(&mut self, ctx: &FetchContext) -> Result<(), FetchError> {
            tokio::select! {
                _ = tokio::time::sleep(self.hold) => {}
                _ = ctx.cancellation().cancelled() => return Err(FetchError::Cancelled),
            }
            match self.fetch {
                Ok(()) => Ok(()),
                Err(message) => Err(FetchError::Rejected(message.to_string())),
            }
        }

        fn current_filename(&self) -> Option<PathBuf> {
            None
        }

        fn last_error(&self) -> Option<StatusMessage> {
            None
        }

        fn resolution(&self) -> Option<String> {
            Some("1280x720".into())
        }

        fn bitrate(&self) -> Option<String> {
            Some("2500".into())
        }
    }

    fn shared(bus: Arc<Bus>, extract_ok: bool, fetch: Result<(), &'static str>) -> SlotShared {
        scripted(bus, extract_ok, false, fetch, Duration::from_millis(20))
    }

    fn scripted(
        bus: Arc<Bus>,
        extract_ok: bool,
        park_extract: bool,
        fetch: Result<(), &'static str>,
        hold: Duration,
    ) -> SlotShared {
        let factory = move |_slot: usize| -> Box<dyn Fetcher> {
            Box::new(ScriptedFetcher {
                extract_ok,
                park_extract,
                fetch,
                hold,
            })
        };
        SlotShared {
            bus,
            gate: PostprocessGate::new(Duration::from_secs(1)),
            factory: Arc::new(factory),
            minimum_duration: Duration::ZERO,
        }
    }

    async fn next_update(bus: &Bus) -> Channel {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(Payload::ChannelUpdate(channel)) = bus
                .consume(Consumer::Manager, Duration::from_millis(20))
                .await
            {
                return channel;
            }
        }
        panic!("no channel update");
    }

    async fn wait_state(slot: &Slot, state: SlotState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while slot.state() != state {
            assert!(Instant::now() < deadline, "slot never reached {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_idle(slot: &Slot) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while slot.busy() {
            assert!(Instant::now() < deadline, "slot stayed busy");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_cycle() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(0, shared(bus.clone(), true, Ok(())), CancellationToken::new());

        assert!(slot.process(Channel::new("alpha")));
        assert!(slot.busy());
        assert!(slot.check_name("alpha"));
        assert!(!slot.process(Channel::new("beta")));

        let channel = next_update(&bus).await;
        assert_eq!(channel.name, "alpha");
        assert!(channel.last_complete.is_some());
        assert!(channel.last_download.is_some());
        assert_eq!(channel.last_resolution.as_deref(), Some("1280x720"));
        assert_eq!(channel.last_error_message, None);

        wait_idle(&slot).await;
        assert!(!slot.check_name("alpha"));
        assert_eq!(slot.active_channel(), None);

        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_extraction_failure_skips_fetch() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(1, shared(bus.clone(), false, Ok(())), CancellationToken::new());

        assert!(slot.process(Channel::new("alpha")));
        let channel = next_update(&bus).await;
        assert_eq!(channel.last_error_message.as_deref(), Some("offline"));
        assert_eq!(channel.last_complete, None);
        assert_eq!(channel.last_download, None);

        wait_idle(&slot).await;
        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rejected_fetch_records_error() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(
            0,
            shared(bus.clone(), true, Err("Duration too short, 02:00")),
            CancellationToken::new(),
        );

        assert!(slot.process(Channel::new("alpha")));
        let channel = next_update(&bus).await;
        assert_eq!(
            channel.last_error_message.as_deref(),
            Some("Duration too short, 02:00")
        );
        assert!(channel.last_error.is_some());
        assert_eq!(channel.last_complete, None);

        wait_idle(&slot).await;
        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_halt_ends_parked_fetch() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(
            1,
            scripted(bus.clone(), true, false, Ok(()), Duration::from_secs(3600)),
            CancellationToken::new(),
        );

        assert!(slot.process(Channel::new("alpha")));
        wait_state(&slot, SlotState::Fetching).await;
        bus.publish(Destination::Slot(1), Payload::Control(Control::Halt));

        let channel = next_update(&bus).await;
        assert_eq!(channel.last_error_message.as_deref(), Some("Cancelled"));
        wait_idle(&slot).await;

        // The slot keeps working after a halt.
        assert!(slot.process(Channel::new("beta")));
        wait_state(&slot, SlotState::Fetching).await;
        assert!(slot.halt());
        assert_eq!(next_update(&bus).await.name, "beta");
        wait_idle(&slot).await;
        assert!(!slot.halt());

        let escalated = bus
            .drain()
            .into_iter()
            .filter(|e| e.payload == Payload::Control(Control::KillSlot(1)))
            .count();
        assert_eq!(escalated, 1);

        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_halt_during_extraction() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(
            0,
            scripted(bus.clone(), true, true, Ok(()), Duration::ZERO),
            CancellationToken::new(),
        );

        assert!(slot.process(Channel::new("alpha")));
        wait_state(&slot, SlotState::Extracting).await;
        bus.publish(Destination::Slot(0), Payload::Control(Control::Halt));

        let channel = next_update(&bus).await;
        assert_eq!(channel.last_error_message.as_deref(), Some("Cancelled"));
        assert_eq!(channel.last_download, None);
        wait_idle(&slot).await;

        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_halt_on_idle_slot_only_notifies() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let slot = Slot::spawn(0, shared(bus.clone(), true, Ok(())), CancellationToken::new());

        bus.publish(Destination::Slot(0), Payload::Control(Control::Halt));
        let payload = bus
            .consume(Consumer::Display, Duration::from_secs(2))
            .await;
        assert_eq!(
            payload,
            Some(Payload::Notice(Notice::notice("Nothing to halt (Slot 1)")))
        );
        assert_eq!(bus.pending(), 0);

        slot.shutdown();
        slot.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_assignment_queued_at_shutdown_is_reported() {
        let bus = Arc::new(Bus::new(Duration::from_millis(5)));
        let shutdown = CancellationToken::new();
        let slot = Slot::spawn(0, shared(bus.clone(), true, Ok(())), shutdown.clone());

        // Cancel before the worker gets to run, with the assignment queued.
        assert!(slot.process(Channel::new("alpha")));
        shutdown.cancel();
        slot.join(Duration::from_secs(1)).await;

        let channel = next_update(&bus).await;
        assert_eq!(channel.name, "alpha");
        assert_eq!(channel.last_error_message.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn test_stale_monitor_finish_is_ignored() {
        let inner = Mutex::new(SlotInner {
            state: SlotState::Fetching,
            active: Some("alpha".into()),
            cycle: 3,
            cycle_token: None,
            cycle_task: None,
        });
        on_finished(0, &inner, FinishOrigin::Monitor { cycle: 2 });
        on_finished(0, &inner, FinishOrigin::Monitor { cycle: 3 });
        assert_eq!(inner.lock().state, SlotState::Fetching);

        inner.lock().state = SlotState::Completing;
        on_finished(0, &inner, FinishOrigin::Worker);
        let inner = inner.lock();
        assert_eq!(inner.state, SlotState::Idle);
        assert_eq!(inner.active, None);
    }
}
