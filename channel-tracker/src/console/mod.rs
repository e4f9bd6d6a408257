//! Operator console.
//!
//! The display half consumes display and per-slot envelopes, keeps one row
//! per slot and renders every change as a log line. The key reader turns
//! operator input into control envelopes.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{
    Bus, Consumer, Control, Destination, Envelope, FetchProgress, HealthBar, Importance, Notice,
    Payload, SlotStatus,
};
use crate::utils::time;

const TARGET: &str = "channel_tracker::console";
const NOTICE_HISTORY: usize = 32;

/// What the console knows about one slot.
#[derive(Debug, Clone, Default)]
pub struct SlotRow {
    pub status: Option<SlotStatus>,
    pub progress: Option<FetchProgress>,
    /// A child process of this slot is being watched.
    pub recording: bool,
    pub unresponsive: bool,
    pub file_size: Option<u64>,
    /// Highest sequence applied; anything not above it is stale.
    pub last_sequence: u64,
}

impl SlotRow {
    fn accept(&mut self, sequence: u64) -> bool {
        if sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = sequence;
        true
    }
}

/// Row model behind the display.
#[derive(Debug, Default)]
pub struct ConsoleModel {
    rows: Vec<SlotRow>,
    notices: VecDeque<Notice>,
    health: HealthBar,
}

impl ConsoleModel {
    pub fn new(slots: usize) -> Self {
        Self {
            rows: vec![SlotRow::default(); slots],
            ..Self::default()
        }
    }

    pub fn row(&self, slot: usize) -> Option<&SlotRow> {
        self.rows.get(slot)
    }

    pub fn notices(&self) -> impl Iterator<Item = &Notice> {
        self.notices.iter()
    }

    pub fn health(&self) -> &HealthBar {
        &self.health
    }

    /// Apply one envelope. Returns `false` when it was discarded.
    pub fn apply(&mut self, envelope: Envelope) -> bool {
        match (envelope.destination, envelope.payload) {
            (Destination::Slot(slot), payload) => self.apply_slot(slot, payload),
            (Destination::Display, Payload::Notice(notice)) => {
                match notice.importance {
                    Importance::Warning => warn!(target: TARGET, "{}", notice.text),
                    Importance::Notice => info!(target: TARGET, "{}", notice.text),
                }
                if self.notices.len() == NOTICE_HISTORY {
                    self.notices.pop_front();
                }
                self.notices.push_back(notice);
                true
            }
            (Destination::Display, Payload::Health(bar)) => {
                info!(target: TARGET, "{}", bar.items.join(" "));
                self.health = bar;
                true
            }
            (Destination::Display, Payload::FileInfo(file)) => match self.rows.get_mut(file.slot) {
                Some(row) => {
                    trace!(target: TARGET, slot = file.slot, size = ?file.size, "File size");
                    row.file_size = file.size;
                    true
                }
                None => false,
            },
            (destination, payload) => {
                debug!(
                    target: TARGET,
                    destination = destination.as_raw(),
                    kind = payload.kind(),
                    "Unexpected display message"
                );
                false
            }
        }
    }

    fn apply_slot(&mut self, slot: usize, payload: Payload) -> bool {
        let Some(row) = self.rows.get_mut(slot) else {
            debug!(target: TARGET, slot, "Message for unknown slot");
            return false;
        };

        match payload {
            Payload::Status(status) => {
                if !row.accept(status.sequence) {
                    trace!(target: TARGET, slot, sequence = status.sequence, "Stale status");
                    return false;
                }
                render_status(&status);
                if !status.is_active || status.has_error.is_some() {
                    row.progress = None;
                    row.recording = false;
                }
                row.unresponsive = false;
                row.status = Some(status);
                true
            }
            Payload::Progress(progress) => {
                if !row.accept(progress.sequence) {
                    trace!(target: TARGET, slot, sequence = progress.sequence, "Stale progress");
                    return false;
                }
                debug!(
                    target: TARGET,
                    slot,
                    status = %progress.status,
                    elapsed = %time::format_elapsed(progress.elapsed_secs as u64),
                    bytes = progress.downloaded_bytes,
                    kbps = ?progress.effective_bitrate_kbps(),
                    "Progress"
                );
                row.progress = Some(progress);
                true
            }
            Payload::Recording => {
                info!(target: TARGET, slot, "Recording");
                row.recording = true;
                row.unresponsive = false;
                true
            }
            Payload::Unresponsive => {
                warn!(target: TARGET, slot, "Unresponsive");
                row.recording = false;
                row.unresponsive = true;
                true
            }
            other => {
                debug!(target: TARGET, slot, kind = other.kind(), "Unexpected slot message");
                false
            }
        }
    }
}

fn render_status(status: &SlotStatus) {
    let previous = status
        .previous_completion
        .as_ref()
        .map(time::format_timestamp)
        .unwrap_or_else(|| "never".to_string());
    let outcome = match status.has_error {
        Some(true) => "failed",
        Some(false) if status.is_complete => "complete",
        Some(false) => "done",
        None if status.is_downloading => "fetching",
        None => "idle",
    };
    info!(
        target: TARGET,
        slot = status.slot,
        channel = %status.channel_name,
        rank = status.rank.label(),
        previous = %previous,
        "{}: {}",
        outcome,
        status.message
    );
}

/// Display consumer task.
pub struct Console {
    bus: Arc<Bus>,
    model: ConsoleModel,
}

impl Console {
    pub fn new(bus: Arc<Bus>, slots: usize) -> Self {
        Self {
            bus,
            model: ConsoleModel::new(slots),
        }
    }

    /// Consume display traffic until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) -> ConsoleModel {
        let poll = self.bus.poll_interval();
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = self.bus.consume_envelope(Consumer::Display, poll) => envelope,
            };
            if let Some(envelope) = envelope {
                self.model.apply(envelope);
            }
        }
        debug!(target: TARGET, "Console stopped");
        self.model
    }
}

/// Map one line of operator input to a control envelope.
pub fn parse_key(line: &str, slots: usize) -> Option<(Destination, Payload)> {
    let key = line.trim();
    match key {
        "q" | "Q" => Some((
            Destination::ChannelState,
            Payload::Control(Control::Shutdown),
        )),
        "c" | "C" => Some((
            Destination::ChannelState,
            Payload::Control(Control::Complete),
        )),
        _ => match key.parse::<usize>() {
            Ok(n) if (1..=9).contains(&n) && n <= slots => Some((
                Destination::Slot(n - 1),
                Payload::Control(Control::Halt),
            )),
            _ => None,
        },
    }
}

/// Read operator keys from stdin on a dedicated thread.
///
/// Stdin reads cannot be cancelled, so the thread is detached and simply
/// ends with the process.
pub fn spawn_key_reader(bus: Arc<Bus>, slots: usize) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("console-keys".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_key(&line, slots) {
                    Some((destination, payload)) => {
                        info!(target: TARGET, key = line.trim(), "Operator request");
                        bus.publish(destination, payload);
                    }
                    None if line.trim().is_empty() => {}
                    None => {
                        warn!(target: TARGET, "Unknown key '{}': q quit, c complete, 1-9 kill slot", line.trim())
                    }
                }
            }
            debug!(target: TARGET, "Key reader stopped");
        })?;
    Ok(())
}
