use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::FetchError;
use crate::bus::{Bus, Destination, FetchProgress, FileInfo, Notice, Payload};
use crate::gate::{GatePermit, PostprocessGate};

/// Minimum spacing of progress reports with an unchanged status.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct ReporterState {
    last_progress: Option<(Instant, String)>,
    filename: Option<PathBuf>,
    permit: Option<GatePermit>,
}

/// Per-cycle reporting channel handed to a fetcher.
///
/// Stamps progress with the slot's sequence counter, announces the output
/// file to the subprocess monitor, and owns the postprocessing permit once
/// the fetcher starts finalizing.
#[derive(Debug)]
pub struct FetchContext {
    slot: usize,
    cycle: u64,
    channel: String,
    bus: Arc<Bus>,
    gate: PostprocessGate,
    minimum_duration: Duration,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
    state: Mutex<ReporterState>,
}

impl FetchContext {
    pub fn new(
        slot: usize,
        cycle: u64,
        channel: impl Into<String>,
        bus: Arc<Bus>,
        gate: PostprocessGate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot,
            cycle,
            channel: channel.into(),
            bus,
            gate,
            minimum_duration: Duration::ZERO,
            sequence: Arc::new(AtomicU64::new(0)),
            cancel,
            state: Mutex::new(ReporterState::default()),
        }
    }

    /// Recordings shorter than this are rejected at finalize.
    pub fn with_minimum_duration(mut self, minimum_duration: Duration) -> Self {
        self.minimum_duration = minimum_duration;
        self
    }

    /// Share the slot's status sequence counter.
    pub fn with_sequence(mut self, sequence: Arc<AtomicU64>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Cancelled when the slot is asked to stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next value of the slot's sequence counter.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Forward interim progress to the slot's status stream.
    ///
    /// Reports with an unchanged status are throttled to one per
    /// [`PROGRESS_INTERVAL`]. Returns whether the report was published.
    pub fn report(&self, mut progress: FetchProgress) -> bool {
        if let Some(filename) = progress.filename.clone() {
            self.set_filename(&filename);
        }

        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let due = match &state.last_progress {
                Some((at, status)) => {
                    *status != progress.status || now.duration_since(*at) >= PROGRESS_INTERVAL
                }
                None => true,
            };
            if !due {
                return false;
            }
            state.last_progress = Some((now, progress.status.clone()));
        }

        progress.sequence = self.next_sequence();
        self.bus
            .publish(Destination::Slot(self.slot), Payload::Progress(progress));
        true
    }

    /// Record the file being written and tell the monitor about it.
    pub fn set_filename(&self, filename: &Path) {
        {
            let mut state = self.state.lock();
            if state.filename.as_deref() == Some(filename) {
                return;
            }
            state.filename = Some(filename.to_path_buf());
        }
        debug!(slot = self.slot, file = %filename.display(), "Output file");
        self.bus.publish(
            Destination::SlotControl,
            Payload::FileInfo(FileInfo {
                slot: self.slot,
                cycle: self.cycle,
                path: filename.to_path_buf(),
                size: None,
            }),
        );
    }

    pub fn filename(&self) -> Option<PathBuf> {
        self.state.lock().filename.clone()
    }

    /// Status-bar notice.
    pub fn notice(&self, text: impl Into<String>) {
        self.bus
            .publish(Destination::Display, Payload::Notice(Notice::notice(text)));
    }

    /// Enter the finalize phase.
    ///
    /// Rejects recordings shorter than the configured minimum, otherwise
    /// waits for the postprocessing gate and keeps the permit until
    /// [`release_gate`](Self::release_gate) or drop.
    pub async fn begin_finalize(&self, elapsed: Duration) -> Result<(), FetchError> {
        if elapsed < self.minimum_duration {
            let secs = elapsed.as_secs();
            return Err(FetchError::Rejected(format!(
                "Duration too short, {:02}:{:02}",
                secs / 60,
                secs % 60
            )));
        }
        if self.holds_gate() {
            return Ok(());
        }

        let slot_label = self.slot + 1;
        self.notice(format!("Acquiring lock (Slot {slot_label})"));
        let permit = tokio::select! {
            permit = self.gate.acquire(self.slot) => permit?,
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        self.state.lock().permit = Some(permit);
        self.notice(format!("Acquired lock (Slot {slot_label})"));
        Ok(())
    }

    pub fn holds_gate(&self) -> bool {
        self.state.lock().permit.is_some()
    }

    /// Give the postprocessing permit back if held.
    pub fn release_gate(&self) {
        let permit = self.state.lock().permit.take();
        if let Some(permit) = permit {
            drop(permit);
            self.notice(format!("Released lock (Slot {})", self.slot + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Consumer;

    fn context(bus: Arc<Bus>, gate: PostprocessGate) -> FetchContext {
        FetchContext::new(1, 4, "alpha", bus, gate, CancellationToken::new())
            .with_minimum_duration(Duration::from_secs(15 * 60))
    }

    fn progress_sequences(bus: &Bus) -> Vec<u64> {
        bus.drain()
            .into_iter()
            .filter_map(|envelope| match envelope.payload {
                Payload::Progress(progress) => Some(progress.sequence),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_throttled_and_sequenced() {
        let bus = Arc::new(Bus::default());
        let ctx = context(bus.clone(), PostprocessGate::new(Duration::from_secs(1)));

        assert!(ctx.report(FetchProgress::download("downloading")));
        assert!(!ctx.report(FetchProgress::download("downloading")));
        assert!(ctx.report(FetchProgress::download("finished")));

        tokio::time::advance(PROGRESS_INTERVAL).await;
        assert!(ctx.report(FetchProgress::download("finished")));

        assert_eq!(progress_sequences(&bus), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_filename_announced_once() {
        let bus = Arc::new(Bus::default());
        let ctx = context(bus.clone(), PostprocessGate::new(Duration::from_secs(1)));
        ctx.set_filename(Path::new("/tmp/slot-01/abc.mp4"));
        ctx.set_filename(Path::new("/tmp/slot-01/abc.mp4"));

        assert_eq!(bus.pending(), 1);
        let payload = bus
            .consume(Consumer::Monitor, Duration::from_millis(10))
            .await;
        assert!(matches!(
            payload,
            Some(Payload::FileInfo(FileInfo {
                slot: 1,
                cycle: 4,
                size: None,
                ..
            }))
        ));
        assert_eq!(ctx.filename(), Some(PathBuf::from("/tmp/slot-01/abc.mp4")));
    }

    #[tokio::test]
    async fn test_short_recording_is_rejected_without_gate() {
        let bus = Arc::new(Bus::default());
        let gate = PostprocessGate::new(Duration::from_secs(1));
        let ctx = context(bus, gate.clone());

        let err = ctx
            .begin_finalize(Duration::from_secs(3 * 60 + 7))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Duration too short, 03:07");
        assert!(gate.is_free());
    }

    #[tokio::test]
    async fn test_finalize_holds_gate_until_released() {
        let bus = Arc::new(Bus::default());
        let gate = PostprocessGate::new(Duration::from_secs(1));
        let ctx = context(bus, gate.clone());

        ctx.begin_finalize(Duration::from_secs(20 * 60)).await.unwrap();
        assert_eq!(gate.holder(), Some(1));
        assert!(ctx.holds_gate());

        ctx.release_gate();
        assert!(gate.is_free());
        assert!(!ctx.holds_gate());
    }
}
