//! Payload types carried by the bus.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, RankTier};

/// Structured status text: which component said what about which channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub source: String,
    pub channel: String,
    pub text: String,
}

impl StatusMessage {
    pub fn new(
        source: impl Into<String>,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            channel: channel.into(),
            text: text.into(),
        }
    }

    /// A message with only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.channel.is_empty() && self.text.is_empty()
    }
}

impl std::fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.source.is_empty(), self.channel.is_empty()) {
            (false, false) => write!(f, "[{}] {}: {}", self.source, self.channel, self.text),
            (false, true) => write!(f, "[{}] {}", self.source, self.text),
            _ => write!(f, "{}", self.text),
        }
    }
}

/// Status of one slot as reported to the display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub slot: usize,
    pub channel_name: String,
    pub rank: RankTier,
    pub previous_completion: Option<DateTime<Utc>>,
    pub is_downloading: bool,
    pub is_active: bool,
    pub is_complete: bool,
    /// `None` while the outcome is unknown.
    pub has_error: Option<bool>,
    pub message: StatusMessage,
    /// Monotonic per slot; stale updates are discarded by consumers.
    pub sequence: u64,
}

/// Phase a fetcher progress report belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStage {
    Download,
    /// Named finalize step (merge, move, fixup).
    Postprocess(String),
}

/// Interim progress reported by a fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub sequence: u64,
    pub stage: FetchStage,
    /// Raw status string from the fetcher ("downloading", "finished", ...).
    pub status: String,
    pub video_id: Option<String>,
    pub filename: Option<PathBuf>,
    pub elapsed_secs: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Nominal bitrate of the selected format in kbit/s.
    pub bitrate_kbps: Option<u64>,
}

impl FetchProgress {
    pub fn download(status: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            stage: FetchStage::Download,
            status: status.into(),
            video_id: None,
            filename: None,
            elapsed_secs: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: None,
            width: None,
            height: None,
            bitrate_kbps: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == "finished"
    }

    /// Observed bitrate in kbit/s, falling back to the nominal one.
    pub fn effective_bitrate_kbps(&self) -> Option<u64> {
        if self.elapsed_secs > 0.0 && self.downloaded_bytes > 0 {
            Some(((self.downloaded_bytes as f64 * 8.0 / self.elapsed_secs) / 1024.0) as u64)
        } else {
            self.bitrate_kbps
        }
    }
}

/// Output file currently written for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub slot: usize,
    /// Fetch cycle of the slot the file belongs to.
    pub cycle: u64,
    pub path: PathBuf,
    pub size: Option<u64>,
}

/// Who ended a slot's cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishOrigin {
    /// The slot's own worker, after publishing its outcome.
    Worker,
    /// The subprocess monitor, after a tracked process of `cycle` went away.
    Monitor { cycle: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Importance {
    Notice,
    Warning,
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Importance::Notice => write!(f, "Notice"),
            Importance::Warning => write!(f, "Warning"),
        }
    }
}

/// Free-form status-bar message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub importance: Importance,
    pub text: String,
}

impl Notice {
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            importance: Importance::Notice,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            importance: Importance::Warning,
            text: text.into(),
        }
    }
}

/// Summary line produced by a health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBar {
    pub items: Vec<String>,
}

/// Control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Cancel the current cycle of the slot the envelope is addressed to.
    Halt,
    /// Kill the captured processes of a slot.
    KillSlot(usize),
    /// A slot finished its fetch cycle; its processes are no longer tracked.
    FetchEnded(usize),
    /// Stop the run now.
    Shutdown,
    /// Stop assigning work and shut down once every slot is idle.
    Complete,
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Status(SlotStatus),
    Progress(FetchProgress),
    /// A child process was attributed to the slot.
    Recording,
    /// The slot's child process was reaped for not responding.
    Unresponsive,
    /// Terminal sentinel: the slot's fetch cycle is over.
    Finished(FinishOrigin),
    FileInfo(FileInfo),
    Notice(Notice),
    Health(HealthBar),
    Control(Control),
    ChannelUpdate(Channel),
}

impl Payload {
    /// Whether this payload ends a slot's cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Payload::Finished(_))
    }

    /// Whether a slot's own callback handles this payload.
    pub fn is_slot_bound(&self) -> bool {
        matches!(self, Payload::Finished(_) | Payload::Control(Control::Halt))
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Status(_) => "status",
            Payload::Progress(_) => "progress",
            Payload::Recording => "recording",
            Payload::Unresponsive => "unresponsive",
            Payload::Finished(_) => "finished",
            Payload::FileInfo(_) => "file-info",
            Payload::Notice(_) => "notice",
            Payload::Health(_) => "health",
            Payload::Control(_) => "control",
            Payload::ChannelUpdate(_) => "channel-update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_display() {
        assert_eq!(
            StatusMessage::new("twitch", "alpha", "offline").to_string(),
            "[twitch] alpha: offline"
        );
        assert_eq!(StatusMessage::text("plain").to_string(), "plain");
        assert!(StatusMessage::default().is_empty());
    }

    #[test]
    fn test_effective_bitrate() {
        let mut progress = FetchProgress::download("downloading");
        progress.bitrate_kbps = Some(2500);
        assert_eq!(progress.effective_bitrate_kbps(), Some(2500));

        progress.elapsed_secs = 8.0;
        progress.downloaded_bytes = 1024 * 1024;
        assert_eq!(progress.effective_bitrate_kbps(), Some(1024));
    }
}
