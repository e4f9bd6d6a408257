//! Fetcher abstraction.
//!
//! A fetcher extracts metadata for a channel and performs the download for
//! one slot. Progress flows back through a [`FetchContext`], which is also
//! where the finalize phase takes the postprocessing gate.

mod context;
pub mod format;
pub mod output;
mod ytdlp;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::StatusMessage;
use crate::gate::GateError;

pub use context::{FetchContext, PROGRESS_INTERVAL};
pub use ytdlp::{YtDlpFactory, YtDlpFetcher};

/// Outcome of a failed extraction or fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Policy rejection (too short, too low resolution).
    #[error("{0}")]
    Rejected(String),

    /// Error reported by the tool itself.
    #[error("{message}")]
    Tool {
        extractor: String,
        channel: String,
        message: String,
    },

    #[error("{binary} exited with status {code:?}")]
    Exited { binary: String, code: Option<i32> },

    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata: {0}")]
    Metadata(String),

    #[error("Nothing extracted")]
    NotExtracted,

    #[error("Output file missing: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Structured message recorded on the channel and shown by the display.
    pub fn to_status(&self) -> StatusMessage {
        match self {
            FetchError::Tool {
                extractor,
                channel,
                message,
            } => StatusMessage::new(extractor.clone(), channel.clone(), message.clone()),
            other => StatusMessage::text(other.to_string()),
        }
    }

    /// Whether the tool's own error output explains this failure better.
    pub fn prefers_tool_message(&self) -> bool {
        matches!(self, FetchError::Exited { .. } | FetchError::NotExtracted)
    }
}

/// Extraction and download for one slot.
#[async_trait]
pub trait Fetcher: Send {
    /// Look the channel up and pick a format. Fails when the channel is
    /// offline, unavailable, or rejected by policy, and with
    /// [`FetchError::Cancelled`] once `cancel` fires.
    async fn extract(&mut self, channel: &str, cancel: &CancellationToken)
    -> Result<(), FetchError>;

    /// Download what `extract` selected. Runs until the broadcast ends,
    /// fails, or `ctx` is cancelled.
    async fn fetch(&mut self, ctx: &FetchContext) -> Result<(), FetchError>;

    /// File currently being written, if known.
    fn current_filename(&self) -> Option<PathBuf>;

    /// Last error reported by the tool.
    fn last_error(&self) -> Option<StatusMessage>;

    /// `WxH` of the selected format.
    fn resolution(&self) -> Option<String>;

    /// Bitrate of the selected format, or the observed one once fetching.
    fn bitrate(&self) -> Option<String>;
}

/// Builds one fetcher per slot.
pub trait FetcherFactory: Send + Sync {
    fn create(&self, slot: usize) -> Box<dyn Fetcher>;
}

impl<F> FetcherFactory for F
where
    F: Fn(usize) -> Box<dyn Fetcher> + Send + Sync,
{
    fn create(&self, slot: usize) -> Box<dyn Fetcher> {
        self(slot)
    }
}
