//! Fetcher backed by the `yt-dlp` command line tool.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::format::{MediaFormat, MediaInfo, select_best};
use super::output::{OutputLine, PROGRESS_TEMPLATE, parse_line};
use super::{FetchContext, FetchError, Fetcher, FetcherFactory};
use crate::bus::{FetchProgress, FetchStage, StatusMessage};
use crate::config::Settings;

const LOG_TARGET: &str = "channel_tracker::fetcher";
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(120);
const PREFERRED_EXTENSION: &str = "mp4";

/// Where a finished recording is filed: `<YYYY-MM>/W<WW>/<Day>/<id>.mp4`.
pub fn archive_path(home: &Path, id: &str, at: DateTime<Utc>) -> PathBuf {
    home.join(at.format("%Y-%m").to_string())
        .join(at.format("W%W").to_string())
        .join(at.format("%a").to_string())
        .join(format!("{id}.{PREFERRED_EXTENSION}"))
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Spawn `cmd`, hand every stdout/stderr line to `on_line`, and wait for exit.
///
/// The child is killed when `cancel` fires.
async fn run_tool(
    binary: &str,
    mut cmd: tokio::process::Command,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<ExitStatus, FetchError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| FetchError::Spawn {
        binary: binary.to_string(),
        source,
    })?;
    debug!(target: LOG_TARGET, binary, pid = ?child.id(), "Spawned");

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill_child(binary, &mut child).await;
                return Err(FetchError::Cancelled);
            }
            line = rx.recv() => match line {
                Some(line) => on_line(&line),
                None => break,
            }
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            kill_child(binary, &mut child).await;
            Err(FetchError::Cancelled)
        }
        status = child.wait() => Ok(status?),
    }
}

async fn kill_child(binary: &str, child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(target: LOG_TARGET, binary, pid = ?child.id(), "Failed to kill child process: {}", e);
    }
}

/// Fetcher for one slot.
pub struct YtDlpFetcher {
    slot: usize,
    settings: Arc<Settings>,
    prefix: String,
    channel: String,
    info: Option<MediaInfo>,
    selected: Option<MediaFormat>,
    filename: Option<PathBuf>,
    last_error: Option<StatusMessage>,
    observed_bitrate: Option<u64>,
}

impl YtDlpFetcher {
    pub fn new(slot: usize, settings: Arc<Settings>, prefix: impl Into<String>) -> Self {
        Self {
            slot,
            settings,
            prefix: prefix.into(),
            channel: String::new(),
            info: None,
            selected: None,
            filename: None,
            last_error: None,
            observed_bitrate: None,
        }
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = process_utils::tokio_command(&self.settings.fetcher_binary);
        cmd.arg("--no-colors");
        if let Some(browser) = &self.settings.cookies_from_browser {
            cmd.arg("--cookies-from-browser").arg(browser);
        }
        cmd
    }

    fn tool_failure(&self, binary: &str, status: ExitStatus) -> FetchError {
        match &self.last_error {
            Some(message) => FetchError::Tool {
                extractor: message.source.clone(),
                channel: message.channel.clone(),
                message: message.text.clone(),
            },
            None => FetchError::Exited {
                binary: binary.to_string(),
                code: status.code(),
            },
        }
    }

    fn handle_diagnostic(slot: usize, last_error: &mut Option<StatusMessage>, line: OutputLine) {
        match line {
            OutputLine::Error(message) => {
                warn!(target: LOG_TARGET, slot, "{}", message);
                *last_error = Some(message);
            }
            OutputLine::Warning(message) => {
                debug!(target: LOG_TARGET, slot, "Warning: {}", message);
            }
            OutputLine::Info(message) => {
                debug!(target: LOG_TARGET, slot, "{}", message);
            }
            OutputLine::Destination(_) | OutputLine::Progress(_) => {}
        }
    }

    async fn remux(
        &mut self,
        ctx: &FetchContext,
        source: &Path,
        destination: &Path,
    ) -> Result<(), FetchError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let binary = self.settings.ffmpeg_binary.clone();
        let mut cmd = process_utils::tokio_command(&binary);
        cmd.args(["-hide_banner", "-nostats", "-loglevel", "error", "-y", "-i"])
            .arg(source)
            .args(["-c", "copy", "-movflags", "+faststart"])
            .arg(destination);

        let slot = self.slot;
        let mut stderr = Vec::new();
        let status = run_tool(&binary, cmd, ctx.cancellation(), |line| {
            let line = line.trim();
            if !line.is_empty() {
                warn!(target: LOG_TARGET, slot, "ffmpeg: {}", line);
                stderr.push(line.to_string());
            }
        })
        .await?;

        if !status.success() {
            if let Some(last) = stderr.pop() {
                self.last_error = Some(StatusMessage::new("ffmpeg", &self.channel, last));
            }
            return Err(self.tool_failure(&binary, status));
        }

        if let Err(e) = tokio::fs::remove_file(source).await {
            warn!(target: LOG_TARGET, slot, file = %source.display(), "Failed to remove download: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn extract(
        &mut self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        self.channel = channel.to_string();
        self.info = None;
        self.selected = None;
        self.filename = None;
        self.last_error = None;
        self.observed_bitrate = None;

        let binary = self.settings.fetcher_binary.clone();
        let mut cmd = self.command();
        cmd.args(["--dump-single-json", "--skip-download", "--no-playlist"])
            .arg(format!("{}{}", self.prefix, channel));

        let slot = self.slot;
        let mut stdout = String::new();
        let mut last_error = None;
        let run = run_tool(&binary, cmd, cancel, |line| {
            if line.trim_start().starts_with('{') {
                stdout.push_str(line);
            } else if let Some(parsed) = parse_line(line) {
                Self::handle_diagnostic(slot, &mut last_error, parsed);
            }
        });
        let status = match tokio::time::timeout(EXTRACT_TIMEOUT, run).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(FetchError::Tool {
                    extractor: String::new(),
                    channel: channel.to_string(),
                    message: "Metadata extraction timed out".to_string(),
                });
            }
        };
        self.last_error = last_error;

        if !status.success() || stdout.is_empty() {
            return Err(self.tool_failure(&binary, status));
        }

        let info: MediaInfo =
            serde_json::from_str(&stdout).map_err(|e| FetchError::Metadata(e.to_string()))?;
        let selected = select_best(&info.formats, PREFERRED_EXTENSION)
            .cloned()
            .ok_or_else(|| {
                FetchError::Rejected(format!("No {PREFERRED_EXTENSION} format available"))
            })?;

        if let Some(minimum) = self.settings.minimum_resolution {
            let height = selected.height.unwrap_or(0);
            if height < minimum {
                return Err(FetchError::Rejected(format!(
                    "Resolution {}x{} too low",
                    selected.width.unwrap_or(0),
                    height
                )));
            }
        }

        info!(
            target: LOG_TARGET,
            slot,
            channel,
            id = %info.id,
            format = %selected.format_id,
            resolution = ?selected.resolution(),
            "Extracted"
        );
        self.info = Some(info);
        self.selected = Some(selected);
        Ok(())
    }

    async fn fetch(&mut self, ctx: &FetchContext) -> Result<(), FetchError> {
        let (Some(info), Some(selected)) = (self.info.clone(), self.selected.clone()) else {
            return Err(FetchError::NotExtracted);
        };
        let url = info
            .url()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", self.prefix, self.channel));

        let temp_dir = self.settings.slot_temp_dir(self.slot);
        tokio::fs::create_dir_all(&temp_dir).await?;
        let download = temp_dir.join(format!("{}.{PREFERRED_EXTENSION}", info.id));
        self.filename = Some(download.clone());
        ctx.set_filename(&download);

        let binary = self.settings.fetcher_binary.clone();
        let mut cmd = self.command();
        cmd.args(["--newline", "--no-playlist", "--progress-template", PROGRESS_TEMPLATE])
            .arg("-f")
            .arg(&selected.format_id)
            .arg("-o")
            .arg(&download)
            .arg(&url);

        let slot = self.slot;
        let started = Instant::now();
        let mut reported_elapsed = 0.0_f64;
        let mut observed_bitrate = None;
        let mut filename = download.clone();
        let mut last_error = None;

        let status = run_tool(&binary, cmd, ctx.cancellation(), |line| {
            let Some(parsed) = parse_line(line) else {
                return;
            };
            match parsed {
                OutputLine::Progress(mut progress) => {
                    progress.video_id = Some(info.id.clone());
                    progress.width = selected.width;
                    progress.height = selected.height;
                    progress.bitrate_kbps = Some(selected.bitrate() as u64);
                    reported_elapsed = reported_elapsed.max(progress.elapsed_secs);
                    if let Some(kbps) = progress.effective_bitrate_kbps() {
                        observed_bitrate = Some(kbps);
                    }
                    if let Some(path) = &progress.filename {
                        filename = path.clone();
                    }
                    ctx.report(progress);
                }
                OutputLine::Destination(path) => {
                    ctx.set_filename(&path);
                    filename = path;
                }
                other => Self::handle_diagnostic(slot, &mut last_error, other),
            }
        })
        .await;

        self.filename = Some(filename.clone());
        self.last_error = last_error;
        if observed_bitrate.is_some() {
            self.observed_bitrate = observed_bitrate;
        }
        let status = status?;
        if !status.success() {
            return Err(self.tool_failure(&binary, status));
        }
        if !tokio::fs::try_exists(&filename).await.unwrap_or(false) {
            return Err(FetchError::MissingOutput(filename));
        }

        let elapsed = if reported_elapsed > 0.0 {
            Duration::from_secs_f64(reported_elapsed)
        } else {
            started.elapsed()
        };
        ctx.begin_finalize(elapsed).await?;

        let recorded_at = info
            .epoch
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
            .unwrap_or_else(Utc::now);
        let destination = archive_path(&self.settings.home_dir(), &info.id, recorded_at);

        let mut progress = FetchProgress::download("started");
        progress.stage = FetchStage::Postprocess("Remux".to_string());
        progress.video_id = Some(info.id.clone());
        progress.filename = Some(destination.clone());
        ctx.report(progress);

        self.remux(ctx, &filename, &destination).await?;
        self.filename = Some(destination.clone());
        info!(
            target: LOG_TARGET,
            slot,
            channel = %self.channel,
            file = %destination.display(),
            "Recording filed"
        );

        let mut progress = FetchProgress::download("finished");
        progress.stage = FetchStage::Postprocess("Remux".to_string());
        progress.video_id = Some(info.id.clone());
        progress.filename = Some(destination);
        ctx.report(progress);
        Ok(())
    }

    fn current_filename(&self) -> Option<PathBuf> {
        self.filename.clone()
    }

    fn last_error(&self) -> Option<StatusMessage> {
        self.last_error.clone()
    }

    fn resolution(&self) -> Option<String> {
        self.selected.as_ref().and_then(MediaFormat::resolution)
    }

    fn bitrate(&self) -> Option<String> {
        self.observed_bitrate
            .or_else(|| {
                self.selected
                    .as_ref()
                    .map(|f| f.bitrate().round() as u64)
                    .filter(|b| *b > 0)
            })
            .map(|b| b.to_string())
    }
}

/// Builds a [`YtDlpFetcher`] per slot with the shared channel URL prefix.
pub struct YtDlpFactory {
    settings: Arc<Settings>,
    prefix: String,
}

impl YtDlpFactory {
    pub fn new(settings: Arc<Settings>, prefix: impl Into<String>) -> Self {
        Self {
            settings,
            prefix: prefix.into(),
        }
    }
}

impl FetcherFactory for YtDlpFactory {
    fn create(&self, slot: usize) -> Box<dyn Fetcher> {
        Box::new(YtDlpFetcher::new(slot, self.settings.clone(), self.prefix.clone()))
    }
}
