use std::path::PathBuf;
use std::time::Duration;

use super::AppConfig;
use crate::{Error, Result};

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_directory: PathBuf,
    pub temporary_storage: PathBuf,
    pub channels_file: PathBuf,
    pub channel_prefix_file: PathBuf,
    pub number_of_slots: usize,
    pub minimum_duration: Duration,
    pub minimum_resolution: Option<u32>,
    pub subprocess_timeout: Duration,
    pub stall_timeout: Option<Duration>,
    pub health_interval: Duration,
    pub offline_window: Duration,
    pub free_percent_limit: f64,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub monitor_scan_ticks: u32,
    pub gate_timeout: Duration,
    pub cookies_from_browser: Option<String>,
    pub fetcher_binary: String,
    pub ffmpeg_binary: String,
    pub log_filter: Option<String>,
    pub resolution_backoff_depth: u32,
    pub resolution_backoff: Duration,
    pub resolution_max_depth: u32,
}

impl Settings {
    /// Directory for final recordings.
    pub fn home_dir(&self) -> PathBuf {
        self.output_directory.join("home")
    }

    /// Scratch area wiped on every start.
    pub fn scratch_dir(&self) -> PathBuf {
        self.temporary_storage.join("temp")
    }

    /// Per-slot scratch directory.
    pub fn slot_temp_dir(&self, slot: usize) -> PathBuf {
        self.scratch_dir().join(format!("slot-{slot:02}"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.temporary_storage.join("logs")
    }
}

impl TryFrom<AppConfig> for Settings {
    type Error = Error;

    fn try_from(config: AppConfig) -> Result<Self> {
        let output_directory = config
            .output_directory
            .ok_or_else(|| Error::config("Output directory not set"))?;
        let temporary_storage = config
            .temporary_storage
            .ok_or_else(|| Error::config("Temporary storage directory not set"))?;
        let channels_file = config
            .channels_file
            .ok_or_else(|| Error::config("Channels file not set"))?;
        let channel_prefix_file = config
            .channel_prefix
            .ok_or_else(|| Error::config("Channel prefix file not set"))?;
        let number_of_slots = match config.number_of_slots {
            Some(n) if n > 0 => n,
            _ => return Err(Error::config("Number of slots not set")),
        };
        if config.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be positive"));
        }
        if config.monitor_scan_ticks == 0 {
            return Err(Error::config("monitor_scan_ticks must be positive"));
        }
        if !(0.0..=1.0).contains(&config.free_percent_limit) {
            return Err(Error::config("free_percent_limit must be between 0 and 1"));
        }

        Ok(Self {
            output_directory,
            temporary_storage,
            channels_file,
            channel_prefix_file,
            number_of_slots,
            minimum_duration: Duration::from_secs(config.minimum_duration * 60),
            minimum_resolution: config.minimum_resolution.filter(|r| *r > 0),
            subprocess_timeout: Duration::from_secs(config.subprocess_timeout),
            stall_timeout: (config.stall_timeout > 0)
                .then(|| Duration::from_secs(config.stall_timeout)),
            health_interval: Duration::from_secs(config.health_interval.max(1) * 60),
            offline_window: Duration::from_secs(config.offline_window.max(1) * 3600),
            free_percent_limit: config.free_percent_limit,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            monitor_scan_ticks: config.monitor_scan_ticks,
            gate_timeout: Duration::from_secs(config.gate_timeout_secs),
            cookies_from_browser: config.cookies_from_browser,
            fetcher_binary: config.fetcher_binary,
            ffmpeg_binary: config.ffmpeg_binary,
            log_filter: config.log_filter,
            resolution_backoff_depth: config.resolution_backoff_depth,
            resolution_backoff: Duration::from_secs(config.resolution_backoff_secs),
            resolution_max_depth: config.resolution_max_depth.max(1),
        })
    }
}
