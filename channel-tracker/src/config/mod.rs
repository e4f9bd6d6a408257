//! Configuration loading and validation.
//!
//! Settings come from a TOML file, optionally overridden by `key=value`
//! pairs from the command line. The raw [`AppConfig`] is validated once
//! into [`Settings`], which is shared read-only by every component.

mod settings;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

pub use settings::Settings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Raw configuration as read from disk.
///
/// Required settings are optional here so that a missing value can be
/// reported as a configuration error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_directory: Option<PathBuf>,
    pub temporary_storage: Option<PathBuf>,
    pub channels_file: Option<PathBuf>,
    /// File whose first line is the URL prefix for every channel name.
    pub channel_prefix: Option<PathBuf>,
    pub number_of_slots: Option<usize>,
    /// Minimum recording length in minutes.
    pub minimum_duration: u64,
    /// Minimum accepted video height in pixels.
    pub minimum_resolution: Option<u32>,
    /// Seconds a captured child process may live before it is reaped.
    pub subprocess_timeout: u64,
    /// Seconds without output growth before a captured child is reaped; 0 disables.
    pub stall_timeout: u64,
    /// Minutes between health checks.
    pub health_interval: u64,
    /// Hours between roster checkpoints.
    pub offline_window: u64,
    /// Free fraction under which a drive is reported as low on space.
    pub free_percent_limit: f64,
    pub poll_interval_ms: u64,
    pub kill_grace_ms: u64,
    /// Monitor passes run every this many polling ticks.
    pub monitor_scan_ticks: u32,
    pub gate_timeout_secs: u64,
    pub cookies_from_browser: Option<String>,
    pub fetcher_binary: String,
    pub ffmpeg_binary: String,
    pub log_filter: Option<String>,
    pub resolution_backoff_depth: u32,
    pub resolution_backoff_secs: u64,
    pub resolution_max_depth: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_directory: None,
            temporary_storage: None,
            channels_file: None,
            channel_prefix: None,
            number_of_slots: None,
            minimum_duration: 15,
            minimum_resolution: None,
            subprocess_timeout: 36_000,
            stall_timeout: 1_800,
            health_interval: 1,
            offline_window: 1,
            free_percent_limit: 0.1,
            poll_interval_ms: 50,
            kill_grace_ms: 1_000,
            monitor_scan_ticks: 20,
            gate_timeout_secs: 3_600,
            cookies_from_browser: None,
            fetcher_binary: "yt-dlp".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            log_filter: None,
            resolution_backoff_depth: 3,
            resolution_backoff_secs: 10,
            resolution_max_depth: 1_000,
        }
    }
}

/// Configuration file plus the overrides applied to it.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    table: toml::Table,
}

impl ConfigSource {
    /// Read the configuration file. A missing file yields an empty table.
    pub fn read(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let table = match std::fs::read_to_string(&path) {
            Ok(text) => text
                .parse::<toml::Table>()
                .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                toml::Table::new()
            }
            Err(e) => return Err(Error::io_path("reading config", &path, e)),
        };
        Ok(Self { path, table })
    }

    /// Build a source from TOML text (used by tests).
    pub fn from_str(path: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let table = text
            .parse::<toml::Table>()
            .map_err(|e| Error::config(e.to_string()))?;
        Ok(Self {
            path: path.into(),
            table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a `key=value` override.
    ///
    /// Values that parse as integers, floats or booleans keep that type;
    /// `None` removes the key; anything else is stored as a string.
    pub fn apply_override(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| Error::config(format!("Invalid override '{assignment}', expected key=value")))?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(Error::config(format!("Invalid override '{assignment}'")));
        }
        if value == "None" {
            self.table.remove(key);
        } else {
            self.table.insert(key.to_string(), parse_value(value));
        }
        debug!(key, value, "Applied config override");
        Ok(())
    }

    /// Deserialize into [`AppConfig`].
    pub fn config(&self) -> Result<AppConfig> {
        toml::Value::Table(self.table.clone())
            .try_into::<AppConfig>()
            .map_err(|e| Error::config(format!("{}: {}", self.path.display(), e)))
    }

    /// Write the (overridden) table back to its file.
    pub fn save(&self) -> Result<()> {
        let text = toml::to_string(&self.table)
            .map_err(|e| Error::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&self.path, text).map_err(|e| Error::io_path("writing config", &self.path, e))?;
        info!(path = %self.path.display(), "Saved configuration");
        Ok(())
    }
}

fn parse_value(value: &str) -> toml::Value {
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    match value.to_lowercase().as_str() {
        "true" | "yes" => toml::Value::Boolean(true),
        "false" | "no" => toml::Value::Boolean(false),
        _ => toml::Value::String(value.to_string()),
    }
}
