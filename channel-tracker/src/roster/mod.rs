//! Roster file persistence.
//!
//! The roster is a `;`-delimited text file with a header row and one row
//! per channel. A sibling file named after the roster with a trailing `_`
//! lists new channel names; it is merged in on load and then deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::domain::{Channel, RankTier};
use crate::utils::{fs, time};
use crate::{Error, Result};

/// Column names of the roster file.
pub const HEADERS: [&str; 9] = [
    "# Channel",
    "Rank",
    "Last Download",
    "Last Complete",
    "Last Attempt",
    "Last Error",
    "Last Error Message",
    "Resolution",
    "Bitrate",
];

const DELIMITER: char = ';';
const NULL: &str = "None";

/// Reads and writes the roster file.
#[derive(Debug, Clone)]
pub struct RosterStore {
    path: PathBuf,
    new_channels_path: PathBuf,
}

impl RosterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut new_name = path.clone().into_os_string();
        new_name.push("_");
        Self {
            path,
            new_channels_path: PathBuf::from(new_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn new_channels_path(&self) -> &Path {
        &self.new_channels_path
    }

    /// Load the roster, merge in new channels and collapse duplicate names.
    pub async fn load(&self) -> Result<Vec<Channel>> {
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Some(parse_roster(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(fs::io_error("reading roster", &self.path, e)),
        };

        let added = match tokio::fs::read_to_string(&self.new_channels_path).await {
            Ok(text) => Some(parse_new_channels(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(fs::io_error("reading new channels", &self.new_channels_path, e)),
        };

        if existing.is_none() && added.is_none() {
            return Err(Error::RosterMissing(self.path.clone()));
        }

        let mut channels = existing.unwrap_or_default();
        let loaded = channels.len();
        if let Some(added) = &added {
            channels.extend(added.iter().cloned());
        }
        let channels = merge_duplicates(channels);

        if let Some(added) = added {
            info!(
                added = added.len(),
                path = %self.new_channels_path.display(),
                "Imported new channels"
            );
            self.save(&channels).await?;
            tokio::fs::remove_file(&self.new_channels_path)
                .await
                .map_err(|e| fs::io_error("removing new channels", &self.new_channels_path, e))?;
        }

        debug!(loaded, total = channels.len(), "Roster loaded");
        Ok(channels)
    }

    /// Persist the full roster, replacing the file atomically.
    pub async fn save(&self, channels: &[Channel]) -> Result<()> {
        fs::ensure_parent_dir(&self.path).await?;

        let mut text = HEADERS.join(&DELIMITER.to_string());
        text.push('\n');
        for channel in channels {
            text.push_str(&format_row(channel));
            text.push('\n');
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, text)
            .await
            .map_err(|e| fs::io_error("writing roster", &tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| fs::io_error("replacing roster", &self.path, e))?;

        debug!(channels = channels.len(), path = %self.path.display(), "Roster saved");
        Ok(())
    }
}

/// Parse roster text, skipping comments, blank lines and short rows.
pub fn parse_roster(text: &str) -> Vec<Channel> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let row = parse_row(line);
            if row.is_none() {
                warn!(line, "Skipping malformed roster row");
            }
            row
        })
        .collect()
}

fn parse_row(line: &str) -> Option<Channel> {
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    if fields.len() < HEADERS.len() || fields[0].trim().is_empty() {
        return None;
    }

    let text = |i: usize| -> Option<String> {
        let value = fields[i].trim();
        (value != NULL && !value.is_empty()).then(|| value.to_string())
    };
    let timestamp = |i: usize| time::parse_timestamp(fields[i]);

    Some(Channel {
        name: fields[0].trim().to_string(),
        rank: fields[1].trim().parse::<u8>().ok().map(RankTier::new),
        last_download: timestamp(2),
        last_complete: timestamp(3),
        last_attempt: timestamp(4),
        last_error: timestamp(5),
        last_error_message: text(6),
        last_resolution: text(7),
        last_bitrate: text(8),
    })
}

/// Parse the new-channels file: first field of each non-comment line.
pub fn parse_new_channels(text: &str) -> Vec<Channel> {
    text.lines()
        .filter_map(|line| line.trim().split(DELIMITER).next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with('#'))
        .map(|name| Channel::new(name).with_rank(RankTier::UNRANKED))
        .collect()
}

fn format_row(channel: &Channel) -> String {
    let timestamp = |value: &Option<chrono::DateTime<chrono::Utc>>| {
        value
            .as_ref()
            .map(time::format_timestamp)
            .unwrap_or_else(|| NULL.to_string())
    };
    let text = |value: &Option<String>| {
        value
            .as_deref()
            .map(sanitize)
            .unwrap_or_else(|| NULL.to_string())
    };

    [
        sanitize(&channel.name),
        channel
            .rank
            .map(|r| r.to_string())
            .unwrap_or_else(|| NULL.to_string()),
        timestamp(&channel.last_download),
        timestamp(&channel.last_complete),
        timestamp(&channel.last_attempt),
        timestamp(&channel.last_error),
        text(&channel.last_error_message),
        text(&channel.last_resolution),
        text(&channel.last_bitrate),
    ]
    .join(&DELIMITER.to_string())
}

/// Keep free text from breaking the row layout.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            DELIMITER => ',',
            '\n' | '\r' => ' ',
            other => other,
        })
        .collect()
}

/// Collapse entries sharing a name into one record, in first-seen order.
///
/// Each field of the merged record is the first non-null value across the
/// duplicates.
pub fn merge_duplicates(channels: Vec<Channel>) -> Vec<Channel> {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(channels.len());
    let mut merged: Vec<Channel> = Vec::with_capacity(channels.len());

    for channel in channels {
        match seen.get(&channel.name) {
            Some(&index) => merged[index].fill_missing_from(&channel),
            None => {
                seen.insert(channel.name.clone(), merged.len());
                merged.push(channel);
            }
        }
    }

    merged
}
