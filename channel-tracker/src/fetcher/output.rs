//! Parsing of the downloader's console output.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::bus::{FetchProgress, StatusMessage};

/// Prefix of the machine-readable progress lines requested on the command line.
pub const PROGRESS_PREFIX: &str = "cbt-progress ";

/// `--progress-template` value producing lines [`parse_line`] understands.
pub const PROGRESS_TEMPLATE: &str = "download:cbt-progress %(progress.status)s;%(progress.downloaded_bytes)s;%(progress.total_bytes)s;%(progress.elapsed)s;%(progress.speed)s;%(progress.filename)s";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

/// One classified output line.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Error(StatusMessage),
    Warning(StatusMessage),
    Destination(PathBuf),
    Progress(FetchProgress),
    Info(StatusMessage),
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}

/// Split `[extractor] channel: message` into its parts.
///
/// `[download]` lines never carry a channel.
pub fn split_message(line: &str) -> StatusMessage {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('[') else {
        return StatusMessage::text(line);
    };
    let Some((extractor, rest)) = rest.split_once(']') else {
        return StatusMessage::text(line);
    };
    if extractor.contains(char::is_whitespace) {
        return StatusMessage::text(line);
    }
    let rest = rest.trim_start();

    if extractor != "download" {
        if let Some((channel, message)) = rest.split_once(' ') {
            if let Some(channel) = channel.strip_suffix(':') {
                return StatusMessage::new(extractor, channel, message.trim_start());
            }
        } else if let Some(channel) = rest.strip_suffix(':') {
            return StatusMessage::new(extractor, channel, "");
        }
    }
    StatusMessage::new(extractor, "", rest)
}

fn parse_number<T: std::str::FromStr>(field: &str) -> Option<T> {
    match field.trim() {
        "" | "NA" | "None" => None,
        value => value.parse().ok(),
    }
}

fn parse_progress(fields: &str) -> Option<FetchProgress> {
    let mut parts = fields.splitn(6, ';');
    let status = parts.next()?.trim();
    if status.is_empty() || status == "NA" {
        return None;
    }
    let mut progress = FetchProgress::download(status);
    progress.downloaded_bytes = parts
        .next()
        .and_then(parse_number::<f64>)
        .map(|b| b as u64)
        .unwrap_or(0);
    progress.total_bytes = parts.next().and_then(parse_number::<f64>).map(|b| b as u64);
    progress.elapsed_secs = parts.next().and_then(parse_number).unwrap_or(0.0);
    progress.speed = parts.next().and_then(parse_number);
    progress.filename = parts
        .next()
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != "NA")
        .map(PathBuf::from);
    Some(progress)
}

/// Classify one line of output.
pub fn parse_line(raw: &str) -> Option<OutputLine> {
    let line = strip_ansi(raw);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(fields) = line.strip_prefix(PROGRESS_PREFIX) {
        return parse_progress(fields).map(OutputLine::Progress);
    }
    if let Some(message) = line.strip_prefix("ERROR: ") {
        return Some(OutputLine::Error(split_message(message)));
    }
    if let Some(message) = line.strip_prefix("WARNING: ") {
        return Some(OutputLine::Warning(split_message(message)));
    }
    if let Some(path) = line
        .strip_prefix("[download] Destination: ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        return Some(OutputLine::Destination(PathBuf::from(path)));
    }
    Some(OutputLine::Info(split_message(line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message() {
        assert_eq!(
            split_message("[twitch:stream] alpha: The channel is not currently live"),
            StatusMessage::new("twitch:stream", "alpha", "The channel is not currently live")
        );
        assert_eq!(
            split_message("[download] 100% of 3.2MiB"),
            StatusMessage::new("download", "", "100% of 3.2MiB")
        );
        assert_eq!(
            split_message("Unable to download webpage"),
            StatusMessage::text("Unable to download webpage")
        );
    }

    #[test]
    fn test_error_line() {
        let line = "\x1b[0;31mERROR:\x1b[0m [generic] beta: Unable to extract";
        assert_eq!(
            parse_line(line),
            Some(OutputLine::Error(StatusMessage::new(
                "generic",
                "beta",
                "Unable to extract"
            )))
        );
    }

    #[test]
    fn test_destination_line() {
        assert_eq!(
            parse_line("[download] Destination: /tmp/temp/slot-00/v1.mp4"),
            Some(OutputLine::Destination(PathBuf::from(
                "/tmp/temp/slot-00/v1.mp4"
            )))
        );
    }

    #[test]
    fn test_progress_line() {
        let line = "cbt-progress downloading;1048576;NA;8.5;123456.7;/tmp/x;y.mp4.part";
        let Some(OutputLine::Progress(progress)) = parse_line(line) else {
            panic!("expected progress");
        };
        assert_eq!(progress.status, "downloading");
        assert_eq!(progress.downloaded_bytes, 1_048_576);
        assert_eq!(progress.total_bytes, None);
        assert_eq!(progress.elapsed_secs, 8.5);
        assert_eq!(progress.filename, Some(PathBuf::from("/tmp/x;y.mp4.part")));
    }

    #[test]
    fn test_blank_and_garbage() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("cbt-progress NA;NA"), None);
    }
}
