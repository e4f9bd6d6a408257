//! Channel record persisted in the roster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RankTier;
use crate::utils::time;

/// One tracked broadcast source with its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Unique key within the roster.
    pub name: String,
    /// Derived display tier; rewritten on every assignment.
    pub rank: Option<RankTier>,
    pub last_download: Option<DateTime<Utc>>,
    pub last_complete: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_resolution: Option<String>,
    pub last_bitrate: Option<String>,
}

impl Channel {
    /// A channel with no history.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rank: None,
            last_download: None,
            last_complete: None,
            last_attempt: None,
            last_error: None,
            last_error_message: None,
            last_resolution: None,
            last_bitrate: None,
        }
    }

    pub fn with_rank(mut self, rank: RankTier) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Whether the channel completed a recording on the calendar date of `now`.
    pub fn completed_on(&self, now: &DateTime<Utc>) -> bool {
        self.last_complete
            .as_ref()
            .is_some_and(|complete| time::same_date(complete, now))
    }

    /// Fill every empty field from `other`, keeping values already present.
    ///
    /// Used when duplicate roster entries are merged: the first occurrence
    /// wins wherever it has a value.
    pub fn fill_missing_from(&mut self, other: &Channel) {
        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }

        fill(&mut self.rank, &other.rank);
        fill(&mut self.last_download, &other.last_download);
        fill(&mut self.last_complete, &other.last_complete);
        fill(&mut self.last_attempt, &other.last_attempt);
        fill(&mut self.last_error, &other.last_error);
        fill(&mut self.last_error_message, &other.last_error_message);
        fill(&mut self.last_resolution, &other.last_resolution);
        fill(&mut self.last_bitrate, &other.last_bitrate);
    }

    /// Record a successful recording.
    pub fn record_complete(
        &mut self,
        at: DateTime<Utc>,
        resolution: Option<String>,
        bitrate: Option<String>,
    ) {
        self.last_complete = Some(at);
        self.last_resolution = resolution;
        self.last_bitrate = bitrate;
    }

    /// Record a failed or rejected attempt.
    pub fn record_error(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.last_error = Some(at);
        self.last_error_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_completed_on() {
        let today = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut channel = Channel::new("alpha");
        assert!(!channel.completed_on(&today));

        channel.last_complete = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap());
        assert!(channel.completed_on(&today));

        channel.last_complete = Some(Utc.with_ymd_and_hms(2024, 4, 30, 23, 59, 0).unwrap());
        assert!(!channel.completed_on(&today));
    }

    #[test]
    fn test_fill_missing_keeps_first_values() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let mut first = Channel::new("alpha");
        first.last_complete = Some(t1);
        let mut second = Channel::new("alpha");
        second.last_complete = Some(t2);
        second.last_attempt = Some(t2);
        second.last_bitrate = Some("3000".into());
        second.rank = Some(RankTier::new(1));

        first.fill_missing_from(&second);
        assert_eq!(first.last_complete, Some(t1));
        assert_eq!(first.last_attempt, Some(t2));
        assert_eq!(first.last_bitrate.as_deref(), Some("3000"));
        assert_eq!(first.rank, Some(RankTier::new(1)));
    }

    #[test]
    fn test_record_error_leaves_complete() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut channel = Channel::new("alpha");
        channel.last_complete = Some(t1);
        channel.record_error(t1, "Duration too short, 03:10");
        assert_eq!(channel.last_complete, Some(t1));
        assert_eq!(
            channel.last_error_message.as_deref(),
            Some("Duration too short, 03:10")
        );
    }
}
