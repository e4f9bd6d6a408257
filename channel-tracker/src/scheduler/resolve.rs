use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{DEFAULT_BACKOFF, DEFAULT_BACKOFF_DEPTH, DEFAULT_MAX_DEPTH, SchedulerError};
use crate::domain::Channel;

/// Bounds of the eligible-channel search.
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    /// Attempts after which every further attempt sleeps `backoff` first.
    pub backoff_depth: u32,
    pub backoff: Duration,
    /// Attempts after which the search fails.
    pub max_depth: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            backoff_depth: DEFAULT_BACKOFF_DEPTH,
            backoff: DEFAULT_BACKOFF,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Find the next eligible channel at or after `cursor`.
///
/// Channels completed on the date of `now` are skipped. A candidate for
/// which `is_running` holds is passed over and the search retried from the
/// following position, backing off once `backoff_depth` retries have been
/// spent. Returns `Ok(None)` when every channel completed today or `stop`
/// fires during a backoff, and [`SchedulerError::ResolutionGuard`] once
/// `max_depth` retries are exhausted.
pub async fn next_channel(
    channels: &[Channel],
    cursor: usize,
    now: &DateTime<Utc>,
    config: &ResolutionConfig,
    stop: &CancellationToken,
    is_running: impl Fn(&str) -> bool,
) -> Result<Option<usize>, SchedulerError> {
    let len = channels.len();
    if len == 0 {
        return Err(SchedulerError::EmptyRoster);
    }

    let mut index = cursor % len;
    let mut attempts: u32 = 0;
    loop {
        if attempts > config.backoff_depth {
            trace!(attempts, "Backing off channel resolution");
            tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                _ = tokio::time::sleep(config.backoff) => {}
            }
        }

        let mut skipped = 0;
        while channels[index].completed_on(now) {
            index = (index + 1) % len;
            skipped += 1;
            if skipped >= len {
                debug!("Every channel completed today");
                return Ok(None);
            }
        }

        if !is_running(&channels[index].name) {
            return Ok(Some(index));
        }

        attempts += 1;
        if attempts > config.max_depth {
            return Err(SchedulerError::ResolutionGuard { attempts });
        }
        index = (index + 1) % len;
    }
}
