//! Round-robin scheduling of channels onto slots.
//!
//! The [`Manager`] owns the roster and the slot pool. Each tick it drains
//! channel updates, runs the health check when due, resolves the next
//! eligible channel for every free slot and periodically checkpoints the
//! roster to disk.

mod manager;
mod resolve;

use std::time::Duration;

use thiserror::Error;

pub use manager::{Manager, ManagerConfig, StopReason};
pub use resolve::{ResolutionConfig, next_channel};

/// Default attempts before resolution starts backing off.
pub const DEFAULT_BACKOFF_DEPTH: u32 = 3;
/// Default sleep between attempts once backing off.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);
/// Default attempt limit after which resolution gives up.
pub const DEFAULT_MAX_DEPTH: u32 = 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Every candidate stayed busy for too long: the roster is too small
    /// for the slot pool or fully occupied.
    #[error("Channel resolution gave up after {attempts} attempts")]
    ResolutionGuard { attempts: u32 },

    #[error("Channel {channel} assigned to more than one slot")]
    DuplicateAssignment { channel: String },

    #[error("No channels imported")]
    EmptyRoster,
}
