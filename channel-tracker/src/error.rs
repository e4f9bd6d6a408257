//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scheduler::SchedulerError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status of the whole run.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    /// Permission problems or unexpected failures.
    pub const FAILURE: u8 = 1;
    /// Required configuration missing.
    pub const CONFIGURATION: u8 = 2;
    /// Fatal startup failure in an optional subsystem.
    pub const SUBSYSTEM: u8 = 3;
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission Error {op} {path}: {source}")]
    Permission {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channels file not found: {0}")]
    RosterMissing(PathBuf),

    #[error("No channels imported")]
    NoChannels,

    #[error("Startup failure in {subsystem}: {message}")]
    Subsystem {
        subsystem: &'static str,
        message: String,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn subsystem(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::Subsystem {
            subsystem,
            message: message.into(),
        }
    }

    /// Build an IO error with operation and path context.
    ///
    /// Permission failures get their own variant so they map to the
    /// permission exit status.
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        let path = path.to_path_buf();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Permission { op, path, source }
        } else {
            Self::IoPath { op, path, source }
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Configuration(_) => exit_code::CONFIGURATION,
            Error::NoChannels | Error::Subsystem { .. } => exit_code::SUBSYSTEM,
            Error::Permission { .. }
            | Error::IoPath { .. }
            | Error::Io(_)
            | Error::RosterMissing(_)
            | Error::Scheduler(_)
            | Error::Other(_) => exit_code::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::config("Number of slots not set").exit_code(), 2);
        assert_eq!(Error::NoChannels.exit_code(), 3);
        assert_eq!(Error::subsystem("logging", "boom").exit_code(), 3);
        assert_eq!(Error::Other("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_permission_denied_maps_to_permission() {
        let err = Error::io_path(
            "creating directory",
            Path::new("/root/forbidden"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, Error::Permission { .. }));
        assert_eq!(err.exit_code(), 1);
    }
}
