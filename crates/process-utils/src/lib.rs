//! Process helpers shared across the workspace.
//!
//! - Windows-friendly command construction (`CREATE_NO_WINDOW`).
//! - A process-table abstraction used to discover and signal the
//!   descendants spawned by external tools.
//! - Terminate-then-kill escalation with a grace period.

use std::ffi::OsStr;

mod table;
#[cfg(feature = "tokio")]
mod terminate;

pub use table::{ProcessEntry, ProcessSignal, ProcessTable, SysinfoProcessTable, current_pid};
#[cfg(feature = "tokio")]
pub use terminate::{Termination, terminate_with_grace};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a background tool.
///
/// Stdin is closed, `kill_on_drop` is set and no console window is opened
/// on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}
