//! Terminate-then-kill escalation.

use std::time::Duration;

use tracing::{debug, warn};

use crate::table::{ProcessSignal, ProcessTable};

/// Outcome of [`terminate_with_grace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone before any signal was sent.
    AlreadyGone,
    /// The process exited within the grace period after `SIGTERM`.
    Terminated,
    /// The process ignored `SIGTERM` and was force-killed.
    Killed,
    /// The process was still present after the forced kill.
    Survived,
}

impl Termination {
    /// Whether the process is known to be gone.
    pub fn is_gone(&self) -> bool {
        !matches!(self, Termination::Survived)
    }
}

/// Ask `pid` to terminate, wait `grace`, then force-kill it if it is still alive.
pub async fn terminate_with_grace<T: ProcessTable + ?Sized>(
    table: &mut T,
    pid: u32,
    grace: Duration,
) -> Termination {
    table.refresh();
    if !table.is_alive(pid) {
        return Termination::AlreadyGone;
    }

    table.signal(pid, ProcessSignal::Terminate);
    tokio::time::sleep(grace).await;

    table.refresh();
    if !table.is_alive(pid) {
        debug!(pid, "Process exited after terminate");
        return Termination::Terminated;
    }

    warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored terminate, killing");
    table.signal(pid, ProcessSignal::Kill);
    tokio::time::sleep(Duration::from_millis(50)).await;

    table.refresh();
    if table.is_alive(pid) {
        warn!(pid, "Process still alive after kill");
        Termination::Survived
    } else {
        Termination::Killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ProcessEntry;
    use std::collections::HashMap;

    /// Process that dies after receiving the configured signal.
    struct FakeTable {
        alive: HashMap<u32, ProcessSignal>,
        sent: Vec<(u32, ProcessSignal)>,
    }

    impl ProcessTable for FakeTable {
        fn refresh(&mut self) {}

        fn descendants(&self, _root: u32) -> Vec<ProcessEntry> {
            Vec::new()
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.alive.contains_key(&pid)
        }

        fn signal(&mut self, pid: u32, signal: ProcessSignal) -> bool {
            self.sent.push((pid, signal));
            if self.alive.get(&pid) == Some(&signal) {
                self.alive.remove(&pid);
            }
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_is_enough() {
        let mut table = FakeTable {
            alive: HashMap::from([(10, ProcessSignal::Terminate)]),
            sent: Vec::new(),
        };
        let outcome = terminate_with_grace(&mut table, 10, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::Terminated);
        assert_eq!(table.sent, vec![(10, ProcessSignal::Terminate)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_to_kill() {
        let mut table = FakeTable {
            alive: HashMap::from([(11, ProcessSignal::Kill)]),
            sent: Vec::new(),
        };
        let outcome = terminate_with_grace(&mut table, 11, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::Killed);
        assert_eq!(
            table.sent,
            vec![(11, ProcessSignal::Terminate), (11, ProcessSignal::Kill)]
        );
        assert!(outcome.is_gone());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_gone() {
        let mut table = FakeTable {
            alive: HashMap::new(),
            sent: Vec::new(),
        };
        let outcome = terminate_with_grace(&mut table, 12, Duration::from_secs(1)).await;
        assert_eq!(outcome, Termination::AlreadyGone);
        assert!(table.sent.is_empty());
    }
}
