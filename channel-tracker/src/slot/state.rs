use std::fmt;

/// Lifecycle of a slot.
///
/// `Idle → Assigned → Extracting → Fetching → {Completing | Failing} → Idle`.
/// Extraction failures skip `Fetching`; an assignment still queued at
/// shutdown goes straight to `Failing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Assigned,
    Extracting,
    Fetching,
    Completing,
    Failing,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Assigned => "assigned",
            Self::Extracting => "extracting",
            Self::Fetching => "fetching",
            Self::Completing => "completing",
            Self::Failing => "failing",
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Whether the worker is inside the fetcher.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Extracting | Self::Fetching)
    }

    /// Whether the outcome is known and being published.
    pub fn is_ending(&self) -> bool {
        matches!(self, Self::Completing | Self::Failing)
    }

    /// Whether moving to `next` is a legal step.
    pub fn can_transition_to(&self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Assigned)
                | (Assigned, Extracting)
                | (Assigned, Failing)
                | (Extracting, Fetching)
                | (Extracting, Failing)
                | (Fetching, Completing)
                | (Fetching, Failing)
                | (Completing, Idle)
                | (Failing, Idle)
        )
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
