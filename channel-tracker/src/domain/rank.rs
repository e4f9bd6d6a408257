//! Display rank tiers derived from roster position.

use serde::{Deserialize, Serialize};

/// Inclusive upper bounds of roster positions for tiers 0..=4.
const TIER_BREAKPOINTS: [usize; 5] = [25, 50, 100, 200, 300];

/// Display-only priority bucket. Lower is more prominent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RankTier(u8);

impl RankTier {
    /// Tier for channels that have never been ranked.
    pub const UNRANKED: RankTier = RankTier(5);

    pub fn new(tier: u8) -> Self {
        Self(tier.min(Self::UNRANKED.0))
    }

    /// Tier for a cursor position in the roster.
    pub fn from_position(index: usize) -> Self {
        let tier = TIER_BREAKPOINTS
            .iter()
            .position(|&limit| index <= limit)
            .unwrap_or(TIER_BREAKPOINTS.len());
        Self(tier as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Short label used in console output.
    pub fn label(&self) -> &'static str {
        match self.0 {
            0 => "gold",
            1 => "silver",
            2 => "bronze",
            3 => "pink",
            4 => "blue",
            _ => "-",
        }
    }
}

impl Default for RankTier {
    fn default() -> Self {
        Self::UNRANKED
    }
}

impl std::fmt::Display for RankTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
