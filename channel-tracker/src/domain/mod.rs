//! Domain types shared by the scheduler, the slots and the roster store.

pub mod channel;
pub mod rank;

pub use channel::Channel;
pub use rank::RankTier;
