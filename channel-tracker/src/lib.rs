//! channel-tracker library crate.
//!
//! Records a large roster of live broadcast channels with a bounded pool of
//! worker slots. The pieces talk over a shared re-enqueueing [`bus::Bus`];
//! the [`scheduler::Manager`] dispatches channels round-robin, each
//! [`slot::Slot`] drives one fetch at a time, the [`gate`] serializes
//! finalize steps and the [`monitor`] reaps hung child processes.

pub mod bus;
pub mod cli;
pub mod config;
pub mod console;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod gate;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod panic_hook;
pub mod roster;
pub mod scheduler;
pub mod slot;
pub mod utils;

pub use error::{Error, Result};
