//! Outcome tracking: inclusion detection, realized profit, feedback

mod store;
mod tracker;
mod windows;

pub use store::OutcomeStore;
pub use tracker::OutcomeTracker;
pub use windows::{RollingWindows, StrategyWindowSnapshot, DEFAULT_WINDOW};
