//! Shared utilities

pub mod clock;
pub mod rate_limit;
pub mod time;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
