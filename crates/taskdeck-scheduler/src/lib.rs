//! Per-agent admission control for session starts.

pub mod admission;

pub use admission::{Admission, ConcurrencyScheduler, ConcurrencySlot};
