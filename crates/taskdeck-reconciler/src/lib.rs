//! Turns a backend's append-only message log into incremental part events.

pub mod classify;
pub mod fingerprint;
pub mod reconcile;
pub mod seen;

pub use classify::{classify_part, classify_tool_input};
pub use fingerprint::fingerprint;
pub use reconcile::{classify_messages, reconcile, MessageReconciler};
pub use seen::SeenState;
