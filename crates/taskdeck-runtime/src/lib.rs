//! Session runtime composition: admission, backend session lifecycle, poll
//! loops, state store and event fan-out behind one handle.

pub mod runtime;
pub mod settings;

pub use runtime::{SessionRuntime, SessionStart};
pub use settings::{AgentProfile, SessionRuntimeConfig, DEFAULT_POLL_INTERVAL};
