//! Fan-out of session output, status and approval events per task and globally.

pub mod bus;
pub mod envelope;

pub use bus::{
    SessionEventBus, SessionEventBusConfig, DEFAULT_GLOBAL_BUFFER_CAPACITY,
    DEFAULT_TASK_BUFFER_CAPACITY,
};
pub use envelope::SessionEventEnvelope;
