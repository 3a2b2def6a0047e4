use serde::{Deserialize, Serialize};
use taskdeck_protocol::{SessionEvent, TaskId};

/// A published event with its bus-wide sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventEnvelope {
    pub task_id: TaskId,
    pub sequence: u64,
    pub published_at_monotonic_nanos: u64,
    pub event: SessionEvent,
}
