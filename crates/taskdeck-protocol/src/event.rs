use serde::{Deserialize, Serialize};

use crate::ids::{LocalSessionId, MessageId, PartId, TaskId};
use crate::message::{MessagePart, MessageRole, QuestionPrompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartChange {
    New,
    Updated,
}

/// One new or changed part produced by a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartEvent {
    pub message_id: MessageId,
    pub role: MessageRole,
    pub part: MessagePart,
    pub change: PartChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Working,
    WaitingApproval,
    Error,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::WaitingApproval => "waiting_approval",
            Self::Error => "error",
        }
    }
}

/// An interactive question the backend is blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub part_id: PartId,
    pub call_id: Option<String>,
    pub questions: Vec<QuestionPrompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub task_id: TaskId,
    pub session_id: LocalSessionId,
    pub part: PartEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub session_id: Option<LocalSessionId>,
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequestEvent {
    pub task_id: TaskId,
    pub session_id: LocalSessionId,
    pub approval: PendingApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    Output(OutputEvent),
    Status(StatusEvent),
    ApprovalRequest(ApprovalRequestEvent),
}

impl SessionEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Output(event) => &event.task_id,
            Self::Status(event) => &event.task_id,
            Self::ApprovalRequest(event) => &event.task_id,
        }
    }
}
