//! Shared types for agent-session orchestration: identifiers, the message
//! model, session events, and the backend trait seam.

pub mod backend;
pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod session;

pub use backend::AgentBackend;
pub use error::{SessionError, SessionResult};
pub use event::{
    ApprovalRequestEvent, OutputEvent, PartChange, PartEvent, PendingApproval, SessionEvent,
    SessionStatus, StatusEvent,
};
pub use ids::{AgentId, LocalSessionId, MessageId, PartId, RemoteSessionId, TaskId};
pub use message::{
    Message, MessagePart, MessageRole, PartKind, QuestionOption, QuestionPrompt, TodoItem,
    ToolInteraction, ToolPayload, ToolStatus,
};
pub use session::{
    BackendSessionStatus, CreatedSession, McpServerSpec, ModelRef, PromptPart, QuestionAnswer,
    QuestionReplyOutcome, ResumedSession, Session, SessionConfig,
};
