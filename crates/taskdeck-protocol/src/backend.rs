use async_trait::async_trait;

use crate::error::SessionResult;
use crate::ids::RemoteSessionId;
use crate::message::Message;
use crate::session::{
    BackendSessionStatus, CreatedSession, PromptPart, QuestionAnswer, QuestionReplyOutcome,
    ResumedSession, SessionConfig,
};

/// Session lifecycle against an agent backend.
///
/// Implementations resolve `config.base_url` to a reachable address on every
/// call that needs the network.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Registers configured tool servers, then creates a remote session.
    async fn create_session(&self, config: &SessionConfig) -> SessionResult<CreatedSession>;

    /// Fails when the remote session no longer exists.
    async fn resume_session(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<ResumedSession>;

    /// Dispatches a prompt without waiting for the agent to finish. Transport
    /// failures after dispatch are logged, never returned.
    async fn send_prompt(
        &self,
        session_id: &RemoteSessionId,
        parts: Vec<PromptPart>,
        config: &SessionConfig,
    ) -> SessionResult<()>;

    /// Returns whether an outstanding prompt was cancelled.
    async fn abort_prompt(&self, session_id: &RemoteSessionId) -> bool;

    /// True while a dispatched prompt request has not yet completed, failed
    /// or been cancelled.
    fn prompt_in_flight(&self, session_id: &RemoteSessionId) -> bool;

    async fn fetch_messages(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<Vec<Message>>;

    /// Unknown or unreadable status is reported as idle.
    async fn get_status(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> BackendSessionStatus;

    async fn respond_to_question(
        &self,
        session_id: &RemoteSessionId,
        answers: &[QuestionAnswer],
        config: &SessionConfig,
    ) -> SessionResult<QuestionReplyOutcome>;

    async fn destroy_session(&self, session_id: &RemoteSessionId) -> SessionResult<()>;

    async fn stop_server(&self) -> SessionResult<()>;
}
