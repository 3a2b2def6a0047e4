use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session configuration error: {0}")]
    Configuration(String),
    #[error("backend not accessible: {0}")]
    BackendUnavailable(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session transport error: {0}")]
    Transport(String),
    #[error("session protocol error: {0}")]
    Protocol(String),
    #[error("invalid session status transition: {0}")]
    InvalidTransition(String),
    #[error("session internal error: {0}")]
    Internal(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
