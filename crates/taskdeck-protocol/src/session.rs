use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::SessionStatus;
use crate::ids::{AgentId, LocalSessionId, RemoteSessionId, TaskId};
use crate::message::Message;

/// Local view of one agent engagement for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub local_session_id: LocalSessionId,
    pub remote_session_id: RemoteSessionId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub status: SessionStatus,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    /// Parses `provider/model`. A bare model name has an empty provider.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('/') {
            Some((provider, model)) if !model.trim().is_empty() => Some(Self {
                provider_id: provider.trim().to_owned(),
                model_id: model.trim().to_owned(),
            }),
            Some(_) => None,
            None => Some(Self {
                provider_id: String::new(),
                model_id: raw.to_owned(),
            }),
        }
    }
}

/// Auxiliary tool server registered with the backend before a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerSpec {
    pub name: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub base_url: String,
    pub directory: Option<PathBuf>,
    pub title: Option<String>,
    pub model: Option<ModelRef>,
    pub tools: BTreeMap<String, bool>,
    pub mcp_servers: Vec<McpServerSpec>,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            directory: None,
            title: None,
            model: None,
            tools: BTreeMap::new(),
            mcp_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    Text { text: String },
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub remote_session_id: RemoteSessionId,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumedSession {
    pub remote_session_id: RemoteSessionId,
    pub base_url: String,
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSessionStatus {
    #[default]
    Idle,
    Busy,
    Retry,
}

impl BackendSessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Busy | Self::Retry)
    }
}

/// One caller-supplied answer. `key` is matched against a question's header,
/// then its text; unmatched answers fall back to position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub key: String,
    pub value: String,
}

impl QuestionAnswer {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionReplyOutcome {
    Submitted { request_id: String },
    NoPendingQuestion,
    /// The reply never reached the backend; the question stays pending.
    Undelivered { reason: String },
}
