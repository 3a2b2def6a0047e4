use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, PartId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Part type as stored in a transcript.
///
/// `Question` and `TodoWrite` never come from the backend directly; they are
/// derived from `Tool` parts whose input carries a question or todo list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Text,
    Reasoning,
    Tool,
    Question,
    TodoWrite,
    Other,
}

impl PartKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
            Self::Tool => "tool",
            Self::Question => "question",
            Self::TodoWrite => "todowrite",
            Self::Other => "other",
        }
    }

    /// Kinds whose content may change in place between polls.
    pub const fn is_updatable(self) -> bool {
        matches!(self, Self::Text | Self::Reasoning | Self::Tool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

impl ToolStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPrompt {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
}

/// What a tool part turned out to be once its input was decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum ToolInteraction {
    #[default]
    Tool,
    Question(Vec<QuestionPrompt>),
    Todo(Vec<TodoItem>),
}

impl ToolInteraction {
    pub fn part_kind(&self) -> PartKind {
        match self {
            Self::Tool => PartKind::Tool,
            Self::Question(_) => PartKind::Question,
            Self::Todo(_) => PartKind::TodoWrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub tool: String,
    pub call_id: Option<String>,
    pub status: ToolStatus,
    pub input: Value,
    pub output: Option<String>,
    #[serde(default)]
    pub interaction: ToolInteraction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: PartId,
    pub kind: PartKind,
    pub text: Option<String>,
    pub tool: Option<ToolPayload>,
}

impl MessagePart {
    pub fn text(id: impl Into<PartId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PartKind::Text,
            text: Some(text.into()),
            tool: None,
        }
    }

    pub fn questions(&self) -> Option<&[QuestionPrompt]> {
        match self.tool.as_ref().map(|tool| &tool.interaction) {
            Some(ToolInteraction::Question(questions)) => Some(questions.as_slice()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}
