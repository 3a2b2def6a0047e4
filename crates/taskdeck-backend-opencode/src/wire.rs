//! Request and response shapes of the OpenCode HTTP API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskdeck_protocol::{
    BackendSessionStatus, Message, MessageId, MessagePart, MessageRole, ModelRef, PartId,
    PartKind, PromptPart, ToolPayload, ToolStatus,
};

#[derive(Debug, Serialize)]
pub(crate) struct CreateSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl SessionInfo {
    /// The session id, unless the body carries an error or a blank id.
    pub fn into_id(self) -> Result<String, String> {
        if let Some(error) = self.error.filter(|error| !error.is_null()) {
            return Err(error_text(&error));
        }
        self.id
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "response carried no session id".to_owned())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct McpServerRequest<'a> {
    pub name: &'a str,
    pub config: &'a Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireModel {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl From<&ModelRef> for WireModel {
    fn from(model: &ModelRef) -> Self {
        Self {
            provider_id: model.provider_id.clone(),
            model_id: model.model_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PromptRequest {
    pub parts: Vec<PromptPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<WireModel>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    pub info: WireMessageInfo,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessageInfo {
    pub id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePart {
    pub id: String,
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub state: Option<WireToolState>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireToolState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
}

impl WireMessage {
    pub fn into_message(self) -> Message {
        let role = match self.info.role.as_str() {
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::System,
        };
        Message {
            id: MessageId::new(self.info.id),
            role,
            parts: self.parts.into_iter().map(WirePart::into_part).collect(),
        }
    }
}

impl WirePart {
    fn into_part(self) -> MessagePart {
        let kind = match self.part_type.as_str() {
            "text" => PartKind::Text,
            "reasoning" => PartKind::Reasoning,
            "tool" => PartKind::Tool,
            _ => PartKind::Other,
        };
        let tool = (kind == PartKind::Tool).then(|| {
            let state = self.state.unwrap_or_default();
            ToolPayload {
                tool: self.tool.unwrap_or_default(),
                call_id: self.call_id,
                status: parse_tool_status(state.status.as_deref()),
                input: state.input,
                output: state.output.map(|output| match output {
                    Value::String(text) => text,
                    other => other.to_string(),
                }),
                interaction: Default::default(),
            }
        });
        MessagePart {
            id: PartId::new(self.id),
            kind,
            text: self.text,
            tool,
        }
    }
}

fn parse_tool_status(raw: Option<&str>) -> ToolStatus {
    match raw.unwrap_or_default() {
        "" | "pending" => ToolStatus::Pending,
        "running" => ToolStatus::Running,
        "completed" => ToolStatus::Completed,
        "error" => ToolStatus::Error,
        _ => ToolStatus::Unknown,
    }
}

/// Looks up one session in the `GET /session/status` map.
pub(crate) fn session_status_from_map(map: &Value, session_id: &str) -> BackendSessionStatus {
    let status_type = map
        .get(session_id)
        .and_then(|entry| entry.get("type").or(Some(entry)))
        .and_then(Value::as_str)
        .unwrap_or_default();
    match status_type {
        "busy" => BackendSessionStatus::Busy,
        "retry" => BackendSessionStatus::Retry,
        _ => BackendSessionStatus::Idle,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PendingQuestionRequest {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub questions: Vec<PendingQuestion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PendingQuestion {
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct QuestionReplyRequest<'a> {
    #[serde(rename = "requestID")]
    pub request_id: &'a str,
    pub answers: Vec<Vec<String>>,
}

fn error_text(error: &Value) -> String {
    error
        .get("message")
        .or_else(|| error.get("data").and_then(|data| data.get("message")))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskdeck_protocol::{BackendSessionStatus, MessageRole, PartKind, ToolStatus};

    use super::{session_status_from_map, SessionInfo, WireMessage};

    #[test]
    fn session_info_rejects_error_and_missing_id() {
        let ok: SessionInfo = serde_json::from_value(json!({"id": "ses_1"})).expect("parse");
        assert_eq!(ok.into_id(), Ok("ses_1".to_owned()));

        let errored: SessionInfo = serde_json::from_value(json!({
            "id": "ses_1",
            "error": {"message": "quota exceeded"}
        }))
        .expect("parse");
        assert_eq!(errored.into_id(), Err("quota exceeded".to_owned()));

        let blank: SessionInfo = serde_json::from_value(json!({"id": "  "})).expect("parse");
        assert!(blank.into_id().is_err());
    }

    #[test]
    fn wire_message_maps_roles_kinds_and_tool_state() {
        let message: WireMessage = serde_json::from_value(json!({
            "info": {"id": "msg_1", "role": "assistant"},
            "parts": [
                {"id": "prt_1", "type": "text", "text": "hello"},
                {"id": "prt_2", "type": "tool", "tool": "bash", "callID": "call_1",
                 "state": {"status": "completed", "input": {"command": "ls"}, "output": "a\nb"}},
                {"id": "prt_3", "type": "step-start"}
            ]
        }))
        .expect("parse message");

        let message = message.into_message();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.parts[0].kind, PartKind::Text);
        let tool = message.parts[1].tool.as_ref().expect("tool payload");
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.output.as_deref(), Some("a\nb"));
        assert_eq!(message.parts[2].kind, PartKind::Other);
        assert!(message.parts[2].tool.is_none());
    }

    #[test]
    fn status_map_lookup_degrades_to_idle() {
        let map = json!({
            "ses_busy": {"type": "busy"},
            "ses_retry": {"type": "retry", "attempt": 2},
            "ses_odd": {"type": "compacting"}
        });
        assert_eq!(
            session_status_from_map(&map, "ses_busy"),
            BackendSessionStatus::Busy
        );
        assert_eq!(
            session_status_from_map(&map, "ses_retry"),
            BackendSessionStatus::Retry
        );
        assert_eq!(
            session_status_from_map(&map, "ses_odd"),
            BackendSessionStatus::Idle
        );
        assert_eq!(
            session_status_from_map(&map, "ses_missing"),
            BackendSessionStatus::Idle
        );
        assert_eq!(
            session_status_from_map(&json!(null), "ses_busy"),
            BackendSessionStatus::Idle
        );
    }
}
