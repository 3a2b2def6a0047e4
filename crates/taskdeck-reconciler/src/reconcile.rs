use taskdeck_protocol::{
    AgentBackend, Message, PartChange, PartEvent, RemoteSessionId, SessionConfig, SessionResult,
};

use crate::classify::classify_part;
use crate::fingerprint::fingerprint;
use crate::seen::SeenState;

/// Diffs a full message list against `seen`, in conversation order.
///
/// Updatable parts (text, reasoning, tool) are emitted when unseen or when
/// their fingerprint changed; other parts are emitted once. `seen` is updated
/// for every part whether or not it was emitted, so an unchanged list yields
/// no events on the next call.
pub fn reconcile(messages: &[Message], seen: &mut SeenState) -> Vec<PartEvent> {
    let mut events = Vec::new();
    for message in messages {
        seen.mark_message(&message.id);
        for part in &message.parts {
            let already_seen = seen.has_part(&part.id);
            let print = if part.kind.is_updatable() {
                fingerprint(part)
            } else {
                None
            };
            let changed = match print.as_deref() {
                Some(current) => seen.fingerprint(&part.id) != Some(current),
                None => false,
            };

            if !already_seen || changed {
                events.push(PartEvent {
                    message_id: message.id.clone(),
                    role: message.role,
                    part: classify_part(part),
                    change: if already_seen {
                        PartChange::Updated
                    } else {
                        PartChange::New
                    },
                });
            }
            seen.mark_part(&part.id, print);
        }
    }
    events
}

/// Classifies every tool part of a transcript without touching any
/// [`SeenState`]; used to present resumed history.
pub fn classify_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| Message {
            id: message.id.clone(),
            role: message.role,
            parts: message.parts.iter().map(classify_part).collect(),
        })
        .collect()
}

/// One reconciliation pass per call against a backend message log.
#[derive(Debug, Clone, Default)]
pub struct MessageReconciler {
    seen: SeenState,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from history that must not be re-emitted.
    pub fn resumed(history: &[Message]) -> Self {
        Self {
            seen: SeenState::seeded(history),
        }
    }

    pub fn seen(&self) -> &SeenState {
        &self.seen
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn apply(&mut self, messages: &[Message]) -> Vec<PartEvent> {
        reconcile(messages, &mut self.seen)
    }

    /// Fetches the session's full message log and returns new or changed parts.
    pub async fn poll(
        &mut self,
        backend: &dyn AgentBackend,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<Vec<PartEvent>> {
        let messages = backend.fetch_messages(session_id, config).await?;
        let events = self.apply(&messages);
        if !events.is_empty() {
            tracing::trace!(
                session_id = session_id.as_str(),
                messages = messages.len(),
                events = events.len(),
                "reconciled session messages"
            );
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use taskdeck_protocol::{
        AgentBackend, BackendSessionStatus, CreatedSession, Message, MessageId, MessagePart,
        MessageRole, PartChange, PartId, PartKind, PromptPart, QuestionAnswer,
        QuestionReplyOutcome, RemoteSessionId, ResumedSession, SessionConfig, SessionError,
        SessionResult, ToolPayload, ToolStatus,
    };

    use super::{classify_messages, reconcile, MessageReconciler};
    use crate::seen::SeenState;

    fn message(id: &str, role: MessageRole, parts: Vec<MessagePart>) -> Message {
        Message {
            id: MessageId::new(id),
            role,
            parts,
        }
    }

    fn tool_part(id: &str, status: ToolStatus, input: serde_json::Value) -> MessagePart {
        MessagePart {
            id: PartId::new(id),
            kind: PartKind::Tool,
            text: None,
            tool: Some(ToolPayload {
                tool: "question".to_owned(),
                call_id: Some(format!("call-{id}")),
                status,
                input,
                output: None,
                interaction: Default::default(),
            }),
        }
    }

    fn other_part(id: &str) -> MessagePart {
        MessagePart {
            id: PartId::new(id),
            kind: PartKind::Other,
            text: Some("step-start".to_owned()),
            tool: None,
        }
    }

    #[test]
    fn second_pass_over_unchanged_messages_yields_nothing() {
        let messages = vec![
            message(
                "msg-1",
                MessageRole::User,
                vec![MessagePart::text("p-user", "fix the bug")],
            ),
            message(
                "msg-2",
                MessageRole::Assistant,
                vec![
                    other_part("p-step"),
                    MessagePart::text("p-answer", "looking"),
                ],
            ),
        ];
        let mut seen = SeenState::default();

        let first = reconcile(&messages, &mut seen);
        let second = reconcile(&messages, &mut seen);

        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|event| event.change == PartChange::New));
        assert!(second.is_empty());
        assert_eq!(seen.message_count(), 2);
        assert_eq!(seen.part_count(), 3);
    }

    #[test]
    fn growing_text_part_is_emitted_as_update() {
        let mut seen = SeenState::default();
        let poll_one = vec![message(
            "msg-1",
            MessageRole::Assistant,
            vec![MessagePart::text("p1", "hello")],
        )];
        let poll_two = vec![message(
            "msg-1",
            MessageRole::Assistant,
            vec![MessagePart::text("p1", "hello world!")],
        )];

        let first = reconcile(&poll_one, &mut seen);
        let second = reconcile(&poll_two, &mut seen);

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].change, PartChange::New);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].change, PartChange::Updated);
        assert_eq!(second[0].part.id, PartId::new("p1"));
        assert_eq!(second[0].part.text.as_deref(), Some("hello world!"));
        assert_eq!(seen.message_count(), 1);
        assert_eq!(seen.part_count(), 1);
        assert_eq!(seen.fingerprint(&PartId::new("p1")), Some("12"));
    }

    #[test]
    fn non_updatable_parts_are_never_re_emitted() {
        let mut seen = SeenState::default();
        let mut part = other_part("p-step");
        let first = reconcile(
            &[message("msg-1", MessageRole::Assistant, vec![part.clone()])],
            &mut seen,
        );
        part.text = Some("step-finish with more text".to_owned());
        let second = reconcile(
            &[message("msg-1", MessageRole::Assistant, vec![part])],
            &mut seen,
        );

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn tool_status_change_re_emits_classified_part() {
        let input = json!({"questions": [{"header": "Plan", "question": "Proceed?"}]});
        let mut seen = SeenState::default();

        let first = reconcile(
            &[message(
                "msg-1",
                MessageRole::Assistant,
                vec![tool_part("p-q", ToolStatus::Running, input.clone())],
            )],
            &mut seen,
        );
        let second = reconcile(
            &[message(
                "msg-1",
                MessageRole::Assistant,
                vec![tool_part("p-q", ToolStatus::Completed, input)],
            )],
            &mut seen,
        );

        assert_eq!(first[0].part.kind, PartKind::Question);
        assert_eq!(first[0].change, PartChange::New);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].part.kind, PartKind::Question);
        assert_eq!(second[0].change, PartChange::Updated);
    }

    #[test]
    fn events_follow_conversation_order() {
        let messages = vec![
            message(
                "msg-b",
                MessageRole::Assistant,
                vec![
                    MessagePart::text("p-3", "third"),
                    MessagePart::text("p-1", "first"),
                ],
            ),
            message(
                "msg-a",
                MessageRole::Assistant,
                vec![MessagePart::text("p-2", "second")],
            ),
        ];
        let events = reconcile(&messages, &mut SeenState::default());
        let ids = events
            .iter()
            .map(|event| event.part.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["p-3", "p-1", "p-2"]);
    }

    #[test]
    fn resumed_reconciler_skips_history() {
        let history = vec![
            message(
                "msg-1",
                MessageRole::User,
                vec![MessagePart::text("p-1", "start")],
            ),
            message(
                "msg-2",
                MessageRole::Assistant,
                vec![tool_part(
                    "p-2",
                    ToolStatus::Completed,
                    json!({"todos": [{"content": "a"}]}),
                )],
            ),
            message(
                "msg-3",
                MessageRole::Assistant,
                vec![MessagePart::text("p-3", "done")],
            ),
        ];
        let mut reconciler = MessageReconciler::resumed(&history);

        assert_eq!(reconciler.seen().part_count(), 3);
        assert!(reconciler.apply(&history).is_empty());
    }

    #[test]
    fn classify_messages_reclassifies_history() {
        let history = vec![message(
            "msg-1",
            MessageRole::Assistant,
            vec![tool_part(
                "p-1",
                ToolStatus::Completed,
                json!({"todos": [{"content": "a"}]}),
            )],
        )];

        let classified = classify_messages(&history);
        assert_eq!(classified[0].parts[0].kind, PartKind::TodoWrite);
    }

    struct LogBackend {
        messages: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl AgentBackend for LogBackend {
        async fn create_session(&self, _config: &SessionConfig) -> SessionResult<CreatedSession> {
            Err(SessionError::Internal("unused".to_owned()))
        }

        async fn resume_session(
            &self,
            _session_id: &RemoteSessionId,
            _config: &SessionConfig,
        ) -> SessionResult<ResumedSession> {
            Err(SessionError::Internal("unused".to_owned()))
        }

        async fn send_prompt(
            &self,
            _session_id: &RemoteSessionId,
            _parts: Vec<PromptPart>,
            _config: &SessionConfig,
        ) -> SessionResult<()> {
            Ok(())
        }

        async fn abort_prompt(&self, _session_id: &RemoteSessionId) -> bool {
            false
        }

        fn prompt_in_flight(&self, _session_id: &RemoteSessionId) -> bool {
            false
        }

        async fn fetch_messages(
            &self,
            _session_id: &RemoteSessionId,
            _config: &SessionConfig,
        ) -> SessionResult<Vec<Message>> {
            Ok(self.messages.lock().expect("messages lock").clone())
        }

        async fn get_status(
            &self,
            _session_id: &RemoteSessionId,
            _config: &SessionConfig,
        ) -> BackendSessionStatus {
            BackendSessionStatus::Idle
        }

        async fn respond_to_question(
            &self,
            _session_id: &RemoteSessionId,
            _answers: &[QuestionAnswer],
            _config: &SessionConfig,
        ) -> SessionResult<QuestionReplyOutcome> {
            Ok(QuestionReplyOutcome::NoPendingQuestion)
        }

        async fn destroy_session(&self, _session_id: &RemoteSessionId) -> SessionResult<()> {
            Ok(())
        }

        async fn stop_server(&self) -> SessionResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn poll_fetches_and_diffs_the_backend_log() {
        let messages = Arc::new(Mutex::new(vec![message(
            "msg-1",
            MessageRole::Assistant,
            vec![MessagePart::text("p-1", "hi")],
        )]));
        let backend = LogBackend {
            messages: Arc::clone(&messages),
        };
        let session_id = RemoteSessionId::new("ses-remote");
        let config = SessionConfig::new("http://127.0.0.1:4096");
        let mut reconciler = MessageReconciler::new();

        let first = reconciler
            .poll(&backend, &session_id, &config)
            .await
            .expect("first poll");
        let idle = reconciler
            .poll(&backend, &session_id, &config)
            .await
            .expect("idle poll");
        messages
            .lock()
            .expect("messages lock")
            .push(message(
                "msg-2",
                MessageRole::Assistant,
                vec![MessagePart::text("p-2", "more")],
            ));
        let third = reconciler
            .poll(&backend, &session_id, &config)
            .await
            .expect("third poll");

        assert_eq!(first.len(), 1);
        assert!(idle.is_empty());
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].message_id, MessageId::new("msg-2"));
    }
}
