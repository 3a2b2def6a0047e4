//! Per-task session state: identity, status machine, transcript merge and
//! pending approvals.

pub mod registry;
pub mod state;

pub use registry::{SessionSnapshot, SessionStateStore};
pub use state::{transition_allowed, StatusTransition};

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskdeck_protocol::{
        AgentId, LocalSessionId, Message, MessageId, MessagePart, MessageRole, PartChange,
        PartEvent, PartId, PartKind, PendingApproval, RemoteSessionId, Session, SessionError,
        SessionStatus, TaskId, ToolPayload, ToolStatus,
    };

    use super::{transition_allowed, SessionStateStore, StatusTransition};

    fn session(task: &str, remote: &str) -> Session {
        Session {
            local_session_id: LocalSessionId::new(format!("local-{task}")),
            remote_session_id: RemoteSessionId::new(remote),
            agent_id: AgentId::new("agent-1"),
            task_id: TaskId::new(task),
            status: SessionStatus::Idle,
            base_url: "http://127.0.0.1:4096".to_owned(),
        }
    }

    fn text_event(message: &str, part: &str, text: &str, change: PartChange) -> PartEvent {
        PartEvent {
            message_id: MessageId::new(message),
            role: MessageRole::Assistant,
            part: MessagePart::text(part, text),
            change,
        }
    }

    fn history() -> Vec<Message> {
        vec![
            Message {
                id: MessageId::new("msg-1"),
                role: MessageRole::User,
                parts: vec![MessagePart::text("p-1", "start")],
            },
            Message {
                id: MessageId::new("msg-2"),
                role: MessageRole::Assistant,
                parts: vec![MessagePart {
                    id: PartId::new("p-2"),
                    kind: PartKind::Tool,
                    text: None,
                    tool: Some(ToolPayload {
                        tool: "todowrite".to_owned(),
                        call_id: None,
                        status: ToolStatus::Completed,
                        input: json!({"todos": [{"content": "write docs"}]}),
                        output: Some("ok".to_owned()),
                        interaction: Default::default(),
                    }),
                }],
            },
            Message {
                id: MessageId::new("msg-3"),
                role: MessageRole::Assistant,
                parts: vec![MessagePart::text("p-3", "done")],
            },
        ]
    }

    #[test]
    fn status_machine_edges() {
        use SessionStatus::{Error, Idle, WaitingApproval, Working};

        assert!(transition_allowed(Idle, Working));
        assert!(transition_allowed(Working, WaitingApproval));
        assert!(transition_allowed(WaitingApproval, Working));
        assert!(transition_allowed(Working, Idle));
        assert!(transition_allowed(Idle, Error));
        assert!(transition_allowed(WaitingApproval, Error));
        assert!(transition_allowed(Error, Idle));

        assert!(!transition_allowed(Idle, WaitingApproval));
        assert!(!transition_allowed(Error, Working));
    }

    #[test]
    fn set_status_rejects_invalid_transition_and_ignores_same_status() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        store.init_session(session("task-1", "ses-1"));

        assert_eq!(
            store.set_status(&task, SessionStatus::Idle).expect("same status"),
            None
        );
        let error = store
            .set_status(&task, SessionStatus::WaitingApproval)
            .expect_err("idle cannot wait for approval");
        assert!(matches!(error, SessionError::InvalidTransition(_)));

        assert_eq!(
            store
                .set_status(&task, SessionStatus::Working)
                .expect("idle to working"),
            Some(StatusTransition {
                from: SessionStatus::Idle,
                to: SessionStatus::Working,
            })
        );
        assert_eq!(store.status(&task), Some(SessionStatus::Working));
    }

    #[test]
    fn init_session_preserves_transcript_and_status_of_existing_entry() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        store.init_session(session("task-1", "ses-1"));
        store
            .set_status(&task, SessionStatus::Working)
            .expect("working");
        store
            .apply_events(&task, &[text_event("m", "p", "hi", PartChange::New)])
            .expect("apply");

        let mut refreshed = session("task-1", "ses-1");
        refreshed.local_session_id = LocalSessionId::new("local-refreshed");
        store.init_session(refreshed);

        let snapshot = store.snapshot(&task).expect("snapshot");
        assert_eq!(snapshot.session.status, SessionStatus::Working);
        assert_eq!(
            snapshot.session.local_session_id,
            LocalSessionId::new("local-refreshed")
        );
        assert_eq!(snapshot.transcript.len(), 1);
    }

    #[test]
    fn apply_events_appends_new_parts_and_replaces_updates_in_place() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        store.init_session(session("task-1", "ses-1"));

        let first = vec![
            text_event("msg-1", "p-1", "hello", PartChange::New),
            text_event("msg-1", "p-2", "second", PartChange::New),
        ];
        assert_eq!(store.apply_events(&task, &first).expect("apply"), 2);
        assert_eq!(store.apply_events(&task, &first).expect("replay"), 0);

        let update = vec![text_event("msg-1", "p-1", "hello world!", PartChange::Updated)];
        assert_eq!(store.apply_events(&task, &update).expect("update"), 1);

        let snapshot = store.snapshot(&task).expect("snapshot");
        assert_eq!(snapshot.transcript.len(), 1);
        let parts = &snapshot.transcript[0].parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id, PartId::new("p-1"));
        assert_eq!(parts[0].text.as_deref(), Some("hello world!"));
        assert_eq!(parts[1].id, PartId::new("p-2"));
    }

    #[test]
    fn resumed_session_seeds_seen_state_and_transcript() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        let history = history();
        store.init_resumed_session(session("task-1", "ses-1"), &history);

        let events = store.reconcile(&task, &history).expect("reconcile");
        assert!(events.is_empty());

        let snapshot = store.snapshot(&task).expect("snapshot");
        assert_eq!(snapshot.transcript.len(), 3);
        assert_eq!(snapshot.transcript[1].parts[0].kind, PartKind::TodoWrite);
    }

    #[test]
    fn new_remote_session_clears_seen_state() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        let history = history();
        store.init_resumed_session(session("task-1", "ses-1"), &history);

        store.init_session(session("task-1", "ses-2"));
        let events = store.reconcile(&task, &history).expect("reconcile");
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn pending_approval_is_set_once_per_part_and_cleared_on_idle() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("task-1");
        store.init_session(session("task-1", "ses-1"));
        let approval = PendingApproval {
            part_id: PartId::new("p-q"),
            call_id: Some("call-q".to_owned()),
            questions: Vec::new(),
        };

        assert!(store
            .set_pending_approval(&task, approval.clone())
            .expect("set approval"));
        assert!(!store
            .set_pending_approval(&task, approval.clone())
            .expect("repeat approval"));
        assert_eq!(store.pending_approval(&task), Some(&approval));

        store.set_status(&task, SessionStatus::Working).expect("working");
        store
            .set_status(&task, SessionStatus::WaitingApproval)
            .expect("waiting");
        store.set_status(&task, SessionStatus::Idle).expect("idle");
        assert_eq!(store.pending_approval(&task), None);
    }

    #[test]
    fn unknown_task_operations_report_session_not_found() {
        let mut store = SessionStateStore::new();
        let task = TaskId::new("missing");

        assert!(matches!(
            store.apply_events(&task, &[]),
            Err(SessionError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.set_status(&task, SessionStatus::Working),
            Err(SessionError::SessionNotFound(_))
        ));
        assert_eq!(store.clear_pending_approval(&task), None);
        assert_eq!(store.remove_session(&task), None);
    }

    #[test]
    fn task_lookup_by_local_session_and_removal() {
        let mut store = SessionStateStore::new();
        store.init_session(session("task-1", "ses-1"));
        store.init_session(session("task-2", "ses-2"));

        assert_eq!(
            store.task_for_session(&LocalSessionId::new("local-task-2")),
            Some(TaskId::new("task-2"))
        );
        assert_eq!(store.len(), 2);

        let removed = store
            .remove_session(&TaskId::new("task-2"))
            .expect("removed session");
        assert_eq!(removed.remote_session_id, RemoteSessionId::new("ses-2"));
        assert_eq!(
            store.task_for_session(&LocalSessionId::new("local-task-2")),
            None
        );
        assert_eq!(store.list_sessions().len(), 1);
    }
}
