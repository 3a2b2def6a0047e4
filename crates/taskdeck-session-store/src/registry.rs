use std::collections::hash_map::Entry;
use std::collections::HashMap;

use taskdeck_protocol::{
    LocalSessionId, Message, PartEvent, PartId, PendingApproval, Session, SessionError,
    SessionResult, SessionStatus, TaskId,
};
use taskdeck_reconciler::{classify_messages, reconcile, SeenState};

use crate::state::{check_transition, StatusTransition};

/// Cloned view of one task's session for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session: Session,
    pub transcript: Vec<Message>,
    pub pending_approval: Option<PendingApproval>,
}

#[derive(Debug, Clone)]
struct TaskSessionEntry {
    session: Session,
    transcript: Vec<Message>,
    part_index: HashMap<PartId, (usize, usize)>,
    pending_approval: Option<PendingApproval>,
    seen: SeenState,
}

impl TaskSessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            transcript: Vec::new(),
            part_index: HashMap::new(),
            pending_approval: None,
            seen: SeenState::default(),
        }
    }

    fn replace_transcript(&mut self, transcript: Vec<Message>) {
        self.part_index.clear();
        for (message_index, message) in transcript.iter().enumerate() {
            for (part_index, part) in message.parts.iter().enumerate() {
                self.part_index
                    .insert(part.id.clone(), (message_index, part_index));
            }
        }
        self.transcript = transcript;
    }

    fn merge(&mut self, event: &PartEvent) -> bool {
        if let Some(&(message_index, part_index)) = self.part_index.get(&event.part.id) {
            let slot = &mut self.transcript[message_index].parts[part_index];
            if *slot == event.part {
                return false;
            }
            *slot = event.part.clone();
            return true;
        }

        let message_index = match self
            .transcript
            .iter()
            .position(|message| message.id == event.message_id)
        {
            Some(index) => index,
            None => {
                self.transcript.push(Message {
                    id: event.message_id.clone(),
                    role: event.role,
                    parts: Vec::new(),
                });
                self.transcript.len() - 1
            }
        };
        let parts = &mut self.transcript[message_index].parts;
        parts.push(event.part.clone());
        self.part_index
            .insert(event.part.id.clone(), (message_index, parts.len() - 1));
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            transcript: self.transcript.clone(),
            pending_approval: self.pending_approval.clone(),
        }
    }
}

/// Per-task session registry: identity, status, transcript, pending approval
/// and the reconciler's seen state.
#[derive(Debug, Default)]
pub struct SessionStateStore {
    sessions: HashMap<TaskId, TaskSessionEntry>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the task's entry, or refreshes its identity while keeping the
    /// existing transcript and status. Seen state starts over when the remote
    /// session differs from the tracked one.
    pub fn init_session(&mut self, session: Session) -> &Session {
        match self.sessions.entry(session.task_id.clone()) {
            Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.session.remote_session_id != session.remote_session_id {
                    entry.seen.clear();
                }
                let status = entry.session.status;
                entry.session = Session { status, ..session };
                &entry.session
            }
            Entry::Vacant(slot) => &slot.insert(TaskSessionEntry::new(session)).session,
        }
    }

    /// Initializes from an existing remote conversation. `history` becomes the
    /// transcript and seeds the seen state so later polls only report what
    /// happened after the resume.
    pub fn init_resumed_session(&mut self, session: Session, history: &[Message]) -> &Session {
        let task_id = session.task_id.clone();
        let status = self
            .sessions
            .get(&task_id)
            .map(|entry| entry.session.status)
            .unwrap_or(session.status);
        let mut entry = TaskSessionEntry::new(Session { status, ..session });
        entry.seen = SeenState::seeded(history);
        entry.replace_transcript(classify_messages(history));
        self.sessions.insert(task_id.clone(), entry);
        &self.sessions[&task_id].session
    }

    /// Diffs a freshly fetched message log against the task's seen state.
    pub fn reconcile(
        &mut self,
        task_id: &TaskId,
        messages: &[Message],
    ) -> SessionResult<Vec<PartEvent>> {
        let entry = self.entry_mut(task_id)?;
        Ok(reconcile(messages, &mut entry.seen))
    }

    /// Merges events into the transcript keyed by part id. Returns how many
    /// events changed the transcript; replaying events is a no-op.
    pub fn apply_events(&mut self, task_id: &TaskId, events: &[PartEvent]) -> SessionResult<usize> {
        let entry = self.entry_mut(task_id)?;
        Ok(events.iter().filter(|event| entry.merge(event)).count())
    }

    pub fn set_status(
        &mut self,
        task_id: &TaskId,
        status: SessionStatus,
    ) -> SessionResult<Option<StatusTransition>> {
        let entry = self.entry_mut(task_id)?;
        let transition = check_transition(entry.session.status, status)?;
        if transition.is_some() {
            entry.session.status = status;
            if status == SessionStatus::Idle {
                entry.pending_approval = None;
            }
        }
        Ok(transition)
    }

    pub fn status(&self, task_id: &TaskId) -> Option<SessionStatus> {
        self.sessions.get(task_id).map(|entry| entry.session.status)
    }

    /// Returns `false` when the same question part is already pending.
    pub fn set_pending_approval(
        &mut self,
        task_id: &TaskId,
        approval: PendingApproval,
    ) -> SessionResult<bool> {
        let entry = self.entry_mut(task_id)?;
        if entry
            .pending_approval
            .as_ref()
            .is_some_and(|pending| pending.part_id == approval.part_id)
        {
            return Ok(false);
        }
        entry.pending_approval = Some(approval);
        Ok(true)
    }

    pub fn clear_pending_approval(&mut self, task_id: &TaskId) -> Option<PendingApproval> {
        self.sessions
            .get_mut(task_id)
            .and_then(|entry| entry.pending_approval.take())
    }

    pub fn pending_approval(&self, task_id: &TaskId) -> Option<&PendingApproval> {
        self.sessions
            .get(task_id)
            .and_then(|entry| entry.pending_approval.as_ref())
    }

    pub fn session(&self, task_id: &TaskId) -> Option<&Session> {
        self.sessions.get(task_id).map(|entry| &entry.session)
    }

    pub fn task_for_session(&self, session_id: &LocalSessionId) -> Option<TaskId> {
        self.sessions
            .values()
            .find(|entry| &entry.session.local_session_id == session_id)
            .map(|entry| entry.session.task_id.clone())
    }

    pub fn snapshot(&self, task_id: &TaskId) -> Option<SessionSnapshot> {
        self.sessions.get(task_id).map(TaskSessionEntry::snapshot)
    }

    pub fn remove_session(&mut self, task_id: &TaskId) -> Option<Session> {
        let entry = self.sessions.remove(task_id)?;
        tracing::debug!(
            task_id = task_id.as_str(),
            session_id = entry.session.local_session_id.as_str(),
            transcript_messages = entry.transcript.len(),
            "removed task session state"
        );
        Some(entry.session)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn entry_mut(&mut self, task_id: &TaskId) -> SessionResult<&mut TaskSessionEntry> {
        self.sessions
            .get_mut(task_id)
            .ok_or_else(|| SessionError::SessionNotFound(format!("no session for task {task_id}")))
    }
}
