use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use taskdeck_eventbus::{SessionEventBus, SessionEventEnvelope};
use taskdeck_protocol::{
    AgentBackend, AgentId, ApprovalRequestEvent, LocalSessionId, Message, OutputEvent, PartEvent,
    PendingApproval, PromptPart, QuestionAnswer, QuestionReplyOutcome, RemoteSessionId, Session,
    SessionConfig, SessionError, SessionEvent, SessionResult, SessionStatus, StatusEvent, TaskId,
    ToolStatus,
};
use taskdeck_scheduler::{Admission, ConcurrencyScheduler, ConcurrencySlot};
use taskdeck_session_store::{SessionSnapshot, SessionStateStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::settings::SessionRuntimeConfig;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStart {
    Started(LocalSessionId),
    /// One-based position in the agent's queue.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
struct QueuedStart {
    agent_id: AgentId,
    resume: Option<RemoteSessionId>,
}

struct Poller {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

type StartFuture = Shared<BoxFuture<'static, SessionResult<SessionStart>>>;

/// A start in progress for one task. Concurrent starts for the task await
/// the same future.
struct PendingStart {
    generation: u64,
    future: StartFuture,
}

struct RuntimeInner {
    backend: Arc<dyn AgentBackend>,
    config: SessionRuntimeConfig,
    store: Mutex<SessionStateStore>,
    scheduler: Mutex<ConcurrencyScheduler>,
    events: SessionEventBus,
    pollers: Mutex<HashMap<TaskId, Poller>>,
    queued: Mutex<HashMap<TaskId, QueuedStart>>,
    starting: Mutex<HashMap<TaskId, PendingStart>>,
    next_session: AtomicU64,
    next_start: AtomicU64,
}

/// Drives agent sessions for tasks: admission, creation or resumption, one
/// poll loop per running session, and the event stream the UI consumes.
///
/// Store and scheduler locks are never held across an await. At most one
/// start per task is in progress at a time.
#[derive(Clone)]
pub struct SessionRuntime {
    inner: Arc<RuntimeInner>,
}

impl SessionRuntime {
    pub fn new(backend: Arc<dyn AgentBackend>, config: SessionRuntimeConfig) -> Self {
        let events = SessionEventBus::new(config.events);
        let scheduler = ConcurrencyScheduler::new(config.scheduler_enabled);
        Self {
            inner: Arc::new(RuntimeInner {
                backend,
                config,
                store: Mutex::new(SessionStateStore::new()),
                scheduler: Mutex::new(scheduler),
                events,
                pollers: Mutex::new(HashMap::new()),
                queued: Mutex::new(HashMap::new()),
                starting: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(0),
                next_start: AtomicU64::new(0),
            }),
        }
    }

    pub async fn start_session(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
    ) -> SessionResult<SessionStart> {
        self.request_start(agent_id, task_id, None).await
    }

    /// Like [`SessionRuntime::start_session`], but attaches to an existing
    /// remote conversation whose history is not replayed as new output.
    pub async fn resume_session(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        remote_session_id: &RemoteSessionId,
    ) -> SessionResult<SessionStart> {
        self.request_start(agent_id, task_id, Some(remote_session_id.clone()))
            .await
    }

    pub async fn stop_session(&self, session_id: &LocalSessionId) -> SessionResult<()> {
        let task_id = lock(&self.inner.store)
            .task_for_session(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(format!("unknown session {session_id}")))?;
        self.stop_task(&task_id).await
    }

    /// Stops the task's session, or withdraws its start if it is still
    /// queued. Local state is removed even when the remote stop fails.
    pub async fn stop_task(&self, task_id: &TaskId) -> SessionResult<()> {
        let queued = lock(&self.inner.queued).remove(task_id);
        if let Some(queued) = queued {
            lock(&self.inner.scheduler).withdraw(&queued.agent_id, task_id);
            self.inner.events.remove_task(task_id);
            tracing::info!(task_id = task_id.as_str(), "withdrew queued session start");
            return Ok(());
        }

        let poller = lock(&self.inner.pollers).remove(task_id);
        if let Some(poller) = poller {
            stop_poller(task_id, poller).await;
        }

        let session = lock(&self.inner.store)
            .session(task_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(format!("no session for task {task_id}")))?;

        self.inner
            .backend
            .abort_prompt(&session.remote_session_id)
            .await;
        if let Err(error) = self
            .inner
            .backend
            .destroy_session(&session.remote_session_id)
            .await
        {
            tracing::warn!(
                task_id = task_id.as_str(),
                session_id = session.local_session_id.as_str(),
                error = %error,
                "remote session stop failed; removing local state anyway"
            );
        }

        {
            let mut store = lock(&self.inner.store);
            let _ = self.apply_status(
                &mut store,
                task_id,
                SessionStatus::Idle,
                Some("session stopped"),
            );
            store.remove_session(task_id);
        }
        self.inner.events.remove_task(task_id);
        tracing::info!(
            task_id = task_id.as_str(),
            session_id = session.local_session_id.as_str(),
            "task session stopped"
        );

        self.release_slot(&session.agent_id).await;
        Ok(())
    }

    pub async fn send_message(&self, session_id: &LocalSessionId, text: &str) -> SessionResult<()> {
        let (task_id, session, config) = self.resolve_session(session_id)?;
        {
            let mut store = lock(&self.inner.store);
            self.apply_status(&mut store, &task_id, SessionStatus::Working, None)?;
        }

        let result = self
            .inner
            .backend
            .send_prompt(
                &session.remote_session_id,
                vec![PromptPart::text(text)],
                &config,
            )
            .await;
        if let Err(error) = result {
            let reason = error.to_string();
            let mut store = lock(&self.inner.store);
            let _ = self.apply_status(&mut store, &task_id, SessionStatus::Error, Some(&reason));
            return Err(error);
        }
        Ok(())
    }

    /// Answers every pending question with `message`, or with `yes`/`no`
    /// when no message is given.
    pub async fn approve(
        &self,
        session_id: &LocalSessionId,
        approved: bool,
        message: Option<&str>,
    ) -> SessionResult<QuestionReplyOutcome> {
        let (task_id, _, _) = self.resolve_session(session_id)?;
        let pending = lock(&self.inner.store).pending_approval(&task_id).cloned();
        let Some(pending) = pending else {
            tracing::debug!(
                session_id = session_id.as_str(),
                "approval given with no pending question"
            );
            return Ok(QuestionReplyOutcome::NoPendingQuestion);
        };

        let value = message
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| if approved { "yes" } else { "no" }.to_owned());
        let answers = pending
            .questions
            .iter()
            .map(|question| {
                let key = if question.header.trim().is_empty() {
                    question.question.clone()
                } else {
                    question.header.clone()
                };
                QuestionAnswer::new(key, value.clone())
            })
            .collect();
        self.answer_question(session_id, answers).await
    }

    pub async fn answer_question(
        &self,
        session_id: &LocalSessionId,
        answers: Vec<QuestionAnswer>,
    ) -> SessionResult<QuestionReplyOutcome> {
        let (task_id, session, config) = self.resolve_session(session_id)?;
        let outcome = match self
            .inner
            .backend
            .respond_to_question(&session.remote_session_id, &answers, &config)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    task_id = task_id.as_str(),
                    session_id = session_id.as_str(),
                    error = %error,
                    "question reply failed; question left pending"
                );
                return Ok(QuestionReplyOutcome::Undelivered {
                    reason: error.to_string(),
                });
            }
        };

        let mut store = lock(&self.inner.store);
        store.clear_pending_approval(&task_id);
        if store.status(&task_id) == Some(SessionStatus::WaitingApproval) {
            let _ = self.apply_status(
                &mut store,
                &task_id,
                SessionStatus::Working,
                Some("question answered"),
            );
        }
        Ok(outcome)
    }

    pub fn subscribe_task(&self, task_id: &TaskId) -> broadcast::Receiver<SessionEventEnvelope> {
        self.inner.events.subscribe_task(task_id.clone())
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<SessionEventEnvelope> {
        self.inner.events.subscribe_all()
    }

    pub fn snapshot(&self, task_id: &TaskId) -> Option<SessionSnapshot> {
        lock(&self.inner.store).snapshot(task_id)
    }

    pub fn session_for_task(&self, task_id: &TaskId) -> Option<Session> {
        lock(&self.inner.store).session(task_id).cloned()
    }

    pub fn status(&self, task_id: &TaskId) -> Option<SessionStatus> {
        lock(&self.inner.store).status(task_id)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        lock(&self.inner.store).list_sessions()
    }

    pub fn scheduler_slot(&self, agent_id: &AgentId) -> Option<ConcurrencySlot> {
        lock(&self.inner.scheduler).slot(agent_id)
    }

    /// Disabling abandons every queued start.
    pub fn set_scheduler_enabled(&self, enabled: bool) {
        lock(&self.inner.scheduler).set_enabled(enabled);
        if !enabled {
            lock(&self.inner.queued).clear();
        }
    }

    /// Stops every poll loop and the backend. Session state is kept.
    pub async fn shutdown(&self) -> SessionResult<()> {
        let pollers = lock(&self.inner.pollers)
            .drain()
            .collect::<Vec<_>>();
        for (task_id, poller) in pollers {
            stop_poller(&task_id, poller).await;
        }
        self.inner.backend.stop_server().await
    }

    async fn request_start(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        resume: Option<RemoteSessionId>,
    ) -> SessionResult<SessionStart> {
        let runtime = self.clone();
        let agent_id = agent_id.clone();
        let owned_task_id = task_id.clone();
        self.single_flight(task_id, move || {
            async move {
                runtime
                    .admit_and_launch(&agent_id, &owned_task_id, resume)
                    .await
            }
            .boxed()
        })
        .await
    }

    /// Joins the start already in progress for `task_id`, reports the running
    /// session, or begins a new start with `begin`.
    async fn single_flight(
        &self,
        task_id: &TaskId,
        begin: impl FnOnce() -> BoxFuture<'static, SessionResult<SessionStart>>,
    ) -> SessionResult<SessionStart> {
        let (generation, future) = {
            let mut starting = lock(&self.inner.starting);
            match starting.get(task_id) {
                Some(pending) => (pending.generation, pending.future.clone()),
                None => {
                    if let Some(session_id) = self.running_session(task_id) {
                        return Ok(SessionStart::Started(session_id));
                    }
                    let generation = self.inner.next_start.fetch_add(1, Ordering::Relaxed);
                    let future = begin().shared();
                    starting.insert(
                        task_id.clone(),
                        PendingStart {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let result = future.await;
        let mut starting = lock(&self.inner.starting);
        if starting
            .get(task_id)
            .is_some_and(|pending| pending.generation == generation)
        {
            starting.remove(task_id);
        }
        result
    }

    async fn admit_and_launch(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        resume: Option<RemoteSessionId>,
    ) -> SessionResult<SessionStart> {
        let limit = self.inner.config.limit_for(agent_id);
        let admission = lock(&self.inner.scheduler).request_start(agent_id, task_id, limit);
        match admission {
            Admission::Queued { position } => {
                lock(&self.inner.queued).insert(
                    task_id.clone(),
                    QueuedStart {
                        agent_id: agent_id.clone(),
                        resume,
                    },
                );
                tracing::info!(
                    agent_id = agent_id.as_str(),
                    task_id = task_id.as_str(),
                    position,
                    "session start queued"
                );
                Ok(SessionStart::Queued { position })
            }
            Admission::Admitted => match self.launch(agent_id, task_id, resume.as_ref()).await {
                Ok(session_id) => {
                    self.spawn_poller(task_id);
                    Ok(SessionStart::Started(session_id))
                }
                Err(error) => {
                    self.fail_start(task_id, &error);
                    self.release_slot(agent_id).await;
                    Err(error)
                }
            },
        }
    }

    fn running_session(&self, task_id: &TaskId) -> Option<LocalSessionId> {
        if !lock(&self.inner.pollers).contains_key(task_id) {
            return None;
        }
        lock(&self.inner.store)
            .session(task_id)
            .map(|session| session.local_session_id.clone())
    }

    async fn launch(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        resume: Option<&RemoteSessionId>,
    ) -> SessionResult<LocalSessionId> {
        let config = self.inner.config.session_config(agent_id, task_id);
        let local_session_id = LocalSessionId::new(format!(
            "session-{}",
            self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1
        ));

        match resume {
            Some(remote_session_id) => {
                let resumed = self
                    .inner
                    .backend
                    .resume_session(remote_session_id, &config)
                    .await?;
                let session = Session {
                    local_session_id: local_session_id.clone(),
                    remote_session_id: resumed.remote_session_id,
                    agent_id: agent_id.clone(),
                    task_id: task_id.clone(),
                    status: SessionStatus::Idle,
                    base_url: resumed.base_url,
                };
                lock(&self.inner.store).init_resumed_session(session, &resumed.history);
                tracing::info!(
                    task_id = task_id.as_str(),
                    session_id = local_session_id.as_str(),
                    remote_session_id = remote_session_id.as_str(),
                    history = resumed.history.len(),
                    "resumed task session"
                );
            }
            None => {
                let created = self.inner.backend.create_session(&config).await?;
                tracing::info!(
                    task_id = task_id.as_str(),
                    session_id = local_session_id.as_str(),
                    remote_session_id = created.remote_session_id.as_str(),
                    "started task session"
                );
                let session = Session {
                    local_session_id: local_session_id.clone(),
                    remote_session_id: created.remote_session_id,
                    agent_id: agent_id.clone(),
                    task_id: task_id.clone(),
                    status: SessionStatus::Idle,
                    base_url: created.base_url,
                };
                lock(&self.inner.store).init_session(session);
            }
        }
        Ok(local_session_id)
    }

    fn fail_start(&self, task_id: &TaskId, error: &SessionError) {
        tracing::warn!(task_id = task_id.as_str(), error = %error, "session failed to start");
        let reason = error.to_string();
        let mut store = lock(&self.inner.store);
        if store.session(task_id).is_some() {
            let _ = self.apply_status(&mut store, task_id, SessionStatus::Error, Some(&reason));
            return;
        }
        self.inner.events.publish(SessionEvent::Status(StatusEvent {
            task_id: task_id.clone(),
            session_id: None,
            from: SessionStatus::Idle,
            to: SessionStatus::Error,
            reason: Some(reason),
        }));
    }

    /// Ends one running session for `agent_id` and starts whatever the
    /// scheduler admits next. A task that fails to start gives its slot to
    /// the task after it.
    async fn release_slot(&self, agent_id: &AgentId) {
        loop {
            let next = lock(&self.inner.scheduler).on_session_end(agent_id);
            let Some(task_id) = next else {
                return;
            };
            let resume = lock(&self.inner.queued)
                .remove(&task_id)
                .and_then(|queued| queued.resume);
            lock(&self.inner.scheduler).admit(agent_id);

            match self.launch_handed_off(agent_id, &task_id, resume).await {
                Ok(session_id) => {
                    tracing::info!(
                        agent_id = agent_id.as_str(),
                        task_id = task_id.as_str(),
                        session_id = session_id.as_str(),
                        "started queued session"
                    );
                    return;
                }
                Err(error) => self.fail_start(&task_id, &error),
            }
        }
    }

    /// Launches a task the scheduler has already counted as running. A start
    /// that reported the task as queued before the hand-off is waited out and
    /// the launch retried.
    async fn launch_handed_off(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        resume: Option<RemoteSessionId>,
    ) -> SessionResult<LocalSessionId> {
        loop {
            let runtime = self.clone();
            let launch_agent_id = agent_id.clone();
            let launch_task_id = task_id.clone();
            let launch_resume = resume.clone();
            let started = self
                .single_flight(task_id, move || {
                    async move {
                        let session_id = runtime
                            .launch(&launch_agent_id, &launch_task_id, launch_resume.as_ref())
                            .await?;
                        runtime.spawn_poller(&launch_task_id);
                        Ok::<_, SessionError>(SessionStart::Started(session_id))
                    }
                    .boxed()
                })
                .await?;
            if let SessionStart::Started(session_id) = started {
                return Ok(session_id);
            }
        }
    }

    fn resolve_session(
        &self,
        session_id: &LocalSessionId,
    ) -> SessionResult<(TaskId, Session, SessionConfig)> {
        let store = lock(&self.inner.store);
        let session = store
            .task_for_session(session_id)
            .and_then(|task_id| store.session(&task_id).cloned())
            .ok_or_else(|| SessionError::SessionNotFound(format!("unknown session {session_id}")))?;
        let config = self
            .inner
            .config
            .session_config(&session.agent_id, &session.task_id);
        Ok((session.task_id.clone(), session, config))
    }

    /// Moves the task's status and publishes the transition. A same-status
    /// request publishes nothing.
    fn apply_status(
        &self,
        store: &mut SessionStateStore,
        task_id: &TaskId,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> SessionResult<()> {
        let Some(transition) = store.set_status(task_id, to)? else {
            return Ok(());
        };
        let session_id = store
            .session(task_id)
            .map(|session| session.local_session_id.clone());
        self.inner.events.publish(SessionEvent::Status(StatusEvent {
            task_id: task_id.clone(),
            session_id,
            from: transition.from,
            to: transition.to,
            reason: reason.map(str::to_owned),
        }));
        Ok(())
    }

    fn spawn_poller(&self, task_id: &TaskId) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let poll_interval = self.inner.config.poll_interval.max(MIN_POLL_INTERVAL);

        let runtime = self.clone();
        let poll_task_id = task_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            keep_polling = runtime.poll_once(&poll_task_id) => {
                                if !keep_polling {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!(task_id = poll_task_id.as_str(), "session poll loop stopped");
        });

        let previous = lock(&self.inner.pollers).insert(
            task_id.clone(),
            Poller { shutdown_tx, task },
        );
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(true);
            previous.task.abort();
        }
    }

    /// One poll pass: fetch, reconcile, merge and publish, then turn-end
    /// detection. Returns `false` once the task has no session left.
    ///
    /// A working session's turn has ended once the backend reports idle and
    /// no prompt request is outstanding.
    async fn poll_once(&self, task_id: &TaskId) -> bool {
        let Some(session) = self.session_for_task(task_id) else {
            return false;
        };
        let config = self
            .inner
            .config
            .session_config(&session.agent_id, task_id);

        let messages = match self
            .inner
            .backend
            .fetch_messages(&session.remote_session_id, &config)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::debug!(
                    task_id = task_id.as_str(),
                    error = %error,
                    "session poll failed; retrying on next tick"
                );
                return true;
            }
        };
        if !self.merge_messages(&session, &messages) {
            return false;
        }

        let backend_status = self
            .inner
            .backend
            .get_status(&session.remote_session_id, &config)
            .await;
        if backend_status.is_active()
            || self
                .inner
                .backend
                .prompt_in_flight(&session.remote_session_id)
        {
            return true;
        }
        let mut store = lock(&self.inner.store);
        if store.status(task_id) == Some(SessionStatus::Working) {
            let _ = self.apply_status(
                &mut store,
                task_id,
                SessionStatus::Idle,
                Some("turn finished"),
            );
        }
        true
    }

    fn merge_messages(&self, session: &Session, messages: &[Message]) -> bool {
        let task_id = &session.task_id;
        let mut store = lock(&self.inner.store);
        let events = match store.reconcile(task_id, messages) {
            Ok(events) => events,
            Err(_) => return false,
        };
        if events.is_empty() {
            return true;
        }
        if let Err(error) = store.apply_events(task_id, &events) {
            tracing::debug!(task_id = task_id.as_str(), error = %error, "transcript merge failed");
            return false;
        }
        tracing::trace!(task_id = task_id.as_str(), events = events.len(), "merged session output");

        for event in events {
            self.track_question(&mut store, session, &event);
            self.inner.events.publish(SessionEvent::Output(OutputEvent {
                task_id: task_id.clone(),
                session_id: session.local_session_id.clone(),
                part: event,
            }));
        }
        true
    }

    fn track_question(&self, store: &mut SessionStateStore, session: &Session, event: &PartEvent) {
        let task_id = &session.task_id;
        let Some(questions) = event.part.questions() else {
            return;
        };
        let Some(tool) = event.part.tool.as_ref() else {
            return;
        };

        if matches!(tool.status, ToolStatus::Completed | ToolStatus::Error) {
            let was_pending = store
                .pending_approval(task_id)
                .is_some_and(|pending| pending.part_id == event.part.id);
            if was_pending {
                store.clear_pending_approval(task_id);
                if store.status(task_id) == Some(SessionStatus::WaitingApproval) {
                    let _ = self.apply_status(
                        store,
                        task_id,
                        SessionStatus::Working,
                        Some("question resolved"),
                    );
                }
            }
            return;
        }

        let approval = PendingApproval {
            part_id: event.part.id.clone(),
            call_id: tool.call_id.clone(),
            questions: questions.to_vec(),
        };
        if !matches!(store.set_pending_approval(task_id, approval.clone()), Ok(true)) {
            return;
        }
        if store.status(task_id) == Some(SessionStatus::Idle) {
            let _ = self.apply_status(
                store,
                task_id,
                SessionStatus::Working,
                Some("question pending"),
            );
        }
        if let Err(error) = self.apply_status(
            store,
            task_id,
            SessionStatus::WaitingApproval,
            Some("question pending"),
        ) {
            tracing::debug!(task_id = task_id.as_str(), error = %error, "question left unflagged");
        }
        self.inner
            .events
            .publish(SessionEvent::ApprovalRequest(ApprovalRequestEvent {
                task_id: task_id.clone(),
                session_id: session.local_session_id.clone(),
                approval,
            }));
    }
}

async fn stop_poller(task_id: &TaskId, poller: Poller) {
    let _ = poller.shutdown_tx.send(true);
    if let Err(error) = poller.task.await {
        if !error.is_cancelled() {
            tracing::warn!(task_id = task_id.as_str(), error = %error, "session poll loop failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
