use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use taskdeck_protocol::{
    AgentBackend, BackendSessionStatus, CreatedSession, McpServerSpec, Message, PromptPart,
    QuestionAnswer, QuestionReplyOutcome, RemoteSessionId, ResumedSession, SessionConfig,
    SessionError, SessionResult,
};
use tokio_util::sync::CancellationToken;

use crate::locator::ServerLocator;
use crate::sanitize_error_body;
use crate::wire::{
    session_status_from_map, CreateSessionRequest, McpServerRequest, PendingQuestion,
    PendingQuestionRequest, PromptRequest, QuestionReplyRequest, SessionInfo, WireMessage,
    WireModel,
};

struct PromptSlot {
    generation: u64,
    token: CancellationToken,
}

/// [`AgentBackend`] over the OpenCode HTTP API.
///
/// Holds one HTTP client per resolved backend address and at most one
/// cancellable prompt per remote session.
#[derive(Clone)]
pub struct OpenCodeBridge {
    locator: ServerLocator,
    clients: Arc<Mutex<HashMap<String, reqwest::Client>>>,
    sessions: Arc<Mutex<HashMap<RemoteSessionId, String>>>,
    prompts: Arc<Mutex<HashMap<RemoteSessionId, PromptSlot>>>,
    next_prompt_generation: Arc<AtomicU64>,
}

impl OpenCodeBridge {
    pub fn new(locator: ServerLocator) -> Self {
        Self {
            locator,
            clients: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            prompts: Arc::new(Mutex::new(HashMap::new())),
            next_prompt_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn locator(&self) -> &ServerLocator {
        &self.locator
    }

    fn client_for(&self, base_url: &str) -> reqwest::Client {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(base_url.to_owned())
            .or_insert_with(reqwest::Client::new)
            .clone()
    }

    fn session_base_url(&self, session_id: &RemoteSessionId) -> Option<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn track_session(&self, session_id: &RemoteSessionId, base_url: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), base_url.to_owned());
    }

    /// Address for calls on a tracked session, resolving the configured
    /// address for sessions this bridge has not seen.
    async fn base_url_for(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<String> {
        match self.session_base_url(session_id) {
            Some(base_url) => Ok(base_url),
            None => self.locator.ensure_running(&config.base_url).await,
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        base_url: &str,
        path: &str,
        directory: Option<&Path>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .client_for(base_url)
            .request(method, format!("{base_url}{path}"));
        match directory {
            Some(directory) => builder.query(&[("directory", directory.to_string_lossy())]),
            None => builder,
        }
    }

    async fn register_mcp_server(
        &self,
        base_url: &str,
        server: &McpServerSpec,
        directory: Option<&Path>,
    ) -> SessionResult<()> {
        let body = McpServerRequest {
            name: server.name.as_str(),
            config: &server.config,
        };
        for path in ["/mcp/add", "/mcp/connect"] {
            let response = self
                .request(reqwest::Method::POST, base_url, path, directory)
                .json(&body)
                .send()
                .await
                .map_err(|error| {
                    SessionError::Transport(format!("{path} request failed: {error}"))
                })?;
            ensure_success(response, path).await?;
        }
        Ok(())
    }

    async fn load_messages(
        &self,
        base_url: &str,
        session_id: &RemoteSessionId,
        directory: Option<&Path>,
    ) -> SessionResult<Vec<Message>> {
        let path = format!("/session/{session_id}/messages");
        let response = self
            .request(reqwest::Method::GET, base_url, &path, directory)
            .send()
            .await
            .map_err(|error| {
                SessionError::Transport(format!("message fetch request failed: {error}"))
            })?;
        let response = ensure_success(response, "message fetch").await?;
        let messages: Vec<WireMessage> = read_json(response, "message fetch").await?;
        Ok(messages.into_iter().map(WireMessage::into_message).collect())
    }
}

#[async_trait]
impl AgentBackend for OpenCodeBridge {
    async fn create_session(&self, config: &SessionConfig) -> SessionResult<CreatedSession> {
        let base_url = self.locator.ensure_running(&config.base_url).await?;
        let directory = config.directory.as_deref();

        for server in &config.mcp_servers {
            if let Err(error) = self.register_mcp_server(&base_url, server, directory).await {
                tracing::warn!(
                    server = %server.name,
                    error = %error,
                    "tool server registration failed; continuing without it"
                );
            }
        }

        let response = self
            .request(reqwest::Method::POST, &base_url, "/session", directory)
            .json(&CreateSessionRequest {
                title: config.title.as_deref(),
            })
            .send()
            .await
            .map_err(|error| {
                SessionError::Transport(format!("session create request failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
            return Err(SessionError::Protocol(format!(
                "session create failed with status {status}: {body}"
            )));
        }
        let info: SessionInfo = read_json(response, "session create").await?;
        let remote_session_id = info
            .into_id()
            .map(RemoteSessionId::new)
            .map_err(|detail| {
                SessionError::Protocol(format!(
                    "session create returned no usable session: {}",
                    sanitize_error_body(&detail)
                ))
            })?;

        self.track_session(&remote_session_id, &base_url);
        tracing::info!(
            session_id = remote_session_id.as_str(),
            base_url = %base_url,
            "created backend session"
        );
        Ok(CreatedSession {
            remote_session_id,
            base_url,
        })
    }

    async fn resume_session(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<ResumedSession> {
        let base_url = self.locator.ensure_running(&config.base_url).await?;
        let directory = config.directory.as_deref();

        let response = self
            .request(
                reqwest::Method::GET,
                &base_url,
                &format!("/session/{session_id}"),
                directory,
            )
            .send()
            .await
            .map_err(|error| {
                SessionError::Transport(format!("session lookup request failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
            return Err(SessionError::SessionNotFound(format!(
                "{session_id} (status {status}): {body}"
            )));
        }
        let info: SessionInfo = read_json(response, "session lookup").await?;
        if let Err(detail) = info.into_id() {
            return Err(SessionError::SessionNotFound(format!(
                "{session_id}: {}",
                sanitize_error_body(&detail)
            )));
        }

        let history = self.load_messages(&base_url, session_id, directory).await?;
        self.track_session(session_id, &base_url);
        tracing::info!(
            session_id = session_id.as_str(),
            messages = history.len(),
            "resumed backend session"
        );
        Ok(ResumedSession {
            remote_session_id: session_id.clone(),
            base_url,
            history,
        })
    }

    async fn send_prompt(
        &self,
        session_id: &RemoteSessionId,
        parts: Vec<PromptPart>,
        config: &SessionConfig,
    ) -> SessionResult<()> {
        let base_url = self.base_url_for(session_id, config).await?;
        let request = self
            .request(
                reqwest::Method::POST,
                &base_url,
                &format!("/session/{session_id}/prompt"),
                config.directory.as_deref(),
            )
            .json(&PromptRequest {
                parts,
                model: config.model.as_ref().map(WireModel::from),
                tools: config.tools.clone(),
            });

        let generation = self.next_prompt_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let replaced = self
            .prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.clone(),
                PromptSlot {
                    generation,
                    token: token.clone(),
                },
            );
        if replaced.is_some() {
            tracing::debug!(
                session_id = session_id.as_str(),
                "prompt sent while another prompt is outstanding"
            );
        }

        let prompts = Arc::clone(&self.prompts);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                result = request.send() => Some(result),
            };
            match outcome {
                None => {
                    tracing::debug!(session_id = session_id.as_str(), "prompt cancelled");
                }
                Some(Ok(response)) if response.status().is_success() => {
                    tracing::debug!(session_id = session_id.as_str(), "prompt completed");
                }
                Some(Ok(response)) => {
                    let status = response.status();
                    let body =
                        sanitize_error_body(response.text().await.unwrap_or_default().as_str());
                    tracing::warn!(
                        session_id = session_id.as_str(),
                        status = %status,
                        body = %body,
                        "prompt request failed"
                    );
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        session_id = session_id.as_str(),
                        error = %error,
                        "prompt request failed"
                    );
                }
            }

            let mut prompts = prompts.lock().unwrap_or_else(PoisonError::into_inner);
            if prompts
                .get(&session_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                prompts.remove(&session_id);
            }
        });
        Ok(())
    }

    async fn abort_prompt(&self, session_id: &RemoteSessionId) -> bool {
        let slot = self
            .prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        match slot {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    fn prompt_in_flight(&self, session_id: &RemoteSessionId) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    async fn fetch_messages(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> SessionResult<Vec<Message>> {
        let base_url = self.base_url_for(session_id, config).await?;
        self.load_messages(&base_url, session_id, config.directory.as_deref())
            .await
    }

    async fn get_status(
        &self,
        session_id: &RemoteSessionId,
        config: &SessionConfig,
    ) -> BackendSessionStatus {
        let Some(base_url) = self.session_base_url(session_id) else {
            return BackendSessionStatus::Idle;
        };
        let response = self
            .request(
                reqwest::Method::GET,
                &base_url,
                "/session/status",
                config.directory.as_deref(),
            )
            .send()
            .await;
        let map = match response {
            Ok(response) if response.status().is_success() => {
                response.json::<Value>().await.unwrap_or(Value::Null)
            }
            Ok(response) => {
                tracing::debug!(
                    session_id = session_id.as_str(),
                    status = %response.status(),
                    "status lookup failed; reporting idle"
                );
                Value::Null
            }
            Err(error) => {
                tracing::debug!(
                    session_id = session_id.as_str(),
                    error = %error,
                    "status lookup failed; reporting idle"
                );
                Value::Null
            }
        };
        session_status_from_map(&map, session_id.as_str())
    }

    async fn respond_to_question(
        &self,
        session_id: &RemoteSessionId,
        answers: &[QuestionAnswer],
        config: &SessionConfig,
    ) -> SessionResult<QuestionReplyOutcome> {
        let base_url = self.base_url_for(session_id, config).await?;
        let directory = config.directory.as_deref();

        let response = self
            .request(reqwest::Method::GET, &base_url, "/questions", directory)
            .send()
            .await
            .map_err(|error| {
                SessionError::Transport(format!("pending question request failed: {error}"))
            })?;
        let response = ensure_success(response, "pending question fetch").await?;
        let pending: Vec<PendingQuestionRequest> =
            read_json(response, "pending question fetch").await?;

        let Some(request) = pending
            .into_iter()
            .find(|request| request.session_id == session_id.as_str())
        else {
            tracing::info!(
                session_id = session_id.as_str(),
                "no pending question for session; answer dropped"
            );
            return Ok(QuestionReplyOutcome::NoPendingQuestion);
        };

        let reply = QuestionReplyRequest {
            request_id: request.id.as_str(),
            answers: align_answers(&request.questions, answers),
        };
        let response = self
            .request(reqwest::Method::POST, &base_url, "/questions/reply", directory)
            .json(&reply)
            .send()
            .await
            .map_err(|error| {
                SessionError::Transport(format!("question reply request failed: {error}"))
            })?;
        ensure_success(response, "question reply").await?;
        Ok(QuestionReplyOutcome::Submitted {
            request_id: request.id,
        })
    }

    async fn destroy_session(&self, session_id: &RemoteSessionId) -> SessionResult<()> {
        self.abort_prompt(session_id).await;
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id = session_id.as_str(), "released backend session");
        }
        Ok(())
    }

    async fn stop_server(&self) -> SessionResult<()> {
        let slots = self
            .prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect::<Vec<_>>();
        for slot in slots {
            slot.token.cancel();
        }
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.locator.shutdown().await;
        Ok(())
    }
}

/// Orders caller answers by the question's declared order. Each question
/// takes the answer keyed by its header, else by its text, else the answer at
/// its position, else the first answer not yet used.
pub(crate) fn align_answers(
    questions: &[PendingQuestion],
    answers: &[QuestionAnswer],
) -> Vec<Vec<String>> {
    let mut used = vec![false; answers.len()];
    let mut assigned: Vec<Option<usize>> = vec![None; questions.len()];

    let claim = |used: &mut Vec<bool>, matches: &dyn Fn(&QuestionAnswer) -> bool| {
        let index = answers
            .iter()
            .enumerate()
            .position(|(index, answer)| !used[index] && matches(answer))?;
        used[index] = true;
        Some(index)
    };

    for (slot, question) in assigned.iter_mut().zip(questions) {
        let header = question.header.trim();
        if !header.is_empty() {
            *slot = claim(&mut used, &|answer| answer.key.trim() == header);
        }
    }
    for (slot, question) in assigned.iter_mut().zip(questions) {
        let text = question.question.trim();
        if slot.is_none() && !text.is_empty() {
            *slot = claim(&mut used, &|answer| answer.key.trim() == text);
        }
    }
    for (position, slot) in assigned.iter_mut().enumerate() {
        if slot.is_none() && position < used.len() && !used[position] {
            used[position] = true;
            *slot = Some(position);
        }
    }
    for slot in assigned.iter_mut() {
        if slot.is_none() {
            *slot = claim(&mut used, &|_| true);
        }
    }

    assigned
        .into_iter()
        .map(|slot| vec![slot.map(|index| answers[index].value.clone()).unwrap_or_default()])
        .collect()
}

async fn ensure_success(
    response: reqwest::Response,
    operation: &str,
) -> SessionResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = sanitize_error_body(response.text().await.unwrap_or_default().as_str());
    Err(SessionError::Transport(format!(
        "{operation} failed with status {status}: {body}"
    )))
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
) -> SessionResult<T> {
    let body = response.text().await.map_err(|error| {
        SessionError::Transport(format!("{operation} response body read failed: {error}"))
    })?;
    serde_json::from_str(&body).map_err(|error| {
        SessionError::Protocol(format!(
            "{operation} response parse failed: {error}; body: {}",
            sanitize_error_body(&body)
        ))
    })
}

#[cfg(test)]
mod tests {
    use taskdeck_protocol::QuestionAnswer;

    use super::align_answers;
    use crate::wire::PendingQuestion;

    fn question(header: &str, text: &str) -> PendingQuestion {
        PendingQuestion {
            header: header.to_owned(),
            question: text.to_owned(),
        }
    }

    #[test]
    fn answers_follow_question_order_by_header() {
        let questions = vec![question("Scope", "Which files?"), question("Tests", "Run tests?")];
        let answers = vec![
            QuestionAnswer::new("Tests", "yes"),
            QuestionAnswer::new("Scope", "src only"),
        ];

        assert_eq!(
            align_answers(&questions, &answers),
            vec![vec!["src only".to_owned()], vec!["yes".to_owned()]]
        );
    }

    #[test]
    fn question_text_matches_when_header_does_not() {
        let questions = vec![question("", "Which files?"), question("Tests", "Run tests?")];
        let answers = vec![
            QuestionAnswer::new("Run tests?", "no"),
            QuestionAnswer::new("Which files?", "all"),
        ];

        assert_eq!(
            align_answers(&questions, &answers),
            vec![vec!["all".to_owned()], vec!["no".to_owned()]]
        );
    }

    #[test]
    fn unmatched_answers_fall_back_to_position() {
        let questions = vec![question("A", "first?"), question("B", "second?")];
        let answers = vec![
            QuestionAnswer::new("something", "one"),
            QuestionAnswer::new("else", "two"),
        ];

        assert_eq!(
            align_answers(&questions, &answers),
            vec![vec!["one".to_owned()], vec!["two".to_owned()]]
        );
    }

    #[test]
    fn missing_answers_become_empty_strings() {
        let questions = vec![question("A", "first?"), question("B", "second?")];
        let answers = vec![QuestionAnswer::new("B", "only b")];

        assert_eq!(
            align_answers(&questions, &answers),
            vec![vec![String::new()], vec!["only b".to_owned()]]
        );
    }
}
