use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use taskdeck_backend_opencode::{LocatorConfig, OpenCodeBridge, ServerLocator};
use taskdeck_config::{TaskdeckConfig, DEFAULT_BACKEND_BASE_URL};
use taskdeck_eventbus::SessionEventBusConfig;
use taskdeck_protocol::{
    AgentId, LocalSessionId, McpServerSpec, ModelRef, QuestionReplyOutcome, RemoteSessionId,
    SessionError, SessionEvent, SessionStatus, TaskId,
};
use taskdeck_runtime::{AgentProfile, SessionRuntime, SessionRuntimeConfig, SessionStart};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_AGENT_ID: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    let config = taskdeck_config::load_from_env()?;
    init_file_logging(&config.session_runtime().log_file)?;
    let cli = parse_cli_flags(std::env::args().skip(1))?;
    if cli.help {
        print_cli_help();
        return Ok(());
    }
    let Some(task) = cli.task else {
        bail!("Missing --task <id>. Run with --help for valid flags.");
    };
    if cli.prompt.is_none() && cli.resume.is_none() {
        bail!("Nothing to do: pass --prompt <text>, --resume <session>, or both.");
    }

    let backend = config.backend_runtime();
    let locator = ServerLocator::new(LocatorConfig {
        default_base_url: DEFAULT_BACKEND_BASE_URL.to_owned(),
        binary: backend.binary.clone(),
        probe_timeout: backend.probe_timeout,
        settle_delay: backend.settle_delay,
    });
    let runtime = SessionRuntime::new(
        Arc::new(OpenCodeBridge::new(locator)),
        runtime_config(&config)?,
    );

    let agent_id = AgentId::new(cli.agent);
    let task_id = TaskId::new(task);
    let result = drive_task(
        &runtime,
        &agent_id,
        &task_id,
        cli.resume.map(RemoteSessionId::new),
        cli.prompt,
    )
    .await;

    if let Err(error) = runtime.shutdown().await {
        tracing::warn!(error = %error, "backend shutdown failed");
    }
    result
}

/// Runs one task until its turn ends, printing every session event as a JSON
/// line. Pending questions are answered from stdin.
async fn drive_task(
    runtime: &SessionRuntime,
    agent_id: &AgentId,
    task_id: &TaskId,
    resume: Option<RemoteSessionId>,
    prompt: Option<String>,
) -> Result<()> {
    let mut events = runtime.subscribe_task(task_id);
    let start = match resume.as_ref() {
        Some(remote_session_id) => {
            runtime
                .resume_session(agent_id, task_id, remote_session_id)
                .await?
        }
        None => runtime.start_session(agent_id, task_id).await?,
    };
    let session_id = match start {
        SessionStart::Started(session_id) => session_id,
        SessionStart::Queued { position } => {
            bail!("session for task {task_id} is queued at position {position}")
        }
    };

    let Some(prompt) = prompt else {
        if let Some(snapshot) = runtime.snapshot(task_id) {
            println!("{}", serde_json::to_string(&snapshot.transcript)?);
        }
        return stop_quietly(runtime, &session_id).await;
    };
    runtime.send_message(&session_id, &prompt).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let envelope = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(task_id = task_id.as_str(), "interrupted");
                break;
            }
            received = events.recv() => match received {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        println!("{}", serde_json::to_string(&envelope)?);

        match &envelope.event {
            SessionEvent::ApprovalRequest(request) => {
                for question in &request.approval.questions {
                    eprintln!("? {}", question.question);
                }
                let answer = stdin.next_line().await?.unwrap_or_default();
                let outcome = runtime
                    .approve(&session_id, !answer.trim().is_empty(), Some(answer.as_str()))
                    .await?;
                if let QuestionReplyOutcome::Undelivered { reason } = outcome {
                    eprintln!("answer not delivered: {reason}");
                }
            }
            SessionEvent::Status(status)
                if matches!(status.to, SessionStatus::Idle | SessionStatus::Error) =>
            {
                break;
            }
            _ => {}
        }
    }

    stop_quietly(runtime, &session_id).await
}

async fn stop_quietly(runtime: &SessionRuntime, session_id: &LocalSessionId) -> Result<()> {
    match runtime.stop_session(session_id).await {
        Ok(()) | Err(SessionError::SessionNotFound(_)) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

fn runtime_config(config: &TaskdeckConfig) -> Result<SessionRuntimeConfig> {
    let backend = config.backend_runtime();
    let policy = config.scheduler_policy();
    let settings = config.session_runtime();

    let mut runtime = SessionRuntimeConfig::new(backend.base_url);
    runtime.session_template.directory = backend.directory;
    runtime.session_template.model = backend.model.as_deref().and_then(ModelRef::parse);
    runtime.session_template.mcp_servers = config
        .mcp_servers
        .iter()
        .map(|server| -> Result<McpServerSpec> {
            Ok(McpServerSpec {
                name: server.name.clone(),
                config: serde_json::to_value(&server.config).with_context(|| {
                    format!("tool server '{}' has an unusable config", server.name)
                })?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    runtime.poll_interval = settings.poll_interval;
    runtime.scheduler_enabled = policy.enabled;
    runtime.default_max_parallel_sessions = policy.default_max_parallel_sessions;
    runtime.agents = config
        .agents
        .iter()
        .map(|agent| {
            (
                AgentId::new(agent.agent_id.as_str()),
                AgentProfile {
                    max_parallel_sessions: Some(agent.max_parallel_sessions)
                        .filter(|limit| *limit > 0),
                    model: config
                        .model_for(&agent.agent_id)
                        .and_then(ModelRef::parse),
                    tools: agent.tools.clone(),
                },
            )
        })
        .collect();
    runtime.events = SessionEventBusConfig {
        task_buffer_capacity: settings.session_event_buffer,
        global_buffer_capacity: settings.global_event_buffer,
    };
    Ok(runtime)
}

fn init_file_logging(log_path: &Path) -> Result<(), SessionError> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|error| {
                SessionError::Configuration(format!(
                    "failed to create taskdeck log directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|error| {
            SessionError::Configuration(format!(
                "failed to open taskdeck log file '{}': {error}",
                log_path.display()
            ))
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct CliFlags {
    agent: String,
    task: Option<String>,
    prompt: Option<String>,
    resume: Option<String>,
    help: bool,
}

impl Default for CliFlags {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT_ID.to_owned(),
            task: None,
            prompt: None,
            resume: None,
            help: false,
        }
    }
}

fn parse_cli_flags(args: impl IntoIterator<Item = String>) -> Result<CliFlags, SessionError> {
    let mut flags = CliFlags::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let target = match arg.as_str() {
            "--agent" => &mut flags.agent,
            "--task" => flags.task.insert(String::new()),
            "--prompt" => flags.prompt.insert(String::new()),
            "--resume" => flags.resume.insert(String::new()),
            "--help" | "-h" => {
                flags.help = true;
                continue;
            }
            value if value.starts_with("--") => {
                return Err(SessionError::Configuration(format!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                )));
            }
            unknown => {
                return Err(SessionError::Configuration(format!(
                    "Unexpected argument '{unknown}'. Run with --help for valid flags."
                )));
            }
        };
        let value = args.next().ok_or_else(|| {
            SessionError::Configuration(format!(
                "Missing value after {arg}. Run with --help for valid flags."
            ))
        })?;
        *target = read_cli_value(&arg, value)?;
    }

    Ok(flags)
}

fn print_cli_help() {
    println!("Usage: taskdeck --task <id> [--agent <id>] [--prompt <text>] [--resume <session>]");
    println!();
    println!("  --task <id>          Task the session belongs to");
    println!("  --agent <id>         Agent identity used for concurrency limits (default: {DEFAULT_AGENT_ID})");
    println!("  --prompt <text>      Message sent once the session is running");
    println!("  --resume <session>   Attach to an existing backend session instead of creating one");
    println!("  --help               Show this help message");
}

fn read_cli_value(flag: &str, value: String) -> Result<String, SessionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SessionError::Configuration(format!(
            "Flag '{flag}' requires a non-empty value."
        )));
    }
    Ok(value.to_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskdeck_config::{AgentConfigToml, McpServerConfigToml, TaskdeckConfig};
    use taskdeck_protocol::{AgentId, SessionError, TaskId};

    use super::{parse_cli_flags, runtime_config, CliFlags};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn cli_flags_parse_values_and_defaults() {
        let flags = parse_cli_flags(args(&["--task", "task-7", "--prompt", " fix the build "]))
            .expect("parse flags");
        assert_eq!(
            flags,
            CliFlags {
                task: Some("task-7".to_owned()),
                prompt: Some("fix the build".to_owned()),
                ..CliFlags::default()
            }
        );
        assert_eq!(flags.agent, "default");

        let flags = parse_cli_flags(args(&["--agent", "reviewer", "--resume", "ses_1", "--task", "t"]))
            .expect("parse flags");
        assert_eq!(flags.agent, "reviewer");
        assert_eq!(flags.resume.as_deref(), Some("ses_1"));
    }

    #[test]
    fn cli_flags_reject_unknown_missing_and_blank_values() {
        assert!(matches!(
            parse_cli_flags(args(&["--verbose"])),
            Err(SessionError::Configuration(message)) if message.contains("Unknown flag")
        ));
        assert!(matches!(
            parse_cli_flags(args(&["--task"])),
            Err(SessionError::Configuration(message)) if message.contains("Missing value")
        ));
        assert!(matches!(
            parse_cli_flags(args(&["--task", "   "])),
            Err(SessionError::Configuration(message)) if message.contains("non-empty")
        ));
        assert!(parse_cli_flags(args(&["--help"])).expect("parse help").help);
    }

    #[test]
    fn runtime_config_maps_agents_models_and_tool_servers() {
        let mut config = TaskdeckConfig::default();
        config.backend.model = Some("openai/gpt-default".to_owned());
        config.backend.directory = Some("/work/repo".to_owned());
        config.runtime.poll_interval_ms = 250;
        config.agents = vec![
            AgentConfigToml {
                agent_id: "reviewer".to_owned(),
                max_parallel_sessions: 2,
                model: Some("anthropic/claude-sonnet".to_owned()),
                tools: [("bash".to_owned(), false)].into_iter().collect(),
            },
            AgentConfigToml {
                agent_id: "builder".to_owned(),
                max_parallel_sessions: 0,
                model: None,
                tools: Default::default(),
            },
        ];
        let mut server = toml::Table::new();
        server.insert("type".to_owned(), toml::Value::String("remote".to_owned()));
        config.mcp_servers = vec![McpServerConfigToml {
            name: "docs".to_owned(),
            config: server,
        }];

        let runtime = runtime_config(&config).expect("runtime config");

        assert_eq!(runtime.poll_interval, Duration::from_millis(250));
        assert_eq!(runtime.limit_for(&AgentId::new("reviewer")), 2);
        assert_eq!(runtime.limit_for(&AgentId::new("builder")), 1);
        assert_eq!(runtime.session_template.mcp_servers.len(), 1);
        assert_eq!(
            runtime.session_template.mcp_servers[0].config,
            serde_json::json!({"type": "remote"})
        );

        let session = runtime.session_config(&AgentId::new("reviewer"), &TaskId::new("task-1"));
        assert_eq!(
            session.model.map(|model| model.provider_id),
            Some("anthropic".to_owned())
        );
        assert_eq!(session.directory, Some("/work/repo".into()));
        assert_eq!(session.tools.get("bash"), Some(&false));

        let builder = runtime.agents.get(&AgentId::new("builder")).expect("builder profile");
        assert_eq!(
            builder.model.as_ref().map(|model| model.model_id.as_str()),
            Some("gpt-default")
        );
    }
}
