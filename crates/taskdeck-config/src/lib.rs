use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_TASKDECK_CONFIG: &str = "TASKDECK_CONFIG";

pub const DEFAULT_BACKEND_BASE_URL: &str = "http://127.0.0.1:4096";
const DEFAULT_BACKEND_BINARY: &str = "opencode";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1_500;
const DEFAULT_SCHEDULER_ENABLED: bool = true;
const DEFAULT_MAX_PARALLEL_SESSIONS: usize = 1;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SESSION_EVENT_BUFFER: usize = 256;
const DEFAULT_GLOBAL_EVENT_BUFFER: usize = 1_024;
const DEFAULT_LOG_FILE_NAME: &str = "taskdeck.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskdeckConfig {
    #[serde(default)]
    pub backend: BackendConfigToml,
    #[serde(default)]
    pub scheduler: SchedulerConfigToml,
    #[serde(default)]
    pub runtime: RuntimeConfigToml,
    #[serde(default)]
    pub agents: Vec<AgentConfigToml>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfigToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfigToml {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_backend_binary")]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for BackendConfigToml {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            binary: default_backend_binary(),
            directory: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfigToml {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_parallel_sessions")]
    pub default_max_parallel_sessions: usize,
}

impl Default for SchedulerConfigToml {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            default_max_parallel_sessions: default_max_parallel_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfigToml {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_session_event_buffer")]
    pub session_event_buffer: usize,
    #[serde(default = "default_global_event_buffer")]
    pub global_event_buffer: usize,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for RuntimeConfigToml {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            session_event_buffer: default_session_event_buffer(),
            global_event_buffer: default_global_event_buffer(),
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfigToml {
    pub agent_id: String,
    #[serde(default)]
    pub max_parallel_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfigToml {
    pub name: String,
    #[serde(default)]
    pub config: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRuntimeConfig {
    pub base_url: String,
    pub binary: String,
    pub directory: Option<PathBuf>,
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub enabled: bool,
    pub default_max_parallel_sessions: usize,
    pub agent_limits: BTreeMap<String, usize>,
}

impl SchedulerPolicy {
    pub fn limit_for(&self, agent_id: &str) -> usize {
        self.agent_limits
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_max_parallel_sessions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRuntimeSettings {
    pub poll_interval: Duration,
    pub session_event_buffer: usize,
    pub global_event_buffer: usize,
    pub log_file: PathBuf,
}

impl TaskdeckConfig {
    pub fn backend_runtime(&self) -> BackendRuntimeConfig {
        BackendRuntimeConfig {
            base_url: self.backend.base_url.clone(),
            binary: self.backend.binary.clone(),
            directory: self.backend.directory.as_ref().map(PathBuf::from),
            probe_timeout: Duration::from_millis(self.backend.probe_timeout_ms),
            settle_delay: Duration::from_millis(self.backend.settle_delay_ms),
            model: self.backend.model.clone(),
        }
    }

    pub fn scheduler_policy(&self) -> SchedulerPolicy {
        SchedulerPolicy {
            enabled: self.scheduler.enabled,
            default_max_parallel_sessions: self.scheduler.default_max_parallel_sessions,
            agent_limits: self
                .agents
                .iter()
                .map(|agent| (agent.agent_id.clone(), agent.max_parallel_sessions))
                .collect(),
        }
    }

    pub fn session_runtime(&self) -> SessionRuntimeSettings {
        SessionRuntimeSettings {
            poll_interval: Duration::from_millis(self.runtime.poll_interval_ms),
            session_event_buffer: self.runtime.session_event_buffer,
            global_event_buffer: self.runtime.global_event_buffer,
            log_file: PathBuf::from(&self.runtime.log_file),
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfigToml> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    /// Model for an agent, falling back to the backend-wide model.
    pub fn model_for(&self, agent_id: &str) -> Option<&str> {
        self.agent(agent_id)
            .and_then(|agent| agent.model.as_deref())
            .or(self.backend.model.as_deref())
    }
}

impl Default for TaskdeckConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfigToml::default(),
            scheduler: SchedulerConfigToml::default(),
            runtime: RuntimeConfigToml::default(),
            agents: Vec::new(),
            mcp_servers: Vec::new(),
        }
    }
}

pub fn load_from_env() -> Result<TaskdeckConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<TaskdeckConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;

    Ok(home.join(".config").join("taskdeck").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_TASKDECK_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "TASKDECK_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_taskdeck_data_dir() -> PathBuf {
    resolve_data_local_dir().join("taskdeck")
}

fn resolve_data_local_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("LOCALAPPDATA") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join("AppData").join("Local");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = resolve_home_dir() {
            return home.join("Library").join("Application Support");
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        if let Ok(path) = std::env::var("XDG_DATA_HOME") {
            let path = path.trim();
            if !path.is_empty() {
                return absolutize_path(PathBuf::from(path));
            }
        }
        if let Some(home) = resolve_home_dir() {
            return home.join(".local").join("share");
        }
    }

    std::env::temp_dir()
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    std::env::temp_dir().join(path)
}

fn default_backend_base_url() -> String {
    DEFAULT_BACKEND_BASE_URL.to_owned()
}

fn default_backend_binary() -> String {
    DEFAULT_BACKEND_BINARY.to_owned()
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

fn default_scheduler_enabled() -> bool {
    DEFAULT_SCHEDULER_ENABLED
}

fn default_max_parallel_sessions() -> usize {
    DEFAULT_MAX_PARALLEL_SESSIONS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_session_event_buffer() -> usize {
    DEFAULT_SESSION_EVENT_BUFFER
}

fn default_global_event_buffer() -> usize {
    DEFAULT_GLOBAL_EVENT_BUFFER
}

fn default_log_file() -> String {
    default_taskdeck_data_dir()
        .join(DEFAULT_LOG_FILE_NAME)
        .to_string_lossy()
        .to_string()
}

fn persist_config(path: &Path, config: &TaskdeckConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize TASKDECK_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write TASKDECK_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<TaskdeckConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for TASKDECK_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = TaskdeckConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read TASKDECK_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: TaskdeckConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse TASKDECK_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    if normalize_config(&mut config) {
        persist_config(path, &config)?;
    }

    Ok(config)
}

/// Restores blank or zero settings to their defaults and collapses duplicate
/// agent and tool-server entries (last one wins). Returns whether anything
/// changed.
pub fn normalize_config(config: &mut TaskdeckConfig) -> bool {
    let mut changed = false;

    changed |= normalize_base_url(&mut config.backend.base_url);
    changed |= normalize_non_empty_string(&mut config.backend.binary, default_backend_binary());
    changed |= normalize_optional_string(&mut config.backend.directory);
    changed |= normalize_optional_string(&mut config.backend.model);
    changed |= normalize_non_zero(
        &mut config.backend.probe_timeout_ms,
        default_probe_timeout_ms(),
    );
    changed |= normalize_non_zero(
        &mut config.backend.settle_delay_ms,
        default_settle_delay_ms(),
    );

    changed |= normalize_non_zero(
        &mut config.scheduler.default_max_parallel_sessions,
        default_max_parallel_sessions(),
    );
    let agent_default = config.scheduler.default_max_parallel_sessions;
    for agent in &mut config.agents {
        changed |= normalize_non_empty_string(&mut agent.agent_id, String::new());
        changed |= normalize_non_zero(&mut agent.max_parallel_sessions, agent_default);
        changed |= normalize_optional_string(&mut agent.model);
    }
    changed |= collapse_by_key(&mut config.agents, |agent| agent.agent_id.as_str());

    changed |= normalize_non_zero(
        &mut config.runtime.poll_interval_ms,
        default_poll_interval_ms(),
    );
    changed |= normalize_non_zero(
        &mut config.runtime.session_event_buffer,
        default_session_event_buffer(),
    );
    changed |= normalize_non_zero(
        &mut config.runtime.global_event_buffer,
        default_global_event_buffer(),
    );
    changed |= normalize_non_empty_string(&mut config.runtime.log_file, default_log_file());

    for server in &mut config.mcp_servers {
        changed |= normalize_non_empty_string(&mut server.name, String::new());
    }
    changed |= collapse_by_key(&mut config.mcp_servers, |server| server.name.as_str());

    changed
}

fn normalize_base_url(value: &mut String) -> bool {
    let mut changed = normalize_non_empty_string(value, default_backend_base_url());
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() {
        *value = default_backend_base_url();
        return true;
    }
    if trimmed.len() != value.len() {
        *value = trimmed.to_owned();
        changed = true;
    }
    changed
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }

    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    let Some(current) = value.as_mut() else {
        return false;
    };
    if current.trim().is_empty() {
        *value = None;
        return true;
    }
    normalize_non_empty_string(current, String::new())
}

fn normalize_non_zero<T>(value: &mut T, default: T) -> bool
where
    T: Copy + Default + PartialEq,
{
    if *value == T::default() {
        *value = default;
        return true;
    }
    false
}

/// Drops entries with a blank key and keeps only the last entry per key, in
/// the position of that last entry.
fn collapse_by_key<T, F>(entries: &mut Vec<T>, key: F) -> bool
where
    F: Fn(&T) -> &str,
{
    let mut last_index = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        last_index.insert(key(entry).to_owned(), index);
    }
    let before = entries.len();
    let mut index = 0;
    entries.retain(|entry| {
        let keep = {
            let key = key(entry);
            !key.is_empty() && last_index.get(key) == Some(&index)
        };
        index += 1;
        keep
    });
    before != entries.len()
}
