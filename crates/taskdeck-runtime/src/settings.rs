use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use taskdeck_eventbus::SessionEventBusConfig;
use taskdeck_protocol::{AgentId, ModelRef, SessionConfig, TaskId};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-agent overrides on top of the runtime defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentProfile {
    pub max_parallel_sessions: Option<usize>,
    pub model: Option<ModelRef>,
    pub tools: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRuntimeConfig {
    /// Base for every session config; title, model and tools are filled per
    /// task and agent.
    pub session_template: SessionConfig,
    pub poll_interval: Duration,
    pub scheduler_enabled: bool,
    pub default_max_parallel_sessions: usize,
    pub agents: HashMap<AgentId, AgentProfile>,
    pub events: SessionEventBusConfig,
}

impl SessionRuntimeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            session_template: SessionConfig::new(base_url),
            poll_interval: DEFAULT_POLL_INTERVAL,
            scheduler_enabled: true,
            default_max_parallel_sessions: 1,
            agents: HashMap::new(),
            events: SessionEventBusConfig::default(),
        }
    }

    pub fn limit_for(&self, agent_id: &AgentId) -> usize {
        self.agents
            .get(agent_id)
            .and_then(|profile| profile.max_parallel_sessions)
            .unwrap_or(self.default_max_parallel_sessions)
            .max(1)
    }

    pub fn session_config(&self, agent_id: &AgentId, task_id: &TaskId) -> SessionConfig {
        let mut config = self.session_template.clone();
        config.title = Some(task_id.to_string());
        if let Some(profile) = self.agents.get(agent_id) {
            if profile.model.is_some() {
                config.model = profile.model.clone();
            }
            config.tools.extend(profile.tools.clone());
        }
        config
    }
}
