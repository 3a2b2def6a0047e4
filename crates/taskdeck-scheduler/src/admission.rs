use std::collections::{HashMap, VecDeque};

use taskdeck_protocol::{AgentId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// One-based position in the agent's queue.
    Queued { position: usize },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Running count and waiting tasks for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySlot {
    pub agent_id: AgentId,
    pub running_count: usize,
    pub queue: VecDeque<TaskId>,
}

/// Caps simultaneously running sessions per agent and queues overflow starts
/// in arrival order.
///
/// Admission is the only edge this gates; callers start the admitted task and
/// report its end through [`ConcurrencyScheduler::on_session_end`].
#[derive(Debug)]
pub struct ConcurrencyScheduler {
    enabled: bool,
    slots: HashMap<AgentId, ConcurrencySlot>,
}

impl Default for ConcurrencyScheduler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConcurrencyScheduler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            slots: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling drops every running count and queued task.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled && self.enabled {
            let abandoned = self
                .slots
                .values()
                .map(|slot| slot.queue.len())
                .sum::<usize>();
            if abandoned > 0 {
                tracing::info!(abandoned, "scheduler disabled; dropping queued starts");
            }
            self.slots.clear();
        }
        self.enabled = enabled;
    }

    /// Admits when the agent is under `limit`, otherwise queues `task_id`.
    /// A task already queued keeps its place. A zero limit is treated as one.
    pub fn request_start(&mut self, agent_id: &AgentId, task_id: &TaskId, limit: usize) -> Admission {
        if !self.enabled {
            return Admission::Admitted;
        }
        let slot = self.slot_mut(agent_id);
        if let Some(index) = slot.queue.iter().position(|queued| queued == task_id) {
            return Admission::Queued { position: index + 1 };
        }
        if slot.running_count < limit.max(1) {
            slot.running_count += 1;
            return Admission::Admitted;
        }
        slot.queue.push_back(task_id.clone());
        tracing::debug!(
            agent_id = agent_id.as_str(),
            task_id = task_id.as_str(),
            position = slot.queue.len(),
            "session start queued"
        );
        Admission::Queued {
            position: slot.queue.len(),
        }
    }

    /// Releases one running slot and returns the next queued task, if any.
    /// The returned task is not counted as running until the caller admits it
    /// with [`ConcurrencyScheduler::admit`].
    pub fn on_session_end(&mut self, agent_id: &AgentId) -> Option<TaskId> {
        if !self.enabled {
            return None;
        }
        let slot = self.slots.get_mut(agent_id)?;
        slot.running_count = slot.running_count.saturating_sub(1);
        let next = slot.queue.pop_front();
        if slot.running_count == 0 && slot.queue.is_empty() && next.is_none() {
            self.slots.remove(agent_id);
        }
        next
    }

    /// Counts a task handed over by [`ConcurrencyScheduler::on_session_end`]
    /// as running.
    pub fn admit(&mut self, agent_id: &AgentId) {
        if self.enabled {
            self.slot_mut(agent_id).running_count += 1;
        }
    }

    /// Removes a task that is still waiting. Returns whether it was queued.
    pub fn withdraw(&mut self, agent_id: &AgentId, task_id: &TaskId) -> bool {
        let Some(slot) = self.slots.get_mut(agent_id) else {
            return false;
        };
        let before = slot.queue.len();
        slot.queue.retain(|queued| queued != task_id);
        before != slot.queue.len()
    }

    pub fn is_queued(&self, agent_id: &AgentId, task_id: &TaskId) -> bool {
        self.slots
            .get(agent_id)
            .is_some_and(|slot| slot.queue.contains(task_id))
    }

    pub fn slot(&self, agent_id: &AgentId) -> Option<ConcurrencySlot> {
        self.slots.get(agent_id).cloned()
    }

    pub fn running_count(&self, agent_id: &AgentId) -> usize {
        self.slots
            .get(agent_id)
            .map(|slot| slot.running_count)
            .unwrap_or(0)
    }

    fn slot_mut(&mut self, agent_id: &AgentId) -> &mut ConcurrencySlot {
        self.slots
            .entry(agent_id.clone())
            .or_insert_with(|| ConcurrencySlot {
                agent_id: agent_id.clone(),
                running_count: 0,
                queue: VecDeque::new(),
            })
    }
}
