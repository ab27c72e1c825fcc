use crate::report::AgentStatus;
use crate::types::{Agent, AgentMetrics, AgentSpec, WorkerStatus};
use std::collections::HashSet;
use tandem_core::{TandemError, TandemResult};

/// Fixed, ordered set of agents. Registration order is the tie-break order
/// used by assignment.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
}

impl AgentRegistry {
    pub fn new(specs: Vec<AgentSpec>) -> TandemResult<Self> {
        let mut seen = HashSet::new();
        let mut agents = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(TandemError::Config("agent with empty id".to_string()));
            }
            if !seen.insert(spec.id.clone()) {
                return Err(TandemError::Config(format!(
                    "duplicate agent id '{}'",
                    spec.id
                )));
            }
            agents.push(Agent::from_spec(spec));
        }
        Ok(Self { agents })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// All agents in registration order.
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Idle agents in registration order.
    pub fn idle(&self) -> Vec<&Agent> {
        self.agents.iter().filter(|a| a.is_idle()).collect()
    }

    /// Mark an idle agent as busy with `task_id`.
    pub fn start_task(&mut self, agent_id: &str, task_id: &str) -> TandemResult<()> {
        let agent = self.get_mut(agent_id)?;
        if let Some(current) = &agent.current_task {
            return Err(TandemError::Orchestrator(format!(
                "agent '{agent_id}' is already busy with task '{current}'"
            )));
        }
        agent.state = WorkerStatus::Busy;
        agent.current_task = Some(task_id.to_string());
        Ok(())
    }

    /// Return an agent to idle and record how its task went.
    pub fn finish_task(&mut self, agent_id: &str, succeeded: bool, busy_ms: u64) -> TandemResult<()> {
        let agent = self.get_mut(agent_id)?;
        agent.state = WorkerStatus::Idle;
        agent.current_task = None;
        agent.metrics.busy_ms += busy_ms;
        if succeeded {
            agent.metrics.tasks_completed += 1;
        } else {
            agent.metrics.tasks_failed += 1;
        }
        Ok(())
    }

    fn get_mut(&mut self, agent_id: &str) -> TandemResult<&mut Agent> {
        self.agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| TandemError::Orchestrator(format!("unknown agent '{agent_id}'")))
    }

    pub fn snapshot(&self) -> Vec<AgentStatus> {
        self.agents.iter().map(AgentStatus::from).collect()
    }

    /// Metrics summed over all agents.
    pub fn aggregate_metrics(&self) -> AgentMetrics {
        let mut total = AgentMetrics::default();
        for agent in &self.agents {
            total.tasks_completed += agent.metrics.tasks_completed;
            total.tasks_failed += agent.metrics.tasks_failed;
            total.busy_ms += agent.metrics.busy_ms;
        }
        total
    }
}
