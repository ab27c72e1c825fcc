//! Specialization scoring and per-round task assignment.
//!
//! Everything here is pure: the functions look at tasks and agents and
//! return a plan, they never change state.

use crate::registry::AgentRegistry;
use crate::task_store::TaskStore;
use crate::types::{Agent, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Points per keyword found in the task's component tag.
pub const COMPONENT_WEIGHT: u32 = 10;
/// Points per keyword found in the task's description.
pub const DESCRIPTION_WEIGHT: u32 = 5;

/// One (task, agent) pair chosen for the next batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub agent_id: String,
    pub score: u32,
}

/// Knobs for the assignment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPolicy {
    /// Hand a task to the first idle agent even when no keyword matches.
    /// When false, such tasks stay Pending.
    #[serde(default = "default_assign_unmatched")]
    pub assign_unmatched: bool,
}

fn default_assign_unmatched() -> bool {
    true
}

impl Default for AssignmentPolicy {
    fn default() -> Self {
        Self {
            assign_unmatched: default_assign_unmatched(),
        }
    }
}

/// `10 x` keywords contained in the component plus `5 x` keywords contained
/// in the description, case-insensitive.
pub fn score(agent: &Agent, task: &Task) -> u32 {
    let component = task.component.to_lowercase();
    let description = task.description.to_lowercase();
    agent
        .keywords
        .iter()
        .map(|keyword| {
            let keyword = keyword.to_lowercase();
            let mut points = 0;
            if component.contains(&keyword) {
                points += COMPONENT_WEIGHT;
            }
            if description.contains(&keyword) {
                points += DESCRIPTION_WEIGHT;
            }
            points
        })
        .sum()
}

/// Index and score of the best candidate. Only a strictly higher score
/// replaces the current best, so ties go to the earlier candidate.
pub fn best_agent(task: &Task, candidates: &[&Agent]) -> Option<(usize, u32)> {
    let mut best: Option<(usize, u32)> = None;
    for (idx, agent) in candidates.iter().enumerate() {
        let points = score(agent, task);
        debug!(task_id = %task.id, agent_id = %agent.id, score = points, "Scored agent");
        match best {
            Some((_, top)) if points <= top => {}
            _ => best = Some((idx, points)),
        }
    }
    best
}

/// Pick the next batch.
///
/// `ready` must be the Pending tasks whose dependencies are Completed, in
/// store order; `idle` the idle agents in registration order; `active` the
/// tasks currently Assigned or InProgress. Tasks are taken in order, each
/// skipped if it conflicts with an active task or an earlier pick of this
/// batch, and each agent is used at most once.
pub fn assign(
    ready: &[&Task],
    idle: &[&Agent],
    active: &[&Task],
    policy: AssignmentPolicy,
) -> Vec<Assignment> {
    let mut available: Vec<&Agent> = idle.to_vec();
    let mut picked: Vec<&Task> = Vec::new();
    let mut plan = Vec::new();

    for &task in ready {
        if available.is_empty() {
            break;
        }
        if task.status != TaskStatus::Pending {
            continue;
        }
        if let Some(other) = active
            .iter()
            .chain(picked.iter())
            .find(|other| other.conflicts_with(task))
        {
            debug!(task_id = %task.id, blocking = %other.id, "Skipping task: file conflict");
            continue;
        }

        let Some((idx, points)) = best_agent(task, &available) else {
            break;
        };
        if points == 0 && !policy.assign_unmatched {
            debug!(task_id = %task.id, "Skipping task: no agent matches");
            continue;
        }

        let agent = available.remove(idx);
        picked.push(task);
        plan.push(Assignment {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            score: points,
        });
    }

    plan
}

/// [`assign`] over the current contents of a store and registry.
pub fn plan_round(
    store: &TaskStore,
    registry: &AgentRegistry,
    policy: AssignmentPolicy,
) -> Vec<Assignment> {
    assign(&store.ready(), &registry.idle(), &store.active(), policy)
}
