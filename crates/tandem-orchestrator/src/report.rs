use crate::task_store::TaskStore;
use crate::types::{Agent, AgentMetrics, ExecutionFailure, TaskStatus, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.in_progress + self.completed + self.failed
    }
}

/// What one agent is doing right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: String,
    pub display_name: String,
    pub state: WorkerStatus,
    pub current_task: Option<String>,
    pub metrics: AgentMetrics,
}

impl From<&Agent> for AgentStatus {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            display_name: agent.display_name.clone(),
            state: agent.state,
            current_task: agent.current_task.clone(),
            metrics: agent.metrics.clone(),
        }
    }
}

/// Point-in-time snapshot returned by `Orchestrator::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub round: u32,
    pub counts: StatusCounts,
    pub agents: Vec<AgentStatus>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing is left Pending, Assigned or InProgress.
    AllDone,
    /// Pending tasks remain whose dependencies can never complete.
    Stalled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::AllDone => write!(f, "all_done"),
            RunOutcome::Stalled => write!(f, "stalled"),
        }
    }
}

/// Final state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: String,
    pub component: String,
    pub status: TaskStatus,
    pub executed_by: Option<String>,
    pub failure: Option<ExecutionFailure>,
    /// Why a task never ran; only set for tasks left Pending.
    pub blocked_reason: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Result of a full orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub rounds: u32,
    pub summary: String,
    pub counts: StatusCounts,
    pub tasks: Vec<TaskReport>,
    pub agents: Vec<AgentStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub(crate) fn build(
        run_id: Uuid,
        outcome: RunOutcome,
        rounds: u32,
        store: &TaskStore,
        agents: &[Agent],
        started_at: DateTime<Utc>,
    ) -> Self {
        let counts = store.status_counts();
        let tasks: Vec<TaskReport> = store
            .all_tasks()
            .iter()
            .map(|task| TaskReport {
                id: task.id.clone(),
                component: task.component.clone(),
                status: task.status,
                executed_by: task.executed_by.clone(),
                failure: task.failure.clone(),
                blocked_reason: store.blocked_reason(&task.id),
                duration_ms: match (task.started_at, task.finished_at) {
                    (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                    _ => None,
                },
            })
            .collect();

        let summary = format!(
            "Orchestration {outcome} after {rounds} round(s): {}/{} tasks completed, {} failed, {} never ran",
            counts.completed,
            counts.total(),
            counts.failed,
            counts.pending,
        );

        Self {
            run_id,
            outcome,
            rounds,
            summary,
            counts,
            tasks,
            agents: agents.iter().map(AgentStatus::from).collect(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Tasks that never ran, with the reason.
    pub fn blocked(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tasks.iter().filter_map(|t| {
            t.blocked_reason
                .as_deref()
                .map(|reason| (t.id.as_str(), reason))
        })
    }

    /// Whether every task completed.
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::AllDone && self.counts.failed == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentSpec, TaskSpec};

    #[test]
    fn test_status_counts_record() {
        let mut counts = StatusCounts::default();
        counts.record(TaskStatus::Pending);
        counts.record(TaskStatus::Failed);
        counts.record(TaskStatus::Failed);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_run_report_lists_blocked_tasks() {
        let mut store = TaskStore::from_specs(vec![
            TaskSpec::new("T1", "schema"),
            TaskSpec::new("T2", "api").depends_on(["T1"]),
        ])
        .unwrap();
        store.assign("T1", "db").unwrap();
        store.start("T1").unwrap();
        store.fail("T1", ExecutionFailure::new("exit 1")).unwrap();

        let agents = vec![Agent::from_spec(AgentSpec::new("db", "DB", ["database"]))];
        let report = RunReport::build(
            Uuid::new_v4(),
            RunOutcome::Stalled,
            1,
            &store,
            &agents,
            Utc::now(),
        );

        assert!(!report.is_success());
        assert_eq!(report.counts.failed, 1);
        let blocked: Vec<(&str, &str)> = report.blocked().collect();
        assert_eq!(blocked, vec![("T2", "blocked by failed dependency T1")]);
        assert!(report.summary.contains("stalled"));
        assert_eq!(report.tasks[0].executed_by.as_deref(), Some("db"));
    }

    #[test]
    fn test_run_report_serialization() {
        let store = TaskStore::new();
        let report = RunReport::build(
            Uuid::new_v4(),
            RunOutcome::AllDone,
            0,
            &store,
            &[],
            Utc::now(),
        );
        let json = report.to_json();
        assert_eq!(json["outcome"], "all_done");
        let parsed: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.run_id, report.run_id);
        assert!(parsed.is_success());
    }
}
