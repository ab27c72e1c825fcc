use crate::assignment::{plan_round, Assignment, AssignmentPolicy};
use crate::coordinator::Coordinator;
use crate::executor::WorkExecutor;
use crate::registry::AgentRegistry;
use crate::report::{RunOutcome, RunReport, StatusReport};
use crate::task_store::TaskStore;
use crate::types::{AgentSpec, ExecutionFailure, TaskSpec, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tandem_core::{TandemError, TandemResult};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Assignments and results of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Run the round belongs to. Round numbers restart at 1 for every run.
    pub run_id: Uuid,
    pub round: u32,
    pub assignments: Vec<Assignment>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

/// The multi-agent orchestrator.
///
/// Runs rounds of assign -> execute batch -> wait until nothing is left to
/// schedule. The task store and agent registry are shared behind locks so
/// [`Orchestrator::status`] can be polled while a run is in progress, but
/// only the run loop and its coordinator ever change them.
pub struct Orchestrator {
    store: Arc<RwLock<TaskStore>>,
    registry: Arc<RwLock<AgentRegistry>>,
    coordinator: Coordinator,
    policy: AssignmentPolicy,
    round: AtomicU32,
    running: AtomicBool,
    history: RwLock<Vec<RoundRecord>>,
}

impl Orchestrator {
    /// Validate the task list and agent set and build an orchestrator.
    ///
    /// Fails with a config error on duplicate ids, unknown or self
    /// dependencies, dependency cycles, or an empty agent set while tasks
    /// are waiting.
    pub fn new(
        tasks: Vec<TaskSpec>,
        agents: Vec<AgentSpec>,
        executor: Arc<dyn WorkExecutor>,
    ) -> TandemResult<Self> {
        let store = TaskStore::from_specs(tasks)?;
        let registry = AgentRegistry::new(agents)?;
        Self::from_parts(store, registry, executor)
    }

    /// Build from an already validated store and registry.
    pub fn from_parts(
        store: TaskStore,
        registry: AgentRegistry,
        executor: Arc<dyn WorkExecutor>,
    ) -> TandemResult<Self> {
        ensure_agents(&store, &registry)?;
        Ok(Self {
            store: Arc::new(RwLock::new(store)),
            registry: Arc::new(RwLock::new(registry)),
            coordinator: Coordinator::new(executor),
            policy: AssignmentPolicy::default(),
            round: AtomicU32::new(0),
            running: AtomicBool::new(false),
            history: RwLock::new(Vec::new()),
        })
    }

    pub fn with_policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get a reference to the task store.
    pub fn store(&self) -> &Arc<RwLock<TaskStore>> {
        &self.store
    }

    /// Get a reference to the agent registry.
    pub fn registry(&self) -> &Arc<RwLock<AgentRegistry>> {
        &self.registry
    }

    /// Append tasks. They are validated against the whole graph and become
    /// schedulable from the next round on.
    pub async fn add_tasks(&self, specs: Vec<TaskSpec>) -> TandemResult<usize> {
        let added = self.store.write().await.extend(specs)?;
        info!(added, "Tasks appended");
        Ok(added)
    }

    /// Snapshot of task counts and agent assignments.
    pub async fn status(&self) -> StatusReport {
        let store = self.store.read().await;
        let registry = self.registry.read().await;
        StatusReport {
            round: self.round.load(Ordering::SeqCst),
            counts: store.status_counts(),
            agents: registry.snapshot(),
        }
    }

    /// Rounds completed so far, across all runs.
    pub async fn history(&self) -> Vec<RoundRecord> {
        self.history.read().await.clone()
    }

    /// Run rounds until every task is terminal or the remaining ones can
    /// never become ready.
    ///
    /// Task failures are recorded in the report; only config errors and
    /// state machine violations come back as `Err`.
    ///
    /// Dropping the returned future cancels the run: in-flight work units are
    /// aborted and the next `run` fails the tasks they held.
    pub async fn run(&self) -> TandemResult<RunReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TandemError::Orchestrator(
                "a run is already in progress".to_string(),
            ));
        }
        let _guard = RunGuard(&self.running);
        self.run_rounds().await
    }

    async fn run_rounds(&self) -> TandemResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        self.round.store(0, Ordering::SeqCst);
        self.recover_interrupted(run_id).await?;

        {
            let store = self.store.read().await;
            let registry = self.registry.read().await;
            ensure_agents(&store, &registry)?;
            info!(
                run_id = %run_id,
                tasks = store.total_count(),
                agents = registry.len(),
                "Orchestrator: starting run"
            );
        }

        let outcome = loop {
            let plan = {
                let store = self.store.read().await;
                if store.is_done() {
                    break RunOutcome::AllDone;
                }
                let registry = self.registry.read().await;
                let plan = plan_round(&store, &registry, self.policy);
                if plan.is_empty() {
                    if !store.active().is_empty() {
                        return Err(TandemError::Orchestrator(
                            "no assignable work while tasks are still active".to_string(),
                        ));
                    }
                    warn!(
                        run_id = %run_id,
                        pending = store.count(TaskStatus::Pending),
                        "Orchestrator: stalled, remaining tasks can never become ready"
                    );
                    break RunOutcome::Stalled;
                }
                plan
            };

            let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
            info!(run_id = %run_id, round, batch = plan.len(), "Round started");
            for assignment in &plan {
                info!(
                    round,
                    task_id = %assignment.task_id,
                    agent_id = %assignment.agent_id,
                    score = assignment.score,
                    "Assigned task"
                );
            }

            let batch = self
                .coordinator
                .run_batch(&plan, &self.store, &self.registry)
                .await?;

            info!(
                round,
                completed = batch.completed.len(),
                failed = batch.failed.len(),
                "Round finished"
            );
            self.history.write().await.push(RoundRecord {
                run_id,
                round,
                assignments: plan,
                completed: batch.completed,
                failed: batch.failed,
            });
        };

        let (report, totals) = {
            let store = self.store.read().await;
            let registry = self.registry.read().await;
            let report = RunReport::build(
                run_id,
                outcome,
                self.round.load(Ordering::SeqCst),
                &store,
                registry.agents(),
                started_at,
            );
            (report, registry.aggregate_metrics())
        };

        for (task_id, reason) in report.blocked() {
            warn!(task_id = %task_id, reason = %reason, "Task never ran");
        }
        info!(
            run_id = %run_id,
            outcome = %report.outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            agent_busy_ms = totals.busy_ms,
            "{}",
            report.summary
        );
        Ok(report)
    }

    /// Fail tasks still bound to an agent by a run that was cancelled, and
    /// free those agents.
    async fn recover_interrupted(&self, run_id: Uuid) -> TandemResult<usize> {
        let mut store = self.store.write().await;
        let mut registry = self.registry.write().await;
        let stale: Vec<(String, Option<String>, TaskStatus)> = store
            .active()
            .into_iter()
            .map(|t| (t.id.clone(), t.assigned_agent.clone(), t.status))
            .collect();
        for (task_id, agent_id, status) in &stale {
            if *status == TaskStatus::Assigned {
                store.start(task_id)?;
            }
            store.fail(task_id, ExecutionFailure::new("interrupted by a cancelled run"))?;
            if let Some(agent_id) = agent_id {
                registry.finish_task(agent_id, false, 0)?;
            }
            warn!(run_id = %run_id, task_id = %task_id, "Task from a cancelled run marked failed");
        }
        Ok(stale.len())
    }
}

/// Clears the running flag when a run ends, including when its future is
/// dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn ensure_agents(store: &TaskStore, registry: &AgentRegistry) -> TandemResult<()> {
    let pending = store.count(TaskStatus::Pending);
    if registry.is_empty() && pending > 0 {
        return Err(TandemError::Config(format!(
            "no agents configured for {pending} pending task(s)"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::DryRunExecutor;

    fn agents() -> Vec<AgentSpec> {
        vec![
            AgentSpec::new("db", "DB Agent", ["database"]),
            AgentSpec::new("api", "API Agent", ["backend"]),
        ]
    }

    #[test]
    fn test_empty_agents_with_pending_tasks() {
        let err = Orchestrator::new(
            vec![TaskSpec::new("T1", "a")],
            vec![],
            Arc::new(DryRunExecutor),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TandemError::Config(_)));
    }

    #[tokio::test]
    async fn test_empty_run_is_all_done() {
        let orchestrator = Orchestrator::new(vec![], vec![], Arc::new(DryRunExecutor)).unwrap();
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::AllDone);
        assert_eq!(report.rounds, 0);
    }

    #[tokio::test]
    async fn test_history_records_rounds() {
        let orchestrator = Orchestrator::new(
            vec![
                TaskSpec::new("T1", "schema").component("database"),
                TaskSpec::new("T2", "api").component("backend").depends_on(["T1"]),
            ],
            agents(),
            Arc::new(DryRunExecutor),
        )
        .unwrap();
        let report = orchestrator.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.rounds, 2);

        let history = orchestrator.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].assignments[0].task_id, "T1");
        assert_eq!(history[1].completed, vec!["T2".to_string()]);
    }

    #[tokio::test]
    async fn test_status_after_run() {
        let orchestrator = Orchestrator::new(
            vec![TaskSpec::new("T1", "schema").component("database")],
            agents(),
            Arc::new(DryRunExecutor),
        )
        .unwrap();
        orchestrator.run().await.unwrap();
        let status = orchestrator.status().await;
        assert_eq!(status.round, 1);
        assert_eq!(status.counts.completed, 1);
        assert!(status.agents.iter().all(|a| a.current_task.is_none()));
    }

    #[tokio::test]
    async fn test_add_tasks_between_runs() {
        let orchestrator = Orchestrator::new(
            vec![TaskSpec::new("T1", "schema").component("database")],
            agents(),
            Arc::new(DryRunExecutor),
        )
        .unwrap();
        orchestrator.run().await.unwrap();

        orchestrator
            .add_tasks(vec![TaskSpec::new("T2", "api").component("backend").depends_on(["T1"])])
            .await
            .unwrap();
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.counts.completed, 2);
        assert_eq!(report.rounds, 1);
        assert_eq!(orchestrator.status().await.round, 1);

        let history = orchestrator.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].round, 1);
        assert_eq!(history[1].run_id, report.run_id);
        assert_ne!(history[0].run_id, history[1].run_id);

        let err = orchestrator
            .add_tasks(vec![TaskSpec::new("T1", "again")])
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::Config(_)));
    }
}
