use crate::assignment::Assignment;
use crate::executor::WorkExecutor;
use crate::registry::AgentRegistry;
use crate::task_store::TaskStore;
use crate::types::{ExecutionFailure, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{TandemError, TandemResult};
use tokio::sync::{mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

/// Message a work unit sends back to the coordinator. Work units never touch
/// the store or registry themselves.
#[derive(Debug)]
pub enum WorkerEvent {
    Started {
        task_id: String,
    },
    Finished {
        task_id: String,
        result: Result<(), ExecutionFailure>,
        elapsed: Duration,
    },
}

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

struct Launched {
    task_id: String,
    agent_id: String,
    handle: JoinHandle<()>,
}

/// Aborts the units of a batch whose future was dropped before they were
/// all joined.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Runs one assignment batch to completion.
pub struct Coordinator {
    executor: Arc<dyn WorkExecutor>,
}

impl Coordinator {
    pub fn new(executor: Arc<dyn WorkExecutor>) -> Self {
        Self { executor }
    }

    /// Bind every pair, launch all work units in parallel and wait for every
    /// one of them. All store and registry mutations happen here, one event
    /// at a time, with the locks held only while an event is applied.
    ///
    /// A failing or panicking unit marks its task Failed and frees its
    /// agent. Errors returned from this function are fatal to the run.
    pub async fn run_batch(
        &self,
        assignments: &[Assignment],
        store: &RwLock<TaskStore>,
        registry: &RwLock<AgentRegistry>,
    ) -> TandemResult<BatchOutcome> {
        let mut work = Vec::with_capacity(assignments.len());
        {
            let mut store = store.write().await;
            let mut registry = registry.write().await;
            for assignment in assignments {
                store.assign(&assignment.task_id, &assignment.agent_id)?;
                registry.start_task(&assignment.agent_id, &assignment.task_id)?;

                let task = store.get(&assignment.task_id).cloned().ok_or_else(|| {
                    TandemError::Orchestrator(format!("task '{}' vanished", assignment.task_id))
                })?;
                let agent = registry.get(&assignment.agent_id).cloned().ok_or_else(|| {
                    TandemError::Orchestrator(format!("agent '{}' vanished", assignment.agent_id))
                })?;
                work.push((task, agent));
            }
        }

        // Two events per unit, so sends never wait on the receiver.
        let (tx, mut rx) = mpsc::channel::<WorkerEvent>(assignments.len().max(1) * 2);
        let mut launched = Vec::with_capacity(work.len());
        for (task, agent) in work {
            let tx = tx.clone();
            let executor = Arc::clone(&self.executor);
            let task_id = task.id.clone();
            let agent_id = agent.id.clone();
            let handle = tokio::spawn(async move {
                let _ = tx
                    .send(WorkerEvent::Started {
                        task_id: task.id.clone(),
                    })
                    .await;
                let start = Instant::now();
                let result = executor.execute(&task, &agent).await;
                let _ = tx
                    .send(WorkerEvent::Finished {
                        task_id: task.id.clone(),
                        result,
                        elapsed: start.elapsed(),
                    })
                    .await;
            });
            launched.push(Launched {
                task_id,
                agent_id,
                handle,
            });
        }
        drop(tx);
        let _abort = AbortOnDrop(launched.iter().map(|u| u.handle.abort_handle()).collect());

        let mut outcome = BatchOutcome::default();
        let mut settled = HashSet::new();
        if let Err(e) = self
            .collect(&mut rx, &launched, store, registry, &mut outcome, &mut settled)
            .await
        {
            error!(error = %e, "Aborting batch");
            return Err(e);
        }

        // Units that died without reporting (panic) still need settling.
        for unit in launched {
            let join = unit.handle.await;
            if settled.contains(&unit.task_id) {
                continue;
            }
            let message = match join {
                Err(e) if e.is_panic() => "work unit panicked".to_string(),
                Err(_) => "work unit was cancelled".to_string(),
                Ok(()) => "work unit exited without reporting a result".to_string(),
            };
            error!(task_id = %unit.task_id, agent_id = %unit.agent_id, %message, "Task failed");
            self.settle(
                &unit.task_id,
                &unit.agent_id,
                Err(ExecutionFailure::new(message)),
                Duration::ZERO,
                store,
                registry,
            )
            .await?;
            outcome.failed.push(unit.task_id);
        }

        Ok(outcome)
    }

    async fn collect(
        &self,
        rx: &mut mpsc::Receiver<WorkerEvent>,
        launched: &[Launched],
        store: &RwLock<TaskStore>,
        registry: &RwLock<AgentRegistry>,
        outcome: &mut BatchOutcome,
        settled: &mut HashSet<String>,
    ) -> TandemResult<()> {
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Started { task_id } => {
                    store.write().await.start(&task_id)?;
                    info!(task_id = %task_id, "Task in progress");
                }
                WorkerEvent::Finished {
                    task_id,
                    result,
                    elapsed,
                } => {
                    let agent_id = launched
                        .iter()
                        .find(|unit| unit.task_id == task_id)
                        .map(|unit| unit.agent_id.clone())
                        .ok_or_else(|| {
                            TandemError::Orchestrator(format!(
                                "result for task '{task_id}' that is not in this batch"
                            ))
                        })?;
                    let succeeded = result.is_ok();
                    match &result {
                        Ok(()) => info!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            duration_ms = elapsed.as_millis() as u64,
                            "Task completed"
                        ),
                        Err(failure) => warn!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            exit_code = ?failure.exit_code,
                            error = %failure,
                            "Task failed"
                        ),
                    }
                    self.settle(&task_id, &agent_id, result, elapsed, store, registry)
                        .await?;
                    if succeeded {
                        outcome.completed.push(task_id.clone());
                    } else {
                        outcome.failed.push(task_id.clone());
                    }
                    settled.insert(task_id);
                }
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        task_id: &str,
        agent_id: &str,
        result: Result<(), ExecutionFailure>,
        elapsed: Duration,
        store: &RwLock<TaskStore>,
        registry: &RwLock<AgentRegistry>,
    ) -> TandemResult<()> {
        let succeeded = result.is_ok();
        {
            let mut store = store.write().await;
            if store.get(task_id).map(|t| t.status) == Some(TaskStatus::Assigned) {
                store.start(task_id)?;
            }
            match result {
                Ok(()) => store.complete(task_id)?,
                Err(failure) => store.fail(task_id, failure)?,
            }
        }
        registry
            .write()
            .await
            .finish_task(agent_id, succeeded, elapsed.as_millis() as u64)
    }
}
