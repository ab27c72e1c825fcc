//! Dependency-aware, conflict-free parallel task orchestration.
//!
//! A fixed set of specialist agents works through a task graph in rounds:
//! ready tasks are matched to idle agents by keyword score, tasks touching
//! overlapping files are kept apart, the batch runs in parallel, and the next
//! round starts once every unit of the batch has reported back.
//!
//! # Main types
//!
//! - [`Orchestrator`]: runs rounds until every task is terminal or the run stalls.
//! - [`TaskStore`]: task graph with validated status transitions.
//! - [`AgentRegistry`]: ordered agent set and per-agent metrics.
//! - [`WorkExecutor`]: how a single task is actually carried out.
//! - [`RunReport`]: final outcome, per-task results and blocked reasons.

/// Keyword scoring and per-round task-to-agent matching.
pub mod assignment;
/// `tandem.toml` loading.
pub mod config;
/// Batch execution and result collection.
pub mod coordinator;
/// Round loop.
pub mod engine;
/// Work executors (shell, dry-run, closure).
pub mod executor;
/// Built-in specialist agents.
pub mod profiles;
/// Agent set and lifecycle.
pub mod registry;
/// Status and run reports.
pub mod report;
/// Task file parsers.
pub mod task_source;
/// Task graph and status state machine.
pub mod task_store;
/// Shared types (Task, Agent, TaskStatus, etc.).
pub mod types;
/// File sync between the project root and agent workspaces.
pub mod workspace;

pub use assignment::{assign, plan_round, score, Assignment, AssignmentPolicy};
pub use config::{default_config_path, TandemConfig};
pub use coordinator::{BatchOutcome, Coordinator, WorkerEvent};
pub use engine::{Orchestrator, RoundRecord};
pub use executor::{DryRunExecutor, FnExecutor, ShellExecutor, ShellExecutorConfig, WorkExecutor};
pub use profiles::default_agents;
pub use registry::AgentRegistry;
pub use report::{AgentStatus, RunOutcome, RunReport, StatusCounts, StatusReport, TaskReport};
pub use task_source::{load_tasks, parse_json, parse_markdown, parse_toml};
pub use task_store::TaskStore;
pub use types::{
    Agent, AgentMetrics, AgentSpec, ExecutionFailure, Task, TaskSpec, TaskStatus, WorkerStatus,
};
