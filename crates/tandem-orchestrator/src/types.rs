use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Status of a task in the store.
///
/// Transitions only go forward: `Pending -> Assigned -> InProgress -> Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Assigned or InProgress: the task holds an agent and its files.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task as supplied by a task source, before it enters the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_component")]
    pub component: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(default = "default_effort")]
    pub estimated_effort: u32,
}

fn default_component() -> String {
    "general".to_string()
}

fn default_effort() -> u32 {
    1
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            component: default_component(),
            files: Vec::new(),
            dependencies: Vec::new(),
            parallel_safe: false,
            estimated_effort: default_effort(),
        }
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel_safe(mut self, safe: bool) -> Self {
        self.parallel_safe = safe;
        self
    }
}

/// Why a work unit failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// A task tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub component: String,
    pub files: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub parallel_safe: bool,
    pub estimated_effort: u32,
    pub status: TaskStatus,
    /// Set iff the task is Assigned or InProgress.
    pub assigned_agent: Option<String>,
    /// Agent that ran the task; survives the terminal transition.
    #[serde(default)]
    pub executed_by: Option<String>,
    #[serde(default)]
    pub failure: Option<ExecutionFailure>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            component: spec.component,
            files: spec.files.into_iter().collect(),
            dependencies: spec.dependencies.into_iter().collect(),
            parallel_safe: spec.parallel_safe,
            estimated_effort: spec.estimated_effort,
            status: TaskStatus::Pending,
            assigned_agent: None,
            executed_by: None,
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending with every dependency in `completed`.
    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Two tasks conflict when they share a file and at least one of them
    /// is not parallel-safe.
    pub fn conflicts_with(&self, other: &Task) -> bool {
        if self.parallel_safe && other.parallel_safe {
            return false;
        }
        !self.files.is_disjoint(&other.files)
    }
}

/// Configuration for one specialized agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Directory the shell executor runs this agent's work in.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl AgentSpec {
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Counters tracked per agent across a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub busy_ms: u64,
}

/// A registered agent and its live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    /// Lowercased, de-duplicated, in configuration order.
    pub keywords: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub state: WorkerStatus,
    /// Set iff `state == Busy`.
    pub current_task: Option<String>,
    pub metrics: AgentMetrics,
}

impl Agent {
    pub fn from_spec(spec: AgentSpec) -> Self {
        let mut keywords: Vec<String> = Vec::with_capacity(spec.keywords.len());
        for keyword in spec.keywords {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        Self {
            id: spec.id,
            display_name: spec.name,
            keywords,
            working_dir: spec.working_dir,
            state: WorkerStatus::Idle,
            current_task: None,
            metrics: AgentMetrics::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerStatus::Idle
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_from_spec() {
        let task = Task::from_spec(
            TaskSpec::new("T001", "Create schema")
                .component("database")
                .files(["schema.sql", "schema.sql"]),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.files.len(), 1);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.estimated_effort, 1);
    }

    #[test]
    fn test_task_is_ready_with_deps() {
        let task = Task::from_spec(TaskSpec::new("T002", "API").depends_on(["T001"]));
        let mut completed = BTreeSet::new();
        assert!(!task.is_ready(&completed));
        completed.insert("T001".to_string());
        assert!(task.is_ready(&completed));
    }

    #[test]
    fn test_task_not_ready_when_assigned() {
        let mut task = Task::from_spec(TaskSpec::new("T001", "Schema"));
        task.status = TaskStatus::Assigned;
        assert!(!task.is_ready(&BTreeSet::new()));
    }

    #[test]
    fn test_conflict_rule_is_symmetric() {
        let safe = Task::from_spec(TaskSpec::new("A", "a").files(["shared.ts"]).parallel_safe(true));
        let safe2 = Task::from_spec(TaskSpec::new("B", "b").files(["shared.ts"]).parallel_safe(true));
        let unsafe_ = Task::from_spec(TaskSpec::new("C", "c").files(["shared.ts"]));
        let other = Task::from_spec(TaskSpec::new("D", "d").files(["other.ts"]));

        assert!(!safe.conflicts_with(&safe2));
        assert!(safe.conflicts_with(&unsafe_));
        assert!(unsafe_.conflicts_with(&safe));
        assert!(!unsafe_.conflicts_with(&other));
    }

    #[test]
    fn test_empty_file_sets_never_conflict() {
        let a = Task::from_spec(TaskSpec::new("A", "a"));
        let b = Task::from_spec(TaskSpec::new("B", "b"));
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Assigned.can_transition_to(Completed));
    }

    #[test]
    fn test_agent_keywords_normalized() {
        let agent = Agent::from_spec(AgentSpec::new("fe", "Frontend", ["React", "css", "react", " "]));
        assert_eq!(agent.keywords, vec!["react", "css"]);
        assert!(agent.is_idle());
        assert!(agent.current_task.is_none());
    }

    #[test]
    fn test_task_spec_serde_defaults() {
        let spec: TaskSpec = serde_json::from_str(r#"{"id": "T009"}"#).unwrap();
        assert_eq!(spec.component, "general");
        assert_eq!(spec.estimated_effort, 1);
        assert!(!spec.parallel_safe);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }
}
