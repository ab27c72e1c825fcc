use crate::types::{Agent, ExecutionFailure, Task};
use crate::workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Performs the work of a single task on behalf of an agent.
///
/// The orchestrator only looks at success or failure; whatever the work
/// produces is the executor's business.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// Run `task` as `agent`. `Err` marks the task Failed.
    async fn execute(&self, task: &Task, agent: &Agent) -> Result<(), ExecutionFailure>;
}

/// `[executor]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellExecutorConfig {
    /// Command template run through the shell. Placeholders: `{id}`,
    /// `{description}`, `{component}`, `{files}`, `{agent}`, `{agent_name}`.
    pub command: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Shared project directory. When set, agents with a `working_dir` get
    /// task files pulled from it before a run and merged back after success.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Directories under `project_root` copied into each agent workspace
    /// before its first task.
    #[serde(default = "workspace::default_seed_dirs")]
    pub seed_dirs: Vec<PathBuf>,
}

impl ShellExecutorConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: default_shell(),
            timeout_secs: None,
            project_root: None,
            seed_dirs: workspace::default_seed_dirs(),
        }
    }
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Runs a templated shell command per task.
///
/// Substituted values are single-quoted. The same values are exported as
/// `TANDEM_TASK_ID`, `TANDEM_TASK_DESCRIPTION`, `TANDEM_TASK_COMPONENT`,
/// `TANDEM_TASK_FILES`, `TANDEM_AGENT_ID` and `TANDEM_AGENT_NAME`. The command
/// runs in the agent's `working_dir` when one is configured.
///
/// With a project root, a task's files travel root -> workspace before the
/// command and workspace -> root after it succeeds. Workspaces that are the
/// project root itself are left alone.
pub struct ShellExecutor {
    config: ShellExecutorConfig,
    seeded: Mutex<HashSet<PathBuf>>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self::from_config(ShellExecutorConfig::new(command))
    }

    pub fn from_config(config: ShellExecutorConfig) -> Self {
        Self {
            config,
            seeded: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.project_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &ShellExecutorConfig {
        &self.config
    }

    /// Expand the command template for `task` running on `agent`.
    ///
    /// Single pass over the template: a `{name}` token is replaced only when
    /// it appears in the template itself, never inside a substituted value.
    pub fn render(&self, task: &Task, agent: &Agent) -> String {
        let mut out = String::with_capacity(self.config.command.len());
        let mut rest = self.config.command.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let token = &rest[open..];
            let expanded = token[1..]
                .find('}')
                .and_then(|close| placeholder(&token[1..=close], task, agent).map(|v| (v, close + 2)));
            match expanded {
                Some((value, consumed)) => {
                    out.push_str(&shell_quote(&value));
                    rest = &token[consumed..];
                }
                None => {
                    out.push('{');
                    rest = &token[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Project root to sync `working_dir` with, if syncing applies.
    async fn sync_root(&self, working_dir: &Path) -> Option<&Path> {
        let root = self.config.project_root.as_deref()?;
        if workspace::same_dir(root, working_dir).await {
            return None;
        }
        Some(root)
    }

    async fn prepare_workspace(
        &self,
        task: &Task,
        root: &Path,
        working_dir: &Path,
    ) -> std::io::Result<()> {
        {
            let mut seeded = self.seeded.lock().await;
            if !seeded.contains(working_dir) {
                let dirs = workspace::seed(root, working_dir, &self.config.seed_dirs).await?;
                debug!(working_dir = %working_dir.display(), dirs, "Workspace seeded");
                seeded.insert(working_dir.to_path_buf());
            }
        }
        let pulled = workspace::copy_files(root, working_dir, &task.files).await?;
        debug!(task_id = %task.id, pulled, "Task files pulled into workspace");
        Ok(())
    }
}

fn placeholder(name: &str, task: &Task, agent: &Agent) -> Option<String> {
    Some(match name {
        "id" => task.id.clone(),
        "description" => task.description.clone(),
        "component" => task.component.clone(),
        "files" => task.files.iter().cloned().collect::<Vec<_>>().join(" "),
        "agent" => agent.id.clone(),
        "agent_name" => agent.display_name.clone(),
        _ => return None,
    })
}

#[async_trait]
impl WorkExecutor for ShellExecutor {
    async fn execute(&self, task: &Task, agent: &Agent) -> Result<(), ExecutionFailure> {
        let command = self.render(task, agent);
        info!(task_id = %task.id, agent_id = %agent.id, command = %command, "Executing shell command");

        let mut cmd = tokio::process::Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&command)
            .env("TANDEM_TASK_ID", &task.id)
            .env("TANDEM_TASK_DESCRIPTION", &task.description)
            .env("TANDEM_TASK_COMPONENT", &task.component)
            .env(
                "TANDEM_TASK_FILES",
                task.files.iter().cloned().collect::<Vec<_>>().join(","),
            )
            .env("TANDEM_AGENT_ID", &agent.id)
            .env("TANDEM_AGENT_NAME", &agent.display_name)
            .kill_on_drop(true);
        if let Some(root) = &self.config.project_root {
            cmd.env("TANDEM_PROJECT_ROOT", root);
        }

        let mut sync_root = None;
        if let Some(dir) = &agent.working_dir {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ExecutionFailure::new(format!(
                    "Failed to create working directory '{}': {e}",
                    dir.display()
                ))
            })?;
            sync_root = self.sync_root(dir).await;
            if let Some(root) = sync_root {
                self.prepare_workspace(task, root, dir).await.map_err(|e| {
                    ExecutionFailure::new(format!(
                        "Failed to prepare workspace '{}': {e}",
                        dir.display()
                    ))
                })?;
            }
            cmd.current_dir(dir);
        }

        let output = match self.config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), cmd.output())
                .await
                .map_err(|_| {
                    warn!(task_id = %task.id, timeout = secs, "Shell command timed out");
                    ExecutionFailure::new(format!("Command timed out after {secs}s"))
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| ExecutionFailure::new(format!("Failed to execute command: {e}")))?;

        if output.status.success() {
            if let (Some(root), Some(dir)) = (sync_root, &agent.working_dir) {
                let merged = workspace::copy_files(dir, root, &task.files)
                    .await
                    .map_err(|e| {
                        ExecutionFailure::new(format!("Failed to merge task files: {e}"))
                    })?;
                info!(task_id = %task.id, merged, "Task files merged into project root");
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("Command exited with {}", output.status)
        } else {
            truncate_output(stderr.trim(), 4_000)
        };
        let failure = ExecutionFailure::new(message);
        Err(match output.status.code() {
            Some(code) => failure.with_exit_code(code),
            None => failure,
        })
    }
}

/// Succeeds immediately without doing anything. Used to preview schedules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl WorkExecutor for DryRunExecutor {
    async fn execute(&self, task: &Task, agent: &Agent) -> Result<(), ExecutionFailure> {
        info!(task_id = %task.id, agent_id = %agent.id, "Dry run: skipping execution");
        Ok(())
    }
}

/// Adapts an async closure into a [`WorkExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> WorkExecutor for FnExecutor<F>
where
    F: Fn(Task, Agent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ExecutionFailure>> + Send,
{
    async fn execute(&self, task: &Task, agent: &Agent) -> Result<(), ExecutionFailure> {
        (self.f)(task.clone(), agent.clone()).await
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentSpec, TaskSpec};

    fn fixtures() -> (Task, Agent) {
        let task = Task::from_spec(
            TaskSpec::new("T001", "Create user's schema")
                .component("database")
                .files(["db/schema.sql"]),
        );
        let agent = Agent::from_spec(AgentSpec::new("db", "Database Specialist", ["database"]));
        (task, agent)
    }

    #[test]
    fn test_render_quotes_placeholders() {
        let (task, agent) = fixtures();
        let exec = ShellExecutor::new("run {id} {component} {files} --by {agent} {description}");
        assert_eq!(
            exec.render(&task, &agent),
            "run 'T001' 'database' 'db/schema.sql' --by 'db' 'Create user'\\''s schema'"
        );
    }

    #[test]
    fn test_render_does_not_expand_substituted_values() {
        let task = Task::from_spec(
            TaskSpec::new("T7", "fix {component}").component("; touch pwned;"),
        );
        let agent = Agent::from_spec(AgentSpec::new("{id}", "Agent {agent}", ["x"]));
        let exec = ShellExecutor::new("echo {description} {agent_name} {unknown} {agent");
        assert_eq!(
            exec.render(&task, &agent),
            "echo 'fix {component}' 'Agent {agent}' {unknown} {agent"
        );
    }

    #[tokio::test]
    async fn test_placeholder_in_value_cannot_inject_commands() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let task = Task::from_spec(
            TaskSpec::new("T7", "fix {component}").component("; touch pwned;"),
        );
        let agent = Agent {
            working_dir: Some(work.clone()),
            ..Agent::from_spec(AgentSpec::new("db", "DB", ["database"]))
        };
        let exec = ShellExecutor::new("echo {description} > out.txt");
        exec.execute(&task, &agent).await.unwrap();
        assert!(!work.join("pwned").exists());
        assert_eq!(
            std::fs::read_to_string(work.join("out.txt")).unwrap().trim(),
            "fix {component}"
        );
    }

    #[test]
    fn test_truncate_output_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = truncate_output(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("truncated"));
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[tokio::test]
    async fn test_shell_success() {
        let (task, agent) = fixtures();
        let exec = ShellExecutor::new("test \"$TANDEM_TASK_ID\" = T001");
        assert!(exec.execute(&task, &agent).await.is_ok());
    }

    #[tokio::test]
    async fn test_shell_failure_carries_exit_code() {
        let (task, agent) = fixtures();
        let exec = ShellExecutor::new("echo broken >&2; exit 3");
        let failure = exec.execute(&task, &agent).await.unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.message, "broken");
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let (task, agent) = fixtures();
        let exec = ShellExecutor::new("sleep 5").with_timeout(Duration::from_secs(1));
        let failure = exec.execute(&task, &agent).await.unwrap_err();
        assert!(failure.message.contains("timed out"));
        assert!(failure.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_shell_runs_in_agent_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work-db");
        let (task, agent) = fixtures();
        let agent = Agent {
            working_dir: Some(work.clone()),
            ..agent
        };
        let exec = ShellExecutor::new("touch marker");
        exec.execute(&task, &agent).await.unwrap();
        assert!(work.join("marker").exists());
    }

    #[tokio::test]
    async fn test_shell_syncs_files_with_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(root.join("db")).unwrap();
        std::fs::write(root.join("db/schema.sql"), "-- v1\n").unwrap();
        std::fs::create_dir_all(root.join("memory")).unwrap();
        std::fs::write(root.join("memory/notes.md"), "notes").unwrap();

        let work = dir.path().join("work-db");
        let (task, agent) = fixtures();
        let agent = Agent {
            working_dir: Some(work.clone()),
            ..agent
        };
        let exec = ShellExecutor::new("echo \"$TANDEM_PROJECT_ROOT\" > root.txt; echo '-- v2' >> db/schema.sql")
            .with_project_root(&root);
        exec.execute(&task, &agent).await.unwrap();

        assert!(work.join("memory/notes.md").exists());
        assert_eq!(
            std::fs::read_to_string(root.join("db/schema.sql")).unwrap(),
            "-- v1\n-- v2\n"
        );
        assert!(!root.join("root.txt").exists());
        let exported = std::fs::read_to_string(work.join("root.txt")).unwrap();
        assert_eq!(exported.trim(), root.display().to_string());
    }

    #[tokio::test]
    async fn test_failed_task_is_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        std::fs::create_dir_all(&root).unwrap();
        let (task, agent) = fixtures();
        let agent = Agent {
            working_dir: Some(dir.path().join("work-db")),
            ..agent
        };
        let exec = ShellExecutor::new("mkdir -p db && echo half > db/schema.sql && exit 1")
            .with_project_root(&root);
        assert!(exec.execute(&task, &agent).await.is_err());
        assert!(!root.join("db/schema.sql").exists());
    }

    #[tokio::test]
    async fn test_working_dir_equal_to_root_is_not_synced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("db")).unwrap();
        std::fs::write(dir.path().join("db/schema.sql"), "keep").unwrap();
        let (task, agent) = fixtures();
        let agent = Agent {
            working_dir: Some(dir.path().to_path_buf()),
            ..agent
        };
        let exec = ShellExecutor::new("true").with_project_root(dir.path());
        exec.execute(&task, &agent).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("db/schema.sql")).unwrap(),
            "keep"
        );
    }

    #[tokio::test]
    async fn test_fn_executor() {
        let (task, agent) = fixtures();
        let exec = FnExecutor::new(|task: Task, _agent: Agent| async move {
            if task.component == "database" {
                Err(ExecutionFailure::new("no db today"))
            } else {
                Ok(())
            }
        });
        assert!(exec.execute(&task, &agent).await.is_err());
        assert!(DryRunExecutor.execute(&task, &agent).await.is_ok());
    }
}
