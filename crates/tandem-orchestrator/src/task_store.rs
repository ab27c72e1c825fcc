use crate::report::StatusCounts;
use crate::types::{ExecutionFailure, Task, TaskSpec, TaskStatus};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tandem_core::{TandemError, TandemResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// In-memory task collection with validated status transitions.
///
/// Tasks keep the order they were loaded in; every query that returns
/// several tasks returns them in that order.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    completed: BTreeSet<String>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a task list, rejecting duplicate ids, unknown or
    /// self dependencies, and dependency cycles.
    pub fn from_specs(specs: Vec<TaskSpec>) -> TandemResult<Self> {
        let mut store = Self::new();
        store.extend(specs)?;
        Ok(store)
    }

    /// Append tasks. Validation covers the combined graph; on error the store
    /// is left untouched.
    pub fn extend(&mut self, specs: Vec<TaskSpec>) -> TandemResult<usize> {
        let mut next = self.clone();
        let added = specs.len();

        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(TandemError::Config("task with empty id".to_string()));
            }
            if next.index.contains_key(&spec.id) {
                return Err(TandemError::Config(format!(
                    "duplicate task id '{}'",
                    spec.id
                )));
            }
            if spec.dependencies.iter().any(|dep| *dep == spec.id) {
                return Err(TandemError::Config(format!(
                    "task '{}' depends on itself",
                    spec.id
                )));
            }
            next.index.insert(spec.id.clone(), next.tasks.len());
            next.tasks.push(Task::from_spec(spec));
        }

        for task in &next.tasks {
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|dep| !next.index.contains_key(dep.as_str()))
            {
                return Err(TandemError::Config(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
        }

        if let Some(cycle) = next.find_cycle() {
            return Err(TandemError::Config(format!(
                "dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }

        *self = next;
        Ok(added)
    }

    /// Get a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&idx| &self.tasks[idx])
    }

    /// All tasks in load order.
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Pending tasks whose dependencies are all Completed.
    pub fn ready(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.is_ready(&self.completed))
            .collect()
    }

    /// Tasks currently holding an agent (Assigned or InProgress).
    pub fn active(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status.is_active()).collect()
    }

    /// Union of the file sets of all active tasks.
    pub fn active_file_set(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_active())
            .flat_map(|t| t.files.iter().cloned())
            .collect()
    }

    /// No task is Pending, Assigned or InProgress.
    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            counts.record(task.status);
        }
        counts
    }

    /// `Pending -> Assigned`, binding the task to `agent_id`.
    pub fn assign(&mut self, id: &str, agent_id: &str) -> TandemResult<()> {
        if let Some(holder) = self
            .tasks
            .iter()
            .find(|t| t.assigned_agent.as_deref() == Some(agent_id))
        {
            return Err(TandemError::Orchestrator(format!(
                "agent '{agent_id}' already holds task '{}'",
                holder.id
            )));
        }
        let task = self.transition(id, TaskStatus::Assigned)?;
        task.assigned_agent = Some(agent_id.to_string());
        Ok(())
    }

    /// `Assigned -> InProgress`.
    pub fn start(&mut self, id: &str) -> TandemResult<()> {
        let task = self.transition(id, TaskStatus::InProgress)?;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// `InProgress -> Completed`, releasing the agent binding.
    pub fn complete(&mut self, id: &str) -> TandemResult<()> {
        let task = self.transition(id, TaskStatus::Completed)?;
        task.executed_by = task.assigned_agent.take();
        task.finished_at = Some(Utc::now());
        self.completed.insert(id.to_string());
        Ok(())
    }

    /// `InProgress -> Failed`, recording the cause and releasing the agent binding.
    pub fn fail(&mut self, id: &str, failure: ExecutionFailure) -> TandemResult<()> {
        let task = self.transition(id, TaskStatus::Failed)?;
        task.executed_by = task.assigned_agent.take();
        task.failure = Some(failure);
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, id: &str, next: TaskStatus) -> TandemResult<&mut Task> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| TandemError::Orchestrator(format!("unknown task '{id}'")))?;
        let task = &mut self.tasks[idx];
        if !task.status.can_transition_to(next) {
            return Err(TandemError::InvalidTransition {
                task_id: id.to_string(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        task.status = next;
        Ok(task)
    }

    /// Find a dependency cycle, returned as the id path that closes it
    /// (`["T1", "T2", "T1"]`).
    ///
    /// Depth-first with an explicit stack, so long chains cannot overflow
    /// the call stack.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for task in &self.tasks {
            if marks.contains_key(task.id.as_str()) {
                continue;
            }
            marks.insert(&task.id, Mark::Visiting);
            let mut stack = vec![(task.id.as_str(), task.dependencies.iter())];
            while let Some((id, deps)) = stack.last_mut() {
                let id = *id;
                let Some(dep) = deps.next() else {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                };
                match marks.get(dep.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let pos = stack.iter().position(|(p, _)| *p == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|(p, _)| p.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    None => {
                        if let Some(next) = self.get(dep) {
                            marks.insert(&next.id, Mark::Visiting);
                            stack.push((next.id.as_str(), next.dependencies.iter()));
                        }
                    }
                }
            }
        }
        None
    }

    /// Failed tasks upstream of `id` that keep it from ever becoming ready.
    pub fn failed_roots(&self, id: &str) -> BTreeSet<String> {
        let mut roots = BTreeSet::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = vec![id];
        while let Some(current) = pending.pop() {
            let Some(task) = self.get(current) else {
                continue;
            };
            for dep in &task.dependencies {
                if !seen.insert(dep) {
                    continue;
                }
                match self.get(dep).map(|t| t.status) {
                    Some(TaskStatus::Completed) => {}
                    Some(TaskStatus::Failed) => {
                        roots.insert(dep.clone());
                    }
                    _ => pending.push(dep),
                }
            }
        }
        roots
    }

    /// Human-readable reason a Pending task never ran, or `None` when the
    /// task is not Pending.
    pub fn blocked_reason(&self, id: &str) -> Option<String> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        let unmet: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|dep| !self.completed.contains(dep.as_str()))
            .map(String::as_str)
            .collect();
        if unmet.is_empty() {
            return Some("ready but never scheduled".to_string());
        }

        let roots = self.failed_roots(id);
        let roots_list = roots.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
        let reason = if roots.is_empty() {
            format!("waiting on {}", unmet.join(", "))
        } else if unmet.iter().all(|dep| roots.contains(*dep)) {
            format!("blocked by failed dependency {roots_list}")
        } else {
            format!(
                "waiting on {}, blocked upstream by failed {roots_list}",
                unmet.join(", ")
            )
        };
        Some(reason)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn chain() -> TaskStore {
        TaskStore::from_specs(vec![
            TaskSpec::new("T1", "Spec").component("database"),
            TaskSpec::new("T2", "Code").depends_on(["T1"]),
            TaskSpec::new("T3", "Test").depends_on(["T2"]),
            TaskSpec::new("T4", "Review").depends_on(["T2", "T3"]),
        ])
        .unwrap()
    }

    fn run_to_completion(store: &mut TaskStore, id: &str) {
        store.assign(id, "agent").unwrap();
        store.start(id).unwrap();
        store.complete(id).unwrap();
    }

    #[test]
    fn test_empty_store() {
        let store = TaskStore::new();
        assert_eq!(store.total_count(), 0);
        assert!(store.is_done());
        assert!(store.ready().is_empty());
    }

    #[test]
    fn test_ready_preserves_load_order() {
        let store = TaskStore::from_specs(vec![
            TaskSpec::new("T3", "c"),
            TaskSpec::new("T1", "a"),
            TaskSpec::new("T2", "b"),
        ])
        .unwrap();
        let ids: Vec<&str> = store.ready().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["T3", "T1", "T2"]);
    }

    #[test]
    fn test_dependency_chain() {
        let mut store = chain();
        assert_eq!(store.ready().len(), 1);

        run_to_completion(&mut store, "T1");
        assert_eq!(store.ready()[0].id, "T2");

        run_to_completion(&mut store, "T2");
        assert_eq!(store.ready()[0].id, "T3");

        run_to_completion(&mut store, "T3");
        assert_eq!(store.ready()[0].id, "T4");

        run_to_completion(&mut store, "T4");
        assert!(store.is_done());
        assert_eq!(store.count(TaskStatus::Completed), 4);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = TaskStore::from_specs(vec![TaskSpec::new("T1", "a"), TaskSpec::new("T1", "b")])
            .unwrap_err();
        assert!(matches!(err, TandemError::Config(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err =
            TaskStore::from_specs(vec![TaskSpec::new("T1", "a").depends_on(["T9"])]).unwrap_err();
        assert!(matches!(err, TandemError::Config(msg) if msg.contains("unknown task 'T9'")));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err =
            TaskStore::from_specs(vec![TaskSpec::new("T1", "a").depends_on(["T1"])]).unwrap_err();
        assert!(matches!(err, TandemError::Config(msg) if msg.contains("itself")));
    }

    #[test]
    fn test_cycle_detection() {
        let err = TaskStore::from_specs(vec![
            TaskSpec::new("T1", "a").depends_on(["T2"]),
            TaskSpec::new("T2", "b").depends_on(["T1"]),
        ])
        .unwrap_err();
        match err {
            TandemError::Config(msg) => assert!(msg.contains("T1 -> T2 -> T1"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let n = 100_000;
        let specs: Vec<TaskSpec> = (0..n)
            .map(|i| {
                let spec = TaskSpec::new(format!("T{i}"), "step");
                if i == 0 {
                    spec
                } else {
                    spec.depends_on([format!("T{}", i - 1)])
                }
            })
            .collect();
        let mut store = TaskStore::from_specs(specs).unwrap();
        assert!(store.find_cycle().is_none());

        store.assign("T0", "agent").unwrap();
        store.start("T0").unwrap();
        store.fail("T0", ExecutionFailure::new("boom")).unwrap();
        let last = format!("T{}", n - 1);
        assert_eq!(
            store.blocked_reason(&last).unwrap(),
            format!("waiting on T{}, blocked upstream by failed T0", n - 2)
        );
    }

    #[test]
    fn test_cycle_path_excludes_lead_in() {
        let err = TaskStore::from_specs(vec![
            TaskSpec::new("A", "a").depends_on(["B"]),
            TaskSpec::new("B", "b").depends_on(["C"]),
            TaskSpec::new("C", "c").depends_on(["B"]),
        ])
        .unwrap_err();
        match err {
            TandemError::Config(msg) => {
                assert!(msg.ends_with("cycle detected: B -> C -> B"), "{msg}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_cycle_in_diamond() {
        let store = TaskStore::from_specs(vec![
            TaskSpec::new("A", "a"),
            TaskSpec::new("B", "b").depends_on(["A"]),
            TaskSpec::new("C", "c").depends_on(["A"]),
            TaskSpec::new("D", "d").depends_on(["B", "C"]),
        ])
        .unwrap();
        assert!(store.find_cycle().is_none());
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut store = chain();
        let err = store
            .extend(vec![
                TaskSpec::new("T5", "ok").depends_on(["T4"]),
                TaskSpec::new("T6", "bad").depends_on(["T99"]),
            ])
            .unwrap_err();
        assert!(matches!(err, TandemError::Config(_)));
        assert_eq!(store.total_count(), 4);
        assert!(store.get("T5").is_none());

        assert_eq!(store.extend(vec![TaskSpec::new("T5", "ok").depends_on(["T4"])]).unwrap(), 1);
        assert_eq!(store.total_count(), 5);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut store = chain();
        let err = store.start("T1").unwrap_err();
        assert!(matches!(err, TandemError::InvalidTransition { .. }));

        run_to_completion(&mut store, "T1");
        let err = store.assign("T1", "other").unwrap_err();
        match err {
            TandemError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "completed");
                assert_eq!(to, "assigned");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_agent_binding_lifecycle() {
        let mut store = chain();
        store.assign("T1", "db").unwrap();
        assert_eq!(store.get("T1").unwrap().assigned_agent.as_deref(), Some("db"));

        store.start("T1").unwrap();
        assert_eq!(store.get("T1").unwrap().assigned_agent.as_deref(), Some("db"));
        assert!(store.get("T1").unwrap().started_at.is_some());

        store.fail("T1", ExecutionFailure::new("boom").with_exit_code(2)).unwrap();
        let task = store.get("T1").unwrap();
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.executed_by.as_deref(), Some("db"));
        assert_eq!(task.failure.as_ref().unwrap().exit_code, Some(2));
    }

    #[test]
    fn test_agent_cannot_hold_two_tasks() {
        let mut store =
            TaskStore::from_specs(vec![TaskSpec::new("A", "a"), TaskSpec::new("B", "b")]).unwrap();
        store.assign("A", "solo").unwrap();
        let err = store.assign("B", "solo").unwrap_err();
        assert!(matches!(err, TandemError::Orchestrator(_)));
        assert_eq!(store.get("B").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_active_file_set() {
        let mut store = TaskStore::from_specs(vec![
            TaskSpec::new("A", "a").files(["a.rs", "shared.rs"]),
            TaskSpec::new("B", "b").files(["b.rs"]),
            TaskSpec::new("C", "c").files(["c.rs"]),
        ])
        .unwrap();
        store.assign("A", "x").unwrap();
        store.assign("B", "y").unwrap();
        store.start("B").unwrap();

        let files = store.active_file_set();
        assert_eq!(files.len(), 3);
        assert!(files.contains("shared.rs"));
        assert!(!files.contains("c.rs"));
        assert_eq!(store.active().len(), 2);
    }

    #[test]
    fn test_is_done_with_failed() {
        let mut store = TaskStore::from_specs(vec![TaskSpec::new("T1", "a")]).unwrap();
        assert!(!store.is_done());
        store.assign("T1", "x").unwrap();
        assert!(!store.is_done());
        store.start("T1").unwrap();
        store.fail("T1", ExecutionFailure::new("error")).unwrap();
        assert!(store.is_done());
    }

    #[test]
    fn test_blocked_reasons() {
        let mut store = chain();
        store.assign("T1", "x").unwrap();
        store.start("T1").unwrap();
        store.fail("T1", ExecutionFailure::new("error")).unwrap();

        assert_eq!(
            store.blocked_reason("T2").unwrap(),
            "blocked by failed dependency T1"
        );
        assert_eq!(
            store.blocked_reason("T3").unwrap(),
            "waiting on T2, blocked upstream by failed T1"
        );
        assert!(store.blocked_reason("T1").is_none());
        assert_eq!(
            store.failed_roots("T4"),
            BTreeSet::from(["T1".to_string()])
        );
    }

    #[test]
    fn test_status_counts() {
        let mut store = chain();
        store.assign("T1", "x").unwrap();
        let counts = store.status_counts();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.assigned, 1);
        assert_eq!(counts.total(), 4);
    }
}
