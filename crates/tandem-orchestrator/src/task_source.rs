//! Loading task lists from `tasks.md`, JSON or TOML files.
//!
//! Two markdown layouts are understood and may be mixed. Task blocks:
//!
//! ```markdown
//! ### T001 [P]: Create user schema
//! **Description:** Create the users table and indexes
//! **Component:** database
//! **Files:** db/schema.sql, db/seed.sql
//! **Dependencies:** none
//! **Effort:** 2
//! ```
//!
//! and checklist lines grouped under phases, with a dependency section:
//!
//! ```markdown
//! ## Phase 3.2: Tests
//! - [ ] T004 [P] Contract test POST /users in tests/contract/test_users.py
//!
//! ## Dependencies
//! - T004 blocks T008, T009
//! - Tests (T004-T007) before implementation (T008-T014)
//! ```
//!
//! `[P]` marks a task parallel-safe. Every field line is optional; the title
//! stands in for a missing description and the component defaults to
//! `general`. A checklist task takes its component from the phase name and
//! its files from the paths mentioned in its description.

use crate::types::TaskSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tandem_core::{TandemError, TandemResult};
use tracing::warn;

const DESCRIPTION: &str = "**Description:**";
const COMPONENT: &str = "**Component:**";
const FILES: &str = "**Files:**";
const DEPENDENCIES: &str = "**Dependencies:**";
const EFFORT: &str = "**Effort:**";
const PARALLEL_MARKER: &str = "[P]";
const CHECKBOXES: [&str; 3] = ["- [ ] ", "- [x] ", "- [X] "];
const MAX_RANGE: u64 = 10_000;

/// Parse a `tasks.md` document.
pub fn parse_markdown(content: &str) -> TandemResult<Vec<TaskSpec>> {
    let mut tasks = Vec::new();
    let mut current: Option<TaskSpec> = None;
    let mut phase: Option<String> = None;
    let mut in_dependencies = false;
    // (dependent, prerequisite) pairs from the dependency section.
    let mut edges: Vec<(String, String)> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        if line.starts_with('#') {
            if let Some(done) = current.take() {
                tasks.push(done);
            }
            in_dependencies = false;
            if let Some(rest) = line.strip_prefix("### ") {
                current = parse_header(rest);
            } else if let Some(rest) = line.strip_prefix("## ") {
                let heading = rest.trim();
                if heading.eq_ignore_ascii_case("dependencies") {
                    in_dependencies = true;
                } else if let Some(name) = phase_name(heading) {
                    phase = Some(name);
                }
            }
            continue;
        }

        if in_dependencies {
            edges.extend(parse_dependency_line(line));
            continue;
        }

        if let Some(task) = parse_checklist(line, phase.as_deref()) {
            if let Some(done) = current.replace(task) {
                tasks.push(done);
            }
            continue;
        }

        let Some(task) = current.as_mut() else {
            continue;
        };
        let line = line.trim_start_matches("- ").trim_start();

        if let Some(value) = line.strip_prefix(DESCRIPTION) {
            task.description = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix(COMPONENT) {
            let value = value.trim();
            if !value.is_empty() {
                task.component = value.to_string();
            }
        } else if let Some(value) = line.strip_prefix(FILES) {
            task.files = split_list(value);
        } else if let Some(value) = line.strip_prefix(DEPENDENCIES) {
            task.dependencies = split_list(value);
        } else if let Some(value) = line.strip_prefix(EFFORT) {
            task.estimated_effort = value.trim().parse().map_err(|_| {
                TandemError::TaskSource(format!(
                    "line {line_no}: task {}: invalid effort '{}'",
                    task.id,
                    value.trim()
                ))
            })?;
        }
    }

    if let Some(done) = current.take() {
        tasks.push(done);
    }
    apply_edges(&mut tasks, edges);
    Ok(tasks)
}

/// `T001 [P]: Title` -> task spec, or `None` when the heading is not a task.
fn parse_header(rest: &str) -> Option<TaskSpec> {
    let rest = rest.trim();
    let first = rest.split_whitespace().next()?;
    let id = first.trim_end_matches(':');
    if !is_task_id(id) {
        return None;
    }

    let parallel_safe = rest.contains(PARALLEL_MARKER);
    let title = rest[first.len()..]
        .replace(PARALLEL_MARKER, "")
        .trim()
        .trim_start_matches(':')
        .trim()
        .to_string();

    Some(TaskSpec::new(id, title).parallel_safe(parallel_safe))
}

/// `Phase 3.1: Setup` -> `setup`.
fn phase_name(heading: &str) -> Option<String> {
    let rest = heading.strip_prefix("Phase ")?;
    let (_, name) = rest.split_once(':')?;
    let name = name.trim().to_lowercase();
    (!name.is_empty()).then_some(name)
}

/// `- [ ] T004 [P] Contract test in tests/test_users.py`
fn parse_checklist(line: &str, phase: Option<&str>) -> Option<TaskSpec> {
    let rest = CHECKBOXES
        .iter()
        .find_map(|checkbox| line.strip_prefix(checkbox))?
        .trim_start();
    let first = rest.split_whitespace().next()?;
    let id = first.trim_end_matches(':');
    if !is_task_id(id) {
        return None;
    }

    let mut description = rest[first.len()..].trim_start();
    let parallel_safe = description.starts_with(PARALLEL_MARKER);
    if parallel_safe {
        description = description[PARALLEL_MARKER.len()..].trim_start();
    }
    let description = description.trim_start_matches(':').trim();

    let mut task = TaskSpec::new(id, description)
        .files(mentioned_files(description))
        .parallel_safe(parallel_safe);
    if let Some(phase) = phase {
        task = task.component(phase);
    }
    Some(task)
}

/// Relative paths mentioned in free text: backticked names with an extension,
/// anything containing `/`, and `in|at <name.ext>`. URL paths such as
/// `/users` are not files.
fn mentioned_files(text: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut previous = "";
    for word in text.split_whitespace() {
        let backticked = word.starts_with('`');
        let candidate = word
            .trim_matches(|c: char| matches!(c, '`' | ',' | ';' | ':' | '(' | ')' | '"' | '\''))
            .trim_end_matches('.');
        let path_like = !candidate.is_empty()
            && !candidate.starts_with('/')
            && !candidate.split('/').any(|part| part == "..")
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '.' | '-'));
        let after_preposition = previous.eq_ignore_ascii_case("in") || previous.eq_ignore_ascii_case("at");
        if path_like
            && (candidate.contains('/')
                || ((backticked || after_preposition) && has_extension(candidate)))
            && !files.iter().any(|f| f == candidate)
        {
            files.push(candidate.to_string());
        }
        previous = word;
    }
    files
}

fn has_extension(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

/// `T008 blocks T009, T015` or `<ids> before <ids>` -> (dependent,
/// prerequisite) pairs.
fn parse_dependency_line(line: &str) -> Vec<(String, String)> {
    let line = line.trim_start_matches(['-', '*']).trim();
    let (prerequisites, dependents) = if let Some((left, right)) = line.split_once(" blocks ") {
        (task_refs(left), task_refs(right))
    } else if let Some((left, right)) = line.split_once(" before ") {
        (task_refs(left), task_refs(right))
    } else {
        return Vec::new();
    };

    let mut edges = Vec::new();
    for dependent in &dependents {
        for prerequisite in &prerequisites {
            edges.push((dependent.clone(), prerequisite.clone()));
        }
    }
    edges
}

/// Task ids mentioned in `text`, with `T004-T007` ranges expanded. Range ids
/// keep the zero padding of the range start.
fn task_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let tokens = text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    for token in tokens.filter(|t| !t.is_empty()) {
        if let Some((start, end)) = token.split_once('-') {
            if is_task_id(start) && is_task_id(end) {
                refs.extend(expand_range(start, end).unwrap_or_default());
                continue;
            }
        }
        if is_task_id(token) {
            refs.push(token.to_string());
        }
    }
    refs
}

fn expand_range(start: &str, end: &str) -> Option<Vec<String>> {
    let digits = start.strip_prefix('T')?;
    let from: u64 = digits.parse().ok()?;
    let to: u64 = end.strip_prefix('T')?.parse().ok()?;
    if to < from || to - from > MAX_RANGE {
        return None;
    }
    let width = digits.len();
    Some((from..=to).map(|n| format!("T{n:0width$}")).collect())
}

/// Add dependency-section edges to the parsed tasks. Edges naming tasks the
/// document does not define are skipped.
fn apply_edges(tasks: &mut [TaskSpec], edges: Vec<(String, String)>) {
    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for (dependent, prerequisite) in edges {
        if dependent == prerequisite {
            continue;
        }
        if !known.contains(&dependent) || !known.contains(&prerequisite) {
            warn!(
                dependent = %dependent,
                prerequisite = %prerequisite,
                "Ignoring dependency on a task that is not defined"
            );
            continue;
        }
        if let Some(task) = tasks.iter_mut().find(|t| t.id == dependent) {
            if !task.dependencies.contains(&prerequisite) {
                task.dependencies.push(prerequisite);
            }
        }
    }
}

/// `T` followed by a digit, then letters, digits, `-` or `_`.
fn is_task_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next() == Some('T')
        && chars.next().is_some_and(|c| c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn split_list(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") || value == "-" {
        return Vec::new();
    }
    value
        .split(',')
        .map(|item| item.trim().trim_matches('`').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonTasks {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

/// Parse a JSON array of tasks, or an object with a `tasks` array.
pub fn parse_json(content: &str) -> TandemResult<Vec<TaskSpec>> {
    Ok(match serde_json::from_str::<JsonTasks>(content)? {
        JsonTasks::List(tasks) | JsonTasks::Wrapped { tasks } => tasks,
    })
}

#[derive(Deserialize)]
struct TomlTasks {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// Parse `[[tasks]]` tables.
pub fn parse_toml(content: &str) -> TandemResult<Vec<TaskSpec>> {
    Ok(toml::from_str::<TomlTasks>(content)?.tasks)
}

/// Load a task file, choosing the format by extension (`.md`, `.json`,
/// `.toml`).
pub async fn load_tasks(path: &Path) -> TandemResult<Vec<TaskSpec>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        TandemError::TaskSource(format!("failed to read '{}': {e}", path.display()))
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "md" | "markdown" => parse_markdown(&content),
        "json" => parse_json(&content),
        "toml" => parse_toml(&content),
        other => Err(TandemError::TaskSource(format!(
            "unsupported task file extension '{other}' for '{}'",
            path.display()
        ))),
    }
}
