//! Syncing task files between the project root and agent workspaces.
//!
//! An agent with a `working_dir` works on private copies. Before a task runs,
//! the shared directories (`specs/`, `memory/`, ...) are seeded into the
//! workspace once and the task's own files are pulled from the project root.
//! After the task succeeds its files are merged back, so a dependent task
//! running on another agent sees them.

use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directories copied into every agent workspace when present.
pub fn default_seed_dirs() -> Vec<PathBuf> {
    ["specs", "memory", "templates"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// Whether two paths point at the same directory. Copying a file onto
/// itself would truncate it.
pub async fn same_dir(a: &Path, b: &Path) -> bool {
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copy each existing `dirs` entry under `root` into `working_dir`.
pub async fn seed(root: &Path, working_dir: &Path, dirs: &[PathBuf]) -> io::Result<usize> {
    let mut seeded = 0;
    for dir in dirs {
        let relative = checked_relative(dir)?;
        let source = root.join(relative);
        if tokio::fs::metadata(&source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            copy_tree(&source, &working_dir.join(relative)).await?;
            seeded += 1;
        }
    }
    Ok(seeded)
}

/// Copy the listed files from `from` to `to`, skipping the ones `from` does
/// not have. Returns how many were copied.
pub async fn copy_files<'a, I>(from: &Path, to: &Path, files: I) -> io::Result<usize>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut copied = 0;
    for file in files {
        let relative = checked_relative(Path::new(file))?;
        if copy_file(&from.join(relative), &to.join(relative)).await? {
            copied += 1;
        }
    }
    Ok(copied)
}

async fn copy_file(source: &Path, target: &Path) -> io::Result<bool> {
    match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, target).await?;
    debug!(source = %source.display(), target = %target.display(), "Copied file");
    Ok(true)
}

/// Recursive directory copy with an explicit work list.
async fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            let dest = to.join(entry.file_name());
            if kind.is_dir() {
                pending.push((entry.path(), dest));
            } else if kind.is_file() {
                tokio::fs::copy(entry.path(), dest).await?;
            }
        }
    }
    Ok(())
}

/// Task files must stay inside the directories they are synced between.
fn checked_relative(path: &Path) -> io::Result<&Path> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path '{}' must be relative to the project root", path.display()),
        ));
    }
    Ok(path)
}
