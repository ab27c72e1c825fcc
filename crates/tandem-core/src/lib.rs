//! Core error definitions for the Tandem task orchestrator.
//!
//! This crate provides the types shared across all Tandem crates.
//!
//! # Main types
//!
//! - [`TandemError`]: Unified error enum for configuration, task loading and orchestration.
//! - [`TandemResult`]: Convenience alias for `Result<T, TandemError>`.

/// Top-level error type for the Tandem orchestrator.
///
/// Only [`TandemError::Config`] and [`TandemError::InvalidTransition`] are produced
/// by the scheduling core itself; a failing work unit is never an error at this level,
/// it is recorded on the task and the run continues.
#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    /// Malformed task or agent input: duplicate ids, unknown or self dependencies,
    /// dependency cycles, or no agents to run pending work on.
    #[error("Config error: {0}")]
    Config(String),

    /// A task status change that the task state machine does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task whose status change was rejected.
        task_id: String,
        /// Status the task was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// A task source (markdown, JSON or TOML task list) could not be parsed.
    #[error("Task source error: {0}")]
    TaskSource(String),

    /// Internal bookkeeping failure inside the orchestrator.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`TandemError`].
pub type TandemResult<T> = Result<T, TandemError>;
