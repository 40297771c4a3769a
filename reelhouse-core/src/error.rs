use serde::Serialize;
use thiserror::Error;

use crate::job::JobId;

/// Errors returned synchronously by the scheduler control surface.
///
/// None of these describe a failure of work that is already queued; task
/// failures are captured per task as [`TaskFailure`] and rolled up into the
/// job state instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unrecognized artifact kind: {0}")]
    InvalidKind(String),

    #[error("no files were given")]
    EmptyFileSet,

    #[error("invalid artifact parameters: {0}")]
    InvalidParams(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} is already terminal")]
    AlreadyTerminal(JobId),

    #[error("an identical artifact task is already in flight for {file}")]
    DuplicateInFlight { file: String },

    #[error("artifact kind {kind} is unavailable: missing {missing}")]
    KindUnavailable { kind: String, missing: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Terminal outcome of a single artifact task that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The tool binary (or its model) is missing. Never retried.
    #[error("tool unavailable: {tool}")]
    ToolUnavailable { tool: String },

    #[error("tool exceeded its time limit")]
    TimedOut,

    #[error("tool exited with {exit_code:?}: {stderr}")]
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The OS refused to start the process for a reason other than a missing
    /// binary. Re-queued without consuming an attempt.
    #[error("failed to spawn {tool}: {message}")]
    SpawnFailed { tool: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("artifact could not be stored: {message}")]
    Artifact { message: String },

    /// The worker itself panicked. Never retried.
    #[error("worker panicked: {message}")]
    Panicked { message: String },
}

impl TaskFailure {
    /// Short machine-readable tag, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            TaskFailure::ToolUnavailable { .. } => "tool_unavailable",
            TaskFailure::TimedOut => "timed_out",
            TaskFailure::ProcessFailed { .. } => "process_failed",
            TaskFailure::SpawnFailed { .. } => "spawn_failed",
            TaskFailure::Cancelled => "cancelled",
            TaskFailure::Artifact { .. } => "artifact",
            TaskFailure::Panicked { .. } => "panicked",
        }
    }

    pub(crate) fn artifact(err: impl std::fmt::Display) -> Self {
        TaskFailure::Artifact {
            message: err.to_string(),
        }
    }
}
