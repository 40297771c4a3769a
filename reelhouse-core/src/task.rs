use serde::Serialize;
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    artifact::{ArtifactKind, ArtifactParams, FileRef, ResourceClass},
    error::TaskFailure,
    job::JobId,
    plan,
    process::ProcessRunner,
    store::ArtifactStore,
    tools::Capabilities,
};

/// One artifact for one file. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactTask {
    pub file: FileRef,
    pub kind: ArtifactKind,
    pub params: ArtifactParams,
    pub resource_class: ResourceClass,
    pub timeout: Duration,
}

impl ArtifactTask {
    pub fn new(
        file: FileRef,
        kind: ArtifactKind,
        params: ArtifactParams,
        timeout: Duration,
    ) -> Self {
        Self {
            file,
            kind,
            params,
            resource_class: kind.resource_class(),
            timeout,
        }
    }

    /// Identity used to keep a single (file, kind) pair in flight.
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            file: self.file.clone(),
            kind: self.kind,
        }
    }

    /// Run the plan for this task and persist the artifact.
    pub async fn execute(
        &self,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TaskFailure> {
        plan::execute(self, ctx, cancel).await
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DedupeKey {
    pub file: FileRef,
    pub kind: ArtifactKind,
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.file)
    }
}

/// Position of a task inside its job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub job: JobId,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Admitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::TimedOut
                | TaskState::Cancelled
        )
    }
}

/// Collaborators a task needs while it runs.
#[derive(Clone)]
pub struct TaskContext {
    pub runner: Arc<dyn ProcessRunner>,
    pub store: Arc<dyn ArtifactStore>,
    pub capabilities: Capabilities,
    /// Thread hint forwarded to every tool.
    pub threads: usize,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("capabilities", &self.capabilities)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
