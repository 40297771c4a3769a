//! User-visible jobs and their rolled-up state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    artifact::{ArtifactKind, FileRef, Priority},
    error::TaskFailure,
    task::{ArtifactTask, TaskKey, TaskState},
};

/// Unique identifier for jobs. Time ordered and never reused.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    /// Every task finished, some succeeded and some failed.
    DoneWithErrors,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::DoneWithErrors => "done_with_errors",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Aggregate progress. `completed + failed + cancelled <= total` always
/// holds, and `total` is fixed at submission.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl Progress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Per-task bookkeeping owned by the job.
#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub task: ArtifactTask,
    pub state: TaskState,
    /// Process-level attempts, including the current one.
    pub attempts: u32,
    /// Consecutive spawn failures; they do not consume attempts.
    pub spawn_failures: u32,
    pub failure: Option<TaskFailure>,
    pub output: Option<PathBuf>,
    /// Set when another job's task already produces this artifact. The
    /// record is never queued and mirrors that task instead.
    pub subscribed_to: Option<TaskKey>,
}

impl TaskRecord {
    fn new(task: ArtifactTask) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            attempts: 0,
            spawn_failures: 0,
            failure: None,
            output: None,
            subscribed_to: None,
        }
    }

    /// Copy the observable outcome of the task this record follows.
    pub(crate) fn mirror(&mut self, source: &TaskRecord) {
        self.state = match source.state {
            TaskState::Admitted => TaskState::Running,
            state => state,
        };
        self.attempts = source.attempts;
        self.failure = source.failure.clone();
        self.output = source.output.clone();
    }
}

/// Outcome for one file of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileResult {
    pub file: FileRef,
    pub state: TaskState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Job whose task is producing this file's artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_with: Option<JobId>,
}

/// Read-only view returned by status queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: ArtifactKind,
    pub batch: bool,
    pub priority: Priority,
    pub state: JobState,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub results: Vec<FileResult>,
    /// Files whose artifact was already in flight for another job when
    /// this one was submitted.
    pub coalesced: Vec<FileRef>,
}

/// Dashboard row: a snapshot without per-file results.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: ArtifactKind,
    pub batch: bool,
    pub priority: Priority,
    pub state: JobState,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Mutable job record. Only the scheduler mutates it, always under its
/// state lock.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Submission order, used for most-recent-first listing.
    pub sequence: u64,
    pub kind: ArtifactKind,
    pub batch: bool,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic completion instant used for retention.
    pub finished: Option<Instant>,
    pub cancel_requested: bool,
    pub state: JobState,
    pub tasks: Vec<TaskRecord>,
    pub coalesced: Vec<FileRef>,
    started: bool,
}

impl Job {
    pub fn new(
        id: JobId,
        sequence: u64,
        kind: ArtifactKind,
        batch: bool,
        priority: Priority,
        tasks: Vec<ArtifactTask>,
        coalesced: Vec<FileRef>,
    ) -> Self {
        Self {
            id,
            sequence,
            kind,
            batch,
            priority,
            created_at: Utc::now(),
            finished_at: None,
            finished: None,
            cancel_requested: false,
            state: JobState::Pending,
            tasks: tasks.into_iter().map(TaskRecord::new).collect(),
            coalesced,
            started: false,
        }
    }

    pub fn key(&self, index: usize) -> TaskKey {
        TaskKey {
            job: self.id,
            index,
        }
    }

    /// Follow `owner` for the task at `index` instead of running it.
    pub(crate) fn subscribe(&mut self, index: usize, owner: TaskKey) {
        if let Some(record) = self.tasks.get_mut(index) {
            record.subscribed_to = Some(owner);
        }
    }

    /// Record that a child was admitted; the job leaves `Pending`.
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.tasks.len(),
            ..Progress::default()
        };
        for record in &self.tasks {
            match record.state {
                TaskState::Succeeded => progress.completed += 1,
                TaskState::Failed | TaskState::TimedOut => progress.failed += 1,
                TaskState::Cancelled => progress.cancelled += 1,
                TaskState::Pending | TaskState::Admitted | TaskState::Running => {}
            }
        }
        progress
    }

    /// Compute the rolled-up state from the children.
    pub fn rollup(&self, fail_batch_on_child_failure: bool) -> JobState {
        let progress = self.progress();
        if progress.finished() < progress.total {
            return if self.started {
                JobState::Running
            } else {
                JobState::Pending
            };
        }
        if self.cancel_requested && progress.cancelled > 0 {
            JobState::Cancelled
        } else if fail_batch_on_child_failure && progress.failed > 0 {
            JobState::Failed
        } else if progress.completed == progress.total {
            JobState::Done
        } else if progress.completed == 0 {
            JobState::Failed
        } else {
            JobState::DoneWithErrors
        }
    }

    /// Recompute `state`; returns true when the job just became terminal.
    pub fn refresh(&mut self, fail_batch_on_child_failure: bool) -> bool {
        let was_terminal = self.state.is_terminal();
        self.state = self.rollup(fail_batch_on_child_failure);
        if !was_terminal && self.state.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.finished = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            kind: self.kind,
            batch: self.batch,
            priority: self.priority,
            state: self.state,
            progress: self.progress(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            cancel_requested: self.cancel_requested,
            results: self
                .tasks
                .iter()
                .map(|record| FileResult {
                    file: record.task.file.clone(),
                    state: record.state,
                    attempts: record.attempts,
                    failure: record.failure.clone(),
                    output: record.output.clone(),
                    shared_with: record.subscribed_to.map(|owner| owner.job),
                })
                .collect(),
            coalesced: self.coalesced.clone(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            kind: self.kind,
            batch: self.batch,
            priority: self.priority,
            state: self.state,
            progress: self.progress(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}
