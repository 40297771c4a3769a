//! The artifact scheduler.
//!
//! All queue and registry state lives behind one lock. Submission, status,
//! cancellation and listing only take that lock briefly and never await, so
//! callers are never suspended waiting for a worker. A single dispatcher
//! loop admits tasks; each admitted task runs on its own tokio task and
//! re-enters the lock once to record its outcome.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    artifact::{ArtifactKind, ArtifactParams, FileRef, Priority},
    config::SchedulerConfig,
    error::{Result, SchedulerError, TaskFailure},
    job::{Job, JobId, JobSnapshot, JobState, JobSummary, TaskRecord},
    process::ProcessRunner,
    queue::{JobQueue, QueueEntry},
    registry::JobRegistry,
    store::ArtifactStore,
    task::{ArtifactTask, DedupeKey, TaskContext, TaskKey, TaskState},
    tools::Capabilities,
};

/// A request to derive one artifact kind for one or more files.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub files: Vec<String>,
    pub kind: ArtifactKind,
    pub priority: Priority,
    pub params: ArtifactParams,
}

impl SubmitRequest {
    pub fn new<I, S>(files: I, kind: ArtifactKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            kind,
            priority: Priority::Interactive,
            params: ArtifactParams::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_params(mut self, params: ArtifactParams) -> Self {
        self.params = params;
        self
    }
}

/// Handle returned immediately on submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub tasks: usize,
    /// Files that follow a task another job already has in flight.
    pub coalesced: Vec<FileRef>,
}

/// Point-in-time view of queue pressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QueueLoad {
    pub running: usize,
    pub pending_interactive: usize,
    pub pending_idle: usize,
    pub global_limit: usize,
}

impl QueueLoad {
    /// No interactive work is waiting and at least one slot is free.
    pub fn is_idle(&self) -> bool {
        self.pending_interactive == 0 && self.running < self.global_limit
    }
}

#[derive(Debug)]
struct SchedulerState {
    queue: JobQueue,
    registry: JobRegistry,
    /// (file, kind) pairs with a non-terminal task.
    in_flight: HashMap<DedupeKey, TaskKey>,
    /// Records in later jobs that follow an in-flight task.
    subscribers: HashMap<TaskKey, Vec<TaskKey>>,
    /// Cancellation handles of admitted tasks.
    running: HashMap<TaskKey, CancellationToken>,
    job_sequence: u64,
    task_sequence: u64,
}

struct Shared {
    config: SchedulerConfig,
    ctx: TaskContext,
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Scheduler");
        debug.field("config", &self.shared.config);
        match self.shared.state.try_lock() {
            Some(state) => {
                debug
                    .field("jobs", &state.registry.len())
                    .field("pending", &state.queue.pending())
                    .field("running", &state.queue.running());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn ArtifactStore>,
        capabilities: Capabilities,
    ) -> Self {
        let state = SchedulerState {
            queue: JobQueue::new(config.limits),
            registry: JobRegistry::new(config.retention),
            in_flight: HashMap::new(),
            subscribers: HashMap::new(),
            running: HashMap::new(),
            job_sequence: 0,
            task_sequence: 0,
        };
        let ctx = TaskContext {
            runner,
            store,
            capabilities,
            threads: config.tool_threads.max(1),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                ctx,
                state: Mutex::new(state),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Spawn the dispatcher loop. Calling it twice is harmless.
    pub fn start(&self) {
        let mut dispatcher = self.shared.dispatcher.lock();
        if dispatcher.is_some() || self.shared.shutdown.is_cancelled() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *dispatcher = Some(tokio::spawn(shared.dispatch_loop()));
    }

    /// Stop admitting work, cancel every active job and wait for running
    /// tasks to record their outcome.
    pub async fn shutdown(&self) {
        let active: Vec<JobId> = self
            .shared
            .state
            .lock()
            .registry
            .active()
            .map(|job| job.id)
            .collect();
        for id in active {
            if let Err(err) = self.cancel(id) {
                debug!(job_id = %id, error = %err, "job settled before shutdown");
            }
        }
        self.shared.shutdown.cancel();
        let dispatcher = self.shared.dispatcher.lock().take();
        if let Some(handle) = dispatcher
            && let Err(err) = handle.await
        {
            warn!(error = %err, "scheduler dispatcher ended abnormally");
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("artifact scheduler stopped");
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.ctx.capabilities
    }

    /// Enqueue a job and return its id without waiting for any work.
    ///
    /// Files whose artifact is already in flight for another job are
    /// attached to that task rather than queued twice. A request made up
    /// only of such files is rejected.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SchedulerError::Internal("scheduler stopped".into()));
        }
        request.params.validate()?;
        let kind = request.kind;
        let mut seen = HashSet::new();
        let files: Vec<FileRef> = request
            .files
            .iter()
            .filter_map(FileRef::new)
            .filter(|file| seen.insert(file.clone()))
            .collect();
        if files.is_empty() {
            return Err(SchedulerError::EmptyFileSet);
        }

        let capabilities = &self.shared.ctx.capabilities;
        if !capabilities.is_enabled(kind) {
            return Err(SchedulerError::KindUnavailable {
                kind: kind.to_string(),
                missing: capabilities.missing_for(kind).join(", "),
            });
        }

        let batch = files.len() > 1;
        let timeout = self.shared.config.timeout_for(kind);

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let owners: Vec<Option<TaskKey>> = files
            .iter()
            .map(|file| {
                state
                    .in_flight
                    .get(&DedupeKey {
                        file: file.clone(),
                        kind,
                    })
                    .copied()
            })
            .collect();
        let coalesced: Vec<FileRef> = files
            .iter()
            .zip(&owners)
            .filter(|(_, owner)| owner.is_some())
            .map(|(file, _)| file.clone())
            .collect();
        if coalesced.len() == files.len() {
            let file = coalesced
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            debug!(kind = %kind, file = %file, "rejecting duplicate submission");
            return Err(SchedulerError::DuplicateInFlight { file });
        }

        state.job_sequence += 1;
        let id = JobId::new();
        let tasks = files
            .into_iter()
            .map(|file| {
                ArtifactTask::new(file, kind, request.params.clone(), timeout)
            })
            .collect();
        let mut job = Job::new(
            id,
            state.job_sequence,
            kind,
            batch,
            request.priority,
            tasks,
            coalesced.clone(),
        );

        for (index, owner) in owners.iter().enumerate() {
            let key = job.key(index);
            if let Some(owner) = *owner {
                job.subscribe(index, owner);
                state.subscribers.entry(owner).or_default().push(key);
                continue;
            }
            let record = &job.tasks[index];
            state.task_sequence += 1;
            state.in_flight.insert(record.task.dedupe_key(), key);
            state.queue.push(QueueEntry {
                key,
                priority: request.priority,
                class: record.task.resource_class,
                sequence: state.task_sequence,
                ready_at: None,
            });
        }
        let receipt = SubmitReceipt {
            job_id: id,
            tasks: job.tasks.len(),
            coalesced,
        };
        state.registry.insert(job);
        let fail_batch = self.shared.config.fail_batch_on_child_failure;
        for owner in owners.into_iter().flatten() {
            sync_subscribers(state, owner, fail_batch);
        }
        drop(guard);

        info!(
            job_id = %id,
            kind = %kind,
            priority = %request.priority,
            tasks = receipt.tasks,
            coalesced = receipt.coalesced.len(),
            "job submitted"
        );
        self.shared.wake.notify_one();
        Ok(receipt)
    }

    pub fn status(&self, id: JobId) -> Result<JobSnapshot> {
        self.shared
            .state
            .lock()
            .registry
            .snapshot(&id)
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Active and recently finished jobs, most recent first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut state = self.shared.state.lock();
        state.registry.evict(Instant::now());
        state.registry.summaries()
    }

    /// Cancel every unfinished task of a job. Pending tasks are dropped
    /// without spawning anything; running tasks are asked to terminate.
    pub fn cancel(&self, id: JobId) -> Result<JobSnapshot> {
        let fail_batch = self.shared.config.fail_batch_on_child_failure;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        let job = state
            .registry
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        if job.is_terminal() || job.cancel_requested {
            return Err(SchedulerError::AlreadyTerminal(id));
        }
        job.cancel_requested = true;

        let mut signalled = 0usize;
        let mut dropped = Vec::new();
        for index in 0..job.tasks.len() {
            let key = job.key(index);
            let record = &mut job.tasks[index];
            if let Some(owner) = record.subscribed_to
                && !record.state.is_terminal()
            {
                unsubscribe(&mut state.subscribers, owner, key);
                record.state = TaskState::Cancelled;
                record.failure = Some(TaskFailure::Cancelled);
                continue;
            }
            match record.state {
                TaskState::Pending => {
                    state.queue.remove(&key);
                    state.in_flight.remove(&record.task.dedupe_key());
                    record.state = TaskState::Cancelled;
                    record.failure = Some(TaskFailure::Cancelled);
                    dropped.push(key);
                }
                TaskState::Admitted | TaskState::Running => {
                    if let Some(token) = state.running.get(&key) {
                        token.cancel();
                        signalled += 1;
                    }
                }
                _ => {}
            }
        }

        let finished = job.refresh(fail_batch);
        let snapshot = job.snapshot();
        for key in dropped {
            sync_subscribers(state, key, fail_batch);
        }
        if finished {
            state.registry.evict(Instant::now());
        }
        drop(guard);

        info!(job_id = %id, running_signalled = signalled, state = %snapshot.state, "job cancellation requested");
        self.shared.wake.notify_one();
        Ok(snapshot)
    }

    pub fn load(&self) -> QueueLoad {
        let state = self.shared.state.lock();
        QueueLoad {
            running: state.queue.running(),
            pending_interactive: state.queue.pending_with(Priority::Interactive),
            pending_idle: state.queue.pending_with(Priority::Idle),
            global_limit: state.queue.limits().global,
        }
    }
}

impl Shared {
    async fn dispatch_loop(self: Arc<Self>) {
        info!(limits = ?self.config.limits, "artifact scheduler started");
        loop {
            let next_retry = self.admit_ready();
            let retry_timer = async move {
                match next_retry {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = retry_timer => {}
            }
        }
        debug!("scheduler dispatcher exiting");
    }

    /// Admit everything the ceilings allow and spawn workers for it.
    /// Returns the earliest pending retry deadline.
    fn admit_ready(self: &Arc<Self>) -> Option<Instant> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let now = Instant::now();
        let fail_batch = self.config.fail_batch_on_child_failure;
        let mut admitted = Vec::new();

        let next_retry = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            while let Some(entry) = state.queue.admit(now) {
                let Some(job) = state.registry.get_mut(&entry.key.job) else {
                    state.queue.release(entry.class);
                    continue;
                };
                let Some(record) = job.tasks.get_mut(entry.key.index) else {
                    state.queue.release(entry.class);
                    continue;
                };
                record.state = TaskState::Admitted;
                record.attempts += 1;
                let task = record.task.clone();
                let attempt = record.attempts;
                job.mark_started();
                job.refresh(fail_batch);

                let token = self.shutdown.child_token();
                state.running.insert(entry.key, token.clone());
                sync_subscribers(state, entry.key, fail_batch);
                admitted.push((entry, task, token, attempt));
            }
            state.queue.next_ready_at(now)
        };

        for (entry, task, token, attempt) in admitted {
            info!(
                job_id = %entry.key.job,
                kind = %task.kind,
                file = %task.file,
                class = %entry.class,
                attempt,
                "task admitted"
            );
            let shared = Arc::clone(self);
            self.tracker
                .spawn(async move { shared.run_task(entry, task, token).await });
        }
        next_retry
    }

    async fn run_task(
        self: Arc<Self>,
        entry: QueueEntry,
        task: ArtifactTask,
        cancel: CancellationToken,
    ) {
        {
            let mut state = self.state.lock();
            if let Some(record) = state
                .registry
                .get_mut(&entry.key.job)
                .and_then(|job| job.tasks.get_mut(entry.key.index))
                && record.state == TaskState::Admitted
            {
                record.state = TaskState::Running;
            }
        }

        let result = AssertUnwindSafe(task.execute(&self.ctx, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(
                    job_id = %entry.key.job,
                    kind = %task.kind,
                    file = %task.file,
                    panic = %message,
                    "artifact worker panicked"
                );
                Err(TaskFailure::Panicked { message })
            });
        self.complete(entry, result);
        self.wake.notify_one();
    }

    /// Completion handler: record the outcome, schedule a retry or finish
    /// the task, and roll the job up.
    fn complete(
        &self,
        entry: QueueEntry,
        result: std::result::Result<std::path::PathBuf, TaskFailure>,
    ) {
        let now = Instant::now();
        let fail_batch = self.config.fail_batch_on_child_failure;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.running.remove(&entry.key);
        state.queue.release(entry.class);

        let key = entry.key;
        let Some(job) = state.registry.get_mut(&key.job) else {
            warn!(job_id = %key.job, "completed task belongs to an evicted job");
            return;
        };
        let cancel_requested = job.cancel_requested;
        let batch = job.batch;
        let Some(record) = job.tasks.get_mut(key.index) else {
            return;
        };
        let dedupe = record.task.dedupe_key();

        let mut retry_at = None;
        let failed = match result {
            Ok(path) => {
                info!(
                    job_id = %key.job,
                    kind = %record.task.kind,
                    file = %record.task.file,
                    path = %path.display(),
                    "task succeeded"
                );
                record.state = TaskState::Succeeded;
                record.failure = None;
                record.output = Some(path);
                false
            }
            Err(failure) => {
                match self.retry_delay(record, &failure, cancel_requested) {
                    Some(delay) => {
                        warn!(
                            job_id = %key.job,
                            file = %record.task.file,
                            failure = %failure,
                            attempt = record.attempts,
                            retry_in = ?delay,
                            "task failed; retrying"
                        );
                        record.state = TaskState::Pending;
                        record.failure = Some(failure);
                        retry_at = Some(now + delay);
                        false
                    }
                    None => {
                        let terminal = terminal_state(&failure);
                        if terminal == TaskState::Cancelled {
                            info!(job_id = %key.job, file = %record.task.file, "task cancelled");
                        } else {
                            warn!(
                                job_id = %key.job,
                                kind = %record.task.kind,
                                file = %record.task.file,
                                failure = %failure,
                                attempts = record.attempts,
                                "task failed"
                            );
                        }
                        record.state = terminal;
                        record.failure = Some(failure);
                        terminal != TaskState::Cancelled
                    }
                }
            }
        };

        if let Some(ready_at) = retry_at {
            state.queue.push(QueueEntry {
                ready_at: Some(ready_at),
                ..entry
            });
            sync_subscribers(state, key, fail_batch);
            return;
        }

        state.in_flight.remove(&dedupe);
        sync_subscribers(state, key, fail_batch);
        if failed && fail_batch && batch {
            abort_pending_siblings(state, key.job, fail_batch);
        }

        let Some(job) = state.registry.get_mut(&key.job) else {
            return;
        };
        if job.refresh(fail_batch) {
            log_finished(job);
            state.registry.evict(now);
        }
    }

    fn retry_delay(
        &self,
        record: &mut TaskRecord,
        failure: &TaskFailure,
        cancel_requested: bool,
    ) -> Option<Duration> {
        if cancel_requested || self.shutdown.is_cancelled() {
            return None;
        }
        let retry = &self.config.retry;
        match failure {
            TaskFailure::TimedOut if record.attempts <= retry.timeout_retries => {
                Some(retry.backoff_for(record.attempts))
            }
            TaskFailure::ProcessFailed { .. }
                if record.attempts <= retry.failure_retries =>
            {
                Some(retry.backoff_for(record.attempts))
            }
            TaskFailure::SpawnFailed { .. } => {
                record.attempts = record.attempts.saturating_sub(1);
                record.spawn_failures += 1;
                Some(retry.backoff_for(record.spawn_failures))
            }
            _ => None,
        }
    }
}

fn terminal_state(failure: &TaskFailure) -> TaskState {
    match failure {
        TaskFailure::TimedOut => TaskState::TimedOut,
        TaskFailure::Cancelled => TaskState::Cancelled,
        _ => TaskState::Failed,
    }
}

/// Batch failure policy: stop the rest of the batch.
fn abort_pending_siblings(
    state: &mut SchedulerState,
    id: JobId,
    fail_batch: bool,
) {
    let Some(job) = state.registry.get_mut(&id) else {
        return;
    };
    let mut aborted = 0usize;
    let mut dropped = Vec::new();
    for index in 0..job.tasks.len() {
        let key = job.key(index);
        let record = &mut job.tasks[index];
        if let Some(owner) = record.subscribed_to
            && !record.state.is_terminal()
        {
            unsubscribe(&mut state.subscribers, owner, key);
            record.state = TaskState::Cancelled;
            record.failure = Some(TaskFailure::Cancelled);
            aborted += 1;
            continue;
        }
        match record.state {
            TaskState::Pending => {
                state.queue.remove(&key);
                state.in_flight.remove(&record.task.dedupe_key());
                record.state = TaskState::Cancelled;
                record.failure = Some(TaskFailure::Cancelled);
                dropped.push(key);
                aborted += 1;
            }
            TaskState::Admitted | TaskState::Running => {
                if let Some(token) = state.running.get(&key) {
                    token.cancel();
                    aborted += 1;
                }
            }
            _ => {}
        }
    }
    if aborted > 0 {
        warn!(job_id = %id, aborted, "batch child failed; aborting remaining tasks");
    }
    for key in dropped {
        sync_subscribers(state, key, fail_batch);
    }
}

/// Push the current state of `owner` to every record following it. Once
/// the owner is terminal its followers are settled and forgotten.
fn sync_subscribers(
    state: &mut SchedulerState,
    owner: TaskKey,
    fail_batch: bool,
) {
    let Some(followers) = state.subscribers.get(&owner).cloned() else {
        return;
    };
    let Some(source) = state
        .registry
        .get(&owner.job)
        .and_then(|job| job.tasks.get(owner.index))
        .cloned()
    else {
        return;
    };
    let settled = source.state.is_terminal();
    if settled {
        state.subscribers.remove(&owner);
    }

    let mut failed_batches = Vec::new();
    for key in followers {
        let Some(job) = state.registry.get_mut(&key.job) else {
            continue;
        };
        let Some(record) = job.tasks.get_mut(key.index) else {
            continue;
        };
        if record.state.is_terminal() {
            continue;
        }
        record.mirror(&source);
        let record_state = record.state;
        if record_state != TaskState::Pending {
            job.mark_started();
        }
        if matches!(record_state, TaskState::Failed | TaskState::TimedOut)
            && fail_batch
            && job.batch
        {
            failed_batches.push(key.job);
        }
        if job.refresh(fail_batch) {
            log_finished(job);
        }
    }

    for id in failed_batches {
        abort_pending_siblings(state, id, fail_batch);
        if let Some(job) = state.registry.get_mut(&id)
            && job.refresh(fail_batch)
        {
            log_finished(job);
        }
    }
}

fn unsubscribe(
    subscribers: &mut HashMap<TaskKey, Vec<TaskKey>>,
    owner: TaskKey,
    key: TaskKey,
) {
    if let Some(followers) = subscribers.get_mut(&owner) {
        followers.retain(|follower| *follower != key);
        if followers.is_empty() {
            subscribers.remove(&owner);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_finished(job: &Job) {
    let progress = job.progress();
    match job.state {
        JobState::Done => info!(
            job_id = %job.id,
            kind = %job.kind,
            total = progress.total,
            "job done"
        ),
        state => warn!(
            job_id = %job.id,
            kind = %job.kind,
            state = %state,
            completed = progress.completed,
            failed = progress.failed,
            cancelled = progress.cancelled,
            total = progress.total,
            "job finished"
        ),
    }
}
