use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use reelhouse_core::{
    ArtifactKind, ArtifactOutput, ArtifactParams, ArtifactStore, Capabilities,
    ConcurrencyLimits, FileRef, JobId, JobSnapshot, JobState, Priority,
    ProcessOutput, ProcessRunner, ProcessSpec, Progress, RetryPolicy, RunnerError,
    Scheduler, SchedulerConfig, SchedulerError, SubmitRequest, TaskState, ToolPaths,
};

#[derive(Clone, Copy, Debug)]
enum Behavior {
    Succeed,
    MissingTool,
    Exit(i32),
    TimeOut,
    Hang,
    SpawnFailOnce,
    Panic,
}

#[derive(Clone, Debug)]
struct Call {
    program: String,
    file: String,
}

/// Process runner that never spawns anything: it records each invocation
/// and answers according to a per-file script.
struct ScriptedRunner {
    script: HashMap<String, Behavior>,
    calls: Mutex<Vec<Call>>,
    gate: Option<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            script: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            gate: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every invocation waits for a permit from [`ScriptedRunner::release`].
    fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    fn with(mut self, file: &str, behavior: Behavior) -> Self {
        self.script.insert(file.to_string(), behavior);
        self
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn calls_for(&self, file: &str) -> usize {
        self.calls().iter().filter(|call| call.file == file).count()
    }

    /// Files in invocation order with consecutive repeats collapsed.
    fn file_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls() {
            if order.last() != Some(&call.file) {
                order.push(call.file);
            }
        }
        order
    }

    fn output(exit_code: Option<i32>) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            ..ProcessOutput::default()
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, RunnerError> {
        let file = spec
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .find(|arg| arg.ends_with(".mkv"))
            .and_then(|arg| {
                PathBuf::from(arg)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let program = spec.display_name();
        let previous = self.calls_for(&file);
        self.calls.lock().push(Call {
            program: program.clone(),
            file: file.clone(),
        });

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.respond(&spec, &file, &program, previous, &cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedRunner {
    async fn respond(
        &self,
        spec: &ProcessSpec,
        file: &str,
        program: &str,
        previous: usize,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RunnerError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => {
                    return Ok(ProcessOutput { cancelled: true, ..Self::output(None) });
                }
            }
        }

        match self.script.get(file).copied().unwrap_or(Behavior::Succeed) {
            Behavior::MissingTool => Err(RunnerError::ToolUnavailable {
                program: program.to_string(),
                source: std::io::ErrorKind::NotFound.into(),
            }),
            Behavior::SpawnFailOnce if previous == 0 => Err(RunnerError::Spawn {
                program: program.to_string(),
                source: std::io::Error::other("resource temporarily unavailable"),
            }),
            Behavior::Exit(code) => Ok(ProcessOutput {
                stderr: "boom".to_string(),
                ..Self::output(Some(code))
            }),
            Behavior::TimeOut => Ok(ProcessOutput {
                timed_out: true,
                ..Self::output(None)
            }),
            Behavior::Panic => panic!("decoder crashed on {file}"),
            Behavior::Hang => {
                cancel.cancelled().await;
                Ok(ProcessOutput {
                    cancelled: true,
                    ..Self::output(None)
                })
            }
            Behavior::Succeed | Behavior::SpawnFailOnce => {
                let stdout = if spec.has_arg("-show_streams") {
                    b"{\"format\":{}}".to_vec()
                } else if spec.has_arg("format=duration") {
                    b"100.000000\n".to_vec()
                } else {
                    Vec::new()
                };
                Ok(ProcessOutput {
                    stdout,
                    ..Self::output(Some(0))
                })
            }
        }
    }
}

/// Store that keeps nothing on disk.
#[derive(Default)]
struct MemoryStore {
    persisted: Mutex<Vec<(FileRef, ArtifactKind)>>,
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn resolve(&self, file: &FileRef) -> PathBuf {
        PathBuf::from("/media").join(file.as_path())
    }

    async fn output_path(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
    ) -> std::io::Result<PathBuf> {
        Ok(PathBuf::from(format!(
            "/nonexistent/cache/{kind}/{file}.{}",
            kind.extension()
        )))
    }

    async fn persist(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
        _output: ArtifactOutput,
    ) -> std::io::Result<PathBuf> {
        self.persisted.lock().push((file.clone(), kind));
        self.output_path(file, kind).await
    }

    async fn missing(
        &self,
        _kind: ArtifactKind,
        _limit: usize,
    ) -> std::io::Result<Vec<FileRef>> {
        Ok(Vec::new())
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        limits: ConcurrencyLimits {
            global: 1,
            ..ConcurrencyLimits::default()
        },
        tool_threads: 1,
        retry: RetryPolicy {
            timeout_retries: 2,
            failure_retries: 1,
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..SchedulerConfig::default()
    }
}

fn start(runner: Arc<ScriptedRunner>, config: SchedulerConfig) -> Scheduler {
    let scheduler = Scheduler::new(
        config,
        runner,
        Arc::new(MemoryStore::default()),
        Capabilities::assume_available(&ToolPaths::default()),
    );
    scheduler.start();
    scheduler
}

async fn wait_terminal(scheduler: &Scheduler, id: JobId) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = scheduler.status(id).expect("job is registered");
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job reached a terminal state")
}

async fn wait_for_calls(runner: &ScriptedRunner, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.calls().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("runner was invoked");
}

#[tokio::test]
async fn batch_with_missing_tool_for_one_file_finishes_with_errors() {
    let runner = Arc::new(
        ScriptedRunner::new().with("two.mkv", Behavior::MissingTool),
    );
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(
            ["one.mkv", "two.mkv", "three.mkv"],
            ArtifactKind::Thumbnail,
        ))
        .expect("submit");
    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;

    assert_eq!(snapshot.state, JobState::DoneWithErrors);
    assert_eq!(
        snapshot.progress,
        Progress {
            total: 3,
            completed: 2,
            failed: 1,
            cancelled: 0
        }
    );
    let failed = &snapshot.results[1];
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.attempts, 1, "missing tools are never retried");
    assert_eq!(
        failed.failure.as_ref().map(|f| f.code()),
        Some("tool_unavailable")
    );
    assert_eq!(runner.file_order(), vec!["one.mkv", "two.mkv", "three.mkv"]);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    assert!(snapshot.results[0].output.is_some());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn interactive_submission_overtakes_queued_idle_batch() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    let idle_files: Vec<String> = (0..10).map(|i| format!("idle{i}.mkv")).collect();
    let idle = scheduler
        .submit(
            SubmitRequest::new(idle_files, ArtifactKind::MetadataProbe)
                .with_priority(Priority::Idle),
        )
        .expect("idle submit");
    wait_for_calls(&runner, 1).await;

    let urgent = scheduler
        .submit(SubmitRequest::new(["urgent.mkv"], ArtifactKind::MetadataProbe))
        .expect("interactive submit");
    runner.release(11);

    assert_eq!(wait_terminal(&scheduler, urgent.job_id).await.state, JobState::Done);
    assert_eq!(wait_terminal(&scheduler, idle.job_id).await.state, JobState::Done);

    let order = runner.file_order();
    assert_eq!(order[0], "idle0.mkv");
    assert_eq!(order[1], "urgent.mkv");
    assert_eq!(order.len(), 11);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn duplicate_in_flight_is_rejected_or_shared_and_spawned_once() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    let first = scheduler
        .submit(SubmitRequest::new(["dup.mkv"], ArtifactKind::MetadataProbe))
        .expect("first submit");
    wait_for_calls(&runner, 1).await;

    let err = scheduler
        .submit(SubmitRequest::new(["dup.mkv"], ArtifactKind::MetadataProbe))
        .unwrap_err();
    assert_eq!(
        err,
        SchedulerError::DuplicateInFlight {
            file: "dup.mkv".to_string()
        }
    );

    let batch = scheduler
        .submit(SubmitRequest::new(
            ["dup.mkv", "other.mkv"],
            ArtifactKind::MetadataProbe,
        ))
        .expect("batch submit");
    assert_eq!(batch.tasks, 2);
    assert_eq!(batch.coalesced, vec![FileRef::new("dup.mkv").unwrap()]);
    let following = scheduler.status(batch.job_id).expect("batch registered");
    assert_eq!(following.state, JobState::Running);
    assert_eq!(following.results[0].state, TaskState::Running);

    runner.release(10);
    let first_snapshot = wait_terminal(&scheduler, first.job_id).await;
    let batch_snapshot = wait_terminal(&scheduler, batch.job_id).await;
    assert_eq!(batch_snapshot.state, JobState::Done);
    assert_eq!(batch_snapshot.progress.total, 2);
    assert_eq!(batch_snapshot.progress.completed, 2);
    let shared = &batch_snapshot.results[0];
    assert_eq!(shared.file, FileRef::new("dup.mkv").unwrap());
    assert_eq!(shared.state, TaskState::Succeeded);
    assert_eq!(shared.shared_with, Some(first.job_id));
    assert_eq!(shared.output, first_snapshot.results[0].output);
    assert!(shared.output.is_some());
    assert_eq!(runner.calls_for("dup.mkv"), 1);

    // once finished the pair may be requested again
    let again = scheduler
        .submit(SubmitRequest::new(["dup.mkv"], ArtifactKind::MetadataProbe))
        .expect("resubmit after completion");
    wait_terminal(&scheduler, again.job_id).await;
    assert_eq!(runner.calls_for("dup.mkv"), 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn shared_file_reports_the_owning_task_failure() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .gated()
            .with("broken.mkv", Behavior::MissingTool),
    );
    let scheduler = start(Arc::clone(&runner), config());

    let first = scheduler
        .submit(SubmitRequest::new(["broken.mkv"], ArtifactKind::MetadataProbe))
        .expect("first submit");
    wait_for_calls(&runner, 1).await;
    let batch = scheduler
        .submit(SubmitRequest::new(
            ["broken.mkv", "fine.mkv"],
            ArtifactKind::MetadataProbe,
        ))
        .expect("batch submit");

    runner.release(10);
    assert_eq!(wait_terminal(&scheduler, first.job_id).await.state, JobState::Failed);
    let snapshot = wait_terminal(&scheduler, batch.job_id).await;
    assert_eq!(snapshot.state, JobState::DoneWithErrors);
    assert_eq!(snapshot.results[0].state, TaskState::Failed);
    assert_eq!(
        snapshot.results[0].failure.as_ref().map(|f| f.code()),
        Some("tool_unavailable")
    );
    assert_eq!(runner.calls_for("broken.mkv"), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_job_that_shares_a_task_leaves_the_owner_running() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    let first = scheduler
        .submit(SubmitRequest::new(["dup.mkv"], ArtifactKind::MetadataProbe))
        .expect("first submit");
    wait_for_calls(&runner, 1).await;
    let batch = scheduler
        .submit(SubmitRequest::new(
            ["dup.mkv", "other.mkv"],
            ArtifactKind::MetadataProbe,
        ))
        .expect("batch submit");

    let cancelled = scheduler.cancel(batch.job_id).expect("cancel batch");
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.progress.cancelled, 2);

    runner.release(10);
    let owner = wait_terminal(&scheduler, first.job_id).await;
    assert_eq!(owner.state, JobState::Done);
    assert_eq!(scheduler.status(batch.job_id).unwrap(), cancelled);
    assert_eq!(runner.calls_for("other.mkv"), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn same_file_different_kind_is_not_a_duplicate() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    scheduler
        .submit(SubmitRequest::new(["a.mkv"], ArtifactKind::MetadataProbe))
        .expect("probe");
    scheduler
        .submit(SubmitRequest::new(["a.mkv"], ArtifactKind::Thumbnail))
        .expect("thumbnail of the same file");

    runner.release(10);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_pending_job_spawns_nothing_and_is_idempotent() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    let running = scheduler
        .submit(SubmitRequest::new(["a.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit a");
    wait_for_calls(&runner, 1).await;
    let pending = scheduler
        .submit(SubmitRequest::new(["b.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit b");

    let cancelled = scheduler.cancel(pending.job_id).expect("cancel pending");
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.progress.cancelled, 1);
    assert_eq!(cancelled.results[0].state, TaskState::Cancelled);

    assert_eq!(
        scheduler.cancel(pending.job_id).unwrap_err(),
        SchedulerError::AlreadyTerminal(pending.job_id)
    );
    assert_eq!(scheduler.status(pending.job_id).unwrap(), cancelled);

    runner.release(5);
    let done = wait_terminal(&scheduler, running.job_id).await;
    assert_eq!(done.state, JobState::Done);
    assert_eq!(
        scheduler.cancel(running.job_id).unwrap_err(),
        SchedulerError::AlreadyTerminal(running.job_id)
    );
    assert_eq!(scheduler.status(running.job_id).unwrap(), done);
    assert_eq!(runner.calls_for("b.mkv"), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelling_a_running_job_terminates_its_process() {
    let runner = Arc::new(ScriptedRunner::new().with("long.mkv", Behavior::Hang));
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(["long.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit");
    wait_for_calls(&runner, 1).await;

    let requested = scheduler.cancel(receipt.job_id).expect("cancel running");
    assert!(requested.cancel_requested);

    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;
    assert_eq!(snapshot.state, JobState::Cancelled);
    assert_eq!(snapshot.progress.cancelled, 1);
    assert_eq!(runner.calls_for("long.mkv"), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn timeouts_are_retried_with_backoff_then_reported() {
    let runner =
        Arc::new(ScriptedRunner::new().with("slow.mkv", Behavior::TimeOut));
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(["slow.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit");
    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.results[0].state, TaskState::TimedOut);
    assert_eq!(snapshot.results[0].attempts, 3);
    assert_eq!(runner.calls_for("slow.mkv"), 3);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn nonzero_exit_is_retried_once_with_stderr_kept() {
    let runner = Arc::new(ScriptedRunner::new().with("bad.mkv", Behavior::Exit(1)));
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(["bad.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit");
    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.results[0].attempts, 2);
    assert_eq!(
        snapshot.results[0].failure,
        Some(reelhouse_core::TaskFailure::ProcessFailed {
            exit_code: Some(1),
            stderr: "boom".to_string()
        })
    );

    scheduler.shutdown().await;
}

#[tokio::test]
async fn transient_spawn_failures_do_not_consume_attempts() {
    let runner =
        Arc::new(ScriptedRunner::new().with("flaky.mkv", Behavior::SpawnFailOnce));
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(["flaky.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit");
    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;

    assert_eq!(snapshot.state, JobState::Done);
    assert_eq!(snapshot.results[0].attempts, 1);
    assert_eq!(runner.calls_for("flaky.mkv"), 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn progress_counters_never_exceed_total() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .with("f1.mkv", Behavior::Exit(2))
            .with("f4.mkv", Behavior::MissingTool),
    );
    let scheduler = start(Arc::clone(&runner), config());

    let files: Vec<String> = (0..6).map(|i| format!("f{i}.mkv")).collect();
    let receipt = scheduler
        .submit(SubmitRequest::new(files, ArtifactKind::MetadataProbe))
        .expect("submit");

    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = scheduler.status(receipt.job_id).unwrap();
            let progress = snapshot.progress;
            assert_eq!(progress.total, 6);
            assert!(progress.completed + progress.failed + progress.cancelled <= progress.total);
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("batch finished");

    assert_eq!(snapshot.state, JobState::DoneWithErrors);
    assert_eq!(snapshot.progress.completed, 4);
    assert_eq!(snapshot.progress.failed, 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn fail_batch_policy_aborts_remaining_siblings() {
    let runner = Arc::new(ScriptedRunner::new().with("bad.mkv", Behavior::Exit(1)));
    let mut config = config();
    config.fail_batch_on_child_failure = true;
    config.retry.failure_retries = 0;
    let scheduler = start(Arc::clone(&runner), config);

    let receipt = scheduler
        .submit(SubmitRequest::new(
            ["bad.mkv", "good1.mkv", "good2.mkv"],
            ArtifactKind::MetadataProbe,
        ))
        .expect("submit");
    let snapshot = wait_terminal(&scheduler, receipt.job_id).await;

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.progress.failed, 1);
    assert_eq!(snapshot.progress.cancelled, 2);
    assert_eq!(runner.calls_for("good1.mkv"), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_synchronously() {
    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = start(Arc::clone(&runner), config());

    assert_eq!(
        scheduler
            .submit(SubmitRequest::new(Vec::<String>::new(), ArtifactKind::Thumbnail))
            .unwrap_err(),
        SchedulerError::EmptyFileSet
    );
    assert_eq!(
        scheduler
            .submit(SubmitRequest::new(["  "], ArtifactKind::Thumbnail))
            .unwrap_err(),
        SchedulerError::EmptyFileSet
    );
    assert!(matches!(
        "waveform".parse::<ArtifactKind>(),
        Err(SchedulerError::InvalidKind(_))
    ));
    assert!(matches!(
        scheduler.submit(SubmitRequest::new(["a.mkv"], ArtifactKind::Subtitle)),
        Err(SchedulerError::KindUnavailable { .. })
    ));

    let unknown = JobId::new();
    assert_eq!(
        scheduler.status(unknown).unwrap_err(),
        SchedulerError::NotFound(unknown)
    );
    assert_eq!(
        scheduler.cancel(unknown).unwrap_err(),
        SchedulerError::NotFound(unknown)
    );
    assert!(runner.calls().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn list_returns_most_recent_jobs_first() {
    let runner = Arc::new(ScriptedRunner::new().gated());
    let scheduler = start(Arc::clone(&runner), config());

    let ids: Vec<JobId> = ["a.mkv", "b.mkv", "c.mkv"]
        .into_iter()
        .map(|file| {
            scheduler
                .submit(SubmitRequest::new([file], ArtifactKind::MetadataProbe))
                .expect("submit")
                .job_id
        })
        .collect();

    let listed: Vec<JobId> = scheduler.list().iter().map(|job| job.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);

    let load = scheduler.load();
    assert_eq!(load.global_limit, 1);
    assert_eq!(load.running + load.pending_interactive, 3);

    runner.release(3);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_running_work() {
    let runner = Arc::new(ScriptedRunner::new().with("long.mkv", Behavior::Hang));
    let scheduler = start(Arc::clone(&runner), config());

    let receipt = scheduler
        .submit(SubmitRequest::new(["long.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit");
    wait_for_calls(&runner, 1).await;

    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("shutdown completes");

    let snapshot = scheduler.status(receipt.job_id).expect("still registered");
    assert_eq!(snapshot.state, JobState::Cancelled);
    assert_eq!(snapshot.results[0].state, TaskState::Cancelled);
}

#[tokio::test]
async fn submissions_after_shutdown_are_refused() {
    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = start(Arc::clone(&runner), config());
    scheduler.shutdown().await;

    let err = scheduler
        .submit(SubmitRequest::new(["late.mkv"], ArtifactKind::MetadataProbe))
        .unwrap_err();
    assert_eq!(err, SchedulerError::Internal("scheduler stopped".to_string()));
    assert!(scheduler.list().is_empty());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn panicking_worker_fails_its_task_without_stalling_the_queue() {
    let runner = Arc::new(ScriptedRunner::new().with("cursed.mkv", Behavior::Panic));
    let scheduler = start(Arc::clone(&runner), config());

    let cursed = scheduler
        .submit(SubmitRequest::new(["cursed.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit cursed");
    let next = scheduler
        .submit(SubmitRequest::new(["next.mkv"], ArtifactKind::MetadataProbe))
        .expect("submit next");

    let snapshot = wait_terminal(&scheduler, cursed.job_id).await;
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.results[0].state, TaskState::Failed);
    assert_eq!(snapshot.results[0].attempts, 1, "panics are never retried");
    assert_eq!(
        snapshot.results[0].failure.as_ref().map(|f| f.code()),
        Some("panicked")
    );

    assert_eq!(wait_terminal(&scheduler, next.job_id).await.state, JobState::Done);
    assert_eq!(scheduler.load().running, 0);

    // the pair is released, so it can be requested again
    let again = scheduler
        .submit(SubmitRequest::new(["cursed.mkv"], ArtifactKind::MetadataProbe))
        .expect("resubmit after panic");
    wait_terminal(&scheduler, again.job_id).await;
    assert_eq!(runner.calls_for("cursed.mkv"), 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn oversized_params_are_rejected_before_queueing() {
    let runner = Arc::new(ScriptedRunner::new());
    let scheduler = start(Arc::clone(&runner), config());

    let params = ArtifactParams {
        preview_seconds: u32::MAX,
        ..ArtifactParams::default()
    };
    let err = scheduler
        .submit(
            SubmitRequest::new(["big.mkv"], ArtifactKind::HoverPreview)
                .with_params(params),
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidParams(_)));
    assert!(scheduler.list().is_empty());

    let next = scheduler
        .submit(SubmitRequest::new(["big.mkv"], ArtifactKind::HoverPreview))
        .expect("default params are accepted");
    assert_eq!(wait_terminal(&scheduler, next.job_id).await.state, JobState::Done);

    scheduler.shutdown().await;
}
