//! Background catch-up of missing artifacts.
//!
//! The idle worker is an ordinary client of the scheduler: it submits
//! idle-priority batches through [`Scheduler::submit`] and relies on queue
//! priority for non-interference. What is missing is always re-derived from
//! the artifact store, never from job history, so restarting loses nothing
//! but progress.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    artifact::{ArtifactKind, FileRef, Priority},
    config::IdleConfig,
    error::SchedulerError,
    job::JobId,
    scheduler::{Scheduler, SubmitRequest},
    store::ArtifactStore,
    task::TaskState,
};

pub struct IdleWorker {
    scheduler: Scheduler,
    store: Arc<dyn ArtifactStore>,
    config: IdleConfig,
    /// Outstanding idle job per kind; at most one at a time.
    active: HashMap<ArtifactKind, JobId>,
    /// Files whose idle attempt failed during this process lifetime. They
    /// are skipped so they cannot monopolize every batch.
    failed: HashSet<(ArtifactKind, FileRef)>,
}

impl fmt::Debug for IdleWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleWorker")
            .field("config", &self.config)
            .field("active", &self.active)
            .field("failed", &self.failed.len())
            .finish_non_exhaustive()
    }
}

impl IdleWorker {
    pub fn new(
        scheduler: Scheduler,
        store: Arc<dyn ArtifactStore>,
        config: IdleConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
            active: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            kinds = ?self.config.kinds,
            "idle worker started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("idle worker stopped");
    }

    /// One pass over the configured kinds. Returns the jobs submitted.
    pub async fn sweep(&mut self) -> Vec<JobId> {
        let mut submitted = Vec::new();
        for kind in self.config.kinds.clone() {
            let load = self.scheduler.load();
            if !load.is_idle() {
                debug!(?load, "queue busy; deferring idle work");
                break;
            }
            if !self.scheduler.capabilities().is_enabled(kind) {
                continue;
            }
            if self.has_active(kind) {
                continue;
            }

            let skipped = self.failed.iter().filter(|(k, _)| *k == kind).count();
            let files = match self
                .store
                .missing(kind, self.config.batch_size + skipped)
                .await
            {
                Ok(files) => files,
                Err(err) => {
                    warn!(kind = %kind, error = %err, "failed to scan for missing artifacts");
                    continue;
                }
            };
            let files: Vec<String> = files
                .into_iter()
                .filter(|file| !self.failed.contains(&(kind, file.clone())))
                .take(self.config.batch_size)
                .map(|file| file.to_string())
                .collect();
            if files.is_empty() {
                continue;
            }

            let request = SubmitRequest::new(files, kind).with_priority(Priority::Idle);
            match self.scheduler.submit(request) {
                Ok(receipt) => {
                    info!(
                        job_id = %receipt.job_id,
                        kind = %kind,
                        tasks = receipt.tasks,
                        "submitted idle batch"
                    );
                    self.active.insert(kind, receipt.job_id);
                    submitted.push(receipt.job_id);
                }
                Err(
                    err @ (SchedulerError::DuplicateInFlight { .. }
                    | SchedulerError::EmptyFileSet),
                ) => {
                    debug!(kind = %kind, reason = %err, "nothing new to submit");
                }
                Err(err) => {
                    warn!(kind = %kind, error = %err, "idle submission rejected");
                }
            }
        }
        submitted
    }

    /// Whether the last idle job for `kind` is still running. A finished job
    /// is forgotten, and its failed files are remembered.
    fn has_active(&mut self, kind: ArtifactKind) -> bool {
        let Some(id) = self.active.get(&kind).copied() else {
            return false;
        };
        match self.scheduler.status(id) {
            Ok(snapshot) if !snapshot.state.is_terminal() => true,
            Ok(snapshot) => {
                for result in snapshot.results {
                    if matches!(result.state, TaskState::Failed | TaskState::TimedOut) {
                        self.failed.insert((kind, result.file));
                    }
                }
                self.active.remove(&kind);
                false
            }
            Err(_) => {
                self.active.remove(&kind);
                false
            }
        }
    }
}
