use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;
use tracing::debug;

use crate::job::{Job, JobId, JobSnapshot, JobSummary};

/// How long terminal jobs stay visible. Whichever limit is hit first evicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Terminal jobs kept at most.
    pub max_jobs: usize,
    /// Age past completion after which a terminal job is dropped.
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_jobs: 200,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Process-wide table of active and recently finished jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    retention: RetentionPolicy,
}

impl JobRegistry {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            jobs: HashMap::new(),
            retention,
        }
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs.get(id).map(Job::snapshot)
    }

    /// Most recent submission first.
    pub fn summaries(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        jobs.into_iter().map(Job::summary).collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|job| !job.is_terminal())
    }

    /// Drop terminal jobs past the TTL, then the oldest terminal jobs beyond
    /// the count limit. Active jobs are never evicted.
    pub fn evict(&mut self, now: Instant) -> usize {
        let before = self.jobs.len();
        let ttl = self.retention.ttl;
        self.jobs.retain(|_, job| match job.finished {
            Some(finished) => now.saturating_duration_since(finished) < ttl,
            None => true,
        });

        let mut terminal: Vec<(Instant, u64, JobId)> = self
            .jobs
            .values()
            .filter_map(|job| job.finished.map(|at| (at, job.sequence, job.id)))
            .collect();
        if terminal.len() > self.retention.max_jobs {
            terminal.sort();
            let excess = terminal.len() - self.retention.max_jobs;
            for (_, _, id) in terminal.into_iter().take(excess) {
                self.jobs.remove(&id);
            }
        }

        let evicted = before - self.jobs.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.jobs.len(), "evicted finished jobs");
        }
        evicted
    }
}
