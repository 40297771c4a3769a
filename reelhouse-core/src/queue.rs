//! Bounded-concurrency admission for artifact tasks.
//!
//! Pending tasks are ordered by priority band, then by submission sequence.
//! A task is admitted when both the global counter and the counter of its
//! resource class are below their ceilings. The queue itself is plain data;
//! the scheduler serializes every call behind its state lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use crate::{
    artifact::{Priority, ResourceClass},
    task::TaskKey,
};

/// Concurrency ceilings. Defaults protect low-power hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub global: usize,
    pub cpu_light: usize,
    pub cpu_heavy: usize,
    pub io_bound: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 1,
            cpu_light: 2,
            cpu_heavy: 1,
            io_bound: 2,
        }
    }
}

impl ConcurrencyLimits {
    pub fn for_class(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::CpuLight => self.cpu_light,
            ResourceClass::CpuHeavy => self.cpu_heavy,
            ResourceClass::IoBound => self.io_bound,
        }
    }
}

/// A pending task as the queue sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: TaskKey,
    pub priority: Priority,
    pub class: ResourceClass,
    /// Submission order; kept across retries so a retried task does not
    /// lose its place.
    pub sequence: u64,
    /// Earliest admission time for a task waiting out a retry backoff.
    pub ready_at: Option<Instant>,
}

impl QueueEntry {
    fn slot(&self) -> Slot {
        (self.priority.rank(), self.sequence)
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }
}

type Slot = (u8, u64);

#[derive(Debug)]
pub struct JobQueue {
    limits: ConcurrencyLimits,
    pending: BTreeMap<Slot, QueueEntry>,
    index: HashMap<TaskKey, Slot>,
    running_total: usize,
    running: HashMap<ResourceClass, usize>,
}

impl JobQueue {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            limits,
            pending: BTreeMap::new(),
            index: HashMap::new(),
            running_total: 0,
            running: HashMap::new(),
        }
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        &self.limits
    }

    pub fn push(&mut self, entry: QueueEntry) {
        let slot = entry.slot();
        self.index.insert(entry.key, slot);
        self.pending.insert(slot, entry);
    }

    /// Drop a pending task. Returns `None` if it was not queued.
    pub fn remove(&mut self, key: &TaskKey) -> Option<QueueEntry> {
        let slot = self.index.remove(key)?;
        self.pending.remove(&slot)
    }

    /// Admit the best ready task that fits under the ceilings, reserving its
    /// slot. Call [`JobQueue::release`] once it finishes.
    pub fn admit(&mut self, now: Instant) -> Option<QueueEntry> {
        if self.running_total >= self.limits.global {
            return None;
        }
        let slot = self
            .pending
            .values()
            .find(|entry| {
                entry.is_ready(now)
                    && self.running_in(entry.class)
                        < self.limits.for_class(entry.class)
            })
            .map(QueueEntry::slot)?;

        let entry = self.pending.remove(&slot)?;
        self.index.remove(&entry.key);
        self.running_total += 1;
        *self.running.entry(entry.class).or_default() += 1;
        Some(entry)
    }

    pub fn release(&mut self, class: ResourceClass) {
        self.running_total = self.running_total.saturating_sub(1);
        if let Some(count) = self.running.get_mut(&class) {
            *count = count.saturating_sub(1);
        }
    }

    /// Earliest backoff expiry among tasks that are not ready yet.
    pub fn next_ready_at(&self, now: Instant) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|entry| entry.ready_at)
            .filter(|at| *at > now)
            .min()
    }

    pub fn running(&self) -> usize {
        self.running_total
    }

    pub fn running_in(&self, class: ResourceClass) -> usize {
        self.running.get(&class).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_with(&self, priority: Priority) -> usize {
        self.pending
            .values()
            .filter(|entry| entry.priority == priority)
            .count()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.index.contains_key(key)
    }
}
