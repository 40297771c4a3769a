//! Runtime settings for the scheduler and idle worker.

use std::time::Duration;

use crate::{
    artifact::ArtifactKind, queue::ConcurrencyLimits, registry::RetentionPolicy,
};

/// Retry policy per failure kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after a timeout.
    pub timeout_retries: u32,
    /// Extra attempts after a non-zero exit.
    pub failure_retries: u32,
    /// First backoff; doubles per attempt.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_retries: 2,
            failure_retries: 1,
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerConfig {
    pub limits: ConcurrencyLimits,
    /// Overrides every kind's default timeout when set.
    pub tool_timeout: Option<Duration>,
    /// Thread hint passed to external tools.
    pub tool_threads: usize,
    /// Batch jobs fail, and pending siblings are aborted, on the first
    /// failed child.
    pub fail_batch_on_child_failure: bool,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            tool_timeout: None,
            tool_threads: default_tool_threads(),
            fail_batch_on_child_failure: false,
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn timeout_for(&self, kind: ArtifactKind) -> Duration {
        self.tool_timeout.unwrap_or_else(|| kind.default_timeout())
    }
}

/// Half the CPUs, at least one; leaves headroom for serving requests.
pub fn default_tool_threads() -> usize {
    (num_cpus::get() / 2).max(1)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdleConfig {
    pub enabled: bool,
    /// Pause between sweeps.
    pub interval: Duration,
    pub kinds: Vec<ArtifactKind>,
    /// Files per idle batch job.
    pub batch_size: usize,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            kinds: vec![ArtifactKind::MetadataProbe, ArtifactKind::Thumbnail],
            batch_size: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(12),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(12));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(12));
    }

    #[test]
    fn tool_timeout_overrides_kind_defaults() {
        let mut config = SchedulerConfig::default();
        assert_eq!(
            config.timeout_for(ArtifactKind::Subtitle),
            Duration::from_secs(1800)
        );
        config.tool_timeout = Some(Duration::from_secs(7));
        assert_eq!(
            config.timeout_for(ArtifactKind::Subtitle),
            Duration::from_secs(7)
        );
    }
}
