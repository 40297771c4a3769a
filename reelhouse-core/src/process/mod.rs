//! Supervision of external tool processes.
//!
//! Every invocation carries a hard wall-clock limit. When the limit expires
//! (or the caller cancels) the child is asked to terminate, given a short
//! grace period, then killed. Callers therefore always receive a
//! [`ProcessOutput`]; the only errors are failures to start the process.

mod tokio_runner;

pub use tokio_runner::TokioProcessRunner;

use async_trait::async_trait;
use std::{ffi::OsString, path::PathBuf, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Resource caps handed to the tool up front. Nothing is throttled after
/// the process has started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Worker thread hint for the tool.
    pub threads: Option<usize>,
}

impl ResourceLimits {
    pub fn threads(threads: usize) -> Self {
        Self {
            threads: Some(threads.max(1)),
        }
    }

    /// Environment variables understood by common numeric backends.
    pub fn env(&self) -> Vec<(OsString, OsString)> {
        match self.threads {
            Some(threads) => ["OMP_NUM_THREADS", "OPENBLAS_NUM_THREADS"]
                .into_iter()
                .map(|key| (key.into(), threads.to_string().into()))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A single command line to run.
#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
            limits: ResourceLimits::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(
        mut self,
        key: impl Into<OsString>,
        value: impl Into<OsString>,
    ) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Program name used in logs and failure reports.
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// True when any argument equals `needle`.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg == needle)
    }
}

/// Result of a supervised process that was started.
#[derive(Clone, Debug, Default)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    /// Tail of standard error, lossily decoded.
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("tool unavailable: {program}")]
    ToolUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    pub(crate) fn from_spawn(program: String, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied => {
                RunnerError::ToolUnavailable { program, source }
            }
            _ => RunnerError::Spawn { program, source },
        }
    }
}

/// Runs one external command to completion, timeout or cancellation.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, RunnerError>;
}
