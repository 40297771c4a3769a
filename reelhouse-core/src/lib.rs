//! # Reelhouse Core
//!
//! Artifact generation for the Reelhouse media server: thumbnails, probed
//! metadata, hover previews, subtitles and face-detection data are derived
//! from source videos by external tools under a bounded-concurrency
//! scheduler.
//!
//! ## Architecture
//!
//! - [`process`]: supervised execution of one external command with a hard
//!   timeout and graceful-then-forced termination
//! - [`plan`] / [`task`]: the tool invocations that produce one artifact
//! - [`queue`]: priority and resource-class aware admission
//! - [`job`] / [`registry`]: user-visible jobs and their rolled-up state
//! - [`scheduler`]: the serialized admission/completion handlers
//! - [`idle`]: background catch-up driven through the public submit path
//! - [`store`]: on-disk artifact layout and "what is missing" queries
//! - [`tools`]: one-time capability detection
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use reelhouse_core::{
//!     ArtifactKind, Capabilities, FsArtifactStore, Scheduler, SchedulerConfig,
//!     SubmitRequest, TokioProcessRunner, ToolPaths,
//! };
//!
//! # async fn demo() -> Result<(), reelhouse_core::SchedulerError> {
//! let store = Arc::new(FsArtifactStore::new(
//!     Some("/srv/media".into()),
//!     "/var/cache/reelhouse".into(),
//! ));
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(TokioProcessRunner::default()),
//!     store,
//!     Capabilities::detect(&ToolPaths::default()),
//! );
//! scheduler.start();
//!
//! let receipt = scheduler.submit(SubmitRequest::new(
//!     ["movies/heat.mkv", "movies/ronin.mkv"],
//!     ArtifactKind::Thumbnail,
//! ))?;
//! let status = scheduler.status(receipt.job_id)?;
//! println!("{} {:?}", status.state, status.progress);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod artifact;
pub mod config;
pub mod error;
pub mod idle;
pub mod job;
pub mod plan;
pub mod process;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tools;

pub use artifact::{ArtifactKind, ArtifactParams, FileRef, Priority, ResourceClass};
pub use config::{IdleConfig, RetryPolicy, SchedulerConfig};
pub use error::{Result, SchedulerError, TaskFailure};
pub use idle::IdleWorker;
pub use job::{FileResult, JobId, JobSnapshot, JobState, JobSummary, Progress};
pub use process::{
    ProcessOutput, ProcessRunner, ProcessSpec, ResourceLimits, RunnerError,
    TokioProcessRunner,
};
pub use queue::ConcurrencyLimits;
pub use registry::RetentionPolicy;
pub use scheduler::{QueueLoad, Scheduler, SubmitReceipt, SubmitRequest};
pub use store::{ArtifactOutput, ArtifactStore, FsArtifactStore};
pub use task::{ArtifactTask, TaskState};
pub use tools::{Capabilities, KindCapability, Tool, ToolPaths, ToolStatus};
