//! Command plans for each artifact kind.
//!
//! A plan is a short, fixed sequence of tool invocations. Steps run one after
//! another and share the task's wall-clock budget: each step is started with
//! whatever time the previous steps left over.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    artifact::ArtifactKind,
    error::TaskFailure,
    process::{ProcessOutput, ProcessRunner, ProcessSpec, ResourceLimits, RunnerError},
    store::ArtifactOutput,
    task::{ArtifactTask, TaskContext},
    tools::{Capabilities, Tool},
};

/// Playback speed-up applied to hover previews so a short clip covers more
/// of the source.
const PREVIEW_SPEEDUP: u32 = 4;

/// Paths and tool locations for one task.
#[derive(Debug)]
pub struct ArtifactPlan<'a> {
    task: &'a ArtifactTask,
    capabilities: &'a Capabilities,
    input: PathBuf,
    output: PathBuf,
    limits: ResourceLimits,
}

impl<'a> ArtifactPlan<'a> {
    pub fn new(
        task: &'a ArtifactTask,
        capabilities: &'a Capabilities,
        input: PathBuf,
        output: PathBuf,
        threads: usize,
    ) -> Self {
        Self {
            task,
            capabilities,
            input,
            output,
            limits: ResourceLimits::threads(threads),
        }
    }

    /// Where tools that write files put their result before it is moved to
    /// the final location.
    pub fn staging_path(&self) -> PathBuf {
        self.output
            .with_extension(format!("partial.{}", self.task.kind.extension()))
    }

    fn threads(&self) -> String {
        self.limits.threads.unwrap_or(1).to_string()
    }

    fn spec(&self, tool: Tool) -> ProcessSpec {
        ProcessSpec::new(self.capabilities.program(tool), self.task.timeout)
            .limits(self.limits)
    }

    fn ffmpeg(&self) -> ProcessSpec {
        self.spec(Tool::Ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
    }

    pub fn probe_metadata(&self) -> ProcessSpec {
        self.spec(Tool::Ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(&self.input)
    }

    pub fn probe_duration(&self) -> ProcessSpec {
        self.spec(Tool::Ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(&self.input)
    }

    pub fn thumbnail(&self, duration: Option<f64>) -> ProcessSpec {
        let params = &self.task.params;
        let seek = duration
            .map(|secs| secs * params.seek_fraction.clamp(0.0, 0.99))
            .unwrap_or(0.0);
        self.ffmpeg()
            .arg("-ss")
            .arg(format!("{seek:.3}"))
            .arg("-i")
            .arg(&self.input)
            .args(["-frames:v", "1", "-vf"])
            .arg(format!("scale={}:-2", params.thumbnail_width))
            .args(["-q:v", "3", "-threads"])
            .arg(self.threads())
            .arg(self.staging_path())
    }

    pub fn hover_preview(&self, duration: Option<f64>) -> ProcessSpec {
        let params = &self.task.params;
        let span =
            f64::from(params.preview_seconds.saturating_mul(PREVIEW_SPEEDUP));
        let start = match duration {
            Some(secs) if secs > span => (secs * 0.10).min(secs - span),
            _ => 0.0,
        };
        self.ffmpeg()
            .arg("-ss")
            .arg(format!("{start:.3}"))
            .arg("-t")
            .arg(format!("{span:.3}"))
            .arg("-i")
            .arg(&self.input)
            .arg("-vf")
            .arg(format!(
                "setpts=PTS/{PREVIEW_SPEEDUP},fps={},scale={}:-2",
                params.preview_fps, params.preview_width
            ))
            .args([
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-crf",
                "28",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "-threads",
            ])
            .arg(self.threads())
            .arg(self.staging_path())
    }

    pub fn extract_audio(&self, wav: &Path) -> ProcessSpec {
        self.ffmpeg()
            .arg("-i")
            .arg(&self.input)
            .args([
                "-vn",
                "-ac",
                "1",
                "-ar",
                "16000",
                "-c:a",
                "pcm_s16le",
                "-threads",
            ])
            .arg(self.threads())
            .arg(wav)
    }

    pub fn transcribe(&self, wav: &Path) -> Result<ProcessSpec, TaskFailure> {
        let model = self.capabilities.transcribe_model().ok_or_else(|| {
            TaskFailure::ToolUnavailable {
                tool: "transcribe-model".to_string(),
            }
        })?;
        // the tool appends `.srt` to the output stem itself
        let stem = self.output.with_extension("partial");
        let mut spec = self
            .spec(Tool::Transcribe)
            .arg("-m")
            .arg(model)
            .arg("-t")
            .arg(self.threads())
            .args(["-osrt", "-of"])
            .arg(stem)
            .arg("-f")
            .arg(wav);
        if let Some(language) = &self.task.params.language {
            spec = spec.arg("-l").arg(language);
        }
        Ok(spec)
    }

    pub fn detect_faces(&self) -> ProcessSpec {
        self.spec(Tool::FaceDetect)
            .arg("--threads")
            .arg(self.threads())
            .arg("--input")
            .arg(&self.input)
            .arg("--output")
            .arg(self.staging_path())
    }
}

/// Runs plan steps against a shared deadline.
struct StepRunner<'a> {
    runner: &'a dyn ProcessRunner,
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl StepRunner<'_> {
    async fn run(&self, mut spec: ProcessSpec) -> Result<ProcessOutput, TaskFailure> {
        if self.cancel.is_cancelled() {
            return Err(TaskFailure::Cancelled);
        }
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TaskFailure::TimedOut);
        }
        spec.timeout = remaining;

        match self.runner.run(spec, self.cancel.clone()).await {
            Err(RunnerError::ToolUnavailable { program, .. }) => {
                Err(TaskFailure::ToolUnavailable { tool: program })
            }
            Err(RunnerError::Spawn { program, source }) => {
                Err(TaskFailure::SpawnFailed {
                    tool: program,
                    message: source.to_string(),
                })
            }
            Ok(output) if output.cancelled => Err(TaskFailure::Cancelled),
            Ok(output) if output.timed_out => Err(TaskFailure::TimedOut),
            Ok(output) if !output.success() => Err(TaskFailure::ProcessFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }),
            Ok(output) => Ok(output),
        }
    }

    /// A duration the probe cannot report is not fatal; later steps fall
    /// back to the start of the file.
    async fn duration(&self, spec: ProcessSpec) -> Result<Option<f64>, TaskFailure> {
        let output = self.run(spec).await?;
        Ok(parse_duration(&output.stdout))
    }
}

pub(crate) fn parse_duration(stdout: &[u8]) -> Option<f64> {
    std::str::from_utf8(stdout)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
}

/// Produce the artifact for `task` and hand it to the store.
pub(crate) async fn execute(
    task: &ArtifactTask,
    ctx: &TaskContext,
    cancel: &CancellationToken,
) -> Result<PathBuf, TaskFailure> {
    let input = ctx.store.resolve(&task.file);
    let output = ctx
        .store
        .output_path(&task.file, task.kind)
        .await
        .map_err(TaskFailure::artifact)?;
    let plan =
        ArtifactPlan::new(task, &ctx.capabilities, input, output, ctx.threads);
    let steps = StepRunner {
        runner: ctx.runner.as_ref(),
        deadline: Instant::now() + task.timeout,
        cancel,
    };

    let produced = match task.kind {
        ArtifactKind::MetadataProbe => {
            let probed = steps.run(plan.probe_metadata()).await?;
            serde_json::from_slice::<serde_json::Value>(&probed.stdout)
                .map_err(TaskFailure::artifact)?;
            Ok(ArtifactOutput::Bytes(probed.stdout))
        }
        ArtifactKind::Thumbnail => {
            let duration = steps.duration(plan.probe_duration()).await?;
            steps
                .run(plan.thumbnail(duration))
                .await
                .map(|_| ArtifactOutput::Staged(plan.staging_path()))
        }
        ArtifactKind::HoverPreview => {
            let duration = steps.duration(plan.probe_duration()).await?;
            steps
                .run(plan.hover_preview(duration))
                .await
                .map(|_| ArtifactOutput::Staged(plan.staging_path()))
        }
        ArtifactKind::Subtitle => {
            let scratch = tempfile::tempdir().map_err(TaskFailure::artifact)?;
            let wav = scratch.path().join("audio.wav");
            steps.run(plan.extract_audio(&wav)).await?;
            let transcribe = plan.transcribe(&wav)?;
            steps
                .run(transcribe)
                .await
                .map(|_| ArtifactOutput::Staged(plan.staging_path()))
        }
        ArtifactKind::FaceDetect => steps
            .run(plan.detect_faces())
            .await
            .map(|_| ArtifactOutput::Staged(plan.staging_path())),
    };

    let produced = match produced {
        Ok(produced) => produced,
        Err(failure) => {
            discard_staging(&plan.staging_path()).await;
            return Err(failure);
        }
    };

    ctx.store
        .persist(&task.file, task.kind, produced)
        .await
        .map_err(TaskFailure::artifact)
}

async fn discard_staging(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial artifact"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            debug!(path = %path.display(), error = %err, "failed to remove partial artifact")
        }
    }
}

/// Flatten args for assertions and logging.
pub fn render_args(spec: &ProcessSpec) -> Vec<String> {
    spec.args
        .iter()
        .map(|arg: &OsString| arg.to_string_lossy().into_owned())
        .collect()
}
