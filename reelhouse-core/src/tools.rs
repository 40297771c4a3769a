//! External tool discovery.
//!
//! Tools are resolved once at startup; the result is cached in
//! [`Capabilities`] and never re-probed per task. A missing tool disables the
//! artifact kinds that need it instead of failing startup.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::artifact::ArtifactKind;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    Ffprobe,
    Ffmpeg,
    Transcribe,
    FaceDetect,
}

impl Tool {
    pub const ALL: [Tool; 4] =
        [Tool::Ffprobe, Tool::Ffmpeg, Tool::Transcribe, Tool::FaceDetect];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Ffprobe => "ffprobe",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Transcribe => "transcribe",
            Tool::FaceDetect => "face-detect",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured tool locations. Bare names are looked up on `PATH`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub ffprobe: PathBuf,
    pub ffmpeg: PathBuf,
    pub transcribe: PathBuf,
    pub face_detect: PathBuf,
    /// Model file passed to the transcription tool.
    pub transcribe_model: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
            transcribe: PathBuf::from("whisper-cli"),
            face_detect: PathBuf::from("face-detect"),
            transcribe_model: None,
        }
    }
}

impl ToolPaths {
    pub fn configured(&self, tool: Tool) -> &PathBuf {
        match tool {
            Tool::Ffprobe => &self.ffprobe,
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Transcribe => &self.transcribe,
            Tool::FaceDetect => &self.face_detect,
        }
    }
}

/// Detection result for one tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub configured: PathBuf,
    pub resolved: Option<PathBuf>,
}

/// Per-kind availability as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KindCapability {
    pub kind: ArtifactKind,
    pub enabled: bool,
    /// Tools (or the transcription model) that are missing.
    pub missing: Vec<String>,
}

/// Cached view of which tools exist and therefore which kinds can run.
#[derive(Clone, Debug)]
pub struct Capabilities {
    tools: BTreeMap<Tool, ToolStatus>,
    transcribe_model: Option<PathBuf>,
    model_present: bool,
}

impl Capabilities {
    /// Resolve every configured tool once.
    pub fn detect(paths: &ToolPaths) -> Self {
        let tools: BTreeMap<Tool, ToolStatus> = Tool::ALL
            .into_iter()
            .map(|tool| {
                let configured = paths.configured(tool).clone();
                let resolved = resolve_binary(&configured);
                match &resolved {
                    Some(path) => {
                        info!(tool = %tool, path = %path.display(), "tool detected")
                    }
                    None => warn!(
                        tool = %tool,
                        configured = %configured.display(),
                        "tool not found; dependent artifact kinds are disabled"
                    ),
                }
                (tool, ToolStatus { configured, resolved })
            })
            .collect();

        let model_present = paths
            .transcribe_model
            .as_ref()
            .is_some_and(|model| model.is_file());
        if tools
            .get(&Tool::Transcribe)
            .is_some_and(|status| status.resolved.is_some())
            && !model_present
        {
            warn!("transcription tool found but no usable model is configured");
        }

        Self {
            tools,
            transcribe_model: paths.transcribe_model.clone(),
            model_present,
        }
    }

    /// Treat every configured tool as present without touching the
    /// filesystem. Useful when the runner is not a real process runner.
    pub fn assume_available(paths: &ToolPaths) -> Self {
        let tools = Tool::ALL
            .into_iter()
            .map(|tool| {
                let configured = paths.configured(tool).clone();
                (
                    tool,
                    ToolStatus {
                        resolved: Some(configured.clone()),
                        configured,
                    },
                )
            })
            .collect();
        Self {
            tools,
            transcribe_model: paths.transcribe_model.clone(),
            model_present: paths.transcribe_model.is_some(),
        }
    }

    /// Path to invoke for `tool`; falls back to the configured value so a
    /// vanished binary surfaces as a spawn-time `ToolUnavailable`.
    pub fn program(&self, tool: Tool) -> PathBuf {
        self.tools
            .get(&tool)
            .and_then(|status| {
                status.resolved.clone().or(Some(status.configured.clone()))
            })
            .unwrap_or_else(|| PathBuf::from(tool.as_str()))
    }

    pub fn transcribe_model(&self) -> Option<&PathBuf> {
        self.transcribe_model.as_ref()
    }

    /// Names of whatever `kind` needs but does not have.
    pub fn missing_for(&self, kind: ArtifactKind) -> Vec<String> {
        let mut missing: Vec<String> = kind
            .required_tools()
            .iter()
            .filter(|tool| {
                self.tools
                    .get(*tool)
                    .is_none_or(|status| status.resolved.is_none())
            })
            .map(|tool| tool.to_string())
            .collect();
        if kind == ArtifactKind::Subtitle && !self.model_present {
            missing.push("transcribe-model".to_string());
        }
        missing
    }

    pub fn is_enabled(&self, kind: ArtifactKind) -> bool {
        self.missing_for(kind).is_empty()
    }

    pub fn enabled_kinds(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }

    pub fn kinds(&self) -> Vec<KindCapability> {
        ArtifactKind::ALL
            .into_iter()
            .map(|kind| {
                let missing = self.missing_for(kind);
                KindCapability {
                    kind,
                    enabled: missing.is_empty(),
                    missing,
                }
            })
            .collect()
    }

    pub fn tools(&self) -> &BTreeMap<Tool, ToolStatus> {
        &self.tools
    }
}

fn resolve_binary(configured: &Path) -> Option<PathBuf> {
    if configured.components().count() > 1 || configured.is_absolute() {
        return configured.is_file().then(|| configured.to_path_buf());
    }
    which::which(configured).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_with(dir: &std::path::Path) -> ToolPaths {
        ToolPaths {
            ffprobe: dir.join("ffprobe"),
            ffmpeg: dir.join("ffmpeg"),
            transcribe: dir.join("whisper-cli"),
            face_detect: dir.join("face-detect"),
            transcribe_model: None,
        }
    }

    #[test]
    fn missing_binaries_disable_only_dependent_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("ffprobe"), b"").expect("write ffprobe");

        let caps = Capabilities::detect(&paths_with(dir.path()));

        assert!(caps.is_enabled(ArtifactKind::MetadataProbe));
        assert!(!caps.is_enabled(ArtifactKind::Thumbnail));
        assert_eq!(caps.missing_for(ArtifactKind::Thumbnail), vec!["ffmpeg"]);
        assert_eq!(caps.enabled_kinds(), vec![ArtifactKind::MetadataProbe]);
    }

    #[test]
    fn subtitles_need_a_transcription_model() {
        let caps = Capabilities::assume_available(&ToolPaths::default());
        assert!(!caps.is_enabled(ArtifactKind::Subtitle));
        assert_eq!(
            caps.missing_for(ArtifactKind::Subtitle),
            vec!["transcribe-model"]
        );

        let caps = Capabilities::assume_available(&ToolPaths {
            transcribe_model: Some(PathBuf::from("/models/base.bin")),
            ..ToolPaths::default()
        });
        assert!(caps.is_enabled(ArtifactKind::Subtitle));
    }

    #[test]
    fn program_falls_back_to_configured_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = paths_with(dir.path());
        let caps = Capabilities::detect(&paths);
        assert_eq!(caps.program(Tool::Ffmpeg), paths.ffmpeg);
    }
}
