//! Artifact vocabulary: what can be derived from a media file, and how
//! expensive it is to derive.

use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};

use crate::error::SchedulerError;
use crate::tools::Tool;

/// Derived artifact produced from a source media file.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    MetadataProbe,
    Thumbnail,
    HoverPreview,
    Subtitle,
    FaceDetect,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::MetadataProbe,
        ArtifactKind::Thumbnail,
        ArtifactKind::HoverPreview,
        ArtifactKind::Subtitle,
        ArtifactKind::FaceDetect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::MetadataProbe => "metadata-probe",
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::HoverPreview => "hover-preview",
            ArtifactKind::Subtitle => "subtitle",
            ArtifactKind::FaceDetect => "face-detect",
        }
    }

    pub fn resource_class(&self) -> ResourceClass {
        match self {
            ArtifactKind::MetadataProbe => ResourceClass::IoBound,
            ArtifactKind::Thumbnail => ResourceClass::CpuLight,
            ArtifactKind::HoverPreview
            | ArtifactKind::Subtitle
            | ArtifactKind::FaceDetect => ResourceClass::CpuHeavy,
        }
    }

    /// Wall-clock budget for the whole task when no override is configured.
    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            ArtifactKind::MetadataProbe => 30,
            ArtifactKind::Thumbnail => 60,
            ArtifactKind::HoverPreview => 300,
            ArtifactKind::Subtitle => 1800,
            ArtifactKind::FaceDetect => 900,
        };
        Duration::from_secs(secs)
    }

    /// Tools that must be present for this kind to be enabled.
    pub fn required_tools(&self) -> &'static [Tool] {
        match self {
            ArtifactKind::MetadataProbe => &[Tool::Ffprobe],
            ArtifactKind::Thumbnail | ArtifactKind::HoverPreview => {
                &[Tool::Ffprobe, Tool::Ffmpeg]
            }
            ArtifactKind::Subtitle => &[Tool::Ffmpeg, Tool::Transcribe],
            ArtifactKind::FaceDetect => &[Tool::FaceDetect],
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::MetadataProbe | ArtifactKind::FaceDetect => "json",
            ArtifactKind::Thumbnail => "jpg",
            ArtifactKind::HoverPreview => "mp4",
            ArtifactKind::Subtitle => "srt",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| SchedulerError::InvalidKind(s.to_string()))
    }
}

/// Coarse bucket used to apply independent concurrency ceilings.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    CpuLight,
    CpuHeavy,
    IoBound,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::CpuLight => "cpu-light",
            ResourceClass::CpuHeavy => "cpu-heavy",
            ResourceClass::IoBound => "io-bound",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the work. Interactive requests always outrank idle sweeps.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Interactive,
    Idle,
}

impl Priority {
    /// Lower rank is admitted first.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::Interactive => 0,
            Priority::Idle => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Interactive => f.write_str("interactive"),
            Priority::Idle => f.write_str("idle"),
        }
    }
}

/// A media file, relative to the media root unless absolute.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    /// Returns `None` for blank input.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tunables forwarded to the artifact plan. Every field has a sensible
/// default so callers usually send none of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactParams {
    /// Output width for thumbnails; height follows the aspect ratio.
    pub thumbnail_width: u32,
    /// Position of the thumbnail frame as a fraction of the duration.
    pub seek_fraction: f64,
    pub preview_width: u32,
    /// Length of the hover preview clip.
    pub preview_seconds: u32,
    pub preview_fps: u32,
    /// Spoken language hint for transcription.
    pub language: Option<String>,
}

impl Default for ArtifactParams {
    fn default() -> Self {
        Self {
            thumbnail_width: 320,
            seek_fraction: 0.10,
            preview_width: 240,
            preview_seconds: 6,
            preview_fps: 8,
            language: None,
        }
    }
}

impl ArtifactParams {
    pub const MAX_WIDTH: u32 = 3840;
    pub const MAX_PREVIEW_SECONDS: u32 = 60;
    pub const MAX_PREVIEW_FPS: u32 = 60;

    /// Reject values no tool invocation could sensibly use.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |message: String| Err(SchedulerError::InvalidParams(message));
        for (name, width) in [
            ("thumbnail_width", self.thumbnail_width),
            ("preview_width", self.preview_width),
        ] {
            if !(16..=Self::MAX_WIDTH).contains(&width) {
                return invalid(format!(
                    "{name} must be between 16 and {}, got {width}",
                    Self::MAX_WIDTH
                ));
            }
        }
        if !(1..=Self::MAX_PREVIEW_SECONDS).contains(&self.preview_seconds) {
            return invalid(format!(
                "preview_seconds must be between 1 and {}, got {}",
                Self::MAX_PREVIEW_SECONDS,
                self.preview_seconds
            ));
        }
        if !(1..=Self::MAX_PREVIEW_FPS).contains(&self.preview_fps) {
            return invalid(format!(
                "preview_fps must be between 1 and {}, got {}",
                Self::MAX_PREVIEW_FPS,
                self.preview_fps
            ));
        }
        if !(0.0..1.0).contains(&self.seek_fraction) {
            return invalid(format!(
                "seek_fraction must be in [0, 1), got {}",
                self.seek_fraction
            ));
        }
        if let Some(language) = &self.language
            && language.trim().is_empty()
        {
            return invalid("language must not be blank".to_string());
        }
        Ok(())
    }
}
