use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use reelhouse_core::ArtifactKind;

use crate::{
    loader::error::ConfigLoadError,
    util::{parse_bool, parse_csv, parse_duration},
};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub media: FileMediaConfig,
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub tools: FileToolsConfig,
    #[serde(default)]
    pub scheduler: FileSchedulerConfig,
    #[serde(default)]
    pub retention: FileRetentionConfig,
    #[serde(default)]
    pub idle: FileIdleConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileMediaConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffprobe: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribe: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_detect: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcribe_model: Option<PathBuf>,
    /// humantime duration, e.g. `"90s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSchedulerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_light_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_heavy_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_bound_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_batch_on_child_failure: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRetentionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileIdleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub media_root: Option<PathBuf>,
    pub cache_root: Option<PathBuf>,
    pub max_concurrent_jobs: Option<usize>,
    pub cpu_light_limit: Option<usize>,
    pub cpu_heavy_limit: Option<usize>,
    pub io_bound_limit: Option<usize>,
    pub tool_timeout: Option<Duration>,
    pub tool_threads: Option<usize>,
    pub tool_grace_period: Option<Duration>,
    pub ffprobe_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub transcribe_path: Option<PathBuf>,
    pub face_detect_path: Option<PathBuf>,
    pub transcribe_model: Option<PathBuf>,
    pub fail_batch_on_child_failure: Option<bool>,
    pub retention_count: Option<usize>,
    pub retention_ttl: Option<Duration>,
    pub idle_enabled: Option<bool>,
    pub idle_interval: Option<Duration>,
    pub idle_kinds: Option<Vec<ArtifactKind>>,
    pub idle_batch_size: Option<usize>,
}

impl EnvConfig {
    /// Read the process environment.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        Ok(Self {
            config_path: env.path("REELHOUSE_CONFIG"),
            server_host: env.string("SERVER_HOST"),
            server_port: env.parsed("SERVER_PORT")?,
            media_root: env.path("MEDIA_ROOT"),
            cache_root: env.path("CACHE_DIR"),
            max_concurrent_jobs: env.parsed("MAX_CONCURRENT_JOBS")?,
            cpu_light_limit: env.parsed("CPU_LIGHT_LIMIT")?,
            cpu_heavy_limit: env.parsed("CPU_HEAVY_LIMIT")?,
            io_bound_limit: env.parsed("IO_BOUND_LIMIT")?,
            tool_timeout: env
                .parsed::<u64>("TOOL_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            tool_threads: env.parsed("TOOL_THREADS")?,
            tool_grace_period: env
                .parsed::<u64>("TOOL_GRACE_PERIOD_MS")?
                .map(Duration::from_millis),
            ffprobe_path: env.path("FFPROBE_PATH"),
            ffmpeg_path: env.path("FFMPEG_PATH"),
            transcribe_path: env.path("TRANSCRIBE_PATH"),
            face_detect_path: env.path("FACE_DETECT_PATH"),
            transcribe_model: env.path("TRANSCRIBE_MODEL"),
            fail_batch_on_child_failure: env.boolean("FAIL_BATCH_ON_CHILD_FAILURE")?,
            retention_count: env.parsed("JOB_RETENTION_COUNT")?,
            retention_ttl: env.duration("JOB_RETENTION")?,
            idle_enabled: env.boolean("IDLE_WORKER_ENABLED")?,
            idle_interval: env.duration("IDLE_WORKER_INTERVAL")?,
            idle_kinds: env
                .string("IDLE_WORKER_KINDS")
                .map(|raw| parse_kinds("IDLE_WORKER_KINDS", &parse_csv(&raw)))
                .transpose()?,
            idle_batch_size: env.parsed("IDLE_WORKER_BATCH_SIZE")?,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.string(name).map(PathBuf::from)
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>, ConfigLoadError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|err| ConfigLoadError::invalid(name, &raw, err))
            })
            .transpose()
    }

    fn boolean(&self, name: &str) -> Result<Option<bool>, ConfigLoadError> {
        self.string(name)
            .map(|raw| {
                parse_bool(&raw).ok_or_else(|| {
                    ConfigLoadError::invalid(name, &raw, "expected a boolean")
                })
            })
            .transpose()
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>, ConfigLoadError> {
        self.string(name)
            .map(|raw| file_or_env_duration(name, &raw))
            .transpose()
    }
}

pub(crate) fn file_or_env_duration(
    key: &str,
    raw: &str,
) -> Result<Duration, ConfigLoadError> {
    parse_duration(raw).map_err(|err| ConfigLoadError::invalid(key, raw, err))
}

pub(crate) fn parse_kinds(
    key: &str,
    raw: &[String],
) -> Result<Vec<ArtifactKind>, ConfigLoadError> {
    raw.iter()
        .map(|kind| {
            kind.parse::<ArtifactKind>()
                .map_err(|err| ConfigLoadError::invalid(key, kind, err))
        })
        .collect()
}
