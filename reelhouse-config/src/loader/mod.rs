pub mod error;

use once_cell::sync::Lazy;
use std::{fs, path::PathBuf, time::Duration};
use tracing::debug;

use reelhouse_core::{
    ConcurrencyLimits, IdleConfig, RetentionPolicy, RetryPolicy, SchedulerConfig,
    ToolPaths, config::default_tool_threads,
};

use crate::{
    models::{
        CacheConfig, Config, ConfigMetadata, MediaConfig, ServerConfig,
        ToolsConfig,
        sources::{EnvConfig, FileConfig, file_or_env_duration, parse_kinds},
    },
    validation::{self, ConfigWarnings},
};
use error::ConfigLoadError;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("reelhouse.toml"),
        PathBuf::from("config/reelhouse.toml"),
    ]
});

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A composed configuration plus anything worth telling the operator.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Apply the `.env` file, then compose from the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather()?;
        self.compose(env_config, env_file_loaded)
    }

    /// Compose from already gathered environment values. The process
    /// environment and `.env` are not consulted.
    pub fn load_with_env(
        &self,
        env_config: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        self.compose(env_config, false)
    }

    fn compose(
        &self,
        env_config: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env_config)?;
        let (config, warnings) = compose_config(
            file_config,
            env_config,
            config_path,
            env_file_loaded,
        )?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;
        debug!(path = %path.display(), ?provenance, "loaded configuration file");

        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if config_path.is_none() {
        warnings.push_with_hint(
            "No reelhouse.toml detected; falling back to environment variables",
            "Create reelhouse.toml or point REELHOUSE_CONFIG at one",
        );
    }

    let FileConfig {
        server: file_server,
        media: file_media,
        cache: file_cache,
        tools: file_tools,
        scheduler: file_scheduler,
        retention: file_retention,
        idle: file_idle,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(3000),
    };

    let media = MediaConfig {
        root: env.media_root.or(file_media.root),
    };

    let cache = CacheConfig {
        root: env
            .cache_root
            .or(file_cache.root)
            .unwrap_or_else(|| PathBuf::from("./cache")),
    };

    let tool_defaults = ToolPaths::default();
    let tools = ToolsConfig {
        paths: ToolPaths {
            ffprobe: env
                .ffprobe_path
                .or(file_tools.ffprobe)
                .unwrap_or(tool_defaults.ffprobe),
            ffmpeg: env
                .ffmpeg_path
                .or(file_tools.ffmpeg)
                .unwrap_or(tool_defaults.ffmpeg),
            transcribe: env
                .transcribe_path
                .or(file_tools.transcribe)
                .unwrap_or(tool_defaults.transcribe),
            face_detect: env
                .face_detect_path
                .or(file_tools.face_detect)
                .unwrap_or(tool_defaults.face_detect),
            transcribe_model: env
                .transcribe_model
                .or(file_tools.transcribe_model),
        },
        grace_period: env
            .tool_grace_period
            .or(file_duration("tools.grace_period", file_tools.grace_period)?)
            .unwrap_or(DEFAULT_GRACE_PERIOD),
    };

    let default_limits = ConcurrencyLimits::default();
    let default_retention = RetentionPolicy::default();
    let scheduler = SchedulerConfig {
        limits: ConcurrencyLimits {
            global: env
                .max_concurrent_jobs
                .or(file_scheduler.max_concurrent_jobs)
                .unwrap_or(default_limits.global),
            cpu_light: env
                .cpu_light_limit
                .or(file_scheduler.cpu_light_limit)
                .unwrap_or(default_limits.cpu_light),
            cpu_heavy: env
                .cpu_heavy_limit
                .or(file_scheduler.cpu_heavy_limit)
                .unwrap_or(default_limits.cpu_heavy),
            io_bound: env
                .io_bound_limit
                .or(file_scheduler.io_bound_limit)
                .unwrap_or(default_limits.io_bound),
        },
        tool_timeout: env
            .tool_timeout
            .or(file_duration("tools.timeout", file_tools.timeout)?),
        tool_threads: env
            .tool_threads
            .or(file_tools.threads)
            .unwrap_or_else(default_tool_threads)
            .max(1),
        fail_batch_on_child_failure: env
            .fail_batch_on_child_failure
            .or(file_scheduler.fail_batch_on_child_failure)
            .unwrap_or(false),
        retry: RetryPolicy::default(),
        retention: RetentionPolicy {
            max_jobs: env
                .retention_count
                .or(file_retention.max_jobs)
                .unwrap_or(default_retention.max_jobs),
            ttl: env
                .retention_ttl
                .or(file_duration("retention.ttl", file_retention.ttl)?)
                .unwrap_or(default_retention.ttl),
        },
    };

    let idle_defaults = IdleConfig::default();
    let file_kinds = file_idle
        .kinds
        .map(|kinds| parse_kinds("idle.kinds", &kinds))
        .transpose()?;
    let idle = IdleConfig {
        enabled: env
            .idle_enabled
            .or(file_idle.enabled)
            .unwrap_or(idle_defaults.enabled),
        interval: env
            .idle_interval
            .or(file_duration("idle.interval", file_idle.interval)?)
            .unwrap_or(idle_defaults.interval),
        kinds: env
            .idle_kinds
            .or(file_kinds)
            .unwrap_or(idle_defaults.kinds),
        batch_size: env
            .idle_batch_size
            .or(file_idle.batch_size)
            .unwrap_or(idle_defaults.batch_size),
    };

    let config = Config {
        server,
        media,
        cache,
        tools,
        scheduler,
        idle,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
    };

    warnings.extend(validation::apply_guard_rails(&config)?);
    Ok((config, warnings))
}

fn file_duration(
    key: &str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|raw| file_or_env_duration(key, &raw)).transpose()
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit)
    }
}
