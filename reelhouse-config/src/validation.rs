use std::fmt;
use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} (hint: {hint})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("{name} must be at least 1")]
    ZeroLimit { name: &'static str },
    #[error("idle worker batch size must be at least 1")]
    ZeroBatchSize,
    #[error("idle worker interval must be greater than zero")]
    ZeroInterval,
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let limits = &config.scheduler.limits;

    for (name, value) in [
        ("MAX_CONCURRENT_JOBS", limits.global),
        ("CPU_LIGHT_LIMIT", limits.cpu_light),
        ("CPU_HEAVY_LIMIT", limits.cpu_heavy),
        ("IO_BOUND_LIMIT", limits.io_bound),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroLimit { name });
        }
    }
    if config.idle.enabled {
        if config.idle.batch_size == 0 {
            return Err(ConfigGuardRailError::ZeroBatchSize);
        }
        if config.idle.interval.is_zero() {
            return Err(ConfigGuardRailError::ZeroInterval);
        }
    }

    let cpus = num_cpus::get();
    if limits.global > cpus {
        warnings.push_with_hint(
            format!(
                "MAX_CONCURRENT_JOBS={} exceeds the {cpus} available CPUs",
                limits.global
            ),
            "Artifact tools are CPU bound; more concurrent jobs than cores only adds contention",
        );
    }

    if config.idle.enabled && config.media.root.is_none() {
        warnings.push_with_hint(
            "Idle worker enabled but MEDIA_ROOT is not set; background generation is disabled",
            "Set MEDIA_ROOT or [media].root to let missing artifacts be filled in",
        );
    }

    if let Some(model) = &config.tools.paths.transcribe_model
        && !model.exists()
    {
        warnings.push(format!(
            "TRANSCRIBE_MODEL {} does not exist; subtitle jobs will fail",
            model.display()
        ));
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CacheConfig, ConfigMetadata, MediaConfig, ServerConfig, ToolsConfig,
    };
    use reelhouse_core::{IdleConfig, SchedulerConfig, ToolPaths};
    use std::{path::PathBuf, time::Duration};

    fn config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 3000,
            },
            media: MediaConfig {
                root: Some(PathBuf::from("/srv/media")),
            },
            cache: CacheConfig {
                root: PathBuf::from("./cache"),
            },
            tools: ToolsConfig {
                paths: ToolPaths::default(),
                grace_period: Duration::from_secs(2),
            },
            scheduler: SchedulerConfig::default(),
            idle: IdleConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&config()).expect("valid");
        assert!(warnings.is_empty(), "{:?}", warnings.items);
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let mut config = config();
        config.scheduler.limits.cpu_heavy = 0;
        assert_eq!(
            apply_guard_rails(&config).unwrap_err(),
            ConfigGuardRailError::ZeroLimit {
                name: "CPU_HEAVY_LIMIT"
            }
        );
    }

    #[test]
    fn ceiling_above_cpu_count_warns() {
        let mut config = config();
        config.scheduler.limits.global = num_cpus::get() + 1;
        let warnings = apply_guard_rails(&config).expect("valid");
        assert!(
            warnings
                .iter()
                .any(|w| w.message.contains("MAX_CONCURRENT_JOBS"))
        );
    }

    #[test]
    fn idle_without_media_root_warns() {
        let mut config = config();
        config.media.root = None;
        let warnings = apply_guard_rails(&config).expect("valid");
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }
}
