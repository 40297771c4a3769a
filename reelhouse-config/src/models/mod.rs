pub mod sources;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use reelhouse_core::{IdleConfig, SchedulerConfig, ToolPaths};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub cache: CacheConfig,
    pub tools: ToolsConfig,
    pub scheduler: SchedulerConfig,
    pub idle: IdleConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        self.cache.ensure_directories()
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache.root
    }

    pub fn media_root(&self) -> Option<&Path> {
        self.media.root.as_deref()
    }

    /// The idle worker needs a library to scan.
    pub fn idle_enabled(&self) -> bool {
        self.idle.enabled && self.media.root.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl CacheConfig {
    fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub paths: ToolPaths,
    /// Time between SIGTERM and SIGKILL when stopping a tool.
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
