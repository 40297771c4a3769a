//! Configuration loading for Reelhouse.
//!
//! Values are layered: a `.env` file is applied to the process environment
//! first, then environment variables win over `reelhouse.toml`, which wins
//! over built-in defaults. The result is one [`Config`] plus any
//! [`ConfigWarnings`] worth logging at startup.

#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{
    CacheConfig, Config, ConfigMetadata, MediaConfig, ServerConfig, ToolsConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
