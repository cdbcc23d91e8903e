//! Configuration for sandpit: schema, discovery/loading, environment
//! overrides and typed setters.
//!
//! Configuration is read once at startup and handed to the executor as an
//! immutable snapshot. Reloading means loading again and rebuilding.

pub mod keys;
pub mod loader;
pub mod schema;

pub use {
    keys::{ConfigError, ConfigKey, validate},
    loader::{
        apply_env_overrides, clear_config_dir, config_dir, discover_and_load,
        find_or_default_config_path, load_config, save_config, set_config_dir, update_config,
    },
    schema::{AgentConfig, ResourceLimitsConfig, SandboxConfig, SandpitConfig},
};
