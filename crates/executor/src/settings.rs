use std::{path::PathBuf, time::Duration};

use sandpit_config::{ResourceLimitsConfig, SandpitConfig};

pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_CONTAINER_PREFIX: &str = "sandpit";

/// How long backend setup (an image pull, say) may take before the request
/// is turned away.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Immutable snapshot of the executor's configuration.
///
/// Built once per service; changing configuration means building a new
/// service from freshly loaded config.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub shared_root: PathBuf,
    pub running_timeout: Duration,
    pub grace_period: Duration,
    pub max_concurrent: usize,
    pub admission_timeout: Option<Duration>,
    pub ready_timeout: Duration,
    pub max_output_bytes: usize,
    pub backend: String,
    pub command: Vec<String>,
    pub image: String,
    pub container_prefix: String,
    pub no_network: bool,
    pub resource_limits: ResourceLimitsConfig,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&SandpitConfig::default())
    }
}

impl From<&SandpitConfig> for ExecutorSettings {
    fn from(config: &SandpitConfig) -> Self {
        let sandbox = &config.sandbox;
        Self {
            shared_root: sandbox.shared_host_dir.clone(),
            running_timeout: Duration::from_secs(sandbox.running_timeout.max(1)),
            grace_period: Duration::from_secs(sandbox.grace_period),
            max_concurrent: sandbox.max_concurrent.max(1),
            admission_timeout: sandbox.admission_timeout.map(Duration::from_secs),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            max_output_bytes: sandbox.max_output_bytes,
            backend: sandbox.backend.clone(),
            command: sandbox.command.clone(),
            image: sandbox
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string()),
            container_prefix: sandbox
                .container_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTAINER_PREFIX.to_string()),
            no_network: sandbox.no_network,
            resource_limits: sandbox.resource_limits.clone(),
        }
    }
}
