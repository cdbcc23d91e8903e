/// Config schema types (sandbox runtime, agent retry budgets).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandpitConfig {
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
}

/// Sandboxed execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Root directory holding one workspace per chat key.
    pub shared_host_dir: PathBuf,
    /// Wall-clock deadline per execution, in seconds.
    pub running_timeout: u64,
    /// Time allowed after the termination signal before a hard kill, in seconds.
    pub grace_period: u64,
    /// Size of the concurrency slot pool.
    pub max_concurrent: usize,
    /// How long a request may queue for a slot, in seconds. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_timeout: Option<u64>,
    /// Upper bound on the result string returned to callers, in bytes.
    pub max_output_bytes: usize,
    /// Backend: `"auto"` (default), `"docker"`, `"process"` (bubblewrap) or
    /// `"unconfined"` (no filesystem isolation between sessions).
    pub backend: String,
    /// Interpreter command; the code is fed on stdin.
    pub command: Vec<String>,
    /// Container image for the docker backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_prefix: Option<String>,
    pub no_network: bool,
    pub resource_limits: ResourceLimitsConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shared_host_dir: PathBuf::from(".temp/sandboxes"),
            running_timeout: 60,
            grace_period: 5,
            max_concurrent: 4,
            admission_timeout: None,
            max_output_bytes: 4 * 1024,
            backend: "auto".into(),
            command: vec!["python3".into(), "-u".into(), "-".into()],
            image: None,
            container_prefix: None,
            no_network: true,
            resource_limits: ResourceLimitsConfig::default(),
        }
    }
}

/// Resource limits applied by container backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    /// Memory limit (e.g. "512M", "1G").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    /// CPU quota as a fraction (e.g. 0.5 = half a core).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<f64>,
    /// Maximum number of PIDs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_max: Option<u32>,
}

/// Retry budgets enforced by callers of the executor.
///
/// The two budgets are independent: script retries count failed executions,
/// LLM API retries count failed attempts of one code-generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub script_max_retry_times: u32,
    pub llm_api_max_retries: u32,
    /// Pause before resubmitting after an admission rejection, in milliseconds.
    pub admission_backoff_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            script_max_retry_times: 5,
            llm_api_max_retries: 3,
            admission_backoff_ms: 500,
        }
    }
}
