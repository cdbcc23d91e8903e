//! Closed set of typed, validated configuration setters.
//!
//! Every key that may be changed outside the config file (environment
//! variables, `sandpit config set`) is listed in [`ConfigKey`]. Values are
//! parsed into the field's own type and checked against its bounds; there is
//! no generic string coercion.

use std::{fmt, path::PathBuf, str::FromStr};

use crate::schema::SandpitConfig;

/// Backends accepted by `sandbox.backend`.
pub const BACKENDS: &[&str] = &["auto", "docker", "process", "unconfined"];

/// Smallest accepted `sandbox.max_output_bytes`; leaves room for the
/// truncation marker.
pub const MIN_OUTPUT_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config key `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SharedHostDir,
    RunningTimeout,
    GracePeriod,
    MaxConcurrent,
    AdmissionTimeout,
    MaxOutputBytes,
    Backend,
    Image,
    NoNetwork,
    ScriptMaxRetryTimes,
    LlmApiMaxRetries,
}

impl ConfigKey {
    pub const ALL: &'static [ConfigKey] = &[
        Self::SharedHostDir,
        Self::RunningTimeout,
        Self::GracePeriod,
        Self::MaxConcurrent,
        Self::AdmissionTimeout,
        Self::MaxOutputBytes,
        Self::Backend,
        Self::Image,
        Self::NoNetwork,
        Self::ScriptMaxRetryTimes,
        Self::LlmApiMaxRetries,
    ];

    /// Dotted path of the key inside the config file.
    pub fn path(self) -> &'static str {
        match self {
            Self::SharedHostDir => "sandbox.shared_host_dir",
            Self::RunningTimeout => "sandbox.running_timeout",
            Self::GracePeriod => "sandbox.grace_period",
            Self::MaxConcurrent => "sandbox.max_concurrent",
            Self::AdmissionTimeout => "sandbox.admission_timeout",
            Self::MaxOutputBytes => "sandbox.max_output_bytes",
            Self::Backend => "sandbox.backend",
            Self::Image => "sandbox.image",
            Self::NoNetwork => "sandbox.no_network",
            Self::ScriptMaxRetryTimes => "agent.script_max_retry_times",
            Self::LlmApiMaxRetries => "agent.llm_api_max_retries",
        }
    }

    /// Environment variable that overrides the key.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::SharedHostDir => "SANDBOX_SHARED_HOST_DIR",
            Self::RunningTimeout => "SANDBOX_RUNNING_TIMEOUT",
            Self::GracePeriod => "SANDBOX_GRACE_PERIOD",
            Self::MaxConcurrent => "SANDBOX_MAX_CONCURRENT",
            Self::AdmissionTimeout => "SANDBOX_ADMISSION_TIMEOUT",
            Self::MaxOutputBytes => "SANDBOX_MAX_OUTPUT_BYTES",
            Self::Backend => "SANDBOX_BACKEND",
            Self::Image => "SANDBOX_IMAGE",
            Self::NoNetwork => "SANDBOX_NO_NETWORK",
            Self::ScriptMaxRetryTimes => "AI_SCRIPT_MAX_RETRY_TIMES",
            Self::LlmApiMaxRetries => "AI_CHAT_LLM_API_MAX_RETRIES",
        }
    }

    /// Render the current value as it would be typed on the command line.
    pub fn get(self, cfg: &SandpitConfig) -> String {
        let sandbox = &cfg.sandbox;
        match self {
            Self::SharedHostDir => sandbox.shared_host_dir.display().to_string(),
            Self::RunningTimeout => sandbox.running_timeout.to_string(),
            Self::GracePeriod => sandbox.grace_period.to_string(),
            Self::MaxConcurrent => sandbox.max_concurrent.to_string(),
            Self::AdmissionTimeout => sandbox
                .admission_timeout
                .map_or_else(|| "none".to_string(), |t| t.to_string()),
            Self::MaxOutputBytes => sandbox.max_output_bytes.to_string(),
            Self::Backend => sandbox.backend.clone(),
            Self::Image => sandbox.image.clone().unwrap_or_else(|| "none".into()),
            Self::NoNetwork => sandbox.no_network.to_string(),
            Self::ScriptMaxRetryTimes => cfg.agent.script_max_retry_times.to_string(),
            Self::LlmApiMaxRetries => cfg.agent.llm_api_max_retries.to_string(),
        }
    }

    /// Parse `raw` into the key's type and store it.
    ///
    /// The config is left untouched when parsing or validation fails.
    pub fn set(self, cfg: &mut SandpitConfig, raw: &str) -> Result<(), ConfigError> {
        let raw = raw.trim();
        let sandbox = &mut cfg.sandbox;
        match self {
            Self::SharedHostDir => {
                if raw.is_empty() {
                    return Err(self.invalid(raw, "path must not be empty"));
                }
                sandbox.shared_host_dir = PathBuf::from(raw);
            },
            Self::RunningTimeout => sandbox.running_timeout = self.parse_int(raw, 1)?,
            Self::GracePeriod => sandbox.grace_period = self.parse_int(raw, 0)?,
            Self::MaxConcurrent => sandbox.max_concurrent = self.parse_int(raw, 1)?,
            Self::AdmissionTimeout => {
                sandbox.admission_timeout = if is_unset(raw) {
                    None
                } else {
                    Some(self.parse_int(raw, 0)?)
                };
            },
            Self::MaxOutputBytes => {
                sandbox.max_output_bytes = self.parse_int(raw, MIN_OUTPUT_BYTES as u64)?;
            },
            Self::Backend => {
                let backend = raw.to_ascii_lowercase();
                if !BACKENDS.contains(&backend.as_str()) {
                    return Err(self.invalid(
                        raw,
                        &format!("expected one of {}", BACKENDS.join(", ")),
                    ));
                }
                sandbox.backend = backend;
            },
            Self::Image => {
                sandbox.image = (!is_unset(raw)).then(|| raw.to_string());
            },
            Self::NoNetwork => sandbox.no_network = self.parse_bool(raw)?,
            Self::ScriptMaxRetryTimes => cfg.agent.script_max_retry_times = self.parse_int(raw, 0)?,
            Self::LlmApiMaxRetries => cfg.agent.llm_api_max_retries = self.parse_int(raw, 0)?,
        }
        Ok(())
    }

    fn invalid(self, value: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.path(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn parse_int<T>(self, raw: &str, min: u64) -> Result<T, ConfigError>
    where
        T: TryFrom<u64>,
    {
        let value: u64 = raw
            .parse()
            .map_err(|_| self.invalid(raw, "expected a non-negative integer"))?;
        if value < min {
            return Err(self.invalid(raw, &format!("must be at least {min}")));
        }
        T::try_from(value).map_err(|_| self.invalid(raw, "value out of range"))
    }

    fn parse_bool(self, raw: &str) -> Result<bool, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(self.invalid(raw, "expected true or false")),
        }
    }
}

fn is_unset(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("unset")
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    /// Accepts the dotted path, the bare field name, or the environment
    /// variable name (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|key| {
                let path = key.path();
                let field = path.rsplit('.').next().unwrap_or(path);
                needle == path || needle == field || needle.eq_ignore_ascii_case(key.env_var())
            })
            .ok_or_else(|| ConfigError::UnknownKey(needle.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Check cross-field and bound invariants of a loaded config.
///
/// File values bypass [`ConfigKey::set`], so the same bounds are enforced here.
pub fn validate(cfg: &SandpitConfig) -> Result<(), ConfigError> {
    let sandbox = &cfg.sandbox;
    if sandbox.running_timeout == 0 {
        return Err(ConfigKey::RunningTimeout.invalid("0", "must be at least 1"));
    }
    if sandbox.max_concurrent == 0 {
        return Err(ConfigKey::MaxConcurrent.invalid("0", "must be at least 1"));
    }
    if sandbox.max_output_bytes < MIN_OUTPUT_BYTES {
        return Err(ConfigKey::MaxOutputBytes.invalid(
            &sandbox.max_output_bytes.to_string(),
            &format!("must be at least {MIN_OUTPUT_BYTES}"),
        ));
    }
    if !BACKENDS.contains(&sandbox.backend.as_str()) {
        return Err(ConfigKey::Backend.invalid(
            &sandbox.backend,
            &format!("expected one of {}", BACKENDS.join(", ")),
        ));
    }
    if sandbox.command.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "sandbox.command",
            value: String::new(),
            reason: "interpreter command must not be empty".into(),
        });
    }
    Ok(())
}
