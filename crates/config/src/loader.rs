use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    keys::{ConfigError, ConfigKey, validate},
    schema::SandpitConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "sandpit.toml",
    "sandpit.yaml",
    "sandpit.yml",
    "sandpit.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, config discovery only looks in
/// this directory (project-local and user-global paths are skipped).
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load and validate config from the given path (any supported format).
///
/// Environment overrides are not applied here; see [`discover_and_load`].
pub fn load_config(path: &Path) -> anyhow::Result<SandpitConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let config = parse_config(&raw, path)?;
    validate(&config).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
    Ok(config)
}

/// Discover config, apply environment overrides, and return the snapshot the
/// process should run with.
///
/// Search order:
/// 1. `./sandpit.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/sandpit/sandpit.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `SandpitConfig::default()` if no usable file is found. Invalid
/// environment overrides are logged and skipped.
pub fn discover_and_load() -> SandpitConfig {
    let mut config = load_file_or_default();
    for error in apply_env_overrides(&mut config, |name| std::env::var(name).ok()) {
        warn!(%error, "ignoring environment override");
    }
    config
}

fn load_file_or_default() -> SandpitConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, writing default config");
        let config = SandpitConfig::default();
        if let Err(e) = write_default_config(&config) {
            warn!(error = %e, "failed to write default config file");
        }
        return config;
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            SandpitConfig::default()
        },
    }
}

/// Apply every [`ConfigKey`] whose environment variable `lookup` resolves.
///
/// Returns the overrides that failed to parse; those keys keep their
/// previous value.
pub fn apply_env_overrides(
    config: &mut SandpitConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    for key in ConfigKey::ALL {
        let Some(raw) = lookup(key.env_var()) else {
            continue;
        };
        match key.set(config, &raw) {
            Ok(()) => debug!(key = key.path(), env = key.env_var(), "applied env override"),
            Err(e) => errors.push(e),
        }
    }
    errors
}

/// Find the first config file in standard locations.
///
/// When a config dir override is set, only that directory is searched.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return CONFIG_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists());
    }

    // Project-local
    if let Some(p) = CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
    {
        return Some(p);
    }

    // User-global: ~/.config/sandpit/
    let dir = home_dir()?.join(".config").join("sandpit");
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/sandpit/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("sandpit"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandpit.toml")
}

/// Lock guarding config read-modify-write cycles.
static CONFIG_SAVE_LOCK: Mutex<()> = Mutex::new(());

/// Load the config file (without env overrides), apply `f`, validate, and save.
///
/// Acquires a process-wide lock so concurrent callers cannot race. Nothing is
/// written when `f` fails or the result does not validate.
pub fn update_config(
    f: impl FnOnce(&mut SandpitConfig) -> Result<(), ConfigError>,
) -> anyhow::Result<PathBuf> {
    let _guard = CONFIG_SAVE_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let mut config = match find_config_file() {
        Some(path) => load_config(&path)?,
        None => SandpitConfig::default(),
    };
    f(&mut config)?;
    validate(&config)?;
    save_config_inner(&config)
}

/// Serialize `config` to TOML and write it to the discovered config path.
///
/// Prefer [`update_config`] for read-modify-write cycles to avoid races.
pub fn save_config(config: &SandpitConfig) -> anyhow::Result<PathBuf> {
    let _guard = CONFIG_SAVE_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    validate(config)?;
    save_config_inner(config)
}

fn save_config_inner(config: &SandpitConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serialize_config(config, &path)?;
    std::fs::write(&path, text)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

/// Write the default config file to the user-global config path.
/// Only called when no config file exists yet.
fn write_default_config(config: &SandpitConfig) -> anyhow::Result<()> {
    let path = find_or_default_config_path();
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, &toml_str)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SandpitConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn serialize_config(config: &SandpitConfig, path: &Path) -> anyhow::Result<String> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::to_string_pretty(config)?),
        "yaml" | "yml" => Ok(serde_yaml::to_string(config)?),
        "json" => Ok(serde_json::to_string_pretty(config)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    /// Tests touching the process-wide config dir override run under this lock.
    static DIR_LOCK: Mutex<()> = Mutex::new(());

    fn with_config_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = DIR_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        set_config_dir(dir.to_path_buf());
        let out = f();
        clear_config_dir();
        out
    }

    #[test]
    fn test_load_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("a.toml");
        std::fs::write(&toml_path, "[sandbox]\nmax_concurrent = 2\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().sandbox.max_concurrent, 2);

        let yaml_path = dir.path().join("a.yaml");
        std::fs::write(&yaml_path, "sandbox:\n  running_timeout: 9\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().sandbox.running_timeout, 9);

        let json_path = dir.path().join("a.json");
        std::fs::write(&json_path, r#"{"agent": {"llm_api_max_retries": 1}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().agent.llm_api_max_retries, 1);

        let ini_path = dir.path().join("a.ini");
        std::fs::write(&ini_path, "x=1").unwrap();
        assert!(load_config(&ini_path).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandpit.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("sandbox.max_concurrent"), "{err}");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SANDBOX_SHARED_HOST_DIR", "/srv/sandboxes"),
            ("SANDBOX_RUNNING_TIMEOUT", "15"),
            ("SANDBOX_MAX_CONCURRENT", "not-a-number"),
            ("AI_SCRIPT_MAX_RETRY_TIMES", "2"),
            ("AI_CHAT_LLM_API_MAX_RETRIES", "1"),
        ]);
        let mut config = SandpitConfig::default();
        let errors = apply_env_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.sandbox.shared_host_dir, PathBuf::from("/srv/sandboxes"));
        assert_eq!(config.sandbox.running_timeout, 15);
        assert_eq!(config.sandbox.max_concurrent, 4);
        assert_eq!(config.agent.script_max_retry_times, 2);
        assert_eq!(config.agent.llm_api_max_retries, 1);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ConfigError::InvalidValue { key: "sandbox.max_concurrent", .. }
        ));
    }

    #[test]
    fn test_discover_writes_default_then_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        with_config_dir(dir.path(), || {
            let first = load_file_or_default();
            assert_eq!(first, SandpitConfig::default());
            assert!(dir.path().join("sandpit.toml").exists());

            let written = update_config(|cfg| ConfigKey::MaxConcurrent.set(cfg, "7")).unwrap();
            assert_eq!(written, dir.path().join("sandpit.toml"));
            assert_eq!(load_file_or_default().sandbox.max_concurrent, 7);
        });
    }

    #[test]
    fn test_update_config_rejects_invalid_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        with_config_dir(dir.path(), || {
            let result = update_config(|cfg| ConfigKey::Backend.set(cfg, "podman"));
            assert!(result.is_err());
            assert!(!dir.path().join("sandpit.toml").exists());
        });
    }

    #[test]
    fn test_save_config_keeps_existing_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandpit.yaml");
        std::fs::write(&path, "sandbox:\n  max_concurrent: 3\n").unwrap();
        with_config_dir(dir.path(), || {
            let mut cfg = load_config(&path).unwrap();
            cfg.agent.script_max_retry_times = 1;
            assert_eq!(save_config(&cfg).unwrap(), path);
            let back = load_config(&path).unwrap();
            assert_eq!(back.sandbox.max_concurrent, 3);
            assert_eq!(back.agent.script_max_retry_times, 1);
        });
    }
}
