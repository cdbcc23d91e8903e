use {
    anyhow::Result,
    clap::Subcommand,
    sandpit_config::{ConfigKey, SandpitConfig},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show effective values (file plus environment overrides).
    Show {
        /// Only this key (path, field name or env var).
        key: Option<String>,
    },
    /// Validate and persist a value.
    Set { key: String, value: String },
    /// Print the config file location.
    Path,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { key } => show(key.as_deref()),
        ConfigAction::Set { key, value } => set(&key, &value),
        ConfigAction::Path => {
            println!("{}", sandpit_config::find_or_default_config_path().display());
            Ok(())
        },
    }
}

fn render(config: &SandpitConfig, keys: &[ConfigKey]) -> String {
    let width = keys.iter().map(|k| k.path().len()).max().unwrap_or(0);
    keys.iter()
        .map(|key| {
            format!(
                "{:<width$}  {}  ({})\n",
                key.path(),
                key.get(config),
                key.env_var()
            )
        })
        .collect()
}

fn show(key: Option<&str>) -> Result<()> {
    let config = sandpit_config::discover_and_load();
    let keys = match key {
        Some(raw) => vec![raw.parse::<ConfigKey>()?],
        None => ConfigKey::ALL.to_vec(),
    };
    print!("{}", render(&config, &keys));
    Ok(())
}

fn set(raw_key: &str, value: &str) -> Result<()> {
    let key: ConfigKey = raw_key.parse()?;
    let path = sandpit_config::update_config(|config| key.set(config, value))?;
    println!("{key} = {value} (saved to {})", path.display());
    if std::env::var_os(key.env_var()).is_some() {
        println!(
            "note: {} is set in the environment and takes precedence",
            key.env_var()
        );
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_aligns_keys() {
        let config = SandpitConfig::default();
        let text = render(&config, &[ConfigKey::RunningTimeout, ConfigKey::NoNetwork]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("sandbox.running_timeout  60"));
        assert!(lines[0].ends_with("(SANDBOX_RUNNING_TIMEOUT)"));
        assert!(lines[1].starts_with("sandbox.no_network       true"));
    }
}
