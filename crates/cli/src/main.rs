mod config_commands;
mod exec_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "sandpit", about = "sandpit: sandboxed code execution", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding sandpit.toml (defaults to ./ then ~/.config/sandpit).
    #[arg(long, global = true, env = "SANDPIT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code in a chat key's sandbox and print the result.
    Exec(exec_commands::ExecArgs),
    /// Delete a chat key's workspace.
    Reset {
        #[arg(long)]
        chat_key: String,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(ref dir) = cli.config_dir {
        sandpit_config::set_config_dir(dir.clone());
    }
    info!(version = env!("CARGO_PKG_VERSION"), "sandpit starting");

    match cli.command {
        Commands::Exec(args) => exec_commands::handle_exec(args).await,
        Commands::Reset { chat_key } => exec_commands::handle_reset(&chat_key).await,
        Commands::Config { action } => config_commands::handle_config(action),
    }
}
