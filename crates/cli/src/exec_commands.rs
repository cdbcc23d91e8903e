use std::{io::Read, path::PathBuf};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    sandpit_executor::{ExecutionRequest, ResetOutcome, SandboxService},
    tracing::debug,
};

#[derive(Args)]
pub struct ExecArgs {
    /// Session the code belongs to; selects the workspace.
    #[arg(long)]
    pub chat_key: String,

    /// Code to run. Read from --file or stdin when omitted.
    pub code: Option<String>,

    /// Read the code from a file.
    #[arg(long, conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Print the outcome as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Delete the workspace after the run.
    #[arg(long, default_value_t = false)]
    pub ephemeral: bool,
}

fn read_code(args: &ExecArgs) -> Result<String> {
    if let Some(ref code) = args.code {
        return Ok(code.clone());
    }
    if let Some(ref path) = args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }
    let mut code = String::new();
    std::io::stdin()
        .read_to_string(&mut code)
        .context("failed to read code from stdin")?;
    Ok(code)
}

fn service() -> Result<SandboxService> {
    let config = sandpit_config::discover_and_load();
    let service = SandboxService::from_config(&config).context("failed to start sandbox service")?;
    debug!(backend = service.backend_name(), "sandbox backend selected");
    Ok(service)
}

pub async fn handle_exec(args: ExecArgs) -> Result<()> {
    let code = read_code(&args)?;
    if code.trim().is_empty() {
        bail!("no code given");
    }
    let service = service()?;

    let request = ExecutionRequest::new(args.chat_key.clone(), code);
    let outcome = service.run(request).await?;
    let result = service.collector().collect(&outcome);

    if args.json {
        let json = serde_json::json!({
            "chat_key": args.chat_key,
            "backend": service.backend_name(),
            "outcome": outcome,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print!("{result}");
        if !result.ends_with('\n') {
            println!();
        }
    }

    if args.ephemeral {
        service.reset(&args.chat_key).await?;
    }
    Ok(())
}

pub async fn handle_reset(chat_key: &str) -> Result<()> {
    let service = service()?;
    match service.reset(chat_key).await? {
        ResetOutcome::Removed => println!("Removed workspace for {chat_key}."),
        ResetOutcome::NotFound => println!("No workspace for {chat_key}."),
    }
    Ok(())
}
