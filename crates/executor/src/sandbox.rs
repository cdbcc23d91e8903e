use std::{path::Path, sync::Arc};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    tokio::sync::OnceCell,
    tracing::{debug, info, warn},
};

use crate::{
    exec::{KillTarget, ProcessSpec, RawOutput, spawn},
    settings::ExecutorSettings,
};

/// Fallback `PATH` for the process backend when the host has none.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Path of the workspace inside a container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Host paths visible read-only inside a bubblewrap sandbox. Missing ones are
/// skipped.
const SYSTEM_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/localtime",
];

/// Extra read-only paths when the sandbox keeps network access.
const NETWORK_PATHS: &[&str] = &["/etc/resolv.conf", "/etc/hosts", "/etc/ssl"];

/// A launched, not yet reaped, execution.
#[async_trait]
pub trait Execution: Send {
    /// Wait for exit and collect output. Cancel-safe: may be called again
    /// after the returned future is dropped.
    async fn wait(&mut self) -> Result<RawOutput>;

    /// Ask the execution to stop (SIGTERM or equivalent).
    async fn terminate(&mut self) -> Result<()>;

    /// Force the execution to stop (SIGKILL or equivalent).
    async fn kill(&mut self) -> Result<()>;
}

/// Trait for sandbox implementations (Docker, bubblewrap process).
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable backend name ("docker", "process", "unconfined").
    fn backend_name(&self) -> &'static str;

    /// Make sure the backend can launch (image present, interpreter
    /// configured). Called before capacity is taken; may be slow the first
    /// time and should be cheap afterwards.
    async fn ensure_ready(&self) -> Result<()>;

    /// Start `code` with `workspace` as its only writable directory.
    async fn launch(&self, code: &str, workspace: &Path) -> Result<Box<dyn Execution>>;
}

fn split_command(command: &[String]) -> Result<(&str, &[String])> {
    match command.split_first() {
        Some((program, args)) if !program.is_empty() => Ok((program.as_str(), args)),
        _ => bail!("sandbox interpreter command is empty"),
    }
}

/// How the process backend fences code in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// `bwrap` with fresh namespaces. The system directories (read-only) and
    /// the workspace (read-write) are the only host paths mounted.
    Bubblewrap,
    /// Working directory and environment only. Code can reach every other
    /// session's workspace.
    Unconfined,
}

/// `bwrap` arguments running `program` confined to `workspace`.
///
/// `/tmp` is mounted before the workspace so a workspace under `/tmp` stays
/// visible.
fn bubblewrap_args(workspace: &Path, no_network: bool, program: &str, args: &[String]) -> Vec<String> {
    let workspace = workspace.display().to_string();
    let mut out: Vec<String> = vec!["--unshare-all".into(), "--die-with-parent".into()];
    if !no_network {
        out.push("--share-net".into());
    }
    let network_paths: &[&str] = if no_network {
        &[]
    } else {
        NETWORK_PATHS
    };
    for path in SYSTEM_PATHS.iter().chain(network_paths) {
        out.extend(["--ro-bind-try".into(), path.to_string(), path.to_string()]);
    }
    out.extend(
        ["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]
            .into_iter()
            .map(String::from),
    );
    out.extend([
        "--bind".into(),
        workspace.clone(),
        workspace.clone(),
        "--chdir".into(),
        workspace,
        "--".into(),
        program.to_string(),
    ]);
    out.extend(args.iter().cloned());
    out
}

/// Runs the interpreter as a host process, inside bubblewrap unless
/// explicitly unconfined.
pub struct ProcessSandbox {
    settings: ExecutorSettings,
    confinement: Confinement,
}

impl ProcessSandbox {
    pub fn new(settings: ExecutorSettings, confinement: Confinement) -> Self {
        Self {
            settings,
            confinement,
        }
    }

    pub fn confinement(&self) -> Confinement {
        self.confinement
    }

    fn env(&self, workspace: &Path) -> Vec<(String, String)> {
        let workspace = workspace.display().to_string();
        vec![
            (
                "PATH".into(),
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.into()),
            ),
            ("HOME".into(), workspace.clone()),
            ("TMPDIR".into(), workspace),
            ("LANG".into(), "C.UTF-8".into()),
            ("PYTHONUNBUFFERED".into(), "1".into()),
        ]
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn backend_name(&self) -> &'static str {
        match self.confinement {
            Confinement::Bubblewrap => "process",
            Confinement::Unconfined => "unconfined",
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        split_command(&self.settings.command)?;
        Ok(())
    }

    async fn launch(&self, code: &str, workspace: &Path) -> Result<Box<dyn Execution>> {
        let (program, args) = split_command(&self.settings.command)?;
        let (program, args) = match self.confinement {
            Confinement::Bubblewrap => (
                "bwrap".to_string(),
                bubblewrap_args(workspace, self.settings.no_network, program, args),
            ),
            Confinement::Unconfined => (program.to_string(), args.to_vec()),
        };
        let spec = ProcessSpec {
            program,
            args,
            working_dir: Some(workspace.to_path_buf()),
            clear_env: true,
            env: self.env(workspace),
            stdin: Some(code.as_bytes().to_vec()),
            max_output_bytes: self.settings.max_output_bytes,
        };
        Ok(Box::new(spawn(&spec, KillTarget::ProcessGroup)?))
    }
}

/// `uid:gid` of this process, so files written into the workspace stay ours.
#[cfg(unix)]
fn host_user() -> Option<String> {
    Some(format!(
        "{}:{}",
        nix::unistd::getuid(),
        nix::unistd::getgid()
    ))
}

#[cfg(not(unix))]
fn host_user() -> Option<String> {
    None
}

/// Docker-based sandbox: one `docker run --rm -i` container per execution.
pub struct DockerSandbox {
    settings: ExecutorSettings,
    user: Option<String>,
    image_ready: OnceCell<()>,
}

impl DockerSandbox {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            user: host_user(),
            image_ready: OnceCell::new(),
        }
    }

    fn image(&self) -> &str {
        &self.settings.image
    }

    fn container_name(&self) -> String {
        format!(
            "{}-{}",
            self.settings.container_prefix,
            uuid::Uuid::new_v4().simple()
        )
    }

    fn resource_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let limits = &self.settings.resource_limits;
        if let Some(ref mem) = limits.memory_limit {
            args.extend(["--memory".to_string(), mem.clone()]);
        }
        if let Some(cpu) = limits.cpu_quota {
            args.extend(["--cpus".to_string(), cpu.to_string()]);
        }
        if let Some(pids) = limits.pids_max {
            args.extend(["--pids-limit".to_string(), pids.to_string()]);
        }
        args
    }

    fn run_args(&self, name: &str, workspace: &Path) -> Result<Vec<String>> {
        let (program, command_args) = split_command(&self.settings.command)?;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKSPACE}:rw", workspace.display()),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            "-e".to_string(),
            format!("HOME={CONTAINER_WORKSPACE}"),
            "-e".to_string(),
            format!("TMPDIR={CONTAINER_WORKSPACE}"),
            "-e".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
        ];
        if let Some(ref user) = self.user {
            args.extend(["--user".to_string(), user.clone()]);
        }
        if self.settings.no_network {
            args.push("--network=none".to_string());
        }
        args.extend(self.resource_args());
        args.push(self.image().to_string());
        args.push(program.to_string());
        args.extend(command_args.iter().cloned());
        Ok(args)
    }

    async fn pull_if_missing(&self) -> Result<()> {
        let image = self.image();
        let present = tokio::process::Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .is_ok_and(|s| s.success());
        if present {
            return Ok(());
        }

        info!(image, "pulling sandbox image");
        let output = tokio::process::Command::new("docker")
            .args(["pull", image])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker pull {image} failed: {}", stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_ready(&self) -> Result<()> {
        split_command(&self.settings.command)?;
        // Concurrent first callers share one pull; a failed or cancelled pull
        // is retried by the next caller.
        self.image_ready
            .get_or_try_init(|| self.pull_if_missing())
            .await?;
        Ok(())
    }

    async fn launch(&self, code: &str, workspace: &Path) -> Result<Box<dyn Execution>> {
        let name = self.container_name();
        let spec = ProcessSpec {
            program: "docker".into(),
            args: self.run_args(&name, workspace)?,
            working_dir: None,
            clear_env: false,
            env: Vec::new(),
            stdin: Some(code.as_bytes().to_vec()),
            max_output_bytes: self.settings.max_output_bytes,
        };
        debug!(container = %name, "launching sandbox container");
        let target = KillTarget::Container {
            cli: "docker".into(),
            name,
        };
        Ok(Box::new(spawn(&spec, target)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendChoice {
    Docker,
    Process(Confinement),
}

/// Create the sandbox backend named by `settings.backend`.
///
/// Fails when the requested isolation is not available on this host rather
/// than running code with less isolation than configured.
pub fn create_sandbox(settings: &ExecutorSettings) -> Result<Arc<dyn Sandbox>> {
    let choice = select_backend(&settings.backend, docker_usable, is_bubblewrap_usable)?;
    let settings = settings.clone();
    Ok(match choice {
        BackendChoice::Docker => Arc::new(DockerSandbox::new(settings)),
        BackendChoice::Process(confinement) => Arc::new(ProcessSandbox::new(settings, confinement)),
    })
}

/// Select the sandbox backend based on config and platform availability.
///
/// `"auto"` (the default) prefers Docker when both the CLI and the daemon are
/// usable, then bubblewrap, and refuses when neither can isolate sessions.
fn select_backend(
    requested: &str,
    docker: impl Fn() -> bool,
    bubblewrap: impl Fn() -> bool,
) -> Result<BackendChoice> {
    match requested {
        "docker" => Ok(BackendChoice::Docker),
        "process" if bubblewrap() => Ok(BackendChoice::Process(Confinement::Bubblewrap)),
        "process" => bail!(
            "the process backend needs bubblewrap (`bwrap`) with unprivileged user namespaces"
        ),
        "unconfined" => {
            warn!("sandbox backend is unconfined; executions can read each other's workspaces");
            Ok(BackendChoice::Process(Confinement::Unconfined))
        },
        _ => auto_detect_backend(docker, bubblewrap),
    }
}

fn auto_detect_backend(
    docker: impl Fn() -> bool,
    bubblewrap: impl Fn() -> bool,
) -> Result<BackendChoice> {
    if docker() {
        info!("sandbox backend: docker");
        return Ok(BackendChoice::Docker);
    }
    if bubblewrap() {
        info!("sandbox backend: process (bubblewrap)");
        return Ok(BackendChoice::Process(Confinement::Bubblewrap));
    }
    bail!(
        "no usable isolation found (docker daemon or bubblewrap); install one, or set \
         sandbox.backend = \"unconfined\" to run code without isolation"
    )
}

fn docker_usable() -> bool {
    let cli = is_cli_available("docker");
    let usable = should_use_docker_backend(cli, cli && is_docker_daemon_available());
    if cli && !usable {
        warn!("docker CLI detected but daemon is not accessible");
    }
    usable
}

fn should_use_docker_backend(docker_cli_available: bool, docker_daemon_available: bool) -> bool {
    docker_cli_available && docker_daemon_available
}

fn is_docker_daemon_available() -> bool {
    std::process::Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Whether `bwrap` can actually create its namespaces here. It is often
/// installed but unusable inside unprivileged containers.
pub fn is_bubblewrap_usable() -> bool {
    std::process::Command::new("bwrap")
        .args(["--unshare-all", "--die-with-parent", "--ro-bind", "/", "/", "true"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Check whether a CLI tool is available on PATH.
fn is_cli_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
