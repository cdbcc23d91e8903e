use std::{io, path::PathBuf, process::Stdio, time::Duration};

use {
    anyhow::{Context, Result},
    async_trait::async_trait,
    serde::Serialize,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        process::{Child, Command},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::sandbox::Execution;

/// How long to keep reading pipes after the process exited. Descendants that
/// inherited the pipes can hold them open indefinitely.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Upper bound on a `docker kill` round trip. A wedged daemon must not stall
/// the caller.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Captured result of one finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Either stream produced more than the capture limit.
    pub truncated: bool,
}

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Start from an empty environment instead of inheriting ours.
    pub clear_env: bool,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
}

/// Where termination signals go.
#[derive(Debug, Clone)]
pub enum KillTarget {
    /// Signal the child's process group (the child is the group leader).
    ProcessGroup,
    /// Signal a named container through its CLI; the local child is only the
    /// attached client.
    Container { cli: String, name: String },
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read a stream to EOF, keeping at most `limit` bytes.
async fn capture<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<Captured> {
    let mut captured = Captured::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n <= room {
            captured.bytes.extend_from_slice(&buf[..n]);
        } else {
            captured.bytes.extend_from_slice(&buf[..room]);
            captured.truncated = true;
        }
    }
    Ok(captured)
}

/// Await a reader task, giving up after [`IO_DRAIN_TIMEOUT`]. Cancel-safe:
/// the handle is only cleared once it has produced a value.
async fn drain(handle: &mut Option<JoinHandle<io::Result<Captured>>>, stream: &str) -> Captured {
    let Some(task) = handle.as_mut() else {
        return Captured::default();
    };
    let captured = match tokio::time::timeout(IO_DRAIN_TIMEOUT, &mut *task).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(stream, error = %e, "failed to read process output");
            Captured::default()
        },
        Ok(Err(e)) => {
            warn!(stream, error = %e, "output reader task failed");
            Captured::default()
        },
        Err(_) => {
            warn!(stream, "output pipe still open after exit, abandoning");
            task.abort();
            Captured {
                bytes: Vec::new(),
                truncated: true,
            }
        },
    };
    *handle = None;
    captured
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

    let pgid = Pid::from_raw(i32::try_from(pid).context("pid out of range")?);
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to send {signal:?} to process group {pid}")),
    }
}

async fn container_kill(cli: &str, name: &str, signal: Option<&str>) -> Result<()> {
    let mut args = vec!["kill".to_string()];
    if let Some(signal) = signal {
        args.push(format!("--signal={signal}"));
    }
    args.push(name.to_string());
    let request = Command::new(cli)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(SIGNAL_TIMEOUT, request)
        .await
        .with_context(|| format!("{cli} kill {name} did not answer"))?
        .with_context(|| format!("failed to run {cli} kill"))?;
    if !output.status.success() {
        // The container may already be gone.
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(container = name, stderr = %stderr.trim(), "container kill reported failure");
    }
    Ok(())
}

/// A spawned process with its output readers.
pub struct ProcessExecution {
    child: Child,
    pid: Option<u32>,
    target: KillTarget,
    stdout: Option<JoinHandle<io::Result<Captured>>>,
    stderr: Option<JoinHandle<io::Result<Captured>>>,
    stdin: Option<JoinHandle<()>>,
    reaped: bool,
}

impl std::fmt::Debug for ProcessExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessExecution")
            .field("pid", &self.pid)
            .field("target", &self.target)
            .field("reaped", &self.reaped)
            .finish()
    }
}

/// Spawn `spec` with piped output, in its own process group on unix.
pub fn spawn(spec: &ProcessSpec, target: KillTarget) -> Result<ProcessExecution> {
    debug!(program = %spec.program, args = ?spec.args, "spawning sandboxed process");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    if spec.clear_env {
        cmd.env_clear();
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", spec.program))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .context("stdout pipe not available")?;
    let stderr = child
        .stderr
        .take()
        .context("stderr pipe not available")?;
    let limit = spec.max_output_bytes;
    let stdout = tokio::spawn(capture(stdout, limit));
    let stderr = tokio::spawn(capture(stderr, limit));

    let stdin = match (child.stdin.take(), spec.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
            // A program that exits without reading stdin closes the pipe early.
            if let Err(e) = pipe.write_all(&input).await {
                debug!(error = %e, "stdin closed before input was written");
            }
        })),
        _ => None,
    };

    Ok(ProcessExecution {
        child,
        pid,
        target,
        stdout: Some(stdout),
        stderr: Some(stderr),
        stdin,
        reaped: false,
    })
}

impl ProcessExecution {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn signal(&mut self, graceful: bool) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        if !graceful {
            // The local client goes first; the container follows.
            let _ = self.child.start_kill();
        }
        match &self.target {
            KillTarget::Container { cli, name } => {
                container_kill(cli, name, graceful.then_some("TERM")).await?;
            },
            KillTarget::ProcessGroup => {
                #[cfg(unix)]
                if let Some(pid) = self.pid {
                    use nix::sys::signal::Signal;
                    let signal = if graceful {
                        Signal::SIGTERM
                    } else {
                        Signal::SIGKILL
                    };
                    signal_group(pid, signal)?;
                }
            },
        }
        if graceful && cfg!(not(unix)) {
            // Already exited is fine.
            let _ = self.child.start_kill();
        }
        Ok(())
    }
}

#[async_trait]
impl Execution for ProcessExecution {
    async fn wait(&mut self) -> Result<RawOutput> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for sandboxed process")?;
        self.reaped = true;

        // Nothing in the group may outlive the leader.
        #[cfg(unix)]
        if let (KillTarget::ProcessGroup, Some(pid)) = (&self.target, self.pid) {
            let _ = signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        if let Some(stdin) = self.stdin.take() {
            stdin.abort();
        }
        let stdout = drain(&mut self.stdout, "stdout").await;
        let stderr = drain(&mut self.stderr, "stderr").await;

        let output = RawOutput {
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            exit_code: exit_code(status),
            truncated: stdout.truncated || stderr.truncated,
        };
        debug!(
            pid = self.pid,
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            truncated = output.truncated,
            "sandboxed process finished"
        );
        Ok(output)
    }

    async fn terminate(&mut self) -> Result<()> {
        debug!(pid = self.pid, "terminating sandboxed process");
        self.signal(true).await
    }

    async fn kill(&mut self) -> Result<()> {
        debug!(pid = self.pid, "killing sandboxed process");
        self.signal(false).await
    }
}

impl Drop for ProcessExecution {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        match &self.target {
            KillTarget::ProcessGroup => {
                #[cfg(unix)]
                if let Some(pid) = self.pid {
                    let _ = signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                }
            },
            KillTarget::Container { cli, name } => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let (cli, name) = (cli.clone(), name.clone());
                    handle.spawn(async move {
                        let _ = container_kill(&cli, &name, None).await;
                    });
                }
            },
        }
    }
}
