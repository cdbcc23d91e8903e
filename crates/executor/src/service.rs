use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    anyhow::Context,
    async_trait::async_trait,
    sandpit_config::SandpitConfig,
    tokio::task::JoinHandle,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

use crate::{
    admission::{AdmissionController, AdmissionError},
    collect::ResultCollector,
    error::IntegrityError,
    outcome::{ExecutionOutcome, ExecutionRequest, ExecutionState},
    retry::CodeRunner,
    sandbox::{Execution, Sandbox, create_sandbox},
    settings::ExecutorSettings,
    supervisor::{Supervision, TimeoutSupervisor, reap},
    workspace::{ResetOutcome, WorkspaceError, WorkspaceLease, WorkspaceManager},
};

/// How long a reaper waits for a force-killed execution before giving its
/// workspace back anyway.
const REAP_TIMEOUT: Duration = Duration::from_secs(30);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The sandboxed execution pipeline: admission, workspace, runtime,
/// deadline, collection.
pub struct SandboxService {
    settings: ExecutorSettings,
    sandbox: Arc<dyn Sandbox>,
    admission: AdmissionController,
    workspaces: WorkspaceManager,
    supervisor: TimeoutSupervisor,
    collector: ResultCollector,
    halted: Mutex<Option<IntegrityError>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxService {
    pub fn new(settings: ExecutorSettings, sandbox: Arc<dyn Sandbox>) -> Result<Self, WorkspaceError> {
        let workspaces = WorkspaceManager::new(&settings.shared_root)?;
        info!(
            backend = sandbox.backend_name(),
            root = %workspaces.root().display(),
            max_concurrent = settings.max_concurrent,
            timeout_secs = settings.running_timeout.as_secs(),
            "sandbox service ready"
        );
        Ok(Self {
            admission: AdmissionController::new(settings.max_concurrent),
            supervisor: TimeoutSupervisor::new(settings.running_timeout, settings.grace_period),
            collector: ResultCollector::new(settings.max_output_bytes),
            workspaces,
            sandbox,
            settings,
            halted: Mutex::new(None),
            reapers: Mutex::new(Vec::new()),
        })
    }

    /// Build a service from loaded configuration, selecting the backend.
    /// Fails when the configured isolation is not available.
    pub fn from_config(config: &SandpitConfig) -> anyhow::Result<Self> {
        let settings = ExecutorSettings::from(config);
        let sandbox = create_sandbox(&settings)?;
        Ok(Self::new(settings, sandbox)?)
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.sandbox.backend_name()
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn available_slots(&self) -> usize {
        self.admission.available()
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    fn check_halted(&self) -> Result<(), IntegrityError> {
        match lock(&self.halted).as_ref() {
            Some(fault) => Err(IntegrityError::Halted(fault.to_string())),
            None => Ok(()),
        }
    }

    /// Record the first integrity fault and stop admitting work. Later calls
    /// fail with [`IntegrityError::Halted`].
    fn halt(&self, fault: IntegrityError) -> IntegrityError {
        error!(%fault, "integrity fault, halting executor");
        {
            let mut halted = lock(&self.halted);
            if halted.is_none() {
                *halted = Some(fault.clone());
            }
        }
        self.admission.close();
        fault
    }

    /// Run `code` for `chat_key` and return the rendered result.
    ///
    /// Every timeout, rejection and runtime failure comes back as a string;
    /// only integrity faults are errors.
    pub async fn execute(&self, code: &str, chat_key: &str) -> Result<String, IntegrityError> {
        let outcome = self.run(ExecutionRequest::new(chat_key, code)).await?;
        Ok(self.collector.collect(&outcome))
    }

    /// Run one request to its outcome.
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, IntegrityError> {
        self.check_halted()?;
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let outcome = self.run_pipeline(&request).await.map_err(|f| self.halt(f))?;

        debug!(
            chat_key = %request.chat_key,
            outcome = outcome.label(),
            elapsed_ms = (chrono::Utc::now() - request.submitted_at).num_milliseconds(),
            "execution finished"
        );
        #[cfg(feature = "metrics")]
        {
            counter!("sandpit_executions_total", "outcome" => outcome.label()).increment(1);
            histogram!("sandpit_execution_duration_seconds").record(start.elapsed().as_secs_f64());
        }
        Ok(outcome)
    }

    async fn run_pipeline(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, IntegrityError> {
        let mut state = ExecutionState::Pending;
        let chat_key = request.chat_key.as_str();

        // Backend setup can be slow (image pulls) and must not hold a slot.
        if let Err(e) = self.ensure_ready().await {
            warn!(chat_key, error = %format!("{e:#}"), "sandbox backend not ready");
            return self.reject(&mut state, format!("sandbox backend not ready: {e:#}"));
        }

        // Same-key executions queue here, before taking capacity.
        let lease = match self.workspaces.acquire(chat_key).await {
            Ok(lease) => lease,
            Err(WorkspaceError::Integrity(fault)) => return Err(fault),
            Err(e) => return self.reject(&mut state, e.to_string()),
        };

        let slot = match self.admission.acquire(self.settings.admission_timeout).await {
            Ok(slot) => slot,
            Err(AdmissionError::Integrity(fault)) => return Err(fault),
            Err(e) => {
                self.workspaces.release(lease);
                return self.reject(&mut state, e.to_string());
            },
        };

        state.advance(ExecutionState::Preparing)?;
        let execution = match self.launch(&lease, &request.code).await? {
            Ok(execution) => execution,
            Err(e) => {
                warn!(chat_key, error = %format!("{e:#}"), "sandbox launch failed");
                state.advance(ExecutionState::RuntimeFault)?;
                self.admission.release(slot)?;
                self.workspaces.release(lease);
                return Ok(ExecutionOutcome::RuntimeFault {
                    message: format!("{e:#}"),
                });
            },
        };

        state.advance(ExecutionState::Running)?;
        #[cfg(feature = "metrics")]
        gauge!("sandpit_executions_running").increment(1.0);
        let supervision = self.supervisor.supervise(execution).await;
        #[cfg(feature = "metrics")]
        gauge!("sandpit_executions_running").decrement(1.0);

        let outcome = match supervision {
            Supervision::Finished(output) => ExecutionOutcome::from(output),
            Supervision::Failed(e) => ExecutionOutcome::RuntimeFault {
                message: format!("{e:#}"),
            },
            Supervision::TimedOut { after, straggler } => {
                warn!(chat_key, timeout_secs = after.as_secs(), "execution timed out");
                if let Some(straggler) = straggler {
                    state.advance(ExecutionState::TimedOut)?;
                    // The slot goes back now; the workspace stays locked until
                    // the killed process is gone.
                    self.admission.release(slot)?;
                    lease.mark_unreliable();
                    self.spawn_reaper(straggler, lease);
                    return Ok(ExecutionOutcome::TimedOut { after });
                }
                ExecutionOutcome::TimedOut { after }
            },
        };

        state.advance(ExecutionState::for_outcome(&outcome))?;
        self.admission.release(slot)?;
        self.workspaces.release(lease);
        Ok(outcome)
    }

    fn reject(
        &self,
        state: &mut ExecutionState,
        reason: String,
    ) -> Result<ExecutionOutcome, IntegrityError> {
        state.advance(ExecutionState::Rejected)?;
        #[cfg(feature = "metrics")]
        counter!("sandpit_admission_rejections_total").increment(1);
        Ok(ExecutionOutcome::AdmissionRejected { reason })
    }

    async fn ensure_ready(&self) -> anyhow::Result<()> {
        let limit = self.settings.ready_timeout;
        tokio::time::timeout(limit, self.sandbox.ensure_ready())
            .await
            .with_context(|| format!("setup did not finish within {limit:?}"))?
    }

    /// Prepare the workspace and start the program. The outer error is an
    /// integrity fault; the inner one a launch failure to report as a result.
    async fn launch(
        &self,
        lease: &WorkspaceLease,
        code: &str,
    ) -> Result<anyhow::Result<Box<dyn Execution>>, IntegrityError> {
        let path: &Path = match lease.prepare().await {
            Ok(path) => path,
            Err(WorkspaceError::Integrity(fault)) => return Err(fault),
            Err(e) => return Ok(Err(e.into())),
        };
        Ok(self.sandbox.launch(code, path).await)
    }

    fn spawn_reaper(&self, straggler: Box<dyn Execution>, lease: WorkspaceLease) {
        let workspaces = self.workspaces.clone();
        let handle = tokio::spawn(async move {
            let chat_key = lease.chat_key().to_string();
            if reap(straggler, REAP_TIMEOUT).await {
                debug!(chat_key = %chat_key, "killed execution reaped");
            } else {
                error!(chat_key = %chat_key, "killed execution did not exit, releasing workspace anyway");
            }
            workspaces.release(lease);
        });
        let mut reapers = lock(&self.reapers);
        reapers.retain(|h| !h.is_finished());
        reapers.push(handle);
    }

    /// Delete a chat key's workspace, waiting for its running execution.
    pub async fn reset(&self, chat_key: &str) -> Result<ResetOutcome, WorkspaceError> {
        self.check_halted()?;
        match self.workspaces.reset(chat_key).await {
            Err(WorkspaceError::Integrity(fault)) => Err(self.halt(fault).into()),
            other => other,
        }
    }

    /// Stop admitting work, wait for pending reapers, and remove every
    /// workspace this service created.
    pub async fn shutdown(&self) -> Result<usize, WorkspaceError> {
        self.admission.close();
        let reapers = std::mem::take(&mut *lock(&self.reapers));
        for reaper in reapers {
            if let Err(e) = reaper.await {
                warn!(error = %e, "reaper task failed");
            }
        }
        self.workspaces.shutdown().await
    }
}

#[async_trait]
impl CodeRunner for SandboxService {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, IntegrityError> {
        SandboxService::run(self, request).await
    }

    fn render(&self, outcome: &ExecutionOutcome) -> String {
        self.collector.collect(outcome)
    }
}
