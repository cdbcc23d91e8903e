//! Sandboxed code execution.
//!
//! A [`SandboxService`] takes `(code, chat_key)`, queues it for one of a fixed
//! number of concurrency slots, runs it inside the chat key's own workspace
//! under a wall-clock deadline, and returns the output as a string. Timeouts,
//! rejections and runtime failures are strings too; only broken invariants
//! ([`IntegrityError`]) surface as errors, and they halt the service.
//!
//! Retrying is the caller's business: [`retry`] classifies outcomes and keeps
//! the script and code-generation budgets apart.

pub mod admission;
pub mod collect;
pub mod error;
pub mod exec;
pub mod outcome;
pub mod retry;
pub mod sandbox;
pub mod service;
pub mod settings;
pub mod supervisor;
pub mod workspace;

pub use {
    admission::{AdmissionController, AdmissionError, Slot},
    collect::ResultCollector,
    error::IntegrityError,
    outcome::{ExecutionOutcome, ExecutionRequest, ExecutionState},
    retry::{
        CodeGenerator, CodeRunner, Disposition, RetryOrchestrator, RetryPolicy, RetryReport,
        RetryState, StopReason, classify,
    },
    sandbox::{Confinement, DockerSandbox, Execution, ProcessSandbox, Sandbox, create_sandbox},
    service::SandboxService,
    settings::ExecutorSettings,
    supervisor::{Supervision, TimeoutSupervisor},
    workspace::{ResetOutcome, WorkspaceError, WorkspaceLease, WorkspaceManager},
};
