use std::time::Duration;

use {
    chrono::{DateTime, Utc},
    serde::{Serialize, Serializer},
};

use crate::{error::IntegrityError, exec::RawOutput};

/// One submission of code on behalf of a chat key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRequest {
    pub chat_key: String,
    pub code: String,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(chat_key: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            chat_key: chat_key.into(),
            code: code.into(),
            submitted_at: Utc::now(),
        }
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// Terminal result of one request. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
        truncated: bool,
    },
    TimedOut {
        #[serde(rename = "after_secs", serialize_with = "as_secs")]
        after: Duration,
    },
    AdmissionRejected {
        reason: String,
    },
    RuntimeFault {
        message: String,
    },
}

impl ExecutionOutcome {
    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { exit_code: 0, .. } => "success",
            Self::Completed { .. } => "nonzero_exit",
            Self::TimedOut { .. } => "timed_out",
            Self::AdmissionRejected { .. } => "rejected",
            Self::RuntimeFault { .. } => "runtime_fault",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0, .. })
    }
}

impl From<RawOutput> for ExecutionOutcome {
    fn from(output: RawOutput) -> Self {
        Self::Completed {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            truncated: output.truncated,
        }
    }
}

/// Lifecycle of one request.
///
/// ```text
/// Pending -> Preparing -> Running -> Completed | TimedOut | RuntimeFault
/// Pending -> Rejected
/// Preparing -> RuntimeFault
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Preparing,
    Running,
    Completed,
    TimedOut,
    RuntimeFault,
    Rejected,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::RuntimeFault => "runtime_fault",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::RuntimeFault | Self::Rejected
        )
    }

    fn allows(self, next: Self) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Preparing | Rejected)
                | (Preparing, Running | RuntimeFault)
                | (Running, Completed | TimedOut | RuntimeFault)
        )
    }

    /// Move to `next`, or fail if the lifecycle does not allow it.
    pub fn advance(&mut self, next: Self) -> Result<(), IntegrityError> {
        if !self.allows(next) {
            return Err(IntegrityError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Terminal state matching an outcome.
    pub fn for_outcome(outcome: &ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed { .. } => Self::Completed,
            ExecutionOutcome::TimedOut { .. } => Self::TimedOut,
            ExecutionOutcome::AdmissionRejected { .. } => Self::Rejected,
            ExecutionOutcome::RuntimeFault { .. } => Self::RuntimeFault,
        }
    }
}
