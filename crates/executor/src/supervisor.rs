//! Wall-clock deadline enforcement for one execution.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{exec::RawOutput, sandbox::Execution};

/// Most of the grace period ever held back for the kill request.
const MAX_KILL_ALLOWANCE: Duration = Duration::from_secs(1);

/// How a supervised execution ended.
pub enum Supervision {
    Finished(RawOutput),
    /// The deadline passed. `straggler` is set when the execution ignored
    /// the termination request and was force-killed but not yet reaped.
    TimedOut {
        after: Duration,
        straggler: Option<Box<dyn Execution>>,
    },
    /// Waiting on the execution failed before it produced a result.
    Failed(anyhow::Error),
}

impl std::fmt::Debug for Supervision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finished(output) => f.debug_tuple("Finished").field(output).finish(),
            Self::TimedOut { after, straggler } => f
                .debug_struct("TimedOut")
                .field("after", after)
                .field("straggler", &straggler.is_some())
                .finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutSupervisor {
    timeout: Duration,
    grace: Duration,
}

impl TimeoutSupervisor {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self { timeout, grace }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive `execution` to completion or its deadline.
    ///
    /// Returns no later than `timeout + grace`, even when the execution
    /// ignores termination and the kill request itself hangs.
    pub async fn supervise(&self, mut execution: Box<dyn Execution>) -> Supervision {
        match tokio::time::timeout(self.timeout, execution.wait()).await {
            Ok(Ok(output)) => Supervision::Finished(output),
            Ok(Err(error)) => Supervision::Failed(error),
            Err(_) => self.stop(execution).await,
        }
    }

    /// Tail of the grace period reserved for the kill request.
    fn kill_allowance(&self) -> Duration {
        (self.grace / 5).min(MAX_KILL_ALLOWANCE)
    }

    async fn stop(&self, mut execution: Box<dyn Execution>) -> Supervision {
        warn!(
            timeout_secs = self.timeout.as_secs(),
            "execution deadline reached, terminating"
        );
        let allowance = self.kill_allowance();
        let graceful = async {
            if let Err(error) = execution.terminate().await {
                warn!(%error, "termination request failed");
            }
            execution.wait().await
        };
        if tokio::time::timeout(self.grace - allowance, graceful)
            .await
            .is_ok()
        {
            debug!("execution exited after termination request");
            return Supervision::TimedOut {
                after: self.timeout,
                straggler: None,
            };
        }

        warn!(
            grace_secs = self.grace.as_secs(),
            "execution ignored termination, killing"
        );
        match tokio::time::timeout(allowance, execution.kill()).await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => warn!(%error, "kill request failed"),
            Err(_) => warn!(
                allowance_ms = allowance.as_millis(),
                "kill request did not complete in time"
            ),
        }
        Supervision::TimedOut {
            after: self.timeout,
            straggler: Some(execution),
        }
    }
}

/// Wait up to `limit` for a killed execution to be reaped.
pub async fn reap(mut straggler: Box<dyn Execution>, limit: Duration) -> bool {
    tokio::time::timeout(limit, straggler.wait()).await.is_ok()
}
