//! Caller-side retry contract.
//!
//! The executor runs every request exactly once. Whether to try again is
//! decided here, from the outcome, under two independent budgets: one for
//! failed executions and one, refreshed per call, for the code generator.

use std::time::Duration;

use {
    async_trait::async_trait,
    sandpit_config::AgentConfig,
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    collect::CORE_PREFIX,
    error::IntegrityError,
    outcome::{ExecutionOutcome, ExecutionRequest},
};

/// What a caller should do with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Success,
    /// The code is at fault; regenerate and resubmit.
    RetryScript,
    /// No capacity right now; resubmit the same code after a pause.
    RetryAfterBackoff,
    /// Do not retry automatically. Timeouts land here: a snippet that runs
    /// past its deadline is unlikely to behave differently next time.
    Terminal,
}

pub fn classify(outcome: &ExecutionOutcome) -> Disposition {
    match outcome {
        ExecutionOutcome::Completed { exit_code: 0, .. } => Disposition::Success,
        ExecutionOutcome::Completed { .. } | ExecutionOutcome::RuntimeFault { .. } => {
            Disposition::RetryScript
        },
        ExecutionOutcome::AdmissionRejected { .. } => Disposition::RetryAfterBackoff,
        ExecutionOutcome::TimedOut { .. } => Disposition::Terminal,
    }
}

/// Retries granted against a fixed budget. The first attempt is free;
/// `max_attempts` counts retries beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryState {
    attempts_used: u32,
    max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts_used: 0,
            max_attempts,
        }
    }

    /// Take one retry from the budget. Returns `false` once exhausted.
    pub fn consume(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.attempts_used += 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_used)
    }

    pub fn exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub script_max_retries: u32,
    pub llm_api_max_retries: u32,
    pub admission_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for RetryPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            script_max_retries: config.script_max_retry_times,
            llm_api_max_retries: config.llm_api_max_retries,
            admission_backoff: Duration::from_millis(config.admission_backoff_ms),
        }
    }
}

/// Produces code for a chat key, optionally from the previous attempt's
/// rendered result.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, chat_key: &str, feedback: Option<&str>) -> anyhow::Result<String>;
}

/// Anything that can run a request and render its outcome.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, IntegrityError>;

    fn render(&self, outcome: &ExecutionOutcome) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    TimedOut,
    ScriptBudgetExhausted,
    GenerationFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    /// Final rendered result handed to the user.
    pub output: String,
    /// Last execution outcome, if anything ran.
    pub outcome: Option<ExecutionOutcome>,
    /// Executions submitted, including resubmissions after rejection.
    pub executions: u32,
    pub script: RetryState,
    /// Generator calls made across all steps.
    pub generation_attempts: u32,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generate, execute and classify until success, a terminal outcome, or
    /// an exhausted budget. Integrity faults are returned, never retried.
    pub async fn run(
        &self,
        runner: &dyn CodeRunner,
        generator: &dyn CodeGenerator,
        chat_key: &str,
    ) -> Result<RetryReport, IntegrityError> {
        let mut script = RetryState::new(self.policy.script_max_retries);
        let mut executions = 0;
        let mut generation_attempts = 0;
        let mut feedback: Option<String> = None;

        loop {
            let code = match self
                .generate(generator, chat_key, feedback.as_deref(), &mut generation_attempts)
                .await
            {
                Ok(code) => code,
                Err(error) => {
                    warn!(chat_key, %error, "code generation failed, giving up");
                    return Ok(RetryReport {
                        output: format!("{CORE_PREFIX}code generation failed: {error}"),
                        outcome: None,
                        executions,
                        script,
                        generation_attempts,
                        stop_reason: StopReason::GenerationFailed,
                    });
                },
            };

            loop {
                let outcome = runner.run(ExecutionRequest::new(chat_key, code.clone())).await?;
                executions += 1;
                let output = runner.render(&outcome);
                let disposition = classify(&outcome);
                debug!(chat_key, executions, ?disposition, "execution classified");

                let stop_reason = match disposition {
                    Disposition::Success => Some(StopReason::Succeeded),
                    Disposition::Terminal => Some(StopReason::TimedOut),
                    Disposition::RetryScript | Disposition::RetryAfterBackoff
                        if !script.consume() =>
                    {
                        info!(chat_key, executions, "script retry budget exhausted");
                        Some(StopReason::ScriptBudgetExhausted)
                    },
                    Disposition::RetryScript | Disposition::RetryAfterBackoff => None,
                };
                if let Some(stop_reason) = stop_reason {
                    return Ok(RetryReport {
                        output,
                        outcome: Some(outcome),
                        executions,
                        script,
                        generation_attempts,
                        stop_reason,
                    });
                }

                if disposition == Disposition::RetryAfterBackoff {
                    tokio::time::sleep(self.policy.admission_backoff).await;
                    continue;
                }
                feedback = Some(output);
                break;
            }
        }
    }

    /// One generation step with its own retry budget.
    async fn generate(
        &self,
        generator: &dyn CodeGenerator,
        chat_key: &str,
        feedback: Option<&str>,
        attempts: &mut u32,
    ) -> anyhow::Result<String> {
        let mut budget = RetryState::new(self.policy.llm_api_max_retries);
        loop {
            *attempts += 1;
            match generator.generate(chat_key, feedback).await {
                Ok(code) => return Ok(code),
                Err(error) if budget.consume() => {
                    warn!(chat_key, %error, remaining = budget.remaining(), "code generation failed, retrying");
                },
                Err(error) => return Err(error),
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    use {super::*, crate::collect::ResultCollector, rstest::rstest};

    fn exit(code: i32) -> ExecutionOutcome {
        ExecutionOutcome::Completed {
            stdout: format!("exit {code}"),
            stderr: String::new(),
            exit_code: code,
            truncated: false,
        }
    }

    fn rejected() -> ExecutionOutcome {
        ExecutionOutcome::AdmissionRejected {
            reason: "busy".into(),
        }
    }

    /// Returns queued outcomes in order, then successes.
    struct ScriptedRunner {
        outcomes: Mutex<VecDeque<Result<ExecutionOutcome, IntegrityError>>>,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<Result<ExecutionOutcome, IntegrityError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, IntegrityError> {
            self.submitted.lock().unwrap().push(request.code);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(exit(0)))
        }

        fn render(&self, outcome: &ExecutionOutcome) -> String {
            ResultCollector::new(4096).collect(outcome)
        }
    }

    /// Fails `fail_streak` times before every successful generation.
    struct CountingGenerator {
        fail_streak: u32,
        streak: AtomicU32,
        calls: AtomicU32,
        feedback: Mutex<Vec<Option<String>>>,
    }

    impl CountingGenerator {
        fn new(fail_streak: u32) -> Self {
            Self {
                fail_streak,
                streak: AtomicU32::new(0),
                calls: AtomicU32::new(0),
                feedback: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CodeGenerator for CountingGenerator {
        async fn generate(&self, _chat_key: &str, feedback: Option<&str>) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.streak.load(Ordering::SeqCst) < self.fail_streak {
                self.streak.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("llm api unavailable");
            }
            self.streak.store(0, Ordering::SeqCst);
            self.feedback
                .lock()
                .unwrap()
                .push(feedback.map(str::to_string));
            Ok(format!("print({n})"))
        }
    }

    fn orchestrator(script: u32, llm: u32) -> RetryOrchestrator {
        RetryOrchestrator::new(RetryPolicy {
            script_max_retries: script,
            llm_api_max_retries: llm,
            admission_backoff: Duration::from_millis(10),
        })
    }

    #[rstest]
    #[case(exit(0), Disposition::Success)]
    #[case(exit(1), Disposition::RetryScript)]
    #[case(ExecutionOutcome::RuntimeFault { message: "spawn".into() }, Disposition::RetryScript)]
    #[case(rejected(), Disposition::RetryAfterBackoff)]
    #[case(ExecutionOutcome::TimedOut { after: Duration::from_secs(60) }, Disposition::Terminal)]
    fn test_classify(#[case] outcome: ExecutionOutcome, #[case] expected: Disposition) {
        assert_eq!(classify(&outcome), expected);
    }

    #[test]
    fn test_retry_state_budget() {
        let mut state = RetryState::new(2);
        assert_eq!(state.remaining(), 2);
        assert!(state.consume());
        assert!(state.consume());
        assert!(state.exhausted());
        assert!(!state.consume());
        assert_eq!(state.attempts_used(), 2);
        assert!(RetryState::new(0).exhausted());
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.script_max_retries, 5);
        assert_eq!(policy.llm_api_max_retries, 3);
    }

    #[tokio::test]
    async fn test_success_first_time() {
        let runner = ScriptedRunner::new(vec![]);
        let generator = CountingGenerator::new(0);
        let report = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Succeeded);
        assert_eq!(report.executions, 1);
        assert_eq!(report.script.attempts_used(), 0);
        assert_eq!(report.output, "exit 0");
    }

    #[tokio::test]
    async fn test_script_failures_regenerate_with_feedback() {
        let runner = ScriptedRunner::new(vec![Ok(exit(1)), Ok(exit(2))]);
        let generator = CountingGenerator::new(0);
        let report = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Succeeded);
        assert_eq!(report.executions, 3);
        assert_eq!(report.script.attempts_used(), 2);
        assert_eq!(
            *runner.submitted.lock().unwrap(),
            ["print(0)", "print(1)", "print(2)"]
        );
        let feedback = generator.feedback.lock().unwrap();
        assert_eq!(feedback[0], None);
        assert_eq!(feedback[1].as_deref(), Some("exit 1\n[exit code: 1]"));
    }

    #[tokio::test]
    async fn test_script_budget_exhaustion() {
        let runner = ScriptedRunner::new((0..10).map(|_| Ok(exit(1))).collect());
        let generator = CountingGenerator::new(0);
        let report = orchestrator(2, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::ScriptBudgetExhausted);
        assert_eq!(report.executions, 3);
        assert!(report.script.exhausted());
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let runner = ScriptedRunner::new(vec![Ok(ExecutionOutcome::TimedOut {
            after: Duration::from_secs(1),
        })]);
        let generator = CountingGenerator::new(0);
        let report = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::TimedOut);
        assert_eq!(report.executions, 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(report.output.starts_with(CORE_PREFIX));
    }

    #[tokio::test]
    async fn test_rejection_resubmits_same_code() {
        let runner = ScriptedRunner::new(vec![Ok(rejected()), Ok(rejected())]);
        let generator = CountingGenerator::new(0);
        let report = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Succeeded);
        assert_eq!(
            *runner.submitted.lock().unwrap(),
            ["print(0)", "print(0)", "print(0)"]
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.script.attempts_used(), 2);
    }

    #[tokio::test]
    async fn test_generation_budget_is_independent_and_fresh() {
        // Two failures before each success: four in total, more than a
        // shared budget of two would allow.
        let runner = ScriptedRunner::new(vec![Ok(exit(1))]);
        let generator = CountingGenerator::new(2);
        let report = orchestrator(5, 2)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Succeeded);
        assert_eq!(report.generation_attempts, 6);
        assert_eq!(report.script.attempts_used(), 1);
        assert_eq!(*runner.submitted.lock().unwrap(), ["print(2)", "print(5)"]);
    }

    #[tokio::test]
    async fn test_generation_exhaustion_stops() {
        let runner = ScriptedRunner::new(vec![]);
        let generator = CountingGenerator::new(10);
        let report = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::GenerationFailed);
        assert_eq!(report.generation_attempts, 4);
        assert_eq!(report.executions, 0);
        assert!(report.output.starts_with(CORE_PREFIX));
    }

    #[tokio::test]
    async fn test_integrity_fault_propagates() {
        let runner = ScriptedRunner::new(vec![Err(IntegrityError::DoubleRelease { slot: 1 })]);
        let generator = CountingGenerator::new(0);
        let err = orchestrator(5, 3)
            .run(&runner, &generator, "group_1")
            .await
            .unwrap_err();
        assert_eq!(err, IntegrityError::DoubleRelease { slot: 1 });
    }
}
