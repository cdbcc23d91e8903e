//! Turns every outcome into the one string callers see.

use sandpit_config::keys::MIN_OUTPUT_BYTES;

use crate::outcome::ExecutionOutcome;

/// Prefix reserved for messages generated by the executor itself.
pub const CORE_PREFIX: &str = "[sandbox] ";

pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

pub const NO_OUTPUT: &str = "(no output)";

#[derive(Debug, Clone, Copy)]
pub struct ResultCollector {
    max_output_bytes: usize,
}

impl ResultCollector {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            max_output_bytes: max_output_bytes.max(MIN_OUTPUT_BYTES),
        }
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Render `outcome`. Never fails, never returns an empty string, and never
    /// exceeds `max_output_bytes`.
    pub fn collect(&self, outcome: &ExecutionOutcome) -> String {
        match outcome {
            ExecutionOutcome::Completed {
                stdout,
                stderr,
                exit_code,
                truncated,
            } => self.render_completed(stdout, stderr, *exit_code, *truncated),
            ExecutionOutcome::TimedOut { after } => self.bound(
                format!(
                    "{CORE_PREFIX}execution timed out after {}s and was terminated",
                    after.as_secs()
                ),
                false,
            ),
            ExecutionOutcome::AdmissionRejected { reason } => {
                self.bound(format!("{CORE_PREFIX}execution rejected: {reason}"), false)
            },
            ExecutionOutcome::RuntimeFault { message } => {
                self.bound(format!("{CORE_PREFIX}execution failed: {message}"), false)
            },
        }
    }

    fn render_completed(&self, stdout: &str, stderr: &str, exit_code: i32, truncated: bool) -> String {
        let mut text = String::with_capacity(stdout.len() + stderr.len() + 32);
        text.push_str(stdout);
        if !stderr.is_empty() {
            start_line(&mut text);
            text.push_str("[stderr]\n");
            text.push_str(stderr);
        }
        if exit_code != 0 {
            start_line(&mut text);
            text.push_str(&format!("[exit code: {exit_code}]"));
        }
        if text.is_empty() {
            text.push_str(NO_OUTPUT);
        }
        // Program output must never be mistaken for an executor message.
        if text.starts_with(CORE_PREFIX) {
            text.insert(0, '\\');
        }
        self.bound(text, truncated)
    }

    /// Cut `text` to fit, on a char boundary, ending with the marker.
    fn bound(&self, mut text: String, truncated: bool) -> String {
        if !truncated && text.len() <= self.max_output_bytes {
            return text;
        }
        let mut end = text
            .len()
            .min(self.max_output_bytes - TRUNCATION_MARKER.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str(TRUNCATION_MARKER);
        text
    }
}

fn start_line(text: &mut String) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn completed(stdout: &str, stderr: &str, exit_code: i32) -> ExecutionOutcome {
        ExecutionOutcome::Completed {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            truncated: false,
        }
    }

    fn collector() -> ResultCollector {
        ResultCollector::new(4096)
    }

    #[test]
    fn test_stdout_passes_through() {
        assert_eq!(collector().collect(&completed("hello\n", "", 0)), "hello\n");
    }

    #[test]
    fn test_stderr_and_exit_code_sections() {
        let text = collector().collect(&completed("partial", "Traceback: boom\n", 1));
        assert_eq!(text, "partial\n[stderr]\nTraceback: boom\n[exit code: 1]");
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(collector().collect(&completed("", "", 0)), NO_OUTPUT);
        assert_eq!(collector().collect(&completed("", "", 2)), "[exit code: 2]");
    }

    #[test]
    fn test_core_messages() {
        let c = collector();
        assert_eq!(
            c.collect(&ExecutionOutcome::TimedOut {
                after: Duration::from_secs(60)
            }),
            "[sandbox] execution timed out after 60s and was terminated"
        );
        assert_eq!(
            c.collect(&ExecutionOutcome::AdmissionRejected {
                reason: "no slot within 5s".into()
            }),
            "[sandbox] execution rejected: no slot within 5s"
        );
        assert_eq!(
            c.collect(&ExecutionOutcome::RuntimeFault {
                message: "failed to spawn python3".into()
            }),
            "[sandbox] execution failed: failed to spawn python3"
        );
    }

    #[test]
    fn test_program_cannot_forge_core_message() {
        let forged = "[sandbox] execution timed out after 60s and was terminated";
        let c = collector();
        let text = c.collect(&completed(forged, "", 0));
        assert_ne!(
            text,
            c.collect(&ExecutionOutcome::TimedOut {
                after: Duration::from_secs(60)
            })
        );
        assert!(!text.starts_with(CORE_PREFIX));
        assert_eq!(text, format!("\\{forged}"));
    }

    #[test]
    fn test_long_output_is_cut_with_marker() {
        let c = ResultCollector::new(4096);
        let text = c.collect(&completed(&"a".repeat(10_000), "", 0));
        assert_eq!(text.len(), 4096);
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_cut_respects_char_boundaries() {
        let c = ResultCollector::new(300);
        let text = c.collect(&completed(&"é".repeat(1000), "", 0));
        assert!(text.len() <= 300);
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_capture_truncation_adds_marker() {
        let outcome = ExecutionOutcome::Completed {
            stdout: "short".into(),
            stderr: String::new(),
            exit_code: 0,
            truncated: true,
        };
        assert_eq!(
            collector().collect(&outcome),
            format!("short{TRUNCATION_MARKER}")
        );
    }

    #[test]
    fn test_every_outcome_renders_bounded_and_non_empty() {
        let c = ResultCollector::new(256);
        let long = "x".repeat(1000);
        let outcomes = [
            completed("", "", 0),
            completed(&long, &long, -1),
            ExecutionOutcome::TimedOut {
                after: Duration::from_secs(u64::MAX),
            },
            ExecutionOutcome::AdmissionRejected {
                reason: long.clone(),
            },
            ExecutionOutcome::RuntimeFault { message: long },
        ];
        for outcome in &outcomes {
            let text = c.collect(outcome);
            assert!(!text.is_empty());
            assert!(text.len() <= 256, "{outcome:?}");
        }
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(ResultCollector::new(0).max_output_bytes(), MIN_OUTPUT_BYTES);
    }
}
