//! Reference evaluator implementations.
//!
//! Three stages ship with the core: an external test runner, a
//! patch-size lint, and a wall-time performance probe. Task code may
//! implement [`Evaluator`](super::Evaluator) directly for anything
//! richer.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Evaluator, StageResult};
use crate::config::EvaluatorConfig;
use crate::store::CandidateRecord;

/// Runs an external test command in the workdir; passes iff the exit
/// code is zero. Value is 1.0/0.0, cost is wall time.
#[derive(Debug, Clone)]
pub struct TestsEvaluator {
    command: Vec<String>,
    timeout: Duration,
}

impl TestsEvaluator {
    /// Creates a tests stage invoking `command` in the workdir.
    #[must_use]
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Evaluator for TestsEvaluator {
    fn name(&self) -> &str {
        "tests"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn evaluate(&self, workdir: &Path, _candidate: &CandidateRecord) -> StageResult {
        let Some((program, args)) = self.command.split_first() else {
            return StageResult::failed("empty test command");
        };
        let start = Instant::now();
        match Command::new(program).args(args).current_dir(workdir).output() {
            Err(err) => StageResult::failed(err.to_string()),
            Ok(output) => {
                let cost_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let passed = output.status.success();
                debug!(passed, cost_ms, "tests stage finished");
                let error = if passed {
                    None
                } else {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    Some(text)
                };
                StageResult {
                    value: if passed { 1.0 } else { 0.0 },
                    passed,
                    cost_ms,
                    error,
                }
            }
        }
    }
}

/// Static patch-size check: passes iff added lines stay under the cap.
/// Value is the remaining headroom, so smaller patches score higher.
#[derive(Debug, Clone)]
pub struct LintsEvaluator {
    max_lines: usize,
    timeout: Duration,
}

impl LintsEvaluator {
    /// Creates a lints stage capped at `max_lines` added lines.
    #[must_use]
    pub fn new(max_lines: usize, timeout: Duration) -> Self {
        Self { max_lines, timeout }
    }
}

impl Evaluator for LintsEvaluator {
    fn name(&self) -> &str {
        "lints"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn evaluate(&self, _workdir: &Path, candidate: &CandidateRecord) -> StageResult {
        let added = candidate
            .patch
            .lines()
            .filter(|line| line.starts_with('+'))
            .count();
        let passed = added <= self.max_lines;
        #[allow(clippy::cast_precision_loss)]
        let value = self.max_lines as f64 - added as f64;
        StageResult {
            value,
            passed,
            cost_ms: 1,
            error: if passed {
                None
            } else {
                Some(format!(
                    "too many added lines: {added} > {}",
                    self.max_lines
                ))
            },
        }
    }
}

/// Times an external command; passes iff wall time stays within the
/// budget. Passes vacuously when no command is configured.
#[derive(Debug, Clone)]
pub struct PerfEvaluator {
    command: Option<Vec<String>>,
    budget_ms: u64,
    timeout: Duration,
}

impl PerfEvaluator {
    /// Creates a perf stage timing `command` against `budget_ms`.
    #[must_use]
    pub fn new(command: Option<Vec<String>>, budget_ms: u64, timeout: Duration) -> Self {
        Self {
            command,
            budget_ms,
            timeout,
        }
    }
}

impl Evaluator for PerfEvaluator {
    fn name(&self) -> &str {
        "perf"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn evaluate(&self, workdir: &Path, _candidate: &CandidateRecord) -> StageResult {
        let Some(command) = &self.command else {
            return StageResult {
                value: 0.0,
                passed: true,
                cost_ms: 0,
                error: None,
            };
        };
        let Some((program, args)) = command.split_first() else {
            return StageResult::failed("empty perf command");
        };
        let start = Instant::now();
        // The measured command's exit status is intentionally ignored;
        // only its wall time matters here.
        if let Err(err) = Command::new(program).args(args).current_dir(workdir).output() {
            return StageResult::failed(err.to_string());
        }
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let passed = duration_ms <= self.budget_ms;
        #[allow(clippy::cast_precision_loss)]
        let value = duration_ms as f64;
        StageResult {
            value,
            passed,
            cost_ms: duration_ms,
            error: if passed {
                None
            } else {
                Some(format!(
                    "duration {duration_ms}ms exceeds budget {}ms",
                    self.budget_ms
                ))
            },
        }
    }
}

/// Builds the configured cascade stages.
#[must_use]
pub fn build_evaluators(configs: &[EvaluatorConfig]) -> Vec<Arc<dyn Evaluator>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn Evaluator> {
            match config {
                EvaluatorConfig::Tests { command, timeout_s } => Arc::new(TestsEvaluator::new(
                    command.clone(),
                    Duration::from_secs(*timeout_s),
                )),
                EvaluatorConfig::Lints {
                    max_lines,
                    timeout_s,
                } => Arc::new(LintsEvaluator::new(
                    *max_lines,
                    Duration::from_secs(*timeout_s),
                )),
                EvaluatorConfig::Perf {
                    command,
                    budget_ms,
                    timeout_s,
                } => Arc::new(PerfEvaluator::new(
                    command.clone(),
                    *budget_ms,
                    Duration::from_secs(*timeout_s),
                )),
            }
        })
        .collect()
}
