//! Staged evaluator cascade with bounded parallelism.
//!
//! Stages run on the blocking pool, gated by a semaphore sized to
//! `max_parallel` and dispatched in ascending timeout order so cheap
//! checks surface early. Each stage runs under its own timeout; with
//! `cancel_on_fail` the first failing stage cancels its siblings at
//! their next cooperative point and their results are omitted.

pub mod evaluators;

pub use evaluators::{LintsEvaluator, PerfEvaluator, TestsEvaluator, build_evaluators};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::CandidateRecord;

/// Outcome of a single cascade stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Metric value reported by the stage.
    pub value: f64,
    /// Whether the stage passed.
    pub passed: bool,
    /// Wall cost in milliseconds.
    pub cost_ms: u64,
    /// Failure description, when the stage did not pass cleanly.
    pub error: Option<String>,
}

impl StageResult {
    /// A zero-cost failed result carrying an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            passed: false,
            cost_ms: 0,
            error: Some(error.into()),
        }
    }
}

/// A single evaluation stage.
///
/// `evaluate` is a pure synchronous function hosted on the blocking
/// pool; it must not assume it runs on the orchestrator thread.
pub trait Evaluator: Send + Sync {
    /// Stage name; doubles as the metric name in evaluation records.
    fn name(&self) -> &str;

    /// Per-stage timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Executes the stage for `candidate` within `workdir`.
    fn evaluate(&self, workdir: &Path, candidate: &CandidateRecord) -> StageResult;
}

/// Runs all evaluators against one candidate.
///
/// Returns one entry per completed stage. When `cancel_on_fail` is
/// false the map always contains every evaluator; otherwise stages
/// still running at the first failure are omitted. A stage that panics
/// is converted to a failed result and never terminates the cascade.
pub async fn run_cascade(
    workdir: &Path,
    candidate: &CandidateRecord,
    evaluators: &[Arc<dyn Evaluator>],
    max_parallel: usize,
    cancel_on_fail: bool,
) -> HashMap<String, StageResult> {
    if evaluators.is_empty() {
        return HashMap::new();
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let token = CancellationToken::new();
    let workdir: Arc<PathBuf> = Arc::new(workdir.to_path_buf());
    let candidate = Arc::new(candidate.clone());

    // Cheap checks first: dispatch in ascending timeout order.
    let mut sorted: Vec<Arc<dyn Evaluator>> = evaluators.to_vec();
    sorted.sort_by_key(|ev| ev.timeout());

    let mut tasks: JoinSet<Option<(String, StageResult)>> = JoinSet::new();
    for evaluator in sorted {
        let semaphore = Arc::clone(&semaphore);
        let token = token.child_token();
        let workdir = Arc::clone(&workdir);
        let candidate = Arc::clone(&candidate);

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            if token.is_cancelled() {
                return None;
            }

            let name = evaluator.name().to_string();
            let timeout = evaluator.timeout();
            let work =
                tokio::task::spawn_blocking(move || evaluator.evaluate(&workdir, &candidate));

            tokio::select! {
                () = token.cancelled() => {
                    debug!(stage = %name, "stage cancelled");
                    None
                }
                outcome = tokio::time::timeout(timeout, work) => {
                    let result = match outcome {
                        // Timeout: record the budgeted cost and let the
                        // blocking worker wind down on its own.
                        Err(_) => StageResult {
                            value: 0.0,
                            passed: false,
                            cost_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            error: Some("timeout".to_string()),
                        },
                        // Stage panicked; isolate it as a failed result.
                        Ok(Err(join_err)) => StageResult::failed(join_err.to_string()),
                        Ok(Ok(result)) => result,
                    };
                    Some((name, result))
                }
            }
        });
    }

    let mut results = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some((name, result))) => {
                let failed = !result.passed;
                results.insert(name, result);
                if cancel_on_fail && failed {
                    token.cancel();
                    break;
                }
            }
            Ok(None) => {}
            Err(join_err) => {
                warn!(error = %join_err, "cascade task join failed");
            }
        }
    }
    // Dropping the set aborts still-pending tasks; their blocking
    // workers terminate best-effort.
    results
}
