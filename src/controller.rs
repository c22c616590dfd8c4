//! Single-block controller: mutate one region, keep the best program.
//!
//! A lighter loop than the generation driver for tasks with a single
//! mutable region and an in-process evaluation function. Each round
//! requests a batch of SEARCH/REPLACE candidates, applies them to the
//! block, and either accepts the first viable one (`stop_on_first`) or
//! tracks the best by score across rounds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::blocks::{extract_blocks, replace_block};
use crate::diffs::{apply_hunks, parse_diff};
use crate::error::ControllerError;
use crate::llm::{GenerationRequest, LlmOracle};
use crate::prompts::{build_block_prompt, validate_model_response};

/// Default system prompt for mutation requests.
const DEFAULT_SYSTEM_PROMPT: &str = "You mutate code blocks";

/// Evaluation callback: program source to metric map.
pub type EvaluationFn = dyn Fn(&str) -> Result<HashMap<String, f64>, String> + Send + Sync;
/// Scoring callback: metric map to scalar score.
pub type ScoringFn = dyn Fn(&HashMap<String, f64>) -> f64 + Send + Sync;

/// A registered single-block optimization task.
pub struct EvolutionTask {
    /// Task name, for logging.
    pub name: String,
    /// Optimization goal shown to the model.
    pub description: String,
    /// Program file containing exactly the region to mutate.
    pub program_path: PathBuf,
    /// Trusted task evaluation function.
    pub evaluation: Box<EvaluationFn>,
    /// Optional scalarizer; without it the first viable candidate of
    /// each round is preferred in arrival order.
    pub scoring: Option<Box<ScoringFn>>,
}

impl std::fmt::Debug for EvolutionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionTask")
            .field("name", &self.name)
            .field("program_path", &self.program_path)
            .field("scoring", &self.scoring.is_some())
            .finish_non_exhaustive()
    }
}

/// Orchestrates mutation rounds for one [`EvolutionTask`].
pub struct EvolutionController {
    oracle: Arc<dyn LlmOracle>,
    model: Option<String>,
    temperature: f32,
    candidates: u32,
    max_rounds: u32,
    system_prompt: String,
    fail_on_no_candidate: bool,
    stop_on_first: bool,
}

impl std::fmt::Debug for EvolutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionController")
            .field("oracle", &self.oracle.name())
            .field("candidates", &self.candidates)
            .field("max_rounds", &self.max_rounds)
            .field("stop_on_first", &self.stop_on_first)
            .finish_non_exhaustive()
    }
}

impl EvolutionController {
    /// Creates a controller with default settings around the oracle.
    #[must_use]
    pub fn new(oracle: Arc<dyn LlmOracle>) -> Self {
        Self {
            oracle,
            model: None,
            temperature: 0.7,
            candidates: 1,
            max_rounds: 1,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fail_on_no_candidate: false,
            stop_on_first: true,
        }
    }

    /// Sets the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets candidates requested per round (minimum 1).
    #[must_use]
    pub fn with_candidates(mut self, candidates: u32) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    /// Sets the number of mutation rounds (minimum 1).
    #[must_use]
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Errors instead of restoring the baseline when nothing improves.
    #[must_use]
    pub fn with_fail_on_no_candidate(mut self, fail: bool) -> Self {
        self.fail_on_no_candidate = fail;
        self
    }

    /// Accepts the first viable candidate instead of scoring rounds.
    #[must_use]
    pub fn with_stop_on_first(mut self, stop: bool) -> Self {
        self.stop_on_first = stop;
        self
    }

    /// Runs the mutation loop once and returns the winning metrics.
    ///
    /// The program file ends up holding the best program found, or the
    /// original source when no candidate improved on the baseline.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the program has no blocks, the
    /// baseline evaluation fails, or `fail_on_no_candidate` is set and
    /// nothing improved. Per-candidate failures are logged and skipped.
    pub async fn evolve_once(
        &self,
        task: &EvolutionTask,
    ) -> Result<HashMap<String, f64>, ControllerError> {
        let source = std::fs::read_to_string(&task.program_path)?;
        let blocks = extract_blocks(&source);
        let Some(block) = blocks.into_iter().next() else {
            return Err(ControllerError::NoBlocks);
        };

        let baseline_metrics =
            (task.evaluation)(&source).map_err(ControllerError::BaselineEvaluation)?;
        let baseline_score = task
            .scoring
            .as_ref()
            .map_or(0.0, |scoring| scoring(&baseline_metrics));

        let mut best_score = baseline_score;
        let mut best_metrics = baseline_metrics.clone();
        let mut best_program = source.clone();
        let mut score_counter = baseline_score;

        let mut current_source = source.clone();
        let mut current_block = block;

        info!(
            task = %task.name,
            rounds = self.max_rounds,
            candidates = self.candidates,
            stop_on_first = self.stop_on_first,
            "starting evolution"
        );

        for round in 0..self.max_rounds {
            let prompt = build_block_prompt(&task.description, &current_block.content, None, &[]);
            let mut request = GenerationRequest::new(prompt, self.system_prompt.clone());
            request.model = self.model.clone();
            request.n = self.candidates;
            request.temperature = self.temperature;

            let result = match self.oracle.generate(&request).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(round, error = %err, "language model request failed; skipping round");
                    continue;
                }
            };
            debug!(round, candidates = result.candidates.len(), "received candidates");

            let prompt_source = current_source.clone();
            let prompt_block = current_block.clone();

            for (candidate_index, diff_text) in result.candidates.iter().enumerate() {
                let new_block_content = match validate_model_response(diff_text)
                    .and_then(|()| parse_diff(diff_text))
                    .and_then(|hunks| apply_hunks(&prompt_block.content, &hunks))
                {
                    Ok(content) => content,
                    Err(err) => {
                        warn!(round, candidate_index, error = %err, "candidate discarded: invalid diff");
                        continue;
                    }
                };

                let updated_program =
                    replace_block(&prompt_source, &prompt_block, &new_block_content);
                let metrics = match (task.evaluation)(&updated_program) {
                    Ok(metrics) => metrics,
                    Err(err) => {
                        warn!(round, candidate_index, error = %err, "candidate failed during evaluation");
                        continue;
                    }
                };
                if metrics.is_empty() {
                    warn!(round, candidate_index, "candidate produced no metrics");
                    continue;
                }

                if self.stop_on_first {
                    info!(round, candidate_index, "accepting first viable candidate");
                    std::fs::write(&task.program_path, &updated_program)?;
                    return Ok(metrics);
                }

                let candidate_score = if let Some(scoring) = &task.scoring {
                    scoring(&metrics)
                } else {
                    score_counter += 1.0;
                    score_counter
                };
                debug!(round, candidate_index, candidate_score, best_score, "candidate scored");

                if candidate_score > best_score {
                    best_score = candidate_score;
                    best_metrics = metrics;
                    best_program = updated_program;
                    info!(round, candidate_score, "new best candidate selected");
                }
            }

            current_source = best_program.clone();
            let blocks = extract_blocks(&current_source);
            let Some(next_block) = blocks.into_iter().next() else {
                return Err(ControllerError::NoBlocks);
            };
            current_block = next_block;
        }

        if (best_score - baseline_score).abs() < f64::EPSILON {
            if self.fail_on_no_candidate {
                return Err(ControllerError::NoImprovement);
            }
            info!("evolution finished without improving on the baseline");
            std::fs::write(&task.program_path, &source)?;
            return Ok(baseline_metrics);
        }

        info!("evolution completed with improved program");
        std::fs::write(&task.program_path, &best_program)?;
        Ok(best_metrics)
    }
}
