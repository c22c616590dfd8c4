//! Run configuration with serde defaults and TOML loading.
//!
//! Every field carries a default so partial configuration files work;
//! the stored run configuration round-trips through JSON so `resume`
//! can reconstruct the exact run parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::patch::EditScope;

/// Default database location.
const DEFAULT_DB_PATH: &str = ".evoforge/evoforge.db";
/// Default root for per-run artifact directories.
const DEFAULT_ARTIFACTS_ROOT: &str = "runs";
/// Default candidates per generation.
const DEFAULT_POPULATION_SIZE: usize = 8;
/// Default generation count.
const DEFAULT_GENERATIONS: u32 = 5;
/// Default prompt token budget.
const DEFAULT_BUDGET_TOKENS: usize = 4000;
/// Default cascade parallelism.
const DEFAULT_MAX_PARALLEL: usize = 4;
/// Default archive capacity.
const DEFAULT_ARCHIVE_CAPACITY: usize = 200;
/// Default top-k distances used for novelty.
const DEFAULT_K_NOVELTY: usize = 8;

/// One optimized metric, in archive declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name as reported by evaluators.
    pub name: String,
    /// When `true`, lower values dominate.
    #[serde(default)]
    pub minimize: bool,
}

impl MetricSpec {
    /// A metric where higher values dominate.
    #[must_use]
    pub fn maximize(name: &str) -> Self {
        Self {
            name: name.to_string(),
            minimize: false,
        }
    }

    /// A metric where lower values dominate.
    #[must_use]
    pub fn minimize(name: &str) -> Self {
        Self {
            name: name.to_string(),
            minimize: true,
        }
    }
}

/// The optimization task: target file and goal description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Target source file, relative to the workdir.
    pub target_file: String,
    /// Natural-language description of the optimization goal.
    pub description: String,
    /// Explicit `(start_line, end_line)` region ranges; when absent
    /// they are parsed from the file's markers.
    pub evolve_blocks: Option<Vec<(usize, usize)>>,
}

/// Parent mixture drawn from the archive each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Parents taken from the lowest Pareto ranks.
    pub elite: usize,
    /// Parents taken from the highest novelty.
    pub novel: usize,
    /// Parents taken from the lowest age.
    pub young: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            elite: 4,
            novel: 2,
            young: 2,
        }
    }
}

/// Prompt assembler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Approximate token budget for the assembled prompt.
    pub budget_tokens: usize,
    /// Elite summaries to include.
    pub elites_k: usize,
    /// Novel exemplar summaries to include.
    pub novel_m: usize,
    /// Failure summaries to include.
    pub include_failures: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            budget_tokens: DEFAULT_BUDGET_TOKENS,
            elites_k: 4,
            novel_m: 4,
            include_failures: 2,
        }
    }
}

/// One configured cascade stage.
///
/// The tag is the evaluator name; an unknown name is a configuration
/// error surfaced before the first generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum EvaluatorConfig {
    /// External test runner; passes iff the exit code is zero.
    Tests {
        /// Command and arguments to invoke in the workdir.
        #[serde(default = "default_test_command")]
        command: Vec<String>,
        /// Per-stage timeout in seconds.
        #[serde(default = "default_stage_timeout")]
        timeout_s: u64,
    },
    /// Patch-size check; passes iff added lines stay under the cap.
    Lints {
        /// Maximum `+` lines allowed in the patch.
        #[serde(default = "default_max_lines")]
        max_lines: usize,
        /// Per-stage timeout in seconds.
        #[serde(default = "default_stage_timeout")]
        timeout_s: u64,
    },
    /// Wall-time measurement of an external command.
    Perf {
        /// Command to time; the stage passes vacuously when absent.
        #[serde(default)]
        command: Option<Vec<String>>,
        /// Wall-time budget in milliseconds.
        #[serde(default = "default_perf_budget")]
        budget_ms: u64,
        /// Per-stage timeout in seconds.
        #[serde(default = "default_stage_timeout")]
        timeout_s: u64,
    },
}

fn default_test_command() -> Vec<String> {
    vec!["pytest".to_string(), "-q".to_string()]
}

const fn default_stage_timeout() -> u64 {
    30
}

const fn default_max_lines() -> usize {
    400
}

const fn default_perf_budget() -> u64 {
    100
}

/// Cascade scheduling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Maximum concurrently running stages.
    pub max_parallel: usize,
    /// Cancel remaining stages after the first failure.
    pub cancel_on_fail: bool,
    /// Ordered stage configuration.
    pub evaluators: Vec<EvaluatorConfig>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancel_on_fail: false,
            evaluators: Vec::new(),
        }
    }
}

/// Meta-prompt population parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaPromptConfig {
    /// Target population size when seeding.
    pub population: usize,
    /// Probability of mutating a selected template.
    pub mutation_prob: f64,
    /// Meta-prompts selected per generation.
    pub selection_top_k: usize,
}

impl Default for MetaPromptConfig {
    fn default() -> Self {
        Self {
            population: 4,
            mutation_prob: 0.2,
            selection_top_k: 3,
        }
    }
}

/// Archive sizing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum retained entries.
    pub capacity: usize,
    /// Top-k Jaccard distances averaged into novelty.
    pub k_novelty: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ARCHIVE_CAPACITY,
            k_novelty: DEFAULT_K_NOVELTY,
        }
    }
}

/// Patch scope and revert policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Whether edits are confined to EVOLVE blocks.
    pub scope: EditScope,
    /// In whole-file scope, revert immediately when any stage fails.
    pub apply_safe_revert: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            scope: EditScope::Blocks,
            apply_safe_revert: true,
        }
    }
}

/// How the CLI resolves the LLM callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmMode {
    /// Always return an empty patch (useful with `dry_run`).
    #[default]
    Noop,
    /// Return a fixed response from configuration.
    Echo,
    /// Return the contents of a file.
    File,
    /// Call an OpenAI-compatible chat completion API.
    #[serde(rename = "openai")]
    OpenAi,
}

/// LLM transport configuration (collaborator layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Resolution mode for the LLM callable.
    pub mode: LlmMode,
    /// Fixed response for [`LlmMode::Echo`].
    pub response: Option<String>,
    /// Response file for [`LlmMode::File`].
    pub path: Option<PathBuf>,
    /// API key; falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Base URL override for OpenAI-compatible proxies.
    pub base_url: Option<String>,
    /// Model identifier.
    pub model: Option<String>,
    /// System prompt for generation requests.
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Candidates requested per call.
    pub n: u32,
    /// Maximum retry attempts per request.
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: LlmMode::Noop,
            response: None,
            path: None,
            api_key: None,
            base_url: None,
            model: None,
            system_prompt: None,
            temperature: 0.7,
            n: 1,
            max_retries: 3,
        }
    }
}

/// Complete configuration for one evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Root directory for per-run artifacts.
    pub artifacts_root: PathBuf,
    /// Workspace directory containing the target file.
    pub workdir: PathBuf,
    /// Candidates generated per generation.
    pub population_size: usize,
    /// Number of generations to run.
    pub generations: u32,
    /// Seed for deterministic shuffles; `None` derives from entropy.
    pub seed: Option<u64>,
    /// Stop each slot after writing its prompt.
    pub dry_run: bool,
    /// The optimization task.
    pub task: TaskConfig,
    /// Optimized metrics in archive order.
    pub metrics: Vec<MetricSpec>,
    /// Parent mixture per generation.
    pub selection: SelectionConfig,
    /// Prompt assembler parameters.
    pub sampler: SamplerConfig,
    /// Evaluator cascade parameters.
    pub cascade: CascadeConfig,
    /// Meta-prompt population parameters.
    pub meta_prompt: MetaPromptConfig,
    /// Archive sizing parameters.
    pub archive: ArchiveConfig,
    /// Patch scope and revert policy.
    pub evolution: EvolutionConfig,
    /// LLM transport configuration.
    pub llm: LlmConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            artifacts_root: PathBuf::from(DEFAULT_ARTIFACTS_ROOT),
            workdir: PathBuf::from("."),
            population_size: DEFAULT_POPULATION_SIZE,
            generations: DEFAULT_GENERATIONS,
            seed: None,
            dry_run: false,
            task: TaskConfig::default(),
            metrics: Vec::new(),
            selection: SelectionConfig::default(),
            sampler: SamplerConfig::default(),
            cascade: CascadeConfig::default(),
            meta_prompt: MetaPromptConfig::default(),
            archive: ArchiveConfig::default(),
            evolution: EvolutionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl RunConfig {
    /// Loads configuration from a TOML file, filling absent fields
    /// with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable or invalid.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Reconstructs configuration from its stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the payload does not deserialize.
    pub fn from_json(payload: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(payload)?)
    }
}
