//! Evolutionary program-optimization engine.
//!
//! A registered *task* names a target source file with marked mutable
//! regions, an optimization goal, and a multi-metric evaluator cascade.
//! Over successive generations the engine asks an LLM oracle for
//! candidate patches, applies them with scope rules, evaluates them
//! through a staged cascade, and maintains a bounded archive biased
//! toward the Pareto frontier with novelty preservation.
//!
//! # Architecture
//!
//! ```text
//! engine (generation driver)
//!   ├── meta_prompt  - rank/mutate system-prompt templates
//!   ├── sampler      - token-budgeted prompts from archive exemplars
//!   ├── llm          - oracle trait + OpenAI-compatible client
//!   ├── patch/blocks - decode patches, rewrite EVOLVE blocks
//!   ├── cascade      - bounded-parallel staged evaluation
//!   ├── archive      - Pareto rank, Jaccard novelty, age, truncation
//!   └── store        - SQLite persistence for all of the above
//! ```
//!
//! The `controller` module is a lighter single-block loop for tasks
//! with an in-process evaluation function; `cli` is the collaborator
//! front end.

pub mod archive;
pub mod blocks;
pub mod cascade;
pub mod cli;
pub mod config;
pub mod controller;
pub mod diffs;
pub mod engine;
pub mod error;
pub mod llm;
pub mod meta_prompt;
pub mod patch;
pub mod prompts;
pub mod sampler;
pub mod store;

// Re-export key types
pub use archive::{Archive, ArchiveEntry};
pub use blocks::{EvolveBlock, extract_blocks, replace_block};
pub use cascade::{Evaluator, StageResult, run_cascade};
pub use config::{MetricSpec, RunConfig};
pub use controller::{EvolutionController, EvolutionTask};
pub use diffs::{DiffHunk, parse_diff};
pub use engine::evolve;
pub use error::{ControllerError, EngineError, LlmError, PatchError, StoreError};
pub use llm::{GenerationRequest, GenerationResult, LlmOracle, OpenAiOracle};
pub use patch::{EditScope, Patch, apply_patch};
pub use store::{CandidateRecord, ProgramStore};
