//! Error types for the evolution engine.
//!
//! Each domain carries its own `thiserror` enum so callers can match on
//! the failure class; `anyhow` is reserved for the binary boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while parsing or applying SEARCH/REPLACE hunks.
#[derive(Debug, Error)]
pub enum DiffError {
    /// The diff text was empty after fence stripping.
    #[error("empty diff text")]
    Empty,

    /// The diff text did not contain any SEARCH/REPLACE hunks.
    #[error("diff text does not match SEARCH/REPLACE format")]
    Malformed,

    /// A hunk's search segment was absent from the source.
    #[error("search segment not found in source")]
    SearchNotFound,
}

/// Errors raised while decoding or applying a candidate patch.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The target file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A structured payload was valid JSON but not a list of operations.
    #[error("structured diff must be a list of operations")]
    NotAnOperationList,

    /// An operation named a block that does not exist in the file.
    #[error("block {0} not found in file")]
    BlockNotFound(String),

    /// A block-scoped operation's search text did not match.
    #[error("search text not found in block {0}")]
    SearchNotFoundInBlock(String),

    /// A whole-file operation's search text did not match.
    #[error("search text not present in file")]
    SearchNotFoundInFile,

    /// An operation without a block name was submitted in block scope.
    #[error("whole-file edit attempted in block scope")]
    WholeFileEditInBlockScope,

    /// A unified-diff hunk header could not be parsed.
    #[error("malformed hunk header: {0}")]
    MalformedHunk(String),

    /// A SEARCH/REPLACE hunk matched no mutable region in block scope.
    #[error(transparent)]
    Diff(#[from] DiffError),
}

/// Errors raised by the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite-level failure.
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("failed to prepare database path: {0}")]
    Io(#[from] std::io::Error),

    /// Run configuration could not be (de)serialized.
    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),

    /// The store mutex was poisoned by a panicking writer.
    #[error("store mutex poisoned")]
    Poisoned,
}

/// Errors raised while loading run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML payload was invalid.
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// The stored JSON payload was invalid.
    #[error("invalid stored configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by LLM oracle implementations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key was available from configuration or environment.
    #[error("no API key configured (set OPENAI_API_KEY)")]
    ApiKeyMissing,

    /// The request failed after exhausting retries.
    #[error("LLM request failed: {message}")]
    Request {
        /// Description of the terminal failure.
        message: String,
    },

    /// The provider answered but produced no usable candidates.
    #[error("no valid diff candidates returned by model")]
    NoCandidates,

    /// The provider response did not have the expected shape.
    #[error("invalid LLM response: {message}")]
    InvalidResponse {
        /// What was wrong with the response.
        message: String,
    },
}

/// Errors that abort an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run configuration was unusable before the first generation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistence store failed; partial state may remain.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Artifact directory or event log I/O failed.
    #[error("run artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the single-block controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The target program contains no mutable regions.
    #[error("no EVOLVE blocks found in program")]
    NoBlocks,

    /// No candidate improved on the baseline and the caller required one.
    #[error("no candidate diff produced an improved program")]
    NoImprovement,

    /// The task evaluation function failed on the baseline program.
    #[error("baseline evaluation failed: {0}")]
    BaselineEvaluation(String),

    /// The target program could not be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The LLM oracle failed terminally.
    #[error(transparent)]
    Llm(#[from] LlmError),
}
