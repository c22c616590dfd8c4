//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Evoforge: evolutionary program optimization driven by LLM patches.
///
/// Registers a task (a target file with EVOLVE blocks, a goal, and an
/// evaluator cascade) and evolves it over generations of candidate
/// patches.
#[derive(Parser, Debug)]
#[command(name = "evoforge")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the evoforge database file.
    ///
    /// Defaults to `.evoforge/evoforge.db` in the current directory.
    #[arg(long, env = "EVOFORGE_DB_PATH")]
    pub db: Option<PathBuf>,

    /// Workspace directory containing the target file.
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialise the database schema.
    InitDb,

    /// Start a new run from a configuration file.
    #[command(after_help = r#"Examples:
  evoforge run --config task.toml                 # New run, random id
  evoforge run --config task.toml --run-id demo   # Named run
  evoforge run --config task.toml --dry-run       # Write prompts only
"#)]
    Run {
        /// TOML run configuration.
        #[arg(long)]
        config: PathBuf,

        /// Run identifier; a UUID is generated when omitted.
        #[arg(long)]
        run_id: Option<String>,

        /// Stop each slot after writing its prompt.
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a stored run from its recorded configuration.
    Resume {
        /// Run identifier to resume.
        #[arg(long)]
        run_id: String,

        /// Stop each slot after writing its prompt.
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect a run's top candidates by novelty.
    Inspect {
        /// Run identifier to inspect.
        #[arg(long)]
        run_id: String,

        /// Number of candidates to print.
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Export a run's candidates and metrics as JSON.
    ExportArchive {
        /// Run identifier to export.
        #[arg(long)]
        run_id: String,

        /// Output file path.
        #[arg(long)]
        out: PathBuf,
    },
}
