//! Command-line front end (collaborator layer).

pub mod commands;
pub mod parser;

pub use parser::{Cli, Commands};

/// Dispatches a parsed CLI invocation.
///
/// # Errors
///
/// Propagates command failures for the binary to report.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let db = cli.db.as_deref();
    match cli.command {
        Commands::InitDb => commands::cmd_init_db(db),
        Commands::Run {
            config,
            run_id,
            dry_run,
        } => commands::cmd_run(db, &cli.workdir, &config, run_id, dry_run).await,
        Commands::Resume { run_id, dry_run } => commands::cmd_resume(db, &run_id, dry_run).await,
        Commands::Inspect { run_id, top } => commands::cmd_inspect(db, &run_id, top),
        Commands::ExportArchive { run_id, out } => {
            commands::cmd_export_archive(db, &run_id, &out)
        }
    }
}
