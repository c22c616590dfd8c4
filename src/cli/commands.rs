//! Command handlers.
//!
//! Thin collaborator layer over the library: resolve configuration and
//! the LLM callable, then drive the engine or the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use uuid::Uuid;

use crate::config::{LlmMode, RunConfig};
use crate::engine::evolve;
use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmCallFn, OpenAiOracle, blocking_call};
use crate::store::ProgramStore;

/// Default database path when neither flag nor config provides one.
const DEFAULT_DB_PATH: &str = ".evoforge/evoforge.db";

/// Default system prompt for engine-driven generation requests.
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an expert software engineer evolving code through structured diffs.";

fn resolve_db(db: Option<&Path>) -> PathBuf {
    db.map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), Path::to_path_buf)
}

/// Resolves the blocking LLM callable from run configuration.
///
/// # Errors
///
/// Fails when the `openai` mode lacks credentials.
pub fn resolve_llm(cfg: &RunConfig) -> anyhow::Result<Arc<LlmCallFn>> {
    match cfg.llm.mode {
        LlmMode::Noop => Ok(Arc::new(|_prompt: &str| Ok(String::new()))),
        LlmMode::Echo => {
            let response = cfg.llm.response.clone().unwrap_or_default();
            Ok(Arc::new(move |_prompt: &str| Ok(response.clone())))
        }
        LlmMode::File => {
            let path = cfg
                .llm
                .path
                .clone()
                .context("llm.path is required for llm.mode = \"file\"")?;
            Ok(Arc::new(move |_prompt: &str| {
                std::fs::read_to_string(&path).map_err(|err| LlmError::Request {
                    message: format!("failed to read response file: {err}"),
                })
            }))
        }
        LlmMode::OpenAi => {
            let api_key = cfg
                .llm
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .context("no API key: set llm.api_key or OPENAI_API_KEY")?;
            let oracle = OpenAiOracle::new(
                &api_key,
                cfg.llm.base_url.as_deref(),
                cfg.llm.model.as_deref(),
            )
            .with_max_retries(cfg.llm.max_retries);

            let mut template = GenerationRequest::new(
                String::new(),
                cfg.llm
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            );
            template.model = cfg.llm.model.clone();
            template.n = cfg.llm.n;
            template.temperature = cfg.llm.temperature;

            Ok(blocking_call(
                Arc::new(oracle),
                tokio::runtime::Handle::current(),
                template,
            ))
        }
    }
}

/// `init-db`: create the database file and schema.
///
/// # Errors
///
/// Fails when the database cannot be created.
pub fn cmd_init_db(db: Option<&Path>) -> anyhow::Result<()> {
    let path = resolve_db(db);
    ProgramStore::open(&path)?;
    println!("Initialised database at {}", path.display());
    Ok(())
}

/// `run`: start a new run from a configuration file.
///
/// # Errors
///
/// Fails on configuration or engine errors.
pub async fn cmd_run(
    db: Option<&Path>,
    workdir: &Path,
    config: &Path,
    run_id: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut cfg = RunConfig::from_toml_file(config)
        .with_context(|| format!("loading {}", config.display()))?;
    if let Some(db) = db {
        cfg.db_path = db.to_path_buf();
    }
    cfg.workdir = workdir.to_path_buf();
    cfg.dry_run = cfg.dry_run || dry_run;

    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let llm_call = resolve_llm(&cfg)?;
    evolve(&run_id, &cfg, llm_call).await?;
    println!("Run {run_id} complete");
    Ok(())
}

/// `resume`: continue a stored run from its recorded configuration.
///
/// # Errors
///
/// Fails when the run is unknown or the engine errors.
pub async fn cmd_resume(db: Option<&Path>, run_id: &str, dry_run: bool) -> anyhow::Result<()> {
    let db_path = resolve_db(db);
    let store = ProgramStore::open(&db_path)?;
    let Some(record) = store.get_run(run_id)? else {
        bail!("run {run_id} not found");
    };
    let mut cfg = RunConfig::from_json(&record.config_json)?;
    cfg.db_path = db_path;
    cfg.dry_run = dry_run;
    drop(store);

    let llm_call = resolve_llm(&cfg)?;
    evolve(run_id, &cfg, llm_call).await?;
    println!("Run {run_id} resumed");
    Ok(())
}

/// `inspect`: print a run's top candidates by novelty.
///
/// # Errors
///
/// Fails on store errors.
pub fn cmd_inspect(db: Option<&Path>, run_id: &str, top: usize) -> anyhow::Result<()> {
    let store = ProgramStore::open(&resolve_db(db))?;
    let mut rows = store.get_candidates_by_run(run_id, None)?;
    let ids: Vec<String> = rows.iter().map(|c| c.cand_id.clone()).collect();
    let metrics = store.get_candidate_evals(&ids)?;

    rows.sort_by(|a, b| b.novelty.total_cmp(&a.novelty));
    for row in rows.iter().take(top) {
        let metrics_str = metrics
            .get(&row.cand_id)
            .map_or_else(|| "{}".to_string(), |m| {
                serde_json::to_string(m).unwrap_or_else(|_| "{}".to_string())
            });
        println!(
            "{} gen={} novelty={:.3} metrics={}",
            row.cand_id, row.generation, row.novelty, metrics_str
        );
    }
    Ok(())
}

/// `export-archive`: dump candidates and metrics as pretty JSON.
///
/// # Errors
///
/// Fails on store or output I/O errors.
pub fn cmd_export_archive(db: Option<&Path>, run_id: &str, out: &Path) -> anyhow::Result<()> {
    let store = ProgramStore::open(&resolve_db(db))?;
    let rows = store.get_candidates_by_run(run_id, None)?;
    let ids: Vec<String> = rows.iter().map(|c| c.cand_id.clone()).collect();
    let metrics = store.get_candidate_evals(&ids)?;

    let payload: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "candidate": row,
                "metrics": metrics.get(&row.cand_id).cloned().unwrap_or_default(),
            })
        })
        .collect();

    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, serde_json::to_string_pretty(&payload)?)?;
    println!("Archive exported to {}", out.display());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    #[test]
    fn test_resolve_llm_noop_and_echo() {
        let mut cfg = RunConfig::default();
        let call = resolve_llm(&cfg).unwrap();
        assert_eq!(call("prompt").unwrap(), "");

        cfg.llm = LlmConfig {
            mode: LlmMode::Echo,
            response: Some("fixed".to_string()),
            ..LlmConfig::default()
        };
        let call = resolve_llm(&cfg).unwrap();
        assert_eq!(call("prompt").unwrap(), "fixed");
    }

    #[test]
    fn test_resolve_llm_file_mode_reads_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("response.txt");
        std::fs::write(&path, "one").unwrap();

        let mut cfg = RunConfig::default();
        cfg.llm.mode = LlmMode::File;
        cfg.llm.path = Some(path.clone());
        let call = resolve_llm(&cfg).unwrap();
        assert_eq!(call("prompt").unwrap(), "one");

        std::fs::write(&path, "two").unwrap();
        assert_eq!(call("prompt").unwrap(), "two");
    }

    #[test]
    fn test_resolve_llm_file_mode_requires_path() {
        let mut cfg = RunConfig::default();
        cfg.llm.mode = LlmMode::File;
        assert!(resolve_llm(&cfg).is_err());
    }

    #[test]
    fn test_export_archive_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db.sqlite");
        {
            let store = ProgramStore::open(&db).unwrap();
            store
                .insert_candidate(&crate::store::CandidateRecord {
                    cand_id: "c1".to_string(),
                    run_id: "run".to_string(),
                    parent_ids: Vec::new(),
                    meta_prompt_id: None,
                    filepath: "demo.py".to_string(),
                    patch: "[]".to_string(),
                    code_snapshot: String::new(),
                    generation: 0,
                    novelty: 0.0,
                    age: 0,
                    error: None,
                })
                .unwrap();
        }
        let out = dir.path().join("export/archive.json");
        cmd_export_archive(Some(&db), "run", &out).unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(payload[0]["candidate"]["cand_id"], "c1");
    }
}
