//! Generation driver: orchestrates one evolution run.
//!
//! A single orchestrator task drives generation-at-a-time. LLM calls
//! are blocking callables hosted on the runtime's blocking pool so the
//! orchestrator never waits on network I/O directly; the store
//! serializes writes behind its own mutex; the target file is mutated
//! serially and restored to the generation baseline after every slot.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::Archive;
use crate::cascade::{build_evaluators, run_cascade};
use crate::config::RunConfig;
use crate::error::EngineError;
use crate::llm::LlmCallFn;
use crate::meta_prompt::{evolve_meta_prompts, seed_meta_prompts, select_meta_prompts};
use crate::patch::{EditScope, apply_patch, write_if_changed};
use crate::sampler::{PromptParams, build_run_prompt};
use crate::store::{CandidateRecord, ProgramStore};

/// One generation summary appended to `logs.jsonl`.
#[derive(Debug, Serialize)]
struct GenerationEvent<'a> {
    generation: u32,
    candidates: Vec<&'a Vec<String>>,
    parents: &'a [String],
    archive_size: usize,
    timestamp: f64,
}

/// Runs the evolutionary search loop for `run_id`.
///
/// `llm_call` maps an assembled prompt to raw patch text; it is invoked
/// on the blocking pool, and a failing call aborts only its slot.
/// Resumption is automatic: the first generation executed is one past
/// the highest generation already recorded for the run.
///
/// # Errors
///
/// Returns [`EngineError`] for configuration problems detected before
/// the first generation, and for store or artifact I/O failures, which
/// abort the run.
#[allow(clippy::too_many_lines)]
pub async fn evolve(
    run_id: &str,
    cfg: &RunConfig,
    llm_call: Arc<LlmCallFn>,
) -> Result<(), EngineError> {
    let store = ProgramStore::open(&cfg.db_path)?;
    store.upsert_run(run_id, cfg)?;
    seed_meta_prompts(&store)?;

    let mut rng = StdRng::seed_from_u64(cfg.seed.unwrap_or_else(rand::random));

    if cfg.task.target_file.is_empty() {
        return Err(EngineError::Config(
            "task.target_file must be specified".to_string(),
        ));
    }
    let workdir = cfg.workdir.clone();
    let target_path: PathBuf = workdir.join(&cfg.task.target_file);
    if !target_path.is_file() {
        return Err(EngineError::Config(format!(
            "target file not found: {}",
            target_path.display()
        )));
    }

    let scope = cfg.evolution.scope;
    let mut archive = Archive::new(
        cfg.archive.capacity,
        cfg.metrics.clone(),
        cfg.archive.k_novelty,
    );

    let run_dir = cfg.artifacts_root.join(run_id);
    std::fs::create_dir_all(&run_dir)?;
    let mut event_log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("logs.jsonl"))?;

    let block_ranges: Vec<(usize, usize)> = match &cfg.task.evolve_blocks {
        Some(ranges) => ranges.clone(),
        None => {
            let source = std::fs::read_to_string(&target_path)?;
            crate::blocks::extract_blocks(&source)
                .iter()
                .map(|b| (b.start_line, b.end_line))
                .collect()
        }
    };

    let start_generation = store.max_generation(run_id)?.map_or(0, |g| g + 1);
    if start_generation > 0 {
        // Resume: rebuild the archive's working set from persistence so
        // the first resumed generation has parents to sample.
        let all_cands = store.get_candidates_by_run(run_id, None)?;
        let ids: Vec<String> = all_cands.iter().map(|c| c.cand_id.clone()).collect();
        let evals = store.get_candidate_evals(&ids)?;
        archive.update(&all_cands, &evals, Some(start_generation.saturating_sub(1)));
        info!(
            start_generation,
            archive_size = archive.len(),
            "resuming run"
        );
    }

    let evaluators = build_evaluators(&cfg.cascade.evaluators);

    for generation in start_generation..cfg.generations {
        let gen_dir = run_dir.join(format!("gen_{generation:03}"));
        std::fs::create_dir_all(&gen_dir)?;

        let mut meta_prompts = select_meta_prompts(
            &store,
            cfg.meta_prompt.selection_top_k.max(1),
            &mut rng,
        )?;
        meta_prompts.shuffle(&mut rng);
        let mut contributions: HashMap<String, Vec<String>> = HashMap::new();

        let parents = archive.sample_mixture(
            cfg.selection.elite,
            cfg.selection.novel,
            cfg.selection.young,
        );

        for slot in 0..cfg.population_size {
            let meta = &meta_prompts[slot % meta_prompts.len()];
            let prompt = build_run_prompt(
                &store,
                &PromptParams {
                    run_id,
                    task_desc: &cfg.task.description,
                    target_file: &cfg.task.target_file,
                    evolve_blocks: &block_ranges,
                    metrics: &cfg.metrics,
                    sampler: &cfg.sampler,
                    meta_prompt_template: &meta.template,
                },
            )?;
            std::fs::write(gen_dir.join(format!("candidate_{slot:02}_prompt.txt")), &prompt)?;

            if cfg.dry_run {
                continue;
            }

            // The blocking LLM call is hosted off the orchestrator; a
            // failure abandons only this slot.
            let patch_text = {
                let llm_call = Arc::clone(&llm_call);
                match tokio::task::spawn_blocking(move || llm_call(&prompt)).await {
                    Ok(Ok(text)) => text,
                    Ok(Err(err)) => {
                        warn!(generation, slot, error = %err, "LLM call failed; skipping slot");
                        continue;
                    }
                    Err(join_err) => {
                        warn!(generation, slot, error = %join_err, "LLM worker failed; skipping slot");
                        continue;
                    }
                }
            };

            let cand_id = Uuid::new_v4().to_string();
            let before_source = std::fs::read_to_string(&target_path)?;
            let mut candidate = CandidateRecord {
                cand_id: cand_id.clone(),
                run_id: run_id.to_string(),
                parent_ids: parents.clone(),
                meta_prompt_id: Some(meta.meta_prompt_id.clone()),
                filepath: cfg.task.target_file.clone(),
                patch: patch_text.clone(),
                code_snapshot: before_source.clone(),
                generation,
                novelty: 0.0,
                age: 0,
                error: None,
            };

            let new_source = match apply_patch(&target_path, &patch_text, scope) {
                Ok(new_source) => new_source,
                Err(err) => {
                    debug!(generation, slot, error = %err, "patch failed to apply");
                    candidate.error = Some(err.to_string());
                    store.insert_candidate(&candidate)?;
                    continue;
                }
            };

            write_if_changed(&target_path, &new_source)?;
            candidate.code_snapshot = new_source;
            store.insert_candidate(&candidate)?;
            contributions
                .entry(meta.meta_prompt_id.clone())
                .or_default()
                .push(cand_id.clone());

            if !evaluators.is_empty() {
                let results = run_cascade(
                    &workdir,
                    &candidate,
                    &evaluators,
                    cfg.cascade.max_parallel,
                    cfg.cascade.cancel_on_fail,
                )
                .await;
                store.insert_evaluations(&cand_id, &results)?;

                if scope == EditScope::WholeFile
                    && cfg.evolution.apply_safe_revert
                    && results.values().any(|r| !r.passed)
                {
                    write_if_changed(&target_path, &before_source)?;
                }
            }

            // Each candidate is evaluated in isolation against the
            // generation baseline.
            write_if_changed(&target_path, &before_source)?;
        }

        let all_cands = store.get_candidates_by_run(run_id, None)?;
        let ids: Vec<String> = all_cands.iter().map(|c| c.cand_id.clone()).collect();
        let evals = store.get_candidate_evals(&ids)?;
        archive.update(&all_cands, &evals, Some(generation));

        for entry in archive.iter() {
            if let Some(mut stored) = store.get_candidate(&entry.cand_id)? {
                stored.novelty = entry.novelty;
                stored.age = entry.age;
                store.insert_candidate(&stored)?;
            }
        }

        evolve_meta_prompts(&store, &contributions)?;

        let event = GenerationEvent {
            generation,
            candidates: contributions.values().collect(),
            parents: &parents,
            archive_size: archive.len(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
        };
        writeln!(
            event_log,
            "{}",
            serde_json::to_string(&event).map_err(crate::error::StoreError::Config)?
        )?;
        info!(
            generation,
            produced = contributions.values().map(Vec::len).sum::<usize>(),
            archive_size = archive.len(),
            "generation complete"
        );
    }

    if cfg.dry_run {
        info!(run_id, "dry run completed");
    }
    Ok(())
}
