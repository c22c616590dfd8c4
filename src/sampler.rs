//! Token-budgeted prompt assembly from archive exemplars.
//!
//! A prompt is a header, the meta-prompt template, then elite, novel,
//! and failure exemplar summaries, closed by the pinned response
//! format. Sections are emitted in that order under an approximate
//! one-token-per-word budget; the first section that would overflow
//! the budget stops assembly.

use std::collections::VecDeque;
use std::fmt::Write;

use tracing::debug;

use crate::archive::Archive;
use crate::config::{MetricSpec, SamplerConfig};
use crate::error::StoreError;
use crate::store::{CandidateRecord, FailureRecord, ProgramStore};

/// Snapshot lines included per candidate summary.
const SNAPSHOT_LINES: usize = 12;
/// Transient archive capacity used for novel-exemplar sampling.
const NOVELTY_ARCHIVE_CAPACITY: usize = 256;
/// Top-k distances for the transient novelty archive.
const NOVELTY_ARCHIVE_K: usize = 10;

/// Inputs for one prompt assembly.
#[derive(Debug)]
pub struct PromptParams<'a> {
    /// Run being evolved.
    pub run_id: &'a str,
    /// Natural-language optimization goal.
    pub task_desc: &'a str,
    /// Target file path, as shown to the model.
    pub target_file: &'a str,
    /// Mutable region line ranges; empty means the entire file.
    pub evolve_blocks: &'a [(usize, usize)],
    /// Optimized metrics in declared order.
    pub metrics: &'a [MetricSpec],
    /// Sampler knobs.
    pub sampler: &'a SamplerConfig,
    /// Selected meta-prompt template.
    pub meta_prompt_template: &'a str,
}

/// Approximates token count as whitespace-separated words.
fn approx_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

fn format_candidate_summary(
    cand: &CandidateRecord,
    metrics: Option<&std::collections::HashMap<String, f64>>,
) -> String {
    let metrics_str = metrics.map_or_else(String::new, |table| {
        let mut pairs: Vec<(&String, &f64)> = table.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
            .iter()
            .map(|(name, value)| format!("{name}={value:.3}"))
            .collect::<Vec<_>>()
            .join(", ")
    });
    let metrics_str = if metrics_str.is_empty() {
        "no metrics".to_string()
    } else {
        metrics_str
    };

    let snippet = cand
        .code_snapshot
        .lines()
        .take(SNAPSHOT_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    let patch = cand.patch.trim();

    format!(
        "Candidate {} (gen {}, novelty={:.3}):\nMetrics: {}\nDiff:\n{}\nSnapshot:\n{}",
        cand.cand_id,
        cand.generation,
        cand.novelty,
        metrics_str,
        if patch.is_empty() { "<empty>" } else { patch },
        snippet,
    )
}

fn format_failure_summary(failure: &FailureRecord) -> String {
    let patch = failure.patch.trim();
    format!(
        "Failed Candidate {}:\nPatch:\n{}\nError: {}",
        failure.cand_id,
        if patch.is_empty() { "<empty>" } else { patch },
        failure.error.as_deref().unwrap_or("unknown"),
    )
}

/// The closing instruction block pinning the response format.
fn response_format_block() -> String {
    let mut block = String::new();
    let _ = writeln!(
        block,
        "Respond with one or more SEARCH/REPLACE hunks using exactly this template:"
    );
    let _ = writeln!(block, "<<<<<<< SEARCH");
    let _ = writeln!(block, "old_code");
    let _ = writeln!(block, "=======");
    let _ = writeln!(block, "new_code");
    let _ = writeln!(block, ">>>>>>> REPLACE");
    let _ = writeln!(
        block,
        "For block-scoped edits you may instead reply with a JSON list of \
         {{\"block_id\", \"search\", \"replace\"}} operations."
    );
    let _ = write!(block, "Respond with only the diff instructions.");
    block
}

/// Builds one token-budgeted prompt for a population slot.
///
/// # Errors
///
/// Returns [`StoreError`] when exemplar queries fail.
pub fn build_run_prompt(
    store: &ProgramStore,
    params: &PromptParams<'_>,
) -> Result<String, StoreError> {
    let all_candidates = store.get_candidates_by_run(params.run_id, None)?;
    let all_ids: Vec<String> = all_candidates.iter().map(|c| c.cand_id.clone()).collect();
    let evals = store.get_candidate_evals(&all_ids)?;

    // Elite layer scores with every metric maximized.
    let maximize_all: Vec<MetricSpec> = params
        .metrics
        .iter()
        .map(|m| MetricSpec::maximize(&m.name))
        .collect();
    let elites = store.top_candidates(params.run_id, params.sampler.elites_k, &maximize_all)?;

    // Novel exemplars come from a transient archive sampled novelty-first.
    let mut novelty_archive = Archive::new(
        NOVELTY_ARCHIVE_CAPACITY,
        maximize_all.clone(),
        NOVELTY_ARCHIVE_K,
    );
    novelty_archive.update(&all_candidates, &evals, None);
    let novel_ids = novelty_archive.sample_mixture(0, params.sampler.novel_m, 0);
    let novel: Vec<&CandidateRecord> = novel_ids
        .iter()
        .filter_map(|cand_id| all_candidates.iter().find(|c| &c.cand_id == cand_id))
        .collect();

    let failures = if params.sampler.include_failures > 0 {
        store.recent_failures(params.run_id, params.sampler.include_failures)?
    } else {
        Vec::new()
    };

    let metric_names = params
        .metrics
        .iter()
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let blocks_str = if params.evolve_blocks.is_empty() {
        "entire file".to_string()
    } else {
        format!("{:?}", params.evolve_blocks)
    };

    let mut sections: VecDeque<String> = VecDeque::new();
    sections.push_back(format!(
        "You are improving the program `{}` for run `{}`.\n\
         Follow the meta-instruction template below when producing changes.\n\
         Task description: {}\n\
         Metrics optimised: {}\n\
         Target EVOLVE blocks: {}",
        params.target_file,
        params.run_id,
        params.task_desc,
        if metric_names.is_empty() { "n/a" } else { metric_names.as_str() },
        blocks_str,
    ));
    sections.push_back(params.meta_prompt_template.trim().to_string());

    for cand in &elites {
        sections.push_back(format_candidate_summary(cand, evals.get(&cand.cand_id)));
    }
    for cand in novel {
        sections.push_back(format!(
            "[Novel exemplar]\n{}",
            format_candidate_summary(cand, evals.get(&cand.cand_id))
        ));
    }
    for failure in &failures {
        sections.push_back(format_failure_summary(failure));
    }
    sections.push_back(response_format_block());

    let mut tokens = 0usize;
    let mut kept: Vec<String> = Vec::new();
    while let Some(section) = sections.pop_front() {
        tokens += approx_tokens(&section);
        if tokens > params.sampler.budget_tokens {
            debug!(
                kept = kept.len(),
                dropped = sections.len() + 1,
                budget = params.sampler.budget_tokens,
                "prompt budget reached"
            );
            break;
        }
        kept.push(section);
    }

    Ok(kept.join("\n\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::cascade::StageResult;
    use crate::store::CandidateRecord;

    fn seeded_store() -> ProgramStore {
        let store = ProgramStore::open_in_memory().unwrap();
        store.upsert_run("run", &serde_json::json!({})).unwrap();
        for idx in 0..3u32 {
            let cand_id = format!("c{idx}");
            store
                .insert_candidate(&CandidateRecord {
                    cand_id: cand_id.clone(),
                    run_id: "run".to_string(),
                    parent_ids: Vec::new(),
                    meta_prompt_id: Some("m1".to_string()),
                    filepath: "demo.py".to_string(),
                    patch: format!("patch {idx}"),
                    code_snapshot: "def demo():\n    return 1\n".to_string(),
                    generation: idx,
                    novelty: 0.0,
                    age: 0,
                    error: None,
                })
                .unwrap();
            store
                .insert_evaluations(
                    &cand_id,
                    &HashMap::from([(
                        "accuracy".to_string(),
                        StageResult {
                            value: 0.8 + f64::from(idx) * 0.05,
                            passed: true,
                            cost_ms: 10,
                            error: None,
                        },
                    )]),
                )
                .unwrap();
        }
        store
    }

    fn params<'a>(sampler: &'a SamplerConfig, metrics: &'a [MetricSpec]) -> PromptParams<'a> {
        PromptParams {
            run_id: "run",
            task_desc: "demo task",
            target_file: "demo.py",
            evolve_blocks: &[(0, 1)],
            metrics,
            sampler,
            meta_prompt_template: "Follow instructions strictly.",
        }
    }

    #[test]
    fn test_budget_is_respected() {
        let store = seeded_store();
        let sampler = SamplerConfig {
            budget_tokens: 50,
            elites_k: 2,
            novel_m: 1,
            include_failures: 0,
        };
        let metrics = vec![MetricSpec::maximize("accuracy")];
        let prompt = build_run_prompt(&store, &params(&sampler, &metrics)).unwrap();
        assert!(prompt.contains("demo task"));
        assert!(prompt.split_whitespace().count() <= 60);
    }

    #[test]
    fn test_generous_budget_includes_all_sections() {
        let store = seeded_store();
        // One failing candidate so the failure section has content.
        store
            .insert_evaluations(
                "c0",
                &HashMap::from([(
                    "tests".to_string(),
                    StageResult {
                        value: 0.0,
                        passed: false,
                        cost_ms: 5,
                        error: Some("assertion failed".to_string()),
                    },
                )]),
            )
            .unwrap();
        let sampler = SamplerConfig {
            budget_tokens: 10_000,
            elites_k: 2,
            novel_m: 2,
            include_failures: 1,
        };
        let metrics = vec![MetricSpec::maximize("accuracy")];
        let prompt = build_run_prompt(&store, &params(&sampler, &metrics)).unwrap();

        assert!(prompt.contains("Follow the meta-instruction template"));
        assert!(prompt.contains("Follow instructions strictly."));
        assert!(prompt.contains("[Novel exemplar]"));
        assert!(prompt.contains("Failed Candidate c0"));
        assert!(prompt.contains("assertion failed"));
        // The closing block pins the response format.
        assert!(prompt.contains("<<<<<<< SEARCH"));
        assert!(prompt.contains(">>>>>>> REPLACE"));
    }

    #[test]
    fn test_empty_run_still_produces_header_and_format() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.upsert_run("run", &serde_json::json!({})).unwrap();
        let sampler = SamplerConfig::default();
        let metrics = Vec::new();
        let mut p = params(&sampler, &metrics);
        p.evolve_blocks = &[];
        let prompt = build_run_prompt(&store, &p).unwrap();
        assert!(prompt.contains("entire file"));
        assert!(prompt.contains("n/a"));
        assert!(prompt.contains("<<<<<<< SEARCH"));
    }

    #[test]
    fn test_summary_truncates_snapshot() {
        let long_snapshot = (0..40)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let cand = CandidateRecord {
            cand_id: "c".to_string(),
            run_id: "run".to_string(),
            parent_ids: Vec::new(),
            meta_prompt_id: None,
            filepath: "demo.py".to_string(),
            patch: String::new(),
            code_snapshot: long_snapshot,
            generation: 0,
            novelty: 0.5,
            age: 0,
            error: None,
        };
        let summary = format_candidate_summary(&cand, None);
        assert!(summary.contains("line 11"));
        assert!(!summary.contains("line 12"));
        assert!(summary.contains("<empty>"));
        assert!(summary.contains("no metrics"));
    }
}
