//! Meta-prompt population: seeding, selection, mutation, evolution.
//!
//! Meta-prompts are system-prompt templates ranked by the downstream
//! fitness of the candidates they produce. The population lives in the
//! store; this module owns the lifecycle policy.

use std::collections::HashMap;
use std::collections::HashSet;

use rand::Rng;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{MetaPromptRecord, ProgramStore};

/// Canonical seed templates installed on first use.
pub const DEFAULT_META_PROMPTS: [&str; 4] = [
    "You are an expert software engineer. Optimise for correctness first, then speed. Provide concise diffs.",
    "Act as a performance specialist. Prefer aggressive refactors and explain reasoning briefly before the diff.",
    "Adopt a test-driven mindset. Outline failing tests you expect to pass after the change, then provide the patch.",
    "Balance exploration and exploitation: propose a bold modification but ensure compatibility with existing tests.",
];

/// Directive lines a mutation may append, keyed by intent.
const MUTATIONS: [(&str, &str); 5] = [
    (
        "increase emphasis on speed",
        "Focus on micro-optimisations and data-structure tuning.",
    ),
    (
        "encourage exploration",
        "Include one unconventional idea or alternative approach.",
    ),
    (
        "stress test-first",
        "List quick checks or tests before writing the patch.",
    ),
    (
        "reduce verbosity",
        "Keep explanations under three sentences.",
    ),
    (
        "prefer small diffs",
        "Limit edits to the most relevant EVOLVE blocks and avoid broad refactors.",
    ),
];

/// Installs the canonical templates if the population is empty.
///
/// Returns the ids of the existing or newly seeded population.
///
/// # Errors
///
/// Returns [`StoreError`] on store failure.
pub fn seed_meta_prompts(store: &ProgramStore) -> Result<Vec<String>, StoreError> {
    let existing = store.list_meta_prompts()?;
    if !existing.is_empty() {
        return Ok(existing.into_iter().map(|m| m.meta_prompt_id).collect());
    }
    let mut ids = Vec::with_capacity(DEFAULT_META_PROMPTS.len());
    for template in DEFAULT_META_PROMPTS {
        ids.push(store.insert_meta_prompt(template, &[])?);
    }
    debug!(count = ids.len(), "seeded meta-prompt population");
    Ok(ids)
}

/// Returns the top `n` meta-prompts by (fitness desc, last-used desc).
///
/// When the population is smaller than `n`, new prompts are backfilled
/// by mutating randomly chosen seed templates.
///
/// # Errors
///
/// Returns [`StoreError`] on store failure.
pub fn select_meta_prompts(
    store: &ProgramStore,
    n: usize,
    rng: &mut impl Rng,
) -> Result<Vec<MetaPromptRecord>, StoreError> {
    let mut prompts = store.get_meta_prompts(n)?;
    while prompts.len() < n {
        let base = DEFAULT_META_PROMPTS[rng.gen_range(0..DEFAULT_META_PROMPTS.len())];
        let mutated = mutate_meta_prompt(base, rng);
        let meta_prompt_id = store.insert_meta_prompt(&mutated, &[])?;
        prompts.push(MetaPromptRecord {
            meta_prompt_id,
            template: mutated,
            parent_ids: Vec::new(),
            fitness: 0.0,
            last_used: None,
        });
    }
    prompts.truncate(n);
    Ok(prompts)
}

/// Appends one randomly chosen directive line to the template.
///
/// The template is returned unchanged when the chosen directive is
/// already present.
#[must_use]
pub fn mutate_meta_prompt(template: &str, rng: &mut impl Rng) -> String {
    let (_, directive) = MUTATIONS[rng.gen_range(0..MUTATIONS.len())];
    let existing: HashSet<&str> = template.lines().map(str::trim).collect();
    if existing.contains(directive.trim()) {
        return template.to_string();
    }
    format!("{}\n{directive}", template.trim_end())
}

/// Recomputes meta-prompt fitness from their descendants' evaluations.
///
/// For each contributing group, the raw score is the mean over
/// candidates of the mean of that candidate's numeric metrics; the
/// logistic of the raw score becomes the new fitness. Metrics of
/// different scales mix here unnormalized; the result is a surrogate,
/// not a calibrated probability.
///
/// # Errors
///
/// Returns [`StoreError`] on store failure.
pub fn evolve_meta_prompts(
    store: &ProgramStore,
    contributions: &HashMap<String, Vec<String>>,
) -> Result<(), StoreError> {
    for (meta_prompt_id, cand_ids) in contributions {
        if cand_ids.is_empty() {
            continue;
        }
        let evals = store.get_candidate_evals(cand_ids)?;
        if evals.is_empty() {
            continue;
        }
        let mut scores: Vec<f64> = Vec::new();
        for cand_id in cand_ids {
            if let Some(metrics) = evals.get(cand_id)
                && !metrics.is_empty()
            {
                #[allow(clippy::cast_precision_loss)]
                scores.push(metrics.values().sum::<f64>() / metrics.len() as f64);
            }
        }
        if scores.is_empty() {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let raw = scores.iter().sum::<f64>() / scores.len() as f64;
        let fitness = 1.0 / (1.0 + (-raw).exp());
        debug!(meta_prompt_id = %meta_prompt_id, fitness, "meta-prompt fitness updated");
        store.update_meta_prompt_fitness(meta_prompt_id, fitness)?;
    }
    Ok(())
}
