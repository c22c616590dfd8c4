//! Bounded archive with Pareto ranking, novelty, and age tracking.
//!
//! The archive is the in-memory working set the driver samples parents
//! from. It is rebuilt from persistence on resume by replaying
//! candidates and their evaluations through [`Archive::update`]; only
//! the orchestrator mutates it, between generations.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::MetricSpec;
use crate::store::CandidateRecord;

/// In-memory projection of one archived candidate.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Candidate identifier.
    pub cand_id: String,
    /// Recorded metric values.
    pub metrics: HashMap<String, f64>,
    /// Code snapshot used for novelty features.
    pub code_snapshot: String,
    /// Generations since creation.
    pub age: u32,
    /// Mean of the top-k Jaccard distances to other candidates.
    pub novelty: f64,
    /// Pareto rank; 0 is the non-dominated front.
    pub rank: usize,
    /// Insertion sequence, for stable tie-breaking.
    seq: u64,
}

/// Computes Pareto ranks by iterative non-dominated peeling.
///
/// Metric vectors are built in the declared metric order with the sign
/// inverted for minimize metrics; candidates missing any declared
/// metric are left unranked (they default to rank 0 in the archive).
/// Rank 0 is the non-dominated front; each peel increments the rank.
#[must_use]
pub fn pareto_rank(
    cand_ids: &[String],
    evals: &HashMap<String, HashMap<String, f64>>,
    metrics: &[MetricSpec],
) -> HashMap<String, usize> {
    let mut vectors: Vec<(String, Vec<f64>)> = Vec::new();
    for cand_id in cand_ids {
        let Some(measurements) = evals.get(cand_id) else {
            continue;
        };
        let mut vec = Vec::with_capacity(metrics.len());
        let mut valid = true;
        for spec in metrics {
            match measurements.get(&spec.name) {
                Some(value) => vec.push(if spec.minimize { -value } else { *value }),
                None => {
                    valid = false;
                    break;
                }
            }
        }
        if valid {
            vectors.push((cand_id.clone(), vec));
        }
    }

    let mut ranks = HashMap::new();
    let mut remaining = vectors;
    let mut current_rank = 0;
    while !remaining.is_empty() {
        let front: Vec<usize> = (0..remaining.len())
            .filter(|&i| {
                !remaining
                    .iter()
                    .enumerate()
                    .any(|(j, (_, other))| j != i && dominates(other, &remaining[i].1))
            })
            .collect();
        // Every vector in a finite set has a non-dominated element, so
        // the front is never empty and the peel terminates.
        for &i in front.iter().rev() {
            let (cand_id, _) = remaining.swap_remove(i);
            ranks.insert(cand_id, current_rank);
        }
        current_rank += 1;
    }
    ranks
}

/// Coordinate-wise `>=` with at least one strict `>`.
fn dominates(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip(b).all(|(x, y)| x >= y) && a.iter().zip(b).any(|(x, y)| x > y)
}

/// Computes Jaccard novelty per candidate from symbolic feature sets.
///
/// Novelty is the mean of the top-`k` Jaccard distances
/// (`1 - |A∩B| / |A∪B|`) to every other candidate; a sole candidate
/// scores 1. Values are always in `[0, 1]`.
#[must_use]
pub fn jaccard_novelty(
    features_by_cand: &[(String, HashSet<String>)],
    k: usize,
) -> HashMap<String, f64> {
    let mut novelty = HashMap::new();
    for (i, (cand_id, features)) in features_by_cand.iter().enumerate() {
        let mut distances: Vec<f64> = Vec::new();
        for (j, (_, other)) in features_by_cand.iter().enumerate() {
            if i == j {
                continue;
            }
            let union = features.union(other).count();
            if union == 0 {
                distances.push(0.0);
            } else {
                let intersection = features.intersection(other).count();
                #[allow(clippy::cast_precision_loss)]
                distances.push(1.0 - intersection as f64 / union as f64);
            }
        }
        if distances.is_empty() {
            novelty.insert(cand_id.clone(), 1.0);
            continue;
        }
        distances.sort_by(|a, b| b.total_cmp(a));
        let take = distances.len().min(k).max(1);
        #[allow(clippy::cast_precision_loss)]
        let mean = distances[..take].iter().sum::<f64>() / take as f64;
        novelty.insert(cand_id.clone(), mean);
    }
    novelty
}

/// Extracts shallow symbolic features from a code snapshot.
///
/// A deliberately coarse lexical pass: identifier-like leaves plus
/// token-class names (comment, string, number, identifier, and
/// per-character operators). Any feature function would do as long as
/// the Jaccard contract above holds.
#[must_use]
pub fn code_features(code: &str) -> HashSet<String> {
    let mut features = HashSet::new();
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '#' {
            features.insert("comment".to_string());
            while chars.peek().is_some_and(|&n| n != '\n') {
                chars.next();
            }
        } else if c == '"' || c == '\'' {
            features.insert("string".to_string());
            while let Some(&n) = chars.peek() {
                chars.next();
                if n == c || n == '\n' {
                    break;
                }
            }
        } else if c.is_ascii_digit() {
            features.insert("number".to_string());
            while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                chars.next();
            }
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::from(c);
            while chars.peek().is_some_and(|n| n.is_alphanumeric() || *n == '_') {
                if let Some(n) = chars.next() {
                    ident.push(n);
                }
            }
            features.insert("identifier".to_string());
            features.insert(ident);
        } else if !c.is_whitespace() {
            features.insert(format!("op:{c}"));
        }
    }
    features
}

/// Bounded in-memory archive over candidate evaluations.
#[derive(Debug)]
pub struct Archive {
    capacity: usize,
    metrics: Vec<MetricSpec>,
    k_novelty: usize,
    entries: HashMap<String, ArchiveEntry>,
    next_seq: u64,
}

impl Archive {
    /// Creates an empty archive for the declared metrics.
    #[must_use]
    pub fn new(capacity: usize, metrics: Vec<MetricSpec>, k_novelty: usize) -> Self {
        Self {
            capacity,
            metrics,
            k_novelty,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up one entry by candidate id.
    #[must_use]
    pub fn get(&self, cand_id: &str) -> Option<&ArchiveEntry> {
        self.entries.get(cand_id)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ArchiveEntry> {
        let mut ordered: Vec<&ArchiveEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| e.seq);
        ordered.into_iter()
    }

    fn ordered(&self) -> Vec<&ArchiveEntry> {
        let mut ordered: Vec<&ArchiveEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| e.seq);
        ordered
    }

    /// Rebuilds entries for the given candidates.
    ///
    /// Candidates without any recorded metric are ignored. Entries
    /// absent from this update persist unchanged. When the archive
    /// exceeds capacity afterwards, the worst entries by
    /// (rank, -novelty, age) are dropped.
    pub fn update(
        &mut self,
        candidates: &[CandidateRecord],
        evals: &HashMap<String, HashMap<String, f64>>,
        current_generation: Option<u32>,
    ) {
        let relevant: Vec<&CandidateRecord> = candidates
            .iter()
            .filter(|c| evals.get(&c.cand_id).is_some_and(|m| !m.is_empty()))
            .collect();

        let ids: Vec<String> = relevant.iter().map(|c| c.cand_id.clone()).collect();
        let ranks = pareto_rank(&ids, evals, &self.metrics);

        let mut features_by_cand: Vec<(String, HashSet<String>)> = Vec::new();
        for cand in &relevant {
            let metrics = evals.get(&cand.cand_id).cloned().unwrap_or_default();
            let age = current_generation.map_or(cand.age, |g| g.saturating_sub(cand.generation));
            let seq = if let Some(existing) = self.entries.get(&cand.cand_id) {
                existing.seq
            } else {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            };
            self.entries.insert(
                cand.cand_id.clone(),
                ArchiveEntry {
                    cand_id: cand.cand_id.clone(),
                    metrics,
                    code_snapshot: cand.code_snapshot.clone(),
                    age,
                    novelty: cand.novelty,
                    rank: ranks.get(&cand.cand_id).copied().unwrap_or(0),
                    seq,
                },
            );
            features_by_cand.push((cand.cand_id.clone(), code_features(&cand.code_snapshot)));
        }

        for (cand_id, score) in jaccard_novelty(&features_by_cand, self.k_novelty) {
            if let Some(entry) = self.entries.get_mut(&cand_id) {
                entry.novelty = score;
            }
        }

        if self.entries.len() > self.capacity {
            self.truncate();
        }
    }

    fn truncate(&mut self) {
        let mut ordered: Vec<&ArchiveEntry> = self.ordered();
        ordered.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| b.novelty.total_cmp(&a.novelty))
                .then_with(|| a.age.cmp(&b.age))
        });
        let keep: HashSet<String> = ordered
            .iter()
            .take(self.capacity)
            .map(|e| e.cand_id.clone())
            .collect();
        debug!(
            dropped = self.entries.len() - keep.len(),
            capacity = self.capacity,
            "archive truncated"
        );
        self.entries.retain(|cand_id, _| keep.contains(cand_id));
    }

    /// Returns the candidate ids on the minimum-rank front.
    #[must_use]
    pub fn pareto_front(&self) -> Vec<String> {
        let Some(best) = self.entries.values().map(|e| e.rank).min() else {
            return Vec::new();
        };
        self.ordered()
            .into_iter()
            .filter(|e| e.rank == best)
            .map(|e| e.cand_id.clone())
            .collect()
    }

    /// Samples an ordered, de-duplicated parent mixture.
    ///
    /// First the `n_elite` lowest-rank entries, then fill to
    /// `n_elite + n_novel` from the highest novelty, then fill the rest
    /// from the lowest age. Ties break on insertion order.
    #[must_use]
    pub fn sample_mixture(&self, n_elite: usize, n_novel: usize, n_young: usize) -> Vec<String> {
        let mut by_rank = self.ordered();
        by_rank.sort_by_key(|e| e.rank);
        let mut by_novelty = self.ordered();
        by_novelty.sort_by(|a, b| b.novelty.total_cmp(&a.novelty));
        let mut by_age = self.ordered();
        by_age.sort_by_key(|e| e.age);

        let mut selected: Vec<String> = Vec::new();
        for entry in by_rank.iter().take(n_elite) {
            selected.push(entry.cand_id.clone());
        }
        for entry in &by_novelty {
            if selected.len() >= n_elite + n_novel {
                break;
            }
            if !selected.contains(&entry.cand_id) {
                selected.push(entry.cand_id.clone());
            }
        }
        for entry in &by_age {
            if selected.len() >= n_elite + n_novel + n_young {
                break;
            }
            if !selected.contains(&entry.cand_id) {
                selected.push(entry.cand_id.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn candidate(cand_id: &str, generation: u32, snapshot: &str) -> CandidateRecord {
        CandidateRecord {
            cand_id: cand_id.to_string(),
            run_id: "run".to_string(),
            parent_ids: Vec::new(),
            meta_prompt_id: None,
            filepath: "demo.py".to_string(),
            patch: String::new(),
            code_snapshot: snapshot.to_string(),
            generation,
            novelty: 0.0,
            age: 0,
            error: None,
        }
    }

    fn evals_of(rows: &[(&str, &[(&str, f64)])]) -> HashMap<String, HashMap<String, f64>> {
        rows.iter()
            .map(|(cand_id, metrics)| {
                (
                    (*cand_id).to_string(),
                    metrics
                        .iter()
                        .map(|(name, value)| ((*name).to_string(), *value))
                        .collect(),
                )
            })
            .collect()
    }

    fn acc_time_metrics() -> Vec<MetricSpec> {
        vec![MetricSpec::maximize("acc"), MetricSpec::minimize("time")]
    }

    #[test]
    fn test_pareto_rank_mixed_objectives() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let evals = evals_of(&[
            ("a", &[("acc", 0.8), ("time", 100.0)]),
            ("b", &[("acc", 0.9), ("time", 120.0)]),
            ("c", &[("acc", 0.85), ("time", 90.0)]),
        ]);
        let ranks = pareto_rank(&ids, &evals, &acc_time_metrics());
        assert_eq!(ranks["c"], 0);
        assert_eq!(ranks["b"], 0);
        assert_eq!(ranks["a"], 1);
    }

    #[test]
    fn test_pareto_rank_skips_incomplete_vectors() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let evals = evals_of(&[("a", &[("acc", 0.8), ("time", 100.0)]), ("b", &[("acc", 0.9)])]);
        let ranks = pareto_rank(&ids, &evals, &acc_time_metrics());
        assert_eq!(ranks.len(), 1);
        assert_eq!(ranks["a"], 0);
    }

    #[test]
    fn test_jaccard_novelty_bounds() {
        let features = vec![
            ("a".to_string(), HashSet::from(["x".to_string(), "y".to_string()])),
            ("b".to_string(), HashSet::from(["y".to_string(), "z".to_string()])),
            ("c".to_string(), HashSet::from(["q".to_string()])),
        ];
        let novelty = jaccard_novelty(&features, 5);
        for score in novelty.values() {
            assert!((0.0..=1.0).contains(score));
        }
        assert!(novelty["c"] > novelty["a"]);
    }

    #[test]
    fn test_jaccard_novelty_sole_candidate_is_one() {
        let features = vec![("only".to_string(), HashSet::from(["x".to_string()]))];
        let novelty = jaccard_novelty(&features, 3);
        assert!((novelty["only"] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_code_features_identifiers_and_classes() {
        let features = code_features("def total(values):\n    # sum them\n    return 42\n");
        assert!(features.contains("total"));
        assert!(features.contains("values"));
        assert!(features.contains("identifier"));
        assert!(features.contains("comment"));
        assert!(features.contains("number"));
        assert!(code_features("").is_empty());
    }

    #[test]
    fn test_update_and_pareto_front() {
        let mut archive = Archive::new(10, acc_time_metrics(), 5);
        let candidates = vec![
            candidate("a", 0, "def a(): return 1"),
            candidate("b", 0, "def b(): return 2"),
            candidate("c", 0, "def c(): return 3"),
        ];
        let evals = evals_of(&[
            ("a", &[("acc", 0.8), ("time", 100.0)]),
            ("b", &[("acc", 0.9), ("time", 120.0)]),
            ("c", &[("acc", 0.85), ("time", 90.0)]),
        ]);
        archive.update(&candidates, &evals, Some(0));

        let front = archive.pareto_front();
        assert!(front.contains(&"c".to_string()));
        assert!(front.contains(&"b".to_string()));
        assert!(!front.contains(&"a".to_string()));
        // Front entries all carry the minimum rank.
        for cand_id in &front {
            assert_eq!(archive.get(cand_id).unwrap().rank, 0);
        }

        let mixture = archive.sample_mixture(1, 1, 1);
        assert!(mixture.contains(&"c".to_string()));
        assert_eq!(mixture.len(), 3);
    }

    #[test]
    fn test_update_sets_age_and_novelty() {
        let mut archive = Archive::new(10, vec![MetricSpec::maximize("acc")], 5);
        let candidates = vec![
            candidate("old", 0, "def old(): return alpha"),
            candidate("new", 3, "class Widget: pass"),
        ];
        let evals = evals_of(&[("old", &[("acc", 0.5)]), ("new", &[("acc", 0.6)])]);
        archive.update(&candidates, &evals, Some(3));

        assert_eq!(archive.get("old").unwrap().age, 3);
        assert_eq!(archive.get("new").unwrap().age, 0);
        for entry in archive.iter() {
            assert!((0.0..=1.0).contains(&entry.novelty));
        }
    }

    #[test]
    fn test_entries_absent_from_update_persist() {
        let mut archive = Archive::new(10, vec![MetricSpec::maximize("acc")], 5);
        let evals = evals_of(&[("a", &[("acc", 0.5)])]);
        archive.update(&[candidate("a", 0, "x = 1")], &evals, Some(0));

        let evals2 = evals_of(&[("b", &[("acc", 0.7)])]);
        archive.update(&[candidate("b", 1, "y = 2")], &evals2, Some(1));

        assert_eq!(archive.len(), 2);
        assert!(archive.get("a").is_some());
    }

    #[test]
    fn test_capacity_bound_holds_after_update() {
        let mut archive = Archive::new(2, vec![MetricSpec::maximize("acc")], 5);
        let candidates: Vec<CandidateRecord> = (0..5)
            .map(|i| candidate(&format!("c{i}"), 0, &format!("def f{i}(): return {i}")))
            .collect();
        let rows: Vec<(String, HashMap<String, f64>)> = (0..5)
            .map(|i| {
                (
                    format!("c{i}"),
                    HashMap::from([("acc".to_string(), f64::from(i) * 0.1)]),
                )
            })
            .collect();
        let evals: HashMap<String, HashMap<String, f64>> = rows.into_iter().collect();
        archive.update(&candidates, &evals, Some(0));

        assert!(archive.len() <= 2);
        // The best-scoring candidate survives truncation.
        assert!(archive.get("c4").is_some());
    }

    #[test]
    fn test_candidates_without_metrics_are_ignored() {
        let mut archive = Archive::new(10, vec![MetricSpec::maximize("acc")], 5);
        let evals = evals_of(&[("scored", &[("acc", 0.5)])]);
        archive.update(
            &[candidate("scored", 0, "a = 1"), candidate("bare", 0, "b = 2")],
            &evals,
            Some(0),
        );
        assert_eq!(archive.len(), 1);
        assert!(archive.get("bare").is_none());
    }

    #[test]
    fn test_sample_mixture_deduplicates() {
        let mut archive = Archive::new(10, vec![MetricSpec::maximize("acc")], 5);
        let evals = evals_of(&[("a", &[("acc", 0.9)]), ("b", &[("acc", 0.1)])]);
        archive.update(
            &[candidate("a", 0, "x = 1"), candidate("b", 0, "y = 2")],
            &evals,
            Some(0),
        );
        let mixture = archive.sample_mixture(2, 2, 2);
        assert_eq!(mixture.len(), 2);
        let unique: HashSet<&String> = mixture.iter().collect();
        assert_eq!(unique.len(), mixture.len());
    }
}
