//! SQLite-backed persistence for evolution runs.
//!
//! One embedded database holds runs, candidates, evaluations, and
//! meta-prompts. All access goes through a single mutex so concurrent
//! workers may submit writes; there is no transactional grouping across
//! a candidate and its evaluations, so readers must tolerate a
//! candidate that has no evaluation rows yet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cascade::StageResult;
use crate::config::MetricSpec;
use crate::error::StoreError;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    config_json TEXT NOT NULL,
    created_at  TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS candidates (
    cand_id        TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL,
    parent_ids     TEXT NOT NULL DEFAULT '',
    meta_prompt_id TEXT,
    filepath       TEXT NOT NULL DEFAULT '',
    patch          TEXT NOT NULL DEFAULT '',
    code_snapshot  TEXT NOT NULL DEFAULT '',
    gen            INTEGER NOT NULL DEFAULT 0,
    novelty        REAL NOT NULL DEFAULT 0,
    age            INTEGER NOT NULL DEFAULT 0,
    error          TEXT,
    created_at     TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_candidates_run ON candidates(run_id, gen);

CREATE TABLE IF NOT EXISTS evaluations (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    cand_id    TEXT NOT NULL,
    metric     TEXT NOT NULL,
    value      REAL NOT NULL DEFAULT 0,
    passed     INTEGER NOT NULL DEFAULT 0,
    cost_ms    INTEGER NOT NULL DEFAULT 0,
    error      TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_evaluations_cand ON evaluations(cand_id);

CREATE TABLE IF NOT EXISTS meta_prompts (
    meta_prompt_id TEXT PRIMARY KEY,
    template       TEXT NOT NULL,
    parent_ids     TEXT NOT NULL DEFAULT '',
    fitness        REAL NOT NULL DEFAULT 0,
    last_used      TIMESTAMP
);
";

/// A durable run row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Opaque run identifier.
    pub run_id: String,
    /// Serialized configuration as stored.
    pub config_json: String,
}

/// A durable candidate row.
///
/// Structurally immutable once written; only `novelty` and `age` are
/// recomputed by the archive after each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Unique candidate identifier.
    pub cand_id: String,
    /// Owning run.
    pub run_id: String,
    /// Ordered parent candidate ids.
    pub parent_ids: Vec<String>,
    /// Meta-prompt that produced this candidate, if any.
    pub meta_prompt_id: Option<String>,
    /// Target file path, relative to the workdir.
    pub filepath: String,
    /// Raw patch text as returned by the model.
    pub patch: String,
    /// Code snapshot: post-application on success, pre-application on
    /// apply failure.
    pub code_snapshot: String,
    /// Generation index the candidate was created in.
    pub generation: u32,
    /// Jaccard novelty, recomputed by the archive.
    pub novelty: f64,
    /// Generations since creation, recomputed by the archive.
    pub age: u32,
    /// Apply error annotation, when the patch failed.
    pub error: Option<String>,
}

/// A durable meta-prompt row.
#[derive(Debug, Clone)]
pub struct MetaPromptRecord {
    /// Unique meta-prompt identifier.
    pub meta_prompt_id: String,
    /// System-prompt template text.
    pub template: String,
    /// Parent meta-prompt ids.
    pub parent_ids: Vec<String>,
    /// Fitness in `[0, 1]`, recomputed each generation.
    pub fitness: f64,
    /// Last-used timestamp, as stored.
    pub last_used: Option<String>,
}

/// A failing candidate's patch and error, for prompt exemplars.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// Candidate that failed.
    pub cand_id: String,
    /// The patch that was attempted.
    pub patch: String,
    /// The recorded stage error, if any.
    pub error: Option<String>,
}

/// Embedded relational store for run state.
///
/// All operations serialize on an internal mutex; any write failure
/// propagates and reads never return partial rows.
#[derive(Debug)]
pub struct ProgramStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl ProgramStore {
    /// Opens (creating if needed) the database at `path` and ensures
    /// the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file or schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Opens a transient in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when SQLite cannot initialize.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            path: None,
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Returns the database path, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Creates all tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on DDL failure.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Inserts or overwrites a run's serialized configuration.
    ///
    /// Idempotent: repeating with the same `run_id` replaces the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or write failure.
    pub fn upsert_run<C: Serialize>(&self, run_id: &str, config: &C) -> Result<(), StoreError> {
        let payload = serde_json::to_string(config)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs(run_id, config_json) VALUES(?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET config_json = excluded.config_json",
            params![run_id, payload],
        )?;
        Ok(())
    }

    /// Returns the stored run, or `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT run_id, config_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunRecord {
                        run_id: row.get(0)?,
                        config_json: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Upserts a candidate by id.
    ///
    /// The creation timestamp of an existing row is preserved so that
    /// novelty/age write-backs do not disturb insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_candidate(&self, cand: &CandidateRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO candidates(
                cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                code_snapshot, gen, novelty, age, error
             ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(cand_id) DO UPDATE SET
                run_id = excluded.run_id,
                parent_ids = excluded.parent_ids,
                meta_prompt_id = excluded.meta_prompt_id,
                filepath = excluded.filepath,
                patch = excluded.patch,
                code_snapshot = excluded.code_snapshot,
                gen = excluded.gen,
                novelty = excluded.novelty,
                age = excluded.age,
                error = excluded.error",
            params![
                cand.cand_id,
                cand.run_id,
                cand.parent_ids.join(","),
                cand.meta_prompt_id,
                cand.filepath,
                cand.patch,
                cand.code_snapshot,
                cand.generation,
                cand.novelty,
                cand.age,
                cand.error,
            ],
        )?;
        Ok(())
    }

    /// Returns one candidate by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn get_candidate(&self, cand_id: &str) -> Result<Option<CandidateRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                        code_snapshot, gen, novelty, age, error
                 FROM candidates WHERE cand_id = ?1",
                params![cand_id],
                candidate_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Returns a run's candidates ordered by creation time, optionally
    /// filtered to one generation. Insertion order breaks timestamp
    /// ties.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn get_candidates_by_run(
        &self,
        run_id: &str,
        generation: Option<u32>,
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        let base = "SELECT cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                           code_snapshot, gen, novelty, age, error
                    FROM candidates WHERE run_id = ?1";
        match generation {
            None => {
                let mut stmt =
                    conn.prepare(&format!("{base} ORDER BY created_at, rowid"))?;
                let rows = stmt.query_map(params![run_id], candidate_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            Some(g) => {
                let mut stmt =
                    conn.prepare(&format!("{base} AND gen = ?2 ORDER BY created_at, rowid"))?;
                let rows = stmt.query_map(params![run_id, g], candidate_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Returns the highest generation recorded for a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn max_generation(&self, run_id: &str) -> Result<Option<u32>, StoreError> {
        let conn = self.lock()?;
        let max: Option<u32> = conn.query_row(
            "SELECT MAX(gen) FROM candidates WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Appends one evaluation row per cascade stage result.
    ///
    /// Append-only, and atomic: the whole batch for one cascade
    /// invocation commits together.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_evaluations(
        &self,
        cand_id: &str,
        results: &HashMap<String, StageResult>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO evaluations(cand_id, metric, value, passed, cost_ms, error)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (metric, result) in results {
                stmt.execute(params![
                    cand_id,
                    metric,
                    result.value,
                    i32::from(result.passed),
                    i64::try_from(result.cost_ms).unwrap_or(i64::MAX),
                    result.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns a two-level mapping `cand_id -> metric -> value`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn get_candidate_evals(
        &self,
        cand_ids: &[String],
    ) -> Result<HashMap<String, HashMap<String, f64>>, StoreError> {
        if cand_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; cand_ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT cand_id, metric, value FROM evaluations WHERE cand_id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(cand_ids), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let mut table: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for row in rows {
            let (cand_id, metric, value) = row?;
            table.entry(cand_id).or_default().insert(metric, value);
        }
        Ok(table)
    }

    /// Returns the top `k` candidates by signed metric sum.
    ///
    /// Each listed metric contributes its raw value (negated for
    /// minimize metrics); candidates with no recorded metrics are
    /// skipped. Values are summed without normalization, so callers
    /// must pass comparable metrics or normalize upstream. Ties break
    /// on insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn top_candidates(
        &self,
        run_id: &str,
        k: usize,
        metrics: &[MetricSpec],
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let cands = self.get_candidates_by_run(run_id, None)?;
        if cands.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = cands.iter().map(|c| c.cand_id.clone()).collect();
        let evals = self.get_candidate_evals(&ids)?;

        let mut scored: Vec<(f64, CandidateRecord)> = Vec::new();
        for cand in cands {
            let Some(cand_metrics) = evals.get(&cand.cand_id) else {
                continue;
            };
            let mut score = 0.0;
            for spec in metrics {
                if let Some(value) = cand_metrics.get(&spec.name) {
                    if spec.minimize {
                        score -= value;
                    } else {
                        score += value;
                    }
                }
            }
            scored.push((score, cand));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(k).map(|(_, c)| c).collect())
    }

    /// Returns the most recent failing evaluations for a run, newest
    /// first, with the candidate's patch text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn recent_failures(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.cand_id, c.patch, e.error
             FROM candidates c JOIN evaluations e ON e.cand_id = c.cand_id
             WHERE c.run_id = ?1 AND e.passed = 0
             ORDER BY e.created_at DESC, e.id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(FailureRecord {
                cand_id: row.get(0)?,
                patch: row.get(1)?,
                error: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Inserts a new meta-prompt and returns its generated id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_meta_prompt(
        &self,
        template: &str,
        parents: &[String],
    ) -> Result<String, StoreError> {
        let meta_id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta_prompts(meta_prompt_id, template, parent_ids, last_used)
             VALUES(?1, ?2, ?3, CURRENT_TIMESTAMP)",
            params![meta_id, template, parents.join(",")],
        )?;
        Ok(meta_id)
    }

    /// Updates a meta-prompt's fitness and touches its last-used time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn update_meta_prompt_fitness(
        &self,
        meta_prompt_id: &str,
        fitness: f64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE meta_prompts SET fitness = ?1, last_used = CURRENT_TIMESTAMP
             WHERE meta_prompt_id = ?2",
            params![fitness, meta_prompt_id],
        )?;
        Ok(())
    }

    /// Returns up to `limit` meta-prompts ordered by fitness then
    /// last-used, both descending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn get_meta_prompts(&self, limit: usize) -> Result<Vec<MetaPromptRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT meta_prompt_id, template, parent_ids, fitness, last_used
             FROM meta_prompts ORDER BY fitness DESC, last_used DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], meta_prompt_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Returns every meta-prompt ordered by fitness descending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on read failure.
    pub fn list_meta_prompts(&self) -> Result<Vec<MetaPromptRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT meta_prompt_id, template, parent_ids, fitness, last_used
             FROM meta_prompts ORDER BY fitness DESC",
        )?;
        let rows = stmt.query_map([], meta_prompt_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn candidate_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CandidateRecord> {
    let parent_ids: String = row.get(2)?;
    Ok(CandidateRecord {
        cand_id: row.get(0)?,
        run_id: row.get(1)?,
        parent_ids: split_ids(&parent_ids),
        meta_prompt_id: row.get(3)?,
        filepath: row.get(4)?,
        patch: row.get(5)?,
        code_snapshot: row.get(6)?,
        generation: row.get(7)?,
        novelty: row.get(8)?,
        age: row.get(9)?,
        error: row.get(10)?,
    })
}

fn meta_prompt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetaPromptRecord> {
    let parent_ids: String = row.get(2)?;
    Ok(MetaPromptRecord {
        meta_prompt_id: row.get(0)?,
        template: row.get(1)?,
        parent_ids: split_ids(&parent_ids),
        fitness: row.get(3)?,
        last_used: row.get(4)?,
    })
}

fn split_ids(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sample_candidate(cand_id: &str, run_id: &str, generation: u32) -> CandidateRecord {
        CandidateRecord {
            cand_id: cand_id.to_string(),
            run_id: run_id.to_string(),
            parent_ids: vec!["p1".to_string()],
            meta_prompt_id: Some("m1".to_string()),
            filepath: "demo.py".to_string(),
            patch: "[]".to_string(),
            code_snapshot: "print('hi')\n".to_string(),
            generation,
            novelty: 0.1,
            age: 0,
            error: None,
        }
    }

    fn stage(value: f64, passed: bool) -> StageResult {
        StageResult {
            value,
            passed,
            cost_ms: 10,
            error: if passed { None } else { Some("boom".to_string()) },
        }
    }

    #[test]
    fn test_roundtrip() {
        let store = ProgramStore::open_in_memory().unwrap();
        store
            .upsert_run("run1", &serde_json::json!({"foo": "bar"}))
            .unwrap();

        store.insert_candidate(&sample_candidate("c1", "run1", 0)).unwrap();
        store
            .insert_evaluations("c1", &HashMap::from([("accuracy".to_string(), stage(1.0, true))]))
            .unwrap();

        let rows = store.get_candidates_by_run("run1", None).unwrap();
        assert_eq!(rows[0].cand_id, "c1");
        assert_eq!(rows[0].parent_ids, vec!["p1"]);

        let metrics = store.get_candidate_evals(&["c1".to_string()]).unwrap();
        assert!((metrics["c1"]["accuracy"] - 1.0).abs() < f64::EPSILON);

        let run = store.get_run("run1").unwrap().unwrap();
        let config: serde_json::Value = serde_json::from_str(&run.config_json).unwrap();
        assert_eq!(config["foo"], "bar");
    }

    #[test]
    fn test_upsert_run_overwrites_config() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.upsert_run("run1", &serde_json::json!({"v": 1})).unwrap();
        store.upsert_run("run1", &serde_json::json!({"v": 2})).unwrap();
        let run = store.get_run("run1").unwrap().unwrap();
        let config: serde_json::Value = serde_json::from_str(&run.config_json).unwrap();
        assert_eq!(config["v"], 2);
    }

    #[test]
    fn test_get_run_absent() {
        let store = ProgramStore::open_in_memory().unwrap();
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn test_candidate_upsert_preserves_order() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.insert_candidate(&sample_candidate("c1", "run1", 0)).unwrap();
        store.insert_candidate(&sample_candidate("c2", "run1", 0)).unwrap();

        // Write back novelty for the first candidate; it must keep its
        // position in creation order.
        let mut updated = sample_candidate("c1", "run1", 0);
        updated.novelty = 0.9;
        store.insert_candidate(&updated).unwrap();

        let rows = store.get_candidates_by_run("run1", None).unwrap();
        let ids: Vec<&str> = rows.iter().map(|c| c.cand_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!((rows[0].novelty - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_generation_filter_and_max() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.insert_candidate(&sample_candidate("c1", "run1", 0)).unwrap();
        store.insert_candidate(&sample_candidate("c2", "run1", 1)).unwrap();

        assert_eq!(store.get_candidates_by_run("run1", Some(1)).unwrap().len(), 1);
        assert_eq!(store.max_generation("run1").unwrap(), Some(1));
        assert_eq!(store.max_generation("other").unwrap(), None);
    }

    #[test]
    fn test_candidate_without_evaluations_is_tolerated() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.insert_candidate(&sample_candidate("c1", "run1", 0)).unwrap();
        let evals = store.get_candidate_evals(&["c1".to_string()]).unwrap();
        assert!(evals.is_empty());
        // And it is skipped by top_candidates rather than erroring.
        let top = store
            .top_candidates("run1", 5, &[MetricSpec::maximize("accuracy")])
            .unwrap();
        assert!(top.is_empty());
    }

    #[test]
    fn test_top_candidates_signed_sum_and_ties() {
        let store = ProgramStore::open_in_memory().unwrap();
        for (id, acc, time) in [("a", 0.8, 100.0), ("b", 0.9, 120.0), ("c", 0.9, 90.0)] {
            store.insert_candidate(&sample_candidate(id, "run1", 0)).unwrap();
            store
                .insert_evaluations(
                    id,
                    &HashMap::from([
                        ("acc".to_string(), stage(acc, true)),
                        ("time".to_string(), stage(time, true)),
                    ]),
                )
                .unwrap();
        }
        let metrics = [MetricSpec::maximize("acc"), MetricSpec::minimize("time")];
        let top = store.top_candidates("run1", 2, &metrics).unwrap();
        let ids: Vec<&str> = top.iter().map(|c| c.cand_id.as_str()).collect();
        // c: 0.9 - 90 = -89.1; a: 0.8 - 100 = -99.2; b: 0.9 - 120 = -119.1
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_recent_failures_newest_first() {
        let store = ProgramStore::open_in_memory().unwrap();
        store.insert_candidate(&sample_candidate("c1", "run1", 0)).unwrap();
        store.insert_candidate(&sample_candidate("c2", "run1", 0)).unwrap();
        store
            .insert_evaluations("c1", &HashMap::from([("tests".to_string(), stage(0.0, false))]))
            .unwrap();
        store
            .insert_evaluations("c2", &HashMap::from([("tests".to_string(), stage(0.0, false))]))
            .unwrap();

        let failures = store.recent_failures("run1", 5).unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].cand_id, "c2");
        assert_eq!(failures[0].error.as_deref(), Some("boom"));

        // Failures from another run are not surfaced.
        assert!(store.recent_failures("run2", 5).unwrap().is_empty());
    }

    #[test]
    fn test_meta_prompt_lifecycle() {
        let store = ProgramStore::open_in_memory().unwrap();
        let low = store.insert_meta_prompt("low", &[]).unwrap();
        let high = store.insert_meta_prompt("high", &[]).unwrap();
        store.update_meta_prompt_fitness(&high, 0.9).unwrap();
        store.update_meta_prompt_fitness(&low, 0.2).unwrap();

        let prompts = store.get_meta_prompts(5).unwrap();
        assert_eq!(prompts[0].meta_prompt_id, high);
        assert!((prompts[0].fitness - 0.9).abs() < f64::EPSILON);

        let all = store.list_meta_prompts().unwrap();
        assert_eq!(all.len(), 2);
    }
}
