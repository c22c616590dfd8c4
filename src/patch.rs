//! Decode and apply candidate patches with scope rules.
//!
//! Patches arrive as opaque text and are decoded at apply time into one
//! of three forms: a structured operation list (JSON, optionally inside
//! a `{"format": ..., "diff": [...]}` wrapper), SEARCH/REPLACE hunks,
//! or a restricted unified diff. The applier never writes the target
//! file; callers decide what to do with the returned source.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::blocks::{EvolveBlock, extract_blocks, replace_block};
use crate::diffs::{self, DiffHunk};
use crate::error::{DiffError, PatchError};

/// Which parts of the target file an operation may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditScope {
    /// Edits are confined to EVOLVE blocks.
    #[default]
    Blocks,
    /// Edits may rewrite any part of the file.
    WholeFile,
}

/// One structured patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    /// Target block name; `None` targets the whole file.
    #[serde(default)]
    pub block_id: Option<String>,
    /// Text to locate; empty replaces the entire target.
    #[serde(default)]
    pub search: String,
    /// Replacement text.
    #[serde(default)]
    pub replace: String,
}

/// A decoded patch, tagged by wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Ordered list of block- or file-scoped operations.
    Structured(Vec<PatchOp>),
    /// SEARCH/REPLACE hunks as pinned in the prompt format.
    Hunks(Vec<DiffHunk>),
    /// Restricted unified diff text.
    Unified(String),
}

/// Decodes patch text into its tagged form.
///
/// Valid JSON selects the structured form (a bare list, or a wrapped
/// payload whose `format` field may instead route the embedded `diff`
/// string through the textual path). Non-JSON text is classified as
/// SEARCH/REPLACE hunks when it parses as such, and as a unified diff
/// otherwise.
///
/// # Errors
///
/// Returns [`PatchError::NotAnOperationList`] when JSON parses but is
/// not a list of operations.
pub fn parse_patch(text: &str) -> Result<Patch, PatchError> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) if map.contains_key("diff") => {
            let format = map
                .get("format")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("json");
            let diff = map.get("diff").cloned().unwrap_or_default();
            if format == "json" || format == "structured" {
                let ops: Vec<PatchOp> =
                    serde_json::from_value(diff).map_err(|_| PatchError::NotAnOperationList)?;
                Ok(Patch::Structured(ops))
            } else {
                let payload = diff.as_str().map_or_else(|| diff.to_string(), str::to_string);
                Ok(classify_text(&payload))
            }
        }
        Ok(value @ serde_json::Value::Array(_)) => {
            let ops: Vec<PatchOp> =
                serde_json::from_value(value).map_err(|_| PatchError::NotAnOperationList)?;
            Ok(Patch::Structured(ops))
        }
        Ok(_) => Err(PatchError::NotAnOperationList),
        Err(_) => Ok(classify_text(text)),
    }
}

fn classify_text(text: &str) -> Patch {
    diffs::parse_diff(text).map_or_else(|_| Patch::Unified(text.to_string()), Patch::Hunks)
}

/// Reads the file at `path` and applies the patch under `scope`.
///
/// The file on disk is left untouched; the caller receives the new
/// source on success.
///
/// # Errors
///
/// Returns [`PatchError`] identifying the first operation that failed.
pub fn apply_patch(path: &Path, patch_text: &str, scope: EditScope) -> Result<String, PatchError> {
    let source = fs::read_to_string(path).map_err(|source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let patch = parse_patch(patch_text)?;
    apply_to_source(&source, &patch, scope)
}

/// Applies a decoded patch to in-memory source under `scope`.
///
/// # Errors
///
/// Returns [`PatchError`] identifying the first operation that failed.
pub fn apply_to_source(source: &str, patch: &Patch, scope: EditScope) -> Result<String, PatchError> {
    match patch {
        Patch::Structured(ops) => apply_structured(source, ops, scope),
        Patch::Hunks(hunks) => apply_search_replace(source, hunks, scope),
        Patch::Unified(diff) => apply_unified(source, diff),
    }
}

/// Writes the new source back to the target file.
///
/// # Errors
///
/// Propagates the underlying I/O error.
pub fn write_if_changed(path: &Path, new_source: &str) -> std::io::Result<()> {
    fs::write(path, new_source)
}

fn apply_structured(
    source: &str,
    ops: &[PatchOp],
    scope: EditScope,
) -> Result<String, PatchError> {
    let mut updated = source.to_string();
    for op in ops {
        // Re-scan after every operation so later ops see fresh bounds.
        match &op.block_id {
            Some(block_id) => {
                let blocks = extract_blocks(&updated);
                let block = blocks
                    .into_iter()
                    .find(|b| &b.name == block_id)
                    .ok_or_else(|| PatchError::BlockNotFound(block_id.clone()))?;
                let new_content = block_replacement(&block, op, block_id)?;
                updated = replace_block(&updated, &block, &new_content);
            }
            None => {
                if scope == EditScope::Blocks {
                    return Err(PatchError::WholeFileEditInBlockScope);
                }
                if op.search.is_empty() {
                    updated = op.replace.clone();
                } else {
                    if !updated.contains(&op.search) {
                        return Err(PatchError::SearchNotFoundInFile);
                    }
                    updated = updated.replacen(&op.search, &op.replace, 1);
                }
            }
        }
    }
    Ok(updated)
}

fn block_replacement(
    block: &EvolveBlock,
    op: &PatchOp,
    block_id: &str,
) -> Result<String, PatchError> {
    if op.search.is_empty() {
        return Ok(op.replace.clone());
    }
    if block.content.contains(&op.search) {
        return Ok(block.content.replacen(&op.search, &op.replace, 1));
    }
    // Whitespace-insensitive whole-region match is the one tolerated
    // mismatch; anything else is a failed operation.
    if block.content.trim() == op.search.trim() {
        return Ok(op.replace.clone());
    }
    Err(PatchError::SearchNotFoundInBlock(block_id.to_string()))
}

fn apply_search_replace(
    source: &str,
    hunks: &[DiffHunk],
    scope: EditScope,
) -> Result<String, PatchError> {
    match scope {
        EditScope::WholeFile => Ok(diffs::apply_hunks(source, hunks)?),
        EditScope::Blocks => {
            let mut updated = source.to_string();
            for hunk in hunks {
                let blocks = extract_blocks(&updated);
                let block = blocks
                    .into_iter()
                    .find(|b| b.content.contains(&hunk.search))
                    .ok_or(DiffError::SearchNotFound)?;
                let new_content = block.content.replacen(&hunk.search, &hunk.replace, 1);
                updated = replace_block(&updated, &block, &new_content);
            }
            Ok(updated)
        }
    }
}

fn apply_unified(source: &str, diff: &str) -> Result<String, PatchError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut result: Vec<String> = Vec::new();
    let mut idx = 0usize;

    for line in diff.lines() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if line.starts_with("@@") {
            let token = line
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| PatchError::MalformedHunk(line.to_string()))?;
            let start: usize = token
                .trim_start_matches('-')
                .split(',')
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| PatchError::MalformedHunk(line.to_string()))?;
            let start = start.saturating_sub(1);
            while idx < start && idx < lines.len() {
                result.push(lines[idx].to_string());
                idx += 1;
            }
            continue;
        }
        if line.starts_with('-') {
            idx += 1;
        } else if let Some(added) = line.strip_prefix('+') {
            result.push(added.to_string());
        } else if idx < lines.len() {
            result.push(lines[idx].to_string());
            idx += 1;
        }
    }

    for line in lines.iter().skip(idx) {
        result.push((*line).to_string());
    }

    let mut out = result.join("\n");
    if source.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}
