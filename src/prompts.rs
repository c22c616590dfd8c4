//! Prompt builders for the single-block controller.

use std::collections::HashMap;
use std::fmt::Write;

use crate::diffs::is_valid_diff;
use crate::error::DiffError;

/// Footer pinning the SEARCH/REPLACE response template.
pub const PROMPT_FOOTER: &str = "Respond with one or more SEARCH/REPLACE patches using exactly this template:\n<<<<<<< SEARCH\nold_code\n=======\nnew_code\n>>>>>>> REPLACE\nDo not include any commentary or backticks.";

/// Assembles the user prompt for one mutation round.
#[must_use]
pub fn build_block_prompt(
    task_description: &str,
    block_source: &str,
    evaluation_criteria: Option<&HashMap<String, f64>>,
    reference_summaries: &[String],
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task Description:");
    let _ = writeln!(prompt, "{}", task_description.trim());
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Target Block:");
    let _ = writeln!(prompt, "{}", block_source.trim());
    let _ = writeln!(prompt);

    if !reference_summaries.is_empty() {
        let _ = writeln!(prompt, "Reference Candidates:");
        for summary in reference_summaries {
            let _ = writeln!(prompt, "- {}", summary.trim());
        }
        let _ = writeln!(prompt);
    }

    if let Some(criteria) = evaluation_criteria {
        let _ = writeln!(prompt, "Evaluation Criteria (higher is better unless noted):");
        let mut pairs: Vec<(&String, &f64)> = criteria.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in pairs {
            let _ = writeln!(prompt, "- {name}: {value}");
        }
        let _ = writeln!(prompt);
    }

    prompt.push_str(PROMPT_FOOTER);
    prompt.trim().to_string()
}

/// Rejects responses that are not a valid SEARCH/REPLACE diff.
///
/// # Errors
///
/// Returns [`DiffError::Malformed`] when no hunk parses.
pub fn validate_model_response(response: &str) -> Result<(), DiffError> {
    if is_valid_diff(response) {
        Ok(())
    } else {
        Err(DiffError::Malformed)
    }
}
