//! SEARCH/REPLACE hunk parsing and application.
//!
//! This is the response format pinned in every assembled prompt: zero
//! or more hunks of the form
//!
//! ```text
//! <<<<<<< SEARCH
//! old_code
//! =======
//! new_code
//! >>>>>>> REPLACE
//! ```
//!
//! The parser strips surrounding code fences and tolerates CR/LF line
//! endings, since model output routinely carries both.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::DiffError;

#[allow(clippy::unwrap_used)]
static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<<<<<<< SEARCH\n(?P<search>.*?)\n=======\n(?P<replace>.*?)\n>>>>>>> REPLACE(?:\n|$)").unwrap()
});

/// A single SEARCH/REPLACE hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    /// Text to locate in the source.
    pub search: String,
    /// Text that replaces the first occurrence of `search`.
    pub replace: String,
}

impl DiffHunk {
    /// Applies the hunk to `source`, replacing the first occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError::SearchNotFound`] when the search segment is
    /// absent from `source`.
    pub fn apply(&self, source: &str) -> Result<String, DiffError> {
        if !source.contains(&self.search) {
            return Err(DiffError::SearchNotFound);
        }
        Ok(source.replacen(&self.search, &self.replace, 1))
    }

    /// Renders the hunk back into the wire format.
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "<<<<<<< SEARCH\n{}\n=======\n{}\n>>>>>>> REPLACE",
            self.search, self.replace
        )
    }
}

/// Parses diff text into structured hunks.
///
/// Surrounding triple-backtick fences are stripped and CR/LF line
/// endings normalized before matching. Hunks are returned in order of
/// appearance.
///
/// # Errors
///
/// Returns [`DiffError::Empty`] for blank input and
/// [`DiffError::Malformed`] when no hunk matches.
pub fn parse_diff(diff_text: &str) -> Result<Vec<DiffHunk>, DiffError> {
    let mut text = diff_text.replace("\r\n", "\n").replace('\r', "\n");
    let mut trimmed = text.trim();
    if trimmed.starts_with("```") {
        let mut lines: Vec<&str> = trimmed.lines().collect();
        if lines.first().is_some_and(|l| l.starts_with("```")) {
            lines.remove(0);
        }
        if lines.last().is_some_and(|l| l.starts_with("```")) {
            lines.pop();
        }
        text = lines.join("\n");
        trimmed = text.trim();
    }

    if trimmed.is_empty() {
        return Err(DiffError::Empty);
    }

    let hunks: Vec<DiffHunk> = HUNK_RE
        .captures_iter(trimmed)
        .map(|caps| DiffHunk {
            search: caps["search"].to_string(),
            replace: caps["replace"].to_string(),
        })
        .collect();

    if hunks.is_empty() {
        return Err(DiffError::Malformed);
    }
    Ok(hunks)
}

/// Applies multiple hunks sequentially to `source`.
///
/// # Errors
///
/// Returns the first hunk's [`DiffError`] on a failed match; earlier
/// hunks' effects are discarded.
pub fn apply_hunks(source: &str, hunks: &[DiffHunk]) -> Result<String, DiffError> {
    let mut result = source.to_string();
    for hunk in hunks {
        result = hunk.apply(&result)?;
    }
    Ok(result)
}

/// Renders hunks back into a single response string.
#[must_use]
pub fn serialize_hunks(hunks: &[DiffHunk]) -> String {
    hunks
        .iter()
        .map(DiffHunk::to_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Returns `true` when `diff_text` parses as at least one hunk.
#[must_use]
pub fn is_valid_diff(diff_text: &str) -> bool {
    parse_diff(diff_text).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_hunk() {
        let hunks = parse_diff("<<<<<<< SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE").unwrap();
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].search, "foo");
        assert_eq!(hunks[0].replace, "bar");
    }

    #[test]
    fn test_parse_multiple_hunks_with_fence_and_crlf() {
        let diff = "```\r\n<<<<<<< SEARCH\r\nfoo\r\n=======\r\nbar\r\n>>>>>>> REPLACE\r\n\r\n<<<<<<< SEARCH\r\nspam\r\n=======\r\neggs\r\n>>>>>>> REPLACE\r\n```";
        let hunks = parse_diff(diff).unwrap();
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].search, "foo");
        assert_eq!(hunks[0].replace, "bar");
        assert_eq!(hunks[1].search, "spam");
        assert_eq!(hunks[1].replace, "eggs");
    }

    #[test]
    fn test_parse_multiline_segments() {
        let diff = "<<<<<<< SEARCH\nline one\nline two\n=======\nreplacement\n>>>>>>> REPLACE";
        let hunks = parse_diff(diff).unwrap();
        assert_eq!(hunks[0].search, "line one\nline two");
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(matches!(parse_diff("   "), Err(DiffError::Empty)));
        assert!(matches!(parse_diff("invalid format"), Err(DiffError::Malformed)));
    }

    #[test]
    fn test_apply_hunk() {
        let hunk = DiffHunk {
            search: "foo".to_string(),
            replace: "bar".to_string(),
        };
        let updated = apply_hunks("foo = 1\n", std::slice::from_ref(&hunk)).unwrap();
        assert_eq!(updated, "bar = 1\n");
    }

    #[test]
    fn test_apply_missing_search_fails() {
        let hunk = DiffHunk {
            search: "absent".to_string(),
            replace: "x".to_string(),
        };
        assert!(matches!(hunk.apply("foo"), Err(DiffError::SearchNotFound)));
    }

    #[test]
    fn test_is_valid_diff() {
        assert!(is_valid_diff("<<<<<<< SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE"));
        assert!(!is_valid_diff("not a diff"));
    }

    #[test]
    fn test_roundtrip_preserves_hunk_order_and_content() {
        let diff = "<<<<<<< SEARCH\nfoo\n=======\nbar\n>>>>>>> REPLACE\n\n<<<<<<< SEARCH\nspam\n=======\neggs\n>>>>>>> REPLACE";
        let hunks = parse_diff(diff).unwrap();
        let reparsed = parse_diff(&serialize_hunks(&hunks)).unwrap();
        assert_eq!(hunks, reparsed);
    }
}
