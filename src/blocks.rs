//! Locate and rewrite EVOLVE blocks in a target source file.
//!
//! A block is a span delimited by marker lines; the text between the
//! markers is the mutable region the engine is allowed to edit. Blocks
//! are parsed fresh from the file on every read and are never persisted.

/// Start marker; optionally followed by a space-separated block name.
pub const BLOCK_START: &str = "# EVOLVE-BLOCK-START";
/// End marker.
pub const BLOCK_END: &str = "# EVOLVE-BLOCK-END";

/// A delimited mutable region within a source file.
///
/// `start_line` and `end_line` are the 0-based line numbers of the
/// marker lines themselves; `content` is the exact text between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolveBlock {
    /// Name parsed from the start marker, or `block_<index>` if absent.
    pub name: String,
    /// Line number of the start marker.
    pub start_line: usize,
    /// Line number of the end marker.
    pub end_line: usize,
    /// Raw text between the markers, excluding the marker lines.
    pub content: String,
    /// Shortest leading-whitespace prefix among non-empty content lines.
    pub indent: String,
}

impl EvolveBlock {
    /// Returns the block content with common indentation removed.
    #[must_use]
    pub fn normalized_content(&self) -> String {
        if self.content.is_empty() {
            return String::new();
        }
        dedent(&self.content)
    }
}

/// Returns all evolve blocks in the provided source, in source order.
///
/// Markers must balance; nesting is not supported. An unterminated
/// start marker yields no block.
#[must_use]
pub fn extract_blocks(source: &str) -> Vec<EvolveBlock> {
    let lines: Vec<&str> = source.lines().collect();
    let mut blocks = Vec::new();
    let mut active_start: Option<usize> = None;
    let mut block_lines: Vec<&str> = Vec::new();
    let mut block_name = String::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with(BLOCK_START) {
            active_start = Some(idx);
            block_lines.clear();
            let rest = trimmed[BLOCK_START.len()..].trim();
            block_name = if rest.is_empty() {
                format!("block_{}", blocks.len())
            } else {
                rest.to_string()
            };
            continue;
        }
        if trimmed.starts_with(BLOCK_END) {
            if let Some(start) = active_start.take() {
                let content = block_lines.join("\n");
                let indent = leading_indent(&block_lines);
                blocks.push(EvolveBlock {
                    name: std::mem::take(&mut block_name),
                    start_line: start,
                    end_line: idx,
                    content,
                    indent,
                });
                block_lines.clear();
            }
            continue;
        }
        if active_start.is_some() {
            block_lines.push(line);
        }
    }

    blocks
}

/// Replaces a block's content, preserving the marker lines bit-for-bit.
///
/// The supplied text is stripped of trailing newlines, dedented, then
/// every non-empty line is re-prefixed with the block's original
/// indent; empty lines stay empty. The returned source always ends in
/// exactly one newline.
#[must_use]
pub fn replace_block(source: &str, block: &EvolveBlock, new_content: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let head = &lines[..=block.start_line];
    let tail = &lines[block.end_line..];

    let normalized = dedent(new_content.trim_end_matches('\n'));
    let mut replacement: Vec<String> = Vec::new();
    if !normalized.is_empty() {
        for line in normalized.lines() {
            if line.is_empty() {
                replacement.push(String::new());
            } else {
                replacement.push(format!("{}{line}", block.indent));
            }
        }
    }

    let mut out = String::new();
    for line in head
        .iter()
        .copied()
        .map(str::to_string)
        .chain(replacement)
        .chain(tail.iter().copied().map(str::to_string))
    {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Returns the shortest leading-whitespace prefix among non-empty lines.
fn leading_indent(lines: &[&str]) -> String {
    let mut indent: Option<&str> = None;
    for line in lines {
        let stripped = line.trim_start();
        if stripped.is_empty() {
            continue;
        }
        let prefix = &line[..line.len() - stripped.len()];
        if indent.is_none_or(|current| prefix.len() < current.len()) {
            indent = Some(prefix);
        }
    }
    indent.unwrap_or("").to_string()
}

/// Removes the longest common leading whitespace from every line.
///
/// Lines consisting solely of whitespace are ignored when computing the
/// common prefix and normalize to empty lines in the output.
#[must_use]
pub fn dedent(text: &str) -> String {
    let mut prefix: Option<String> = None;
    for line in text.lines() {
        let stripped = line.trim_start();
        if stripped.is_empty() {
            continue;
        }
        let lead = &line[..line.len() - stripped.len()];
        prefix = Some(match prefix {
            None => lead.to_string(),
            Some(current) => current
                .chars()
                .zip(lead.chars())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    let prefix = prefix.unwrap_or_default();

    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim_start().is_empty() {
            out.push("");
        } else {
            out.push(line.strip_prefix(&prefix).unwrap_or(line));
        }
    }
    out.join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "def wrapper():\n    # EVOLVE-BLOCK-START sample\n    value = 1\n    return value\n    # EVOLVE-BLOCK-END\n";

    #[test]
    fn test_extract_records_indent_and_normalized_content() {
        let blocks = extract_blocks(SAMPLE);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.name, "sample");
        assert_eq!(block.indent, "    ");
        assert!(block.content.starts_with("    "));
        assert_eq!(block.normalized_content(), "value = 1\nreturn value");
    }

    #[test]
    fn test_extract_marker_lines() {
        let blocks = extract_blocks(SAMPLE);
        assert_eq!(blocks[0].start_line, 1);
        assert_eq!(blocks[0].end_line, 4);
    }

    #[test]
    fn test_extract_unnamed_block_gets_positional_name() {
        let source = "# EVOLVE-BLOCK-START\nx = 1\n# EVOLVE-BLOCK-END\n";
        let blocks = extract_blocks(source);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].name, "block_0");
    }

    #[test]
    fn test_extract_multiple_blocks_in_source_order() {
        let source = "# EVOLVE-BLOCK-START first\na\n# EVOLVE-BLOCK-END\nmid\n# EVOLVE-BLOCK-START second\nb\n# EVOLVE-BLOCK-END\n";
        let names: Vec<String> = extract_blocks(source).into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_extract_unterminated_block_yields_nothing() {
        let source = "# EVOLVE-BLOCK-START lonely\nx = 1\n";
        assert!(extract_blocks(source).is_empty());
    }

    #[test]
    fn test_replace_reindents_new_content() {
        let blocks = extract_blocks(SAMPLE);
        let updated = replace_block(SAMPLE, &blocks[0], "return sorted(values)\n");
        let expected = "def wrapper():\n    # EVOLVE-BLOCK-START sample\n    return sorted(values)\n    # EVOLVE-BLOCK-END\n";
        assert_eq!(updated, expected);
    }

    #[test]
    fn test_replace_preserves_marker_lines() {
        let blocks = extract_blocks(SAMPLE);
        let updated = replace_block(SAMPLE, &blocks[0], "pass");
        let marker_lines: Vec<&str> = updated
            .lines()
            .filter(|l| l.trim().starts_with("# EVOLVE-BLOCK"))
            .collect();
        assert_eq!(
            marker_lines,
            vec!["    # EVOLVE-BLOCK-START sample", "    # EVOLVE-BLOCK-END"]
        );
    }

    #[test]
    fn test_replace_keeps_empty_lines_empty() {
        let source = "# EVOLVE-BLOCK-START gap\n    a = 1\n\n    b = 2\n# EVOLVE-BLOCK-END\n";
        let blocks = extract_blocks(source);
        let updated = replace_block(source, &blocks[0], &blocks[0].content);
        assert_eq!(updated, source);
    }

    #[test]
    fn test_replace_roundtrip_is_identity() {
        let blocks = extract_blocks(SAMPLE);
        let updated = replace_block(SAMPLE, &blocks[0], &blocks[0].content);
        assert_eq!(updated, SAMPLE);
    }

    #[test]
    fn test_dedent_ignores_whitespace_only_lines() {
        assert_eq!(dedent("    a\n      \n    b"), "a\n\nb");
    }

    #[test]
    fn test_dedent_mixed_depths() {
        assert_eq!(dedent("    a\n        b"), "a\n    b");
    }

    proptest! {
        /// Re-inserting extracted content reproduces the source exactly
        /// (up to the single trailing newline the rewriter guarantees).
        #[test]
        fn roundtrip_preserves_source(
            body in proptest::collection::vec("[ ]{0,8}[a-z][a-z0-9_ ]{0,12}|", 0..6),
            indent in "[ ]{0,8}",
        ) {
            let mut source = String::new();
            source.push_str(&format!("{indent}{BLOCK_START} region\n"));
            for line in &body {
                source.push_str(line);
                source.push('\n');
            }
            source.push_str(&format!("{indent}{BLOCK_END}\n"));

            let blocks = extract_blocks(&source);
            prop_assert_eq!(blocks.len(), 1);
            let updated = replace_block(&source, &blocks[0], &blocks[0].content);
            prop_assert_eq!(updated, source);
        }
    }
}
