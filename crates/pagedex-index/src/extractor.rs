//! Extraction of indexable text units from a document tree.
//!
//! A unit is a text-bearing block (paragraph, heading, list item...) with a
//! stable id. The extractor walks the tree with an explicit stack, gathers the
//! text that belongs to each unit and drops units whose text is too short to
//! be worth embedding. Subtrees of verbatim content such as code blocks are
//! never entered.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{Document, Node};

/// Default node types that form units.
pub const DEFAULT_INDEXABLE_TYPES: &[&str] = &[
    "paragraph",
    "heading",
    "listItem",
    "checkListItem",
    "quote",
    "callout",
    "tableCell",
];

/// Default node types whose subtrees are never indexed.
pub const DEFAULT_SKIP_TYPES: &[&str] = &["codeBlock", "code", "math", "image", "embed"];

/// Default minimum unit length, in characters, after whitespace normalization.
pub const DEFAULT_MIN_TEXT_LEN: usize = 10;

/// Configuration for the tree extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Node types that become units
    pub indexable_types: HashSet<String>,
    /// Node types whose subtrees are skipped entirely
    pub skip_types: HashSet<String>,
    /// Units shorter than this many characters are dropped
    pub min_text_len: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            indexable_types: DEFAULT_INDEXABLE_TYPES.iter().map(|s| s.to_string()).collect(),
            skip_types: DEFAULT_SKIP_TYPES.iter().map(|s| s.to_string()).collect(),
            min_text_len: DEFAULT_MIN_TEXT_LEN,
        }
    }
}

/// A unit of text extracted from a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedUnit {
    /// Stable id of the block the text came from
    pub unit_id: String,
    /// Whitespace-normalized text
    pub text: String,
}

/// Text accumulated for one unit during the walk.
struct UnitBuffer {
    unit_id: String,
    text: String,
}

impl UnitBuffer {
    fn push(&mut self, piece: &str) {
        self.text.push_str(piece);
    }

    fn push_break(&mut self) {
        if !self.text.is_empty() && !self.text.ends_with(char::is_whitespace) {
            self.text.push(' ');
        }
    }
}

/// Walks documents and emits their indexable units.
#[derive(Debug, Clone, Default)]
pub struct TreeExtractor {
    config: ExtractorConfig,
}

impl TreeExtractor {
    /// Create a new extractor.
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Whether a node type forms a unit.
    pub fn is_indexable(&self, kind: &str) -> bool {
        self.config.indexable_types.contains(kind)
    }

    /// Extract all units of `doc`, in document order.
    ///
    /// Text is attributed to the nearest indexable ancestor that has an id.
    /// A nested unit owns its own text; it does not also count towards the
    /// enclosing unit. When two nodes share an id, the first one wins.
    pub fn extract(&self, doc: &Document) -> Vec<ExtractedUnit> {
        let all = self.unit_texts(doc);
        let total = all.len();
        let units: Vec<ExtractedUnit> = all
            .into_iter()
            .filter(|unit| {
                !unit.text.is_empty() && unit.text.chars().count() >= self.config.min_text_len
            })
            .collect();

        debug!(
            "Extracted {} units ({} below threshold)",
            units.len(),
            total - units.len()
        );
        units
    }

    /// Every unit of `doc` with its normalized text, ignoring the length
    /// threshold.
    pub fn unit_texts(&self, doc: &Document) -> Vec<ExtractedUnit> {
        let mut buffers: Vec<UnitBuffer> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&Node, Option<usize>)> =
            doc.roots.iter().rev().map(|node| (node, None)).collect();

        while let Some((node, owner)) = stack.pop() {
            match node {
                Node::Container { kind, id, children } => {
                    if self.config.skip_types.contains(kind) {
                        continue;
                    }
                    if let Some(o) = owner {
                        buffers[o].push_break();
                    }

                    let mut child_owner = owner;
                    if self.is_indexable(kind) {
                        if let Some(id) = id {
                            if seen.insert(id.as_str()) {
                                buffers.push(UnitBuffer {
                                    unit_id: id.clone(),
                                    text: String::new(),
                                });
                                child_owner = Some(buffers.len() - 1);
                            } else {
                                warn!("Duplicate unit id {} in document, keeping first", id);
                            }
                        }
                    }

                    for child in children.iter().rev() {
                        stack.push((child, child_owner));
                    }
                }
                Node::Text(text) => {
                    if let Some(o) = owner {
                        buffers[o].push(text);
                    }
                }
                Node::PageRef { label, .. } => {
                    if let (Some(o), Some(label)) = (owner, label) {
                        buffers[o].push(label);
                    }
                }
                Node::BlockRef { snippet, .. } => {
                    if let (Some(o), Some(snippet)) = (owner, snippet) {
                        buffers[o].push(snippet);
                    }
                }
            }
        }

        buffers
            .into_iter()
            .map(|buffer| ExtractedUnit {
                unit_id: buffer.unit_id,
                text: normalize_whitespace(&buffer.text),
            })
            .collect()
    }
}

/// Collapse whitespace runs into single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `max_chars` characters, marking the cut with an
/// ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para(id: &str, text: &str) -> Node {
        Node::container("paragraph", Some(id), vec![Node::text(text)])
    }

    fn doc(children: Vec<Node>) -> Document {
        Document::new(vec![Node::container("doc", None, children)])
    }

    #[test]
    fn test_extract_simple_paragraphs() {
        let extractor = TreeExtractor::default();
        let units = extractor.extract(&doc(vec![
            para("p1", "The quick brown fox"),
            para("p2", "jumps over the lazy dog"),
        ]));

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_id, "p1");
        assert_eq!(units[0].text, "The quick brown fox");
        assert_eq!(units[1].unit_id, "p2");
    }

    #[test]
    fn test_extract_drops_short_units() {
        let extractor = TreeExtractor::default();
        let units = extractor.extract(&doc(vec![
            para("short", "hi"),
            para("empty", "   "),
            para("long", "long enough to index"),
        ]));

        let ids: Vec<&str> = units.iter().map(|u| u.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["long"]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let extractor = TreeExtractor::new(ExtractorConfig {
            min_text_len: 5,
            ..Default::default()
        });
        let units = extractor.extract(&doc(vec![para("a", "abcd"), para("b", "abcde")]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_id, "b");
    }

    #[test]
    fn test_extract_skips_code_blocks() {
        let extractor = TreeExtractor::default();
        let code = Node::container(
            "codeBlock",
            Some("c1"),
            vec![para("inner", "fn main() { println!(\"hello\"); }")],
        );
        let units = extractor.extract(&doc(vec![code, para("p1", "prose paragraph text")]));

        let ids: Vec<&str> = units.iter().map(|u| u.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["p1"]);
    }

    #[test]
    fn test_nested_units_own_their_text() {
        let extractor = TreeExtractor::default();
        let item = Node::container(
            "listItem",
            Some("li"),
            vec![
                Node::text("list item own text"),
                para("nested", "nested paragraph text"),
            ],
        );
        let units = extractor.extract(&doc(vec![item]));

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_id, "li");
        assert_eq!(units[0].text, "list item own text");
        assert_eq!(units[1].unit_id, "nested");
        assert_eq!(units[1].text, "nested paragraph text");
    }

    #[test]
    fn test_text_concatenated_across_inline_nodes() {
        let extractor = TreeExtractor::default();
        let p = Node::container(
            "paragraph",
            Some("p"),
            vec![
                Node::text("See "),
                Node::PageRef {
                    page_id: "b".to_string(),
                    label: Some("Page B".to_string()),
                },
                Node::text("   for   details"),
            ],
        );
        let units = extractor.extract(&doc(vec![p]));
        assert_eq!(units[0].text, "See Page B for details");
    }

    #[test]
    fn test_unit_without_id_is_not_emitted() {
        let extractor = TreeExtractor::default();
        let p = Node::container("paragraph", None, vec![Node::text("no stable id here")]);
        assert!(extractor.extract(&doc(vec![p])).is_empty());
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let extractor = TreeExtractor::default();
        let units = extractor.extract(&doc(vec![
            para("dup", "first occurrence text"),
            para("dup", "second occurrence text"),
        ]));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "first occurrence text");
    }

    #[test]
    fn test_block_children_are_separated() {
        let extractor = TreeExtractor::default();
        let cell = Node::container(
            "tableCell",
            Some("cell"),
            vec![
                Node::container("line", None, vec![Node::text("first")]),
                Node::container("line", None, vec![Node::text("second")]),
            ],
        );
        let units = extractor.extract(&doc(vec![cell]));
        assert_eq!(units[0].text, "first second");
    }

    #[test]
    fn test_extract_is_repeatable() {
        let extractor = TreeExtractor::default();
        let d = doc(vec![para("p1", "The quick brown fox")]);
        assert_eq!(extractor.extract(&d), extractor.extract(&d));
    }

    #[test]
    fn test_unit_texts_ignore_threshold() {
        let extractor = TreeExtractor::default();
        let units =
            extractor.unit_texts(&doc(vec![para("a", "tiny"), para("b", "long enough text")]));
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].text, "tiny");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exactly", 7), "exactly");
        assert_eq!(truncate_chars("hello world", 6), "hello...");
        // Multi-byte characters are never split
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }

    #[test]
    fn test_deep_tree_does_not_recurse() {
        let extractor = TreeExtractor::default();
        let mut node = para("leaf", "deeply nested paragraph");
        for _ in 0..1_000 {
            node = Node::container("group", None, vec![node]);
        }
        let units = extractor.extract(&Document::new(vec![node]));
        assert_eq!(units.len(), 1);
    }
}
