//! Page metadata lookups.
//!
//! The indexer does not own pages; it only sees snapshots. A [`PageDirectory`]
//! answers whether a page still exists (so jobs for deleted pages can be
//! dropped) and what its title is (to decorate search results).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::document::{Document, Node};
use crate::extractor::normalize_whitespace;

/// Source of page existence and titles.
#[async_trait]
pub trait PageDirectory: Send + Sync {
    /// Whether the page still exists.
    async fn page_exists(&self, page_id: &str) -> bool;

    /// Display title of the page, if it has one.
    async fn title(&self, page_id: &str) -> Option<String>;
}

/// Directory of `<page_id>.json` files on disk.
///
/// The title of a page is the text of its first heading.
#[derive(Debug, Clone)]
pub struct FsPageDirectory {
    root: PathBuf,
}

impl FsPageDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a page's file.
    pub fn page_path(&self, page_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", page_id))
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PageDirectory for FsPageDirectory {
    async fn page_exists(&self, page_id: &str) -> bool {
        tokio::fs::metadata(self.page_path(page_id))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn title(&self, page_id: &str) -> Option<String> {
        let raw = tokio::fs::read_to_string(self.page_path(page_id)).await.ok()?;
        match Document::parse(&raw) {
            Ok(doc) => first_heading(&doc),
            Err(e) => {
                debug!("No title for {}: {}", page_id, e);
                None
            }
        }
    }
}

/// Text of the first `heading` node in document order.
pub fn first_heading(doc: &Document) -> Option<String> {
    let mut stack: Vec<&Node> = doc.roots.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if node.kind() == "heading" {
            let title = normalize_whitespace(&plain_text(node));
            if !title.is_empty() {
                return Some(title);
            }
        }
        stack.extend(node.children().iter().rev());
    }
    None
}

fn plain_text(node: &Node) -> String {
    let mut text = String::new();
    let mut stack = vec![node];
    while let Some(node) = stack.pop() {
        match node {
            Node::Text(t) => text.push_str(t),
            Node::PageRef { label: Some(l), .. } => text.push_str(l),
            _ => {}
        }
        stack.extend(node.children().iter().rev());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_heading() {
        let doc = Document::new(vec![Node::container(
            "doc",
            None,
            vec![
                Node::container("paragraph", Some("p"), vec![Node::text("intro")]),
                Node::container(
                    "heading",
                    Some("h"),
                    vec![Node::text("Weekly "), Node::text("notes")],
                ),
                Node::container("heading", Some("h2"), vec![Node::text("Later")]),
            ],
        )]);
        assert_eq!(first_heading(&doc), Some("Weekly notes".to_string()));
    }

    #[tokio::test]
    async fn test_fs_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("p1.json"),
            r#"{"type":"doc","content":[{"type":"heading","id":"h","content":[{"type":"text","text":"Groceries"}]}]}"#,
        )
        .unwrap();

        let directory = FsPageDirectory::new(dir.path());
        assert!(directory.page_exists("p1").await);
        assert!(!directory.page_exists("p2").await);
        assert_eq!(directory.title("p1").await, Some("Groceries".to_string()));
        assert_eq!(directory.title("p2").await, None);
    }
}
