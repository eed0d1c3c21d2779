//! Backlink graph between pages.
//!
//! Every `pageRef` and `blockRef` node in a page becomes an outgoing edge of
//! that page. The edge set of a page is replaced on every save, but only the
//! difference is written: unchanged edges are never touched, so the table
//! does not churn when a page is saved without link changes.
//!
//! Edges are stored in `link_edges` with the target unit id as `''` for
//! whole-page references, which keeps the primary key a plain triple.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{now_millis, Database};
use crate::delta::{compute_set_delta, Delta};
use crate::document::{Document, Node};
use crate::error::StoreError;
use crate::extractor::{truncate_chars, TreeExtractor};

/// Longest snippet kept for an edge.
pub const SNIPPET_MAX_CHARS: usize = 120;

/// A reference from one page to another page or to one of its units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    /// Page containing the reference
    pub source_page_id: String,
    /// Referenced page
    pub target_page_id: String,
    /// Referenced unit, `None` for a whole-page reference
    pub target_unit_id: Option<String>,
    /// Context shown next to the backlink
    pub snippet: String,
}

impl LinkEdge {
    fn target_key(&self) -> TargetKey {
        (
            self.target_page_id.clone(),
            self.target_unit_id.clone().unwrap_or_default(),
        )
    }
}

/// `(target_page_id, target_unit_id or '')` within one source page.
pub type TargetKey = (String, String);

/// Pulls link edges out of a document.
#[derive(Debug, Clone, Default)]
pub struct LinkExtractor {
    units: TreeExtractor,
}

impl LinkExtractor {
    /// Create a link extractor. `units` decides which nodes count as the
    /// enclosing unit of a block reference.
    pub fn new(units: TreeExtractor) -> Self {
        Self { units }
    }

    /// All distinct outgoing edges of `doc`, in document order.
    ///
    /// A block reference without its own snippet borrows the text of the
    /// unit it sits in. Repeated references to the same target collapse to
    /// the first one.
    pub fn extract(&self, source_page_id: &str, doc: &Document) -> Vec<LinkEdge> {
        let unit_texts: HashMap<String, String> = self
            .units
            .unit_texts(doc)
            .into_iter()
            .map(|u| (u.unit_id, u.text))
            .collect();

        let mut edges = Vec::new();
        let mut seen: HashSet<TargetKey> = HashSet::new();
        let mut owners: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&Node, Option<&str>)> =
            doc.roots.iter().rev().map(|node| (node, None)).collect();

        while let Some((node, owner)) = stack.pop() {
            let edge = match node {
                Node::Container { kind, id, children } => {
                    let mut child_owner = owner;
                    if self.units.is_indexable(kind) {
                        if let Some(id) = id {
                            if owners.insert(id.as_str()) {
                                child_owner = Some(id.as_str());
                            }
                        }
                    }
                    for child in children.iter().rev() {
                        stack.push((child, child_owner));
                    }
                    continue;
                }
                Node::Text(_) => continue,
                Node::PageRef { page_id, label } => LinkEdge {
                    source_page_id: source_page_id.to_string(),
                    target_page_id: page_id.clone(),
                    target_unit_id: None,
                    snippet: label.clone().unwrap_or_default(),
                },
                Node::BlockRef {
                    page_id,
                    block_id,
                    snippet,
                } => {
                    let snippet = snippet
                        .clone()
                        .or_else(|| owner.and_then(|o| unit_texts.get(o).cloned()))
                        .unwrap_or_default();
                    LinkEdge {
                        source_page_id: source_page_id.to_string(),
                        target_page_id: page_id.clone(),
                        target_unit_id: Some(block_id.clone()),
                        snippet: truncate_chars(&snippet, SNIPPET_MAX_CHARS),
                    }
                }
            };

            if seen.insert(edge.target_key()) {
                edges.push(edge);
            }
        }

        edges
    }
}

/// SQLite-backed edge table.
#[derive(Clone)]
pub struct LinkStore {
    db: Database,
}

impl LinkStore {
    /// Create a link store on top of an open database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replace the outgoing edges of `source_page_id` with `edges`.
    ///
    /// Runs in one transaction and issues only the inserts and deletes the
    /// difference needs, plus snippet updates for kept edges whose context
    /// changed. Returns the applied add/remove delta.
    pub fn sync_page(
        &self,
        source_page_id: &str,
        edges: &[LinkEdge],
    ) -> Result<Delta<TargetKey>, StoreError> {
        let current: BTreeMap<TargetKey, &str> = edges
            .iter()
            .filter(|e| e.source_page_id == source_page_id)
            .map(|e| (e.target_key(), e.snippet.as_str()))
            .collect();

        let delta = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let previous: BTreeMap<TargetKey, String> = {
                let mut stmt = tx.prepare(
                    "SELECT target_page_id, target_unit_id, snippet FROM link_edges
                     WHERE source_page_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![source_page_id], |row| {
                        Ok(((row.get(0)?, row.get(1)?), row.get(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<(TargetKey, String)>>>()?;
                rows.into_iter().collect()
            };

            let previous_keys: BTreeSet<TargetKey> = previous.keys().cloned().collect();
            let current_keys: BTreeSet<TargetKey> = current.keys().cloned().collect();
            let mut delta = compute_set_delta(&previous_keys, &current_keys);

            for (page, unit) in &delta.to_remove {
                tx.execute(
                    "DELETE FROM link_edges
                     WHERE source_page_id = ?1 AND target_page_id = ?2 AND target_unit_id = ?3",
                    params![source_page_id, page, unit],
                )?;
            }

            let now = now_millis();
            for key in &delta.to_add {
                tx.execute(
                    "INSERT INTO link_edges
                        (source_page_id, target_page_id, target_unit_id, snippet, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![source_page_id, &key.0, &key.1, current[key], now],
                )?;
            }

            for (key, snippet) in &current {
                if let Some(old) = previous.get(key) {
                    if old != snippet {
                        tx.execute(
                            "UPDATE link_edges SET snippet = ?4
                             WHERE source_page_id = ?1 AND target_page_id = ?2
                               AND target_unit_id = ?3",
                            params![source_page_id, &key.0, &key.1, snippet],
                        )?;
                        delta.to_update.push(key.clone());
                    }
                }
            }

            tx.commit()?;
            Ok(delta)
        })?;

        debug!(
            "Synced links of {}: +{} -{} ~{}",
            source_page_id,
            delta.to_add.len(),
            delta.to_remove.len(),
            delta.to_update.len()
        );
        Ok(delta)
    }

    /// Pages referencing `target_page_id`, ordered by source page then unit.
    pub fn backlinks(&self, target_page_id: &str) -> Result<Vec<LinkEdge>, StoreError> {
        self.query_edges(
            "SELECT source_page_id, target_page_id, target_unit_id, snippet FROM link_edges
             WHERE target_page_id = ?1
             ORDER BY source_page_id, target_unit_id",
            target_page_id,
        )
    }

    /// Edges leaving `source_page_id`, ordered by target page then unit.
    pub fn outgoing(&self, source_page_id: &str) -> Result<Vec<LinkEdge>, StoreError> {
        self.query_edges(
            "SELECT source_page_id, target_page_id, target_unit_id, snippet FROM link_edges
             WHERE source_page_id = ?1
             ORDER BY target_page_id, target_unit_id",
            source_page_id,
        )
    }

    /// Drop every outgoing edge of a page. Returns the number removed.
    pub fn remove_source(&self, source_page_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM link_edges WHERE source_page_id = ?1",
                params![source_page_id],
            )
        })
    }

    /// Total number of edges.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM link_edges", [], |r| r.get(0))
        })?;
        Ok(count as usize)
    }

    fn query_edges(&self, sql: &str, page_id: &str) -> Result<Vec<LinkEdge>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let edges = stmt
                .query_map(params![page_id], |row| {
                    let unit: String = row.get(2)?;
                    Ok(LinkEdge {
                        source_page_id: row.get(0)?,
                        target_page_id: row.get(1)?,
                        target_unit_id: if unit.is_empty() { None } else { Some(unit) },
                        snippet: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(edges)
        })
    }
}
