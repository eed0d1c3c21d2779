//! Persisted state of indexed units.
//!
//! Each row records the text and fingerprint a unit had when it was last
//! embedded. This is the "previous" side of every semantic delta: a unit is
//! re-embedded only when its current fingerprint differs from the stored one.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{now_millis, Database};
use crate::error::StoreError;

/// A unit as it was last indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedUnit {
    /// Page the unit belongs to
    pub page_id: String,
    /// Stable block id
    pub unit_id: String,
    /// Text that was embedded
    pub text: String,
    /// Fingerprint of `text`
    pub fingerprint: String,
}

/// SQLite-backed store of indexed units.
#[derive(Clone)]
pub struct UnitStore {
    db: Database,
}

impl UnitStore {
    /// Create a unit store on top of an open database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load every unit of a page, keyed by unit id.
    pub fn load_page(&self, page_id: &str) -> Result<HashMap<String, IndexedUnit>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, unit_id, text, fingerprint FROM indexed_units WHERE page_id = ?1",
            )?;
            let units = stmt
                .query_map(params![page_id], row_to_unit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(units
                .into_iter()
                .map(|u| (u.unit_id.clone(), u))
                .collect())
        })
    }

    /// Get a single unit.
    pub fn get(&self, page_id: &str, unit_id: &str) -> Result<Option<IndexedUnit>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT page_id, unit_id, text, fingerprint FROM indexed_units
                 WHERE page_id = ?1 AND unit_id = ?2",
                params![page_id, unit_id],
                row_to_unit,
            )
            .optional()
        })
    }

    /// Insert or replace a unit.
    pub fn upsert(&self, unit: &IndexedUnit) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO indexed_units (page_id, unit_id, text, fingerprint, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(page_id, unit_id) DO UPDATE SET
                    text = excluded.text,
                    fingerprint = excluded.fingerprint,
                    updated_at = excluded.updated_at",
                params![
                    &unit.page_id,
                    &unit.unit_id,
                    &unit.text,
                    &unit.fingerprint,
                    now_millis()
                ],
            )
        })?;
        Ok(())
    }

    /// Remove a unit. Returns whether it existed.
    pub fn remove(&self, page_id: &str, unit_id: &str) -> Result<bool, StoreError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM indexed_units WHERE page_id = ?1 AND unit_id = ?2",
                params![page_id, unit_id],
            )
        })?;
        Ok(removed > 0)
    }

    /// Remove every unit of a page. Returns the number removed.
    pub fn remove_page(&self, page_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM indexed_units WHERE page_id = ?1",
                params![page_id],
            )
        })
    }

    /// Total number of indexed units.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM indexed_units", [], |r| r.get(0))
        })?;
        Ok(count as usize)
    }

    /// Number of distinct pages with at least one unit.
    pub fn page_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(DISTINCT page_id) FROM indexed_units",
                [],
                |r| r.get(0),
            )
        })?;
        Ok(count as usize)
    }
}

fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedUnit> {
    Ok(IndexedUnit {
        page_id: row.get(0)?,
        unit_id: row.get(1)?,
        text: row.get(2)?,
        fingerprint: row.get(3)?,
    })
}
