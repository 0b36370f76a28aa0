/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, placeholders, OpenOptions};

/// `subject_id` refers to an actor.
pub const ACCOUNT_LABEL: i64 = 0;
/// `subject_id` refers to a post.
pub const POST_LABEL: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS custom_labels (
    custom_label_id INTEGER PRIMARY KEY,
    subject_type INTEGER,
    subject_id INTEGER,
    created_at INTEGER,
    label_id INTEGER,
    neg INTEGER DEFAULT 0,
    cbor BLOB,
    UNIQUE(label_id, subject_type, subject_id, neg) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_custom_label_created_at
ON custom_labels(created_at);
CREATE INDEX IF NOT EXISTS idx_custom_label_label_id_created_at
ON custom_labels(label_id, created_at);
CREATE INDEX IF NOT EXISTS idx_custom_label_label_id_neg
ON custom_labels(label_id, neg);
";

#[derive(Debug, Clone, Default)]
pub struct CustomLabelRow {
    pub custom_label_id: i64,
    pub subject_type: i64,
    pub subject_id: i64,
    pub created_at: i64,
    pub label_id: i64,
    pub neg: i64,
    pub cbor: Vec<u8>,
}

impl CustomLabelRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CustomLabelRow {
            custom_label_id: row.get("custom_label_id")?,
            subject_type: row.get("subject_type")?,
            subject_id: row.get("subject_id")?,
            created_at: row.get("created_at")?,
            label_id: row.get("label_id")?,
            neg: row.get("neg")?,
            cbor: row.get("cbor")?,
        })
    }
}

pub struct CustomLabelsTable {
    conn: Mutex<Connection>,
}

impl CustomLabelsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("custom-labels.db"), SCHEMA, opts)?;
        Ok(CustomLabelsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "custom_label_id"
    }

    pub fn insert_labels(&self, rows: &[CustomLabelRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO custom_labels \
                 (label_id, created_at, neg, subject_type, subject_id, cbor) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.label_id,
                    row.created_at,
                    row.neg,
                    row.subject_type,
                    row.subject_id,
                    row.cbor
                ])
                .context("insert custom label")?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn select_labels(&self, since: i64, limit: usize) -> Result<Vec<CustomLabelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM custom_labels WHERE custom_label_id > ?1 \
             ORDER BY custom_label_id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since, limit as i64], CustomLabelRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select custom labels")?;
        Ok(rows)
    }

    pub fn select_by_label_and_neg(
        &self,
        label_id: i64,
        neg: bool,
        since: i64,
        limit: usize,
    ) -> Result<Vec<CustomLabelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM custom_labels \
             WHERE label_id = ?1 AND neg = ?2 AND custom_label_id > ?3 \
             ORDER BY custom_label_id ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![label_id, neg as i64, since, limit as i64],
                CustomLabelRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select custom labels by name")?;
        Ok(rows)
    }

    /// Latest non-negated labels of one name on posts, descending, for
    /// the bangers feed.
    pub fn select_post_labels_desc(
        &self,
        label_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<CustomLabelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM custom_labels \
             WHERE label_id = ?1 AND neg = 0 AND subject_type = ?2 AND custom_label_id < ?3 \
             ORDER BY custom_label_id DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![label_id, POST_LABEL, before, limit as i64],
                CustomLabelRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select post custom labels")?;
        Ok(rows)
    }

    /// Which of the given subjects carry a positive label of this name.
    pub fn select_labeled_subjects(
        &self,
        label_id: i64,
        subject_type: i64,
        subject_ids: &[i64],
    ) -> Result<Vec<i64>> {
        if subject_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT subject_id FROM custom_labels \
             WHERE neg = 0 AND label_id = ? AND subject_type = ? AND subject_id IN ({}) \
             ORDER BY custom_label_id DESC",
            placeholders(subject_ids.len()),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let params = [label_id, subject_type]
            .into_iter()
            .chain(subject_ids.iter().copied());
        let ids = stmt
            .query_map(params_from_iter(params), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select labeled subjects")?;
        Ok(ids)
    }

    pub fn delete_positive_for_subjects(
        &self,
        label_id: i64,
        subject_type: i64,
        subject_ids: &[i64],
    ) -> Result<usize> {
        if subject_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM custom_labels \
             WHERE label_id = ? AND neg = 0 AND subject_type = ? AND subject_id IN ({})",
            placeholders(subject_ids.len()),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let params = [label_id, subject_type]
            .into_iter()
            .chain(subject_ids.iter().copied());
        stmt.execute(params_from_iter(params))
            .context("delete positive custom labels")
    }

    pub fn last_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT custom_label_id FROM custom_labels \
             ORDER BY custom_label_id DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row([], |row| row.get(0))
            .optional()
            .context("select last custom label id")?
            .unwrap_or(0))
    }

    pub fn delete_created_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM custom_labels WHERE created_at < ?1")?
            .execute(params![cutoff])
            .context("prune custom labels");
        x
    }
}
