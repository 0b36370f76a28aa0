/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS labels (
    label_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
";

#[derive(Debug, Clone, Default)]
pub struct LabelRow {
    pub label_id: i64,
    pub name: String,
}

impl LabelRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(LabelRow {
            label_id: row.get("label_id")?,
            name: row.get("name")?,
        })
    }
}

pub struct LabelsTable {
    conn: Mutex<Connection>,
    cache: Mutex<LruCache<String, LabelRow>>,
}

impl LabelsTable {
    pub fn open(dir: &Path, cache_size: usize, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("labels.db"), SCHEMA, opts)?;
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(LabelsTable {
            conn: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "label_id"
    }

    pub fn find_label(&self, name: &str) -> Result<Option<LabelRow>> {
        if let Some(row) = self.cache.lock().unwrap().get(name) {
            return Ok(Some(row.clone()));
        }
        let row = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached("SELECT * FROM labels WHERE name = ?1")?;
            stmt.query_row(params![name], LabelRow::from_row)
                .optional()
                .context("find label")?
        };
        if let Some(row) = &row {
            self.cache.lock().unwrap().put(name.to_string(), row.clone());
        }
        Ok(row)
    }

    pub fn find_label_by_id(&self, label_id: i64) -> Result<Option<LabelRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM labels WHERE label_id = ?1")?;
        stmt.query_row(params![label_id], LabelRow::from_row)
            .optional()
            .context("find label by id")
    }

    pub fn find_or_create_label(&self, name: &str) -> Result<LabelRow> {
        if let Some(row) = self.find_label(name)? {
            return Ok(row);
        }

        let inserted = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare_cached("INSERT OR IGNORE INTO labels (name) VALUES (?1)")?;
            let affected = stmt.execute(params![name]).context("create label")?;
            if affected > 0 {
                Some(conn.last_insert_rowid())
            } else {
                None
            }
        };

        match inserted {
            Some(label_id) => {
                let row = LabelRow {
                    label_id,
                    name: name.to_string(),
                };
                self.cache.lock().unwrap().put(name.to_string(), row.clone());
                Ok(row)
            }
            None => match self.find_label(name)? {
                Some(row) => Ok(row),
                None => bail!("label {name} vanished after insert conflict"),
            },
        }
    }
}
