/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS follows (
    follow_id INTEGER PRIMARY KEY,
    rkey TEXT NOT NULL,
    actor_id INTEGER DEFAULT 0,
    subject_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(actor_id, rkey) ON CONFLICT IGNORE,
    UNIQUE(subject_id, actor_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_follows_actor_id
ON follows(actor_id);
CREATE INDEX IF NOT EXISTS idx_follows_actor_subject_id
ON follows(actor_id, subject_id);
";

#[derive(Debug, Clone, Default)]
pub struct FollowRow {
    pub follow_id: i64,
    pub rkey: String,
    pub actor_id: i64,
    pub subject_id: i64,
    pub created_at: i64,
}

impl FollowRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(FollowRow {
            follow_id: row.get("follow_id")?,
            rkey: row.get("rkey")?,
            actor_id: row.get("actor_id")?,
            subject_id: row.get("subject_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Materialized follow set for one actor, extended incrementally as new
/// follow rows land.
#[derive(Debug, Clone, Default)]
pub(crate) struct FollowSetEntry {
    pub follows: Vec<i64>,
    pub last: i64,
}

pub struct FollowsTable {
    conn: Mutex<Connection>,
    pub(crate) cache: Mutex<LruCache<i64, FollowSetEntry>>,
}

impl FollowsTable {
    pub fn open(dir: &Path, cache_size: usize, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("follows.db"), SCHEMA, opts)?;
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(FollowsTable {
            conn: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "follow_id"
    }

    /// Insert a batch; returns the id assigned to the last row (0 when
    /// every row hit a conflict).
    pub fn insert_follows(&self, rows: &[FollowRow]) -> Result<i64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut last_id = 0i64;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO follows (rkey, actor_id, subject_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in rows {
                let affected = stmt
                    .execute(params![row.rkey, row.actor_id, row.subject_id, row.created_at])
                    .context("insert follow")?;
                if affected > 0 {
                    last_id = tx.last_insert_rowid();
                }
            }
        }
        tx.commit()?;
        Ok(last_id)
    }

    pub fn find_by_rkey(&self, actor_id: i64, rkey: &str) -> Result<Option<FollowRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM follows WHERE actor_id = ?1 AND rkey = ?2")?;
        stmt.query_row(params![actor_id, rkey], FollowRow::from_row)
            .optional()
            .context("find follow by rkey")
    }

    pub fn find_last_follow(&self, actor_id: i64) -> Result<Option<FollowRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM follows WHERE actor_id = ?1 ORDER BY follow_id DESC LIMIT 1",
        )?;
        stmt.query_row(params![actor_id], FollowRow::from_row)
            .optional()
            .context("find last follow")
    }

    pub fn select_follows(
        &self,
        actor_id: i64,
        after: i64,
        limit: usize,
    ) -> Result<Vec<FollowRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM follows WHERE actor_id = ?1 AND follow_id > ?2 \
             ORDER BY follow_id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![actor_id, after, limit as i64], FollowRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select follows")?;
        Ok(rows)
    }

    pub fn delete_by_rkey(&self, actor_id: i64, rkey: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM follows WHERE actor_id = ?1 AND rkey = ?2")?
            .execute(params![actor_id, rkey])
            .context("delete follow");
        x
    }
}
