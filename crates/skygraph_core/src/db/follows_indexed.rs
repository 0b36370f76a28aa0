/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Backfill bookkeeping per actor. No row means "never backfilled",
//! `last_follow = -1` means a backfill is in flight, `>= 0` means fully
//! indexed up to that follow id.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS follows_indexed (
    follow_indexed_id INTEGER PRIMARY KEY,
    actor_id INTEGER NOT NULL UNIQUE,
    cursor TEXT DEFAULT '',
    last_follow INTEGER DEFAULT -1
);
CREATE INDEX IF NOT EXISTS idx_follow_indexed_last_follow
ON follows_indexed(last_follow);
";

#[derive(Debug, Clone, Default)]
pub struct FollowIndexedRow {
    pub follow_indexed_id: i64,
    pub actor_id: i64,
    pub created: bool,
    pub cursor: String,
    pub last_follow: i64,
}

impl FollowIndexedRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(FollowIndexedRow {
            follow_indexed_id: row.get("follow_indexed_id")?,
            actor_id: row.get("actor_id")?,
            created: false,
            cursor: row.get("cursor")?,
            last_follow: row.get("last_follow")?,
        })
    }
}

pub struct FollowsIndexedTable {
    conn: Mutex<Connection>,
}

impl FollowsIndexedTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("follows-indexed.db"), SCHEMA, opts)?;
        Ok(FollowsIndexedTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "follow_indexed_id"
    }

    pub fn find_by_actor_id(&self, actor_id: i64) -> Result<Option<FollowIndexedRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT * FROM follows_indexed WHERE actor_id = ?1")?;
        stmt.query_row(params![actor_id], FollowIndexedRow::from_row)
            .optional()
            .context("find follows index")
    }

    pub fn find_or_create_by_actor_id(&self, actor_id: i64) -> Result<FollowIndexedRow> {
        if let Some(row) = self.find_by_actor_id(actor_id)? {
            return Ok(row);
        }

        let inserted = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO follows_indexed (actor_id, last_follow) VALUES (?1, -1)",
            )?;
            let affected = stmt.execute(params![actor_id]).context("create follows index")?;
            if affected > 0 {
                Some(conn.last_insert_rowid())
            } else {
                None
            }
        };

        match inserted {
            Some(follow_indexed_id) => Ok(FollowIndexedRow {
                follow_indexed_id,
                actor_id,
                created: true,
                cursor: String::new(),
                last_follow: -1,
            }),
            None => Ok(self
                .find_by_actor_id(actor_id)?
                .unwrap_or_default()),
        }
    }

    pub fn set_last_follow(&self, actor_id: i64, follow_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("UPDATE follows_indexed SET last_follow = ?1 WHERE actor_id = ?2")?
            .execute(params![follow_id, actor_id])
            .context("set last follow")?;
        Ok(())
    }

    pub fn set_cursor(&self, actor_id: i64, cursor: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("UPDATE follows_indexed SET cursor = ?1 WHERE actor_id = ?2")?
            .execute(params![cursor, actor_id])
            .context("set follows cursor")?;
        Ok(())
    }

    pub fn select_unindexed(&self, limit: usize) -> Result<Vec<FollowIndexedRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM follows_indexed WHERE last_follow = -1 \
             ORDER BY follow_indexed_id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], FollowIndexedRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select unindexed follows")?;
        Ok(rows)
    }
}
