/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dms (
    dm_id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL,
    actor_id INTEGER NOT NULL,
    UNIQUE(actor_id, post_id DESC) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_dm_post_actor_id
ON dms(post_id, actor_id ASC);
";

pub struct DmsTable {
    conn: Mutex<Connection>,
}

impl DmsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("dms.db"), SCHEMA, opts)?;
        Ok(DmsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "dm_id"
    }

    pub fn insert_dms(&self, post_id: i64, actor_ids: &[i64]) -> Result<()> {
        if actor_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("INSERT INTO dms (post_id, actor_id) VALUES (?1, ?2)")?;
        for actor_id in actor_ids {
            stmt.execute(params![post_id, actor_id]).context("insert dm")?;
        }
        Ok(())
    }

    /// Participants on one dm post.
    pub fn select_dms(&self, post_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT actor_id FROM dms WHERE post_id = ?1 ORDER BY actor_id ASC",
        )?;
        let ids = stmt
            .query_map(params![post_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select dms for post")?;
        Ok(ids)
    }

    pub fn select_for_actor(&self, actor_id: i64, before: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM dms WHERE actor_id = ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![actor_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select dms for actor")?;
        Ok(ids)
    }

    pub fn delete_by_post_id(&self, post_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM dms WHERE post_id = ?1")?
            .execute(params![post_id])
            .context("delete dms")?;
        Ok(())
    }

    pub fn any_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM dms WHERE post_id > 0 AND post_id <= ?1 LIMIT 1")?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe dms")?
            .is_some())
    }

    pub fn delete_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM dms WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune dms");
        x
    }
}
