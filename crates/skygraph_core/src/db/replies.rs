/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, placeholders, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS replies (
    reply_id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL,
    actor_id INTEGER NOT NULL,
    parent_id INTEGER NOT NULL,
    parent_actor_id INTEGER NOT NULL,
    UNIQUE(post_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_replies_parent_actor_id
ON replies(parent_actor_id, post_id DESC);
CREATE INDEX IF NOT EXISTS idx_replies_parent_actor_actor_id
ON replies(parent_actor_id, actor_id, post_id DESC);
CREATE INDEX IF NOT EXISTS idx_replies_actor_id
ON replies(actor_id, post_id DESC);
";

#[derive(Debug, Clone, Default)]
pub struct ReplyRow {
    pub reply_id: i64,
    pub post_id: i64,
    pub actor_id: i64,
    pub parent_id: i64,
    pub parent_actor_id: i64,
}

impl ReplyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ReplyRow {
            reply_id: row.get("reply_id")?,
            post_id: row.get("post_id")?,
            actor_id: row.get("actor_id")?,
            parent_id: row.get("parent_id")?,
            parent_actor_id: row.get("parent_actor_id")?,
        })
    }
}

pub struct RepliesTable {
    conn: Mutex<Connection>,
}

impl RepliesTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("replies.db"), SCHEMA, opts)?;
        Ok(RepliesTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "reply_id"
    }

    pub fn insert_reply(&self, row: &ReplyRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO replies (post_id, actor_id, parent_id, parent_actor_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            row.post_id,
            row.actor_id,
            row.parent_id,
            row.parent_actor_id
        ])
        .context("insert reply")?;
        Ok(())
    }

    pub fn find_by_post_id(&self, post_id: i64) -> Result<Option<ReplyRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM replies WHERE post_id = ?1")?;
        stmt.query_row(params![post_id], ReplyRow::from_row)
            .optional()
            .context("find reply by post")
    }

    /// Replies to the actor's posts, authored by someone else.
    pub fn select_to_actor(&self, actor_id: i64, before: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM replies \
             WHERE parent_actor_id = ?1 AND actor_id != ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![actor_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select replies to actor")?;
        Ok(ids)
    }

    /// Reply post ids authored by any of the given actors.
    pub fn select_from_actor_ids(
        &self,
        actor_ids: &[i64],
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        if actor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT post_id FROM replies WHERE post_id < ? AND actor_id IN ({}) \
             ORDER BY post_id DESC LIMIT ?",
            placeholders(actor_ids.len()),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let params = std::iter::once(before)
            .chain(actor_ids.iter().copied())
            .chain(std::iter::once(limit as i64));
        let ids = stmt
            .query_map(params_from_iter(params), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select replies from actors")?;
        Ok(ids)
    }

    /// Replies by one author to one parent actor.
    pub fn select_by_author_to_actor(
        &self,
        author_id: i64,
        parent_actor_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM replies \
             WHERE actor_id = ?1 AND parent_actor_id = ?2 AND post_id < ?3 \
             ORDER BY post_id DESC LIMIT ?4",
        )?;
        let ids = stmt
            .query_map(
                params![author_id, parent_actor_id, before, limit as i64],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select replies by author")?;
        Ok(ids)
    }

    pub fn delete_reply(&self, reply_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM replies WHERE reply_id = ?1")?
            .execute(params![reply_id])
            .context("delete reply")?;
        Ok(())
    }

    pub fn any_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM replies WHERE post_id > 0 AND post_id <= ?1 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe replies")?
            .is_some())
    }

    pub fn delete_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM replies WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune replies");
        x
    }
}
