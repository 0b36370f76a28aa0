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
CREATE TABLE IF NOT EXISTS mentions (
    mention_id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL,
    actor_id INTEGER NOT NULL,
    subject_id INTEGER NOT NULL,
    UNIQUE(subject_id, post_id DESC) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_mentions_post_id
ON mentions(post_id);
CREATE INDEX IF NOT EXISTS idx_actor_mentions_post_id
ON mentions(actor_id, post_id DESC);
";

pub struct MentionsTable {
    conn: Mutex<Connection>,
}

impl MentionsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("mentions.db"), SCHEMA, opts)?;
        Ok(MentionsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "mention_id"
    }

    pub fn insert_mentions(
        &self,
        post_id: i64,
        actor_id: i64,
        mentioned_actor_ids: &[i64],
    ) -> Result<()> {
        if mentioned_actor_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO mentions (post_id, actor_id, subject_id) VALUES (?1, ?2, ?3)",
        )?;
        for subject_id in mentioned_actor_ids {
            stmt.execute(params![post_id, actor_id, subject_id])
                .context("insert mention")?;
        }
        Ok(())
    }

    /// Mentioned actor ids on one post.
    pub fn select_mentions(&self, post_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT subject_id FROM mentions WHERE post_id = ?1 ORDER BY subject_id ASC",
        )?;
        let ids = stmt
            .query_map(params![post_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select mentions for post")?;
        Ok(ids)
    }

    /// Posts mentioning the actor, authored by someone else.
    pub fn select_for_actor(&self, actor_id: i64, before: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM mentions \
             WHERE subject_id = ?1 AND actor_id != ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![actor_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select mentions for actor")?;
        Ok(ids)
    }

    /// Posts by one author mentioning one subject actor.
    pub fn select_by_author_for_subject(
        &self,
        author_id: i64,
        subject_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM mentions \
             WHERE actor_id = ?1 AND subject_id = ?2 AND post_id < ?3 \
             ORDER BY post_id DESC LIMIT ?4",
        )?;
        let ids = stmt
            .query_map(params![author_id, subject_id, before, limit as i64], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select mentions by author")?;
        Ok(ids)
    }

    pub fn delete_by_post_id(&self, post_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM mentions WHERE post_id = ?1")?
            .execute(params![post_id])
            .context("delete mentions")?;
        Ok(())
    }

    pub fn any_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM mentions WHERE post_id > 0 AND post_id <= ?1 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe mentions")?
            .is_some())
    }

    pub fn delete_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM mentions WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune mentions");
        x
    }
}
