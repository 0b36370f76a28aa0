/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS quotes (
    quote_id INTEGER PRIMARY KEY,
    post_id INTEGER NOT NULL,
    actor_id INTEGER NOT NULL,
    subject_id INTEGER NOT NULL,
    subject_actor_id INTEGER NOT NULL,
    UNIQUE(post_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_quotes_subject_id
ON quotes(subject_id);
CREATE INDEX IF NOT EXISTS idx_quotes_subject_actor_id
ON quotes(subject_actor_id, post_id DESC);
CREATE INDEX IF NOT EXISTS idx_quotes_subject_actor_actor_id
ON quotes(subject_actor_id, actor_id, post_id DESC);
";

#[derive(Debug, Clone, Default)]
pub struct QuoteRow {
    pub quote_id: i64,
    pub post_id: i64,
    pub actor_id: i64,
    pub subject_id: i64,
    pub subject_actor_id: i64,
}

impl QuoteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(QuoteRow {
            quote_id: row.get("quote_id")?,
            post_id: row.get("post_id")?,
            actor_id: row.get("actor_id")?,
            subject_id: row.get("subject_id")?,
            subject_actor_id: row.get("subject_actor_id")?,
        })
    }
}

pub struct QuotesTable {
    conn: Mutex<Connection>,
}

impl QuotesTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("quotes.db"), SCHEMA, opts)?;
        Ok(QuotesTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "quote_id"
    }

    pub fn insert_quote(&self, row: &QuoteRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO quotes (post_id, actor_id, subject_id, subject_actor_id) \
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            row.post_id,
            row.actor_id,
            row.subject_id,
            row.subject_actor_id
        ])
        .context("insert quote")?;
        Ok(())
    }

    pub fn find_by_post_id(&self, post_id: i64) -> Result<Option<QuoteRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM quotes WHERE post_id = ?1")?;
        stmt.query_row(params![post_id], QuoteRow::from_row)
            .optional()
            .context("find quote by post")
    }

    /// Posts quoting one subject post.
    pub fn select_by_subject(
        &self,
        subject_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM quotes WHERE subject_id = ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![subject_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select quotes by subject")?;
        Ok(ids)
    }

    /// Posts quoting the actor's posts, authored by someone else.
    pub fn select_for_actor(&self, actor_id: i64, before: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM quotes \
             WHERE subject_actor_id = ?1 AND actor_id != ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![actor_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select quotes for actor")?;
        Ok(ids)
    }

    /// Posts by one author quoting one subject actor.
    pub fn select_by_author_for_subject_actor(
        &self,
        author_id: i64,
        subject_actor_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM quotes \
             WHERE actor_id = ?1 AND subject_actor_id = ?2 AND post_id < ?3 \
             ORDER BY post_id DESC LIMIT ?4",
        )?;
        let ids = stmt
            .query_map(
                params![author_id, subject_actor_id, before, limit as i64],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select quotes by author")?;
        Ok(ids)
    }

    pub fn delete_quote(&self, quote_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM quotes WHERE quote_id = ?1")?
            .execute(params![quote_id])
            .context("delete quote")?;
        Ok(())
    }

    pub fn any_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM quotes WHERE post_id > 0 AND post_id <= ?1 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe quotes")?
            .is_some())
    }

    pub fn delete_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM quotes WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune quotes");
        x
    }
}
