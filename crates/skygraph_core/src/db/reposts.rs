/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::uri::{dehydrate_uri, hydrate_uri};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, OpenOptions};

pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reposts (
    repost_id INTEGER PRIMARY KEY,
    uri TEXT NOT NULL UNIQUE,
    actor_id INTEGER DEFAULT 0,
    subject_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reposts_subject_id
ON reposts(subject_id);
";

#[derive(Debug, Clone, Default)]
pub struct RepostRow {
    pub repost_id: i64,
    pub actor_id: i64,
    pub dehydrated_uri: String,
    pub uri: String,
    pub subject_id: i64,
    pub created_at: i64,
}

impl RepostRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let dehydrated: String = row.get("uri")?;
        Ok(RepostRow {
            repost_id: row.get("repost_id")?,
            actor_id: row.get("actor_id")?,
            uri: hydrate_uri(&dehydrated, REPOST_COLLECTION),
            dehydrated_uri: dehydrated,
            subject_id: row.get("subject_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub struct RepostsTable {
    conn: Mutex<Connection>,
}

impl RepostsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("reposts.db"), SCHEMA, opts)?;
        Ok(RepostsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "repost_id"
    }

    pub fn insert_repost(&self, row: &RepostRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(
            "INSERT INTO reposts (actor_id, uri, subject_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            row.actor_id,
            row.dehydrated_uri,
            row.subject_id,
            row.created_at
        ])
        .context("insert repost")?;
        Ok(())
    }

    pub fn find_by_uri(&self, uri: &str) -> Result<Option<RepostRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM reposts WHERE uri = ?1")?;
        stmt.query_row(params![dehydrate_uri(uri)], RepostRow::from_row)
            .optional()
            .context("find repost by uri")
    }

    pub fn delete_repost(&self, repost_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM reposts WHERE repost_id = ?1")?
            .execute(params![repost_id])
            .context("delete repost")?;
        Ok(())
    }

    pub fn any_for_subjects_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM reposts WHERE subject_id > 0 AND subject_id <= ?1 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe reposts")?
            .is_some())
    }

    pub fn delete_for_subjects_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM reposts WHERE subject_id > 0 AND subject_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune reposts");
        x
    }
}
