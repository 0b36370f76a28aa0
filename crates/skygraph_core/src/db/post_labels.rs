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
CREATE TABLE IF NOT EXISTS post_labels (
    post_label_id INTEGER PRIMARY KEY,
    post_id INTEGER,
    label_id INTEGER,
    UNIQUE(post_id, label_id) ON CONFLICT IGNORE
);
CREATE INDEX IF NOT EXISTS idx_label_post_id
ON post_labels(label_id, post_id DESC);
";

pub struct PostLabelsTable {
    conn: Mutex<Connection>,
}

impl PostLabelsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("post-labels.db"), SCHEMA, opts)?;
        Ok(PostLabelsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "post_label_id"
    }

    pub fn insert_post_labels(&self, post_id: i64, label_ids: &[i64]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("INSERT INTO post_labels (post_id, label_id) VALUES (?1, ?2)")?;
        for label_id in label_ids {
            stmt.execute(params![post_id, label_id])
                .context("insert post label")?;
        }
        Ok(())
    }

    pub fn select_labels_by_post_id(&self, post_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT label_id FROM post_labels WHERE post_id = ?1 ORDER BY label_id ASC",
        )?;
        let ids = stmt
            .query_map(params![post_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select labels for post")?;
        Ok(ids)
    }

    pub fn select_posts_by_label(
        &self,
        label_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM post_labels WHERE label_id = ?1 AND post_id < ?2 \
             ORDER BY post_id DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![label_id, before, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select posts by label")?;
        Ok(ids)
    }

    pub fn delete_by_post_id(&self, post_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM post_labels WHERE post_id = ?1")?
            .execute(params![post_id])
            .context("delete post labels")?;
        Ok(())
    }

    pub fn any_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM post_labels WHERE post_id > 0 AND post_id <= ?1 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![cutoff_post_id], |_| Ok(()))
            .optional()
            .context("probe post labels")?
            .is_some())
    }

    pub fn delete_for_posts_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM post_labels WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune post labels");
        x
    }
}
