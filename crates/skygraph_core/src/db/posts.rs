/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::uri::{dehydrate_uri, hydrate_uri};
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{open_table, placeholders, OpenOptions};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    post_id INTEGER PRIMARY KEY,
    uri TEXT NOT NULL UNIQUE,
    actor_id INTEGER DEFAULT 0,
    created_at INTEGER NOT NULL,
    labeled INTEGER DEFAULT 0,
    likes INTEGER DEFAULT 0,
    quotes INTEGER DEFAULT 0,
    replies INTEGER DEFAULT 0,
    reposts INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_post_created_at
ON posts(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_post_labeled
ON posts(labeled, post_id DESC);
";

#[derive(Debug, Clone, Copy)]
pub enum PostCounter {
    Likes,
    Quotes,
    Replies,
    Reposts,
}

impl PostCounter {
    fn column(self) -> &'static str {
        match self {
            PostCounter::Likes => "likes",
            PostCounter::Quotes => "quotes",
            PostCounter::Replies => "replies",
            PostCounter::Reposts => "reposts",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostRow {
    pub post_id: i64,
    pub dehydrated_uri: String,
    pub uri: String,
    pub actor_id: i64,
    pub created_at: i64,
    pub labeled: i64,
    pub likes: i64,
    pub quotes: i64,
    pub replies: i64,
    pub reposts: i64,
}

impl PostRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let dehydrated: String = row.get("uri")?;
        Ok(PostRow {
            post_id: row.get("post_id")?,
            uri: hydrate_uri(&dehydrated, POST_COLLECTION),
            dehydrated_uri: dehydrated,
            actor_id: row.get("actor_id")?,
            created_at: row.get("created_at")?,
            labeled: row.get("labeled")?,
            likes: row.get("likes")?,
            quotes: row.get("quotes")?,
            replies: row.get("replies")?,
            reposts: row.get("reposts")?,
        })
    }
}

pub struct PostsTable {
    conn: Mutex<Connection>,
}

impl PostsTable {
    pub fn open(dir: &Path, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("posts.db"), SCHEMA, opts)?;
        Ok(PostsTable {
            conn: Mutex::new(conn),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "post_id"
    }

    pub fn insert_post(&self, row: &mut PostRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO posts (uri, actor_id, created_at, labeled) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![
            row.dehydrated_uri,
            row.actor_id,
            row.created_at,
            row.labeled
        ])
        .context("insert post")?;
        if row.post_id == 0 {
            row.post_id = conn.last_insert_rowid();
        }
        Ok(())
    }

    pub fn find_by_uri(&self, uri: &str) -> Result<Option<PostRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM posts WHERE uri = ?1")?;
        stmt.query_row(params![dehydrate_uri(uri)], PostRow::from_row)
            .optional()
            .context("find post by uri")
    }

    pub fn find_by_uris(&self, uris: &[String]) -> Result<Vec<PostRow>> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM posts WHERE uri IN ({})",
            placeholders(uris.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(uris.iter().map(|u| dehydrate_uri(u))),
                PostRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find posts by uris")?;
        Ok(rows)
    }

    pub fn find_post_id_by_uri(&self, uri: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT post_id FROM posts WHERE uri = ?1")?;
        Ok(stmt
            .query_row(params![dehydrate_uri(uri)], |row| row.get(0))
            .optional()
            .context("find post id by uri")?
            .unwrap_or(0))
    }

    pub fn select_posts_by_id(&self, post_ids: &[i64]) -> Result<Vec<PostRow>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM posts WHERE post_id IN ({})",
            placeholders(post_ids.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(post_ids.iter()), PostRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select posts by id")?;
        Ok(rows)
    }

    pub fn select_posts_by_actor_ids(
        &self,
        actor_ids: &[i64],
        before: i64,
        limit: usize,
    ) -> Result<Vec<PostRow>> {
        if actor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM posts WHERE post_id < ? AND actor_id IN ({}) \
             ORDER BY post_id DESC LIMIT ?",
            placeholders(actor_ids.len()),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let params = std::iter::once(before)
            .chain(actor_ids.iter().copied())
            .chain(std::iter::once(limit as i64));
        let rows = stmt
            .query_map(params_from_iter(params), PostRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select posts by actors")?;
        Ok(rows)
    }

    pub fn select_latest(&self, before: i64, limit: usize) -> Result<Vec<PostRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM posts WHERE post_id < ?1 ORDER BY post_id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![before, limit as i64], PostRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select latest posts")?;
        Ok(rows)
    }

    /// Highest post id created at or before the epoch.
    pub fn select_post_id_by_epoch(&self, epoch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM posts WHERE created_at <= ?1 \
             ORDER BY created_at DESC, post_id DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![epoch], |row| row.get(0))
            .optional()
            .context("select post id by epoch")?
            .unwrap_or(0))
    }

    pub fn select_unlabeled(&self, cutoff: i64, limit: usize) -> Result<Vec<PostRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM posts WHERE created_at < ?1 AND labeled = 0 \
             ORDER BY post_id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], PostRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select unlabeled posts")?;
        Ok(rows)
    }

    pub fn mark_labeled(&self, post_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("UPDATE posts SET labeled = 1 WHERE post_id = ?1")?
            .execute(params![post_id])
            .context("mark post labeled")?;
        Ok(())
    }

    pub fn bump_counter(&self, column: PostCounter, post_id: i64, delta: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "UPDATE posts SET {col} = {col} + ?1 WHERE post_id = ?2",
            col = column.column()
        );
        conn.prepare_cached(&sql)?
            .execute(params![delta, post_id])
            .context("bump post counter")?;
        Ok(())
    }

    /// Oldest post ids with `created_at` below the cutoff, ascending.
    pub fn select_prunable(&self, since: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT post_id FROM posts WHERE created_at < ?1 \
             ORDER BY created_at ASC, post_id ASC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![since, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("select prunable posts")?;
        Ok(ids)
    }

    pub fn delete_post(&self, post_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached("DELETE FROM posts WHERE post_id = ?1")?
            .execute(params![post_id])
            .context("delete post")?;
        Ok(())
    }

    pub fn delete_up_to(&self, cutoff_post_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let x = conn
            .prepare_cached("DELETE FROM posts WHERE post_id > 0 AND post_id <= ?1")?
            .execute(params![cutoff_post_id])
            .context("prune posts");
        x
    }
}
