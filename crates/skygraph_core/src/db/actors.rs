/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use lru::LruCache;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use super::{open_table, placeholders, OpenOptions};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS actors (
    actor_id INTEGER PRIMARY KEY,
    birthday INTEGER DEFAULT 0,
    did TEXT NOT NULL UNIQUE,
    blocked INTEGER DEFAULT 0,
    created_at INTEGER DEFAULT 0,
    last_post INTEGER DEFAULT 0,
    posts INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_actors_blocked_birthday
ON actors(blocked, birthday);
CREATE INDEX IF NOT EXISTS idx_actors_created_at
ON actors(created_at);
CREATE INDEX IF NOT EXISTS idx_actors_blocked_created_at
ON actors(blocked, created_at);
";

#[derive(Debug, Clone, Default)]
pub struct ActorRow {
    pub actor_id: i64,
    pub birthday: i64,
    pub blocked: bool,
    pub did: String,
    /// Set when this lookup created the row.
    pub created: bool,
    pub created_at: i64,
    pub last_post: i64,
    pub posts: i64,
}

impl ActorRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ActorRow {
            actor_id: row.get("actor_id")?,
            birthday: row.get("birthday")?,
            blocked: row.get::<_, i64>("blocked")? != 0,
            did: row.get("did")?,
            created: false,
            created_at: row.get("created_at")?,
            last_post: row.get("last_post")?,
            posts: row.get("posts")?,
        })
    }
}

pub struct ActorsTable {
    conn: Mutex<Connection>,
    cache: Mutex<LruCache<String, ActorRow>>,
}

impl ActorsTable {
    pub fn open(dir: &Path, cache_size: usize, opts: &OpenOptions) -> Result<Self> {
        let conn = open_table(&dir.join("actors.db"), SCHEMA, opts)?;
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Ok(ActorsTable {
            conn: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn primary_key_name(&self) -> &'static str {
        "actor_id"
    }

    pub(crate) fn cache_put(&self, row: &ActorRow) {
        self.cache.lock().unwrap().put(row.did.clone(), row.clone());
    }

    pub fn find_actor_by_id(&self, actor_id: i64) -> Result<Option<ActorRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM actors WHERE actor_id = ?1")?;
        stmt.query_row(params![actor_id], ActorRow::from_row)
            .optional()
            .context("find actor by id")
    }

    pub fn find_actors_by_id(&self, actor_ids: &[i64]) -> Result<Vec<ActorRow>> {
        if actor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM actors WHERE actor_id IN ({})",
            placeholders(actor_ids.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(actor_ids.iter()), ActorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find actors by id")?;
        Ok(rows)
    }

    fn query_actor(&self, did: &str) -> Result<Option<ActorRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT * FROM actors WHERE did = ?1")?;
        stmt.query_row(params![did], ActorRow::from_row)
            .optional()
            .context("find actor by did")
    }

    pub fn find_actor(&self, did: &str) -> Result<Option<ActorRow>> {
        if let Some(row) = self.cache.lock().unwrap().get(did) {
            return Ok(Some(row.clone()));
        }
        let row = self.query_actor(did)?;
        if let Some(row) = &row {
            self.cache_put(row);
        }
        Ok(row)
    }

    pub fn find_actors(&self, dids: &[String]) -> Result<Vec<ActorRow>> {
        let mut found = Vec::with_capacity(dids.len());
        let mut lookup = Vec::new();
        {
            let mut cache = self.cache.lock().unwrap();
            for did in dids {
                match cache.get(did) {
                    Some(row) => found.push(row.clone()),
                    None => lookup.push(did.clone()),
                }
            }
        }
        if lookup.is_empty() {
            return Ok(found);
        }

        let rows = {
            let conn = self.conn.lock().unwrap();
            let sql = format!(
                "SELECT * FROM actors WHERE did IN ({})",
                placeholders(lookup.len())
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let x = stmt
                .query_map(params_from_iter(lookup.iter()), ActorRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("find actors by did")?;
            x
        };
        for row in rows {
            self.cache_put(&row);
            found.push(row);
        }
        Ok(found)
    }

    fn create_actor(&self, did: &str) -> Result<ActorRow> {
        let inserted = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare_cached("INSERT OR IGNORE INTO actors (did) VALUES (?1)")?;
            let affected = stmt.execute(params![did]).context("create actor")?;
            if affected > 0 {
                Some(conn.last_insert_rowid())
            } else {
                None
            }
        };

        match inserted {
            Some(actor_id) => Ok(ActorRow {
                actor_id,
                did: did.to_string(),
                created: true,
                ..Default::default()
            }),
            // Lost the insert race; someone else created it.
            None => match self.find_actor(did)? {
                Some(row) => Ok(row),
                None => bail!("actor {did} vanished after insert conflict"),
            },
        }
    }

    pub fn find_or_create_actor(&self, did: &str) -> Result<ActorRow> {
        if did.is_empty() {
            bail!("did cannot be an empty string");
        }
        if let Some(row) = self.find_actor(did)? {
            return Ok(row);
        }
        self.create_actor(did)
    }

    pub fn find_or_create_actors(&self, dids: &[String]) -> Result<Vec<ActorRow>> {
        if dids.len() == 1 {
            return Ok(vec![self.find_or_create_actor(&dids[0])?]);
        }

        let mut found = self.find_actors(dids)?;
        if found.len() == dids.len() {
            return Ok(found);
        }

        let exists: std::collections::HashSet<&str> =
            found.iter().map(|row| row.did.as_str()).collect();
        let missing: Vec<String> = dids
            .iter()
            .filter(|did| !exists.contains(did.as_str()))
            .cloned()
            .collect();
        for did in missing {
            found.push(self.create_actor(&did)?);
        }
        Ok(found)
    }

    pub fn select_actors_with_birthdays_between(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<ActorRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM actors WHERE birthday > ?1 AND birthday < ?2 AND blocked = 0 \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![start, end], ActorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select birthday actors")?;
        Ok(rows)
    }

    pub fn initialize_birthday(&self, did: &str, birthday: i64) -> Result<Option<ActorRow>> {
        let Some(mut actor) = self.query_actor(did)? else {
            return Ok(None);
        };
        {
            let conn = self.conn.lock().unwrap();
            conn.prepare_cached("UPDATE actors SET birthday = ?1 WHERE actor_id = ?2")?
                .execute(params![birthday, actor.actor_id])
                .context("initialize birthday")?;
        }
        actor.birthday = birthday;
        self.cache_put(&actor);
        Ok(Some(actor))
    }

    pub fn select_actors_without_birthdays(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<ActorRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM actors WHERE birthday = 0 AND blocked = 0 AND actor_id > ?1 \
             ORDER BY actor_id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], ActorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select actors without birthdays")?;
        Ok(rows)
    }

    pub fn select_uninitialized_actors(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<ActorRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM actors WHERE created_at = 0 AND blocked = 0 AND actor_id > ?1 \
             ORDER BY actor_id ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], ActorRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("select uninitialized actors")?;
        Ok(rows)
    }

    pub fn increment_posts_count(&self, actor: &mut ActorRow, now: i64) -> Result<()> {
        let affected = {
            let conn = self.conn.lock().unwrap();
            let x = conn
                .prepare_cached(
                    "UPDATE actors SET last_post = ?1, posts = posts + 1 WHERE actor_id = ?2",
                )?
                .execute(params![now, actor.actor_id])
                .context("increment post count")?;
            x
        };
        if affected == 0 {
            warn!(actor_id = actor.actor_id, "post count update found no actor");
            return Ok(());
        }
        actor.last_post = now;
        actor.posts += 1;
        self.cache_put(actor);
        Ok(())
    }

    pub fn decrement_posts_count(&self, actor_id: i64, did: &str) -> Result<()> {
        let affected = {
            let conn = self.conn.lock().unwrap();
            let x = conn
                .prepare_cached("UPDATE actors SET posts = posts - 1 WHERE actor_id = ?1")?
                .execute(params![actor_id])
                .context("decrement post count")?;
            x
        };
        if affected == 0 {
            warn!(actor_id, "post count update found no actor");
            return Ok(());
        }
        if did.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().unwrap();
        if let Some(row) = cache.get_mut(did) {
            if row.posts > 0 {
                row.posts -= 1;
            }
        }
        Ok(())
    }

    /// Write back an initialized actor row (blocked flag, creation epoch,
    /// counters) and refresh the cache.
    pub fn update_actor_info(&self, actor: &ActorRow) -> Result<()> {
        let affected = {
            let conn = self.conn.lock().unwrap();
            let x = conn
                .prepare_cached(
                    "UPDATE actors SET blocked = ?1, created_at = ?2, last_post = ?3, posts = ?4 \
                     WHERE actor_id = ?5",
                )?
                .execute(params![
                    actor.blocked as i64,
                    actor.created_at,
                    actor.last_post,
                    actor.posts,
                    actor.actor_id
                ])
                .context("update actor info")?;
            x
        };
        if affected != 1 {
            bail!("could not find actor with did {}", actor.did);
        }
        self.cache_put(actor);
        Ok(())
    }
}
