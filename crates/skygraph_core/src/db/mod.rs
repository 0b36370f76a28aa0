/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Embedded storage engine. Every entity table lives in its own SQLite
//! file so the writer lock is per table, and the indexer's multi-table
//! writes fan out as concurrent stages coordinated by deferred cells.

pub mod actors;
pub mod custom_labels;
pub mod dms;
pub mod follows;
pub mod follows_indexed;
pub mod labels;
pub mod likes;
pub mod mentions;
pub mod post_labels;
pub mod posts;
pub mod quotes;
pub mod replies;
pub mod reposts;
pub mod thread_mentions;

use crate::clock::Clock;
use crate::config::Config;
use crate::deferred::Deferred;
use crate::firehose::{FollowEvent, LikeEvent, PostEvent, RepostEvent};
use crate::signing::SigningKey;
use crate::uri::{dehydrate_uri, parse_did, parse_rkey};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Months, TimeZone, Utc};
use regex::Regex;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

pub use actors::{ActorRow, ActorsTable};
pub use custom_labels::{CustomLabelRow, CustomLabelsTable, ACCOUNT_LABEL, POST_LABEL};
pub use dms::DmsTable;
pub use follows::{FollowRow, FollowsTable};
pub use follows_indexed::{FollowIndexedRow, FollowsIndexedTable};
pub use labels::{LabelRow, LabelsTable};
pub use likes::{LikeRow, LikesTable};
pub use mentions::MentionsTable;
pub use post_labels::PostLabelsTable;
pub use posts::{PostCounter, PostRow, PostsTable, POST_COLLECTION};
pub use quotes::{QuoteRow, QuotesTable};
pub use replies::{RepliesTable, ReplyRow};
pub use reposts::{RepostRow, RepostsTable};
pub use thread_mentions::ThreadMentionsTable;

/// The did our labels are issued under.
pub const LABELER_DID: &str = "did:plc:jcce2sa3fgue4wiocvf7e7xj";
/// Administrator whose likes mint `banger` labels.
pub const MARK: &str = "did:plc:wzsilnxf24ehtmmc3gssy5bu";
/// Emoji-only replies pinning this actor's posts are not reply edges.
pub const PIN_TARGET: &str = "did:plc:ikvaup2d6nlir7xfm5vgzvra";
/// Account whose "banger" replies tag the parent post.
pub const BANGER_BOT: &str = "did:plc:nhvvwh2qglcmsbvba7durp7f";
/// These two have their birthday forever.
pub const EVERGREEN_BIRTHDAYS: [&str; 2] = [
    "did:plc:asb3rgscdkkv636buq6blof6",
    "did:plc:6gwchzxwoj7jms5nilauupxq",
];

const SECONDS_PER_WEEK: i64 = 7 * 24 * 60 * 60;

static BANGER_REGEX: OnceLock<Regex> = OnceLock::new();

pub fn banger_regex() -> &'static Regex {
    BANGER_REGEX.get_or_init(|| Regex::new(r"^\W*banger\b").unwrap())
}

static SLOW_QUERY_THRESHOLD_MS: AtomicU64 = AtomicU64::new(1000);

fn profile_query(sql: &str, elapsed: Duration) {
    let threshold = SLOW_QUERY_THRESHOLD_MS.load(Ordering::Relaxed);
    if threshold > 0 && elapsed.as_millis() as u64 >= threshold {
        warn!(elapsed_ms = elapsed.as_millis() as u64, sql, "slow query");
    }
}

#[derive(Clone)]
pub struct OpenOptions {
    pub mmap_size: i64,
    pub synchronous: String,
    pub wal_autocheckpoint: i64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            mmap_size: 0,
            synchronous: "NORMAL".to_string(),
            wal_autocheckpoint: 0,
        }
    }
}

fn db_exists(path: &Path) -> Result<bool> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("stat db {}", path.display())),
        Ok(meta) if meta.is_dir() => {
            bail!("expected db path {} is a directory", path.display())
        }
        Ok(meta) => Ok(meta.len() > 0),
    }
}

/// Open or create one table file. The init sql runs only on creation.
pub(crate) fn open_table(path: &Path, init_sql: &str, opts: &OpenOptions) -> Result<Connection> {
    let exists = db_exists(path)?;
    let mut conn = Connection::open(path)
        .with_context(|| format!("open sqlite file {}", path.display()))?;
    conn.busy_timeout(Duration::from_millis(10_000))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", &opts.synchronous)?;
    if opts.mmap_size > 0 {
        conn.pragma_update(None, "mmap_size", opts.mmap_size)?;
    }
    if opts.wal_autocheckpoint > 0 {
        conn.pragma_update(None, "wal_autocheckpoint", opts.wal_autocheckpoint)?;
    }
    conn.profile(Some(profile_query));
    if !exists {
        conn.execute_batch(init_sql)
            .with_context(|| format!("initialize sqlite db {}", path.display()))?;
    }
    Ok(conn)
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn is_busy_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlite) = cause.downcast_ref::<rusqlite::Error>() {
            if matches!(
                sqlite.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
            ) {
                return true;
            }
        }
    }
    err.to_string().contains("database is locked")
}

/// Retry a write that may hit the engine's busy/locked condition, up to
/// five attempts with no backoff. Other errors propagate immediately.
pub fn retry_busy<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last = None;
    for attempt in 1..=5 {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_error(&err) => {
                warn!(attempt, "database busy: {err:#}");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("retry loop without attempts")))
}

type Stage<'a> = Box<dyn Fn() -> Result<()> + Send + 'a>;

/// Run the stages concurrently, each behind the busy-retry wrapper, and
/// collect every failure.
pub(crate) fn parallelize_with_retries(stages: Vec<Stage<'_>>) -> Vec<anyhow::Error> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = stages
            .into_iter()
            .map(|stage| scope.spawn(move || retry_busy(|| stage())))
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| match handle.join() {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_) => Some(anyhow!("indexing stage panicked")),
            })
            .collect()
    })
}

fn join_errors(what: impl Into<String>, errs: Vec<anyhow::Error>) -> Result<()> {
    if errs.is_empty() {
        return Ok(());
    }
    let mut msg = what.into();
    for err in errs {
        msg = format!("{msg}\n{err:#}");
    }
    warn!("{msg}");
    Err(anyhow!(msg))
}

fn unique_i64s(items: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|v| seen.insert(*v)).collect()
}

fn unique_strings(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|v| seen.insert(v.clone())).collect()
}

fn sort_by_post_id_desc(posts: &mut [PostRow]) {
    posts.sort_by(|a, b| b.post_id.cmp(&a.post_id));
}

fn parse_rfc3339_unix(timestamp: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("parse timestamp {timestamp}"))?;
    Ok(parsed.with_timezone(&Utc).timestamp())
}

pub struct Db {
    pub actors: ActorsTable,
    pub custom_labels: CustomLabelsTable,
    pub dms: DmsTable,
    pub follows: FollowsTable,
    pub follows_indexed: FollowsIndexedTable,
    pub labels: LabelsTable,
    pub likes: LikesTable,
    pub mentions: MentionsTable,
    pub posts: PostsTable,
    pub post_labels: PostLabelsTable,
    pub quotes: QuotesTable,
    pub replies: RepliesTable,
    pub reposts: RepostsTable,
    pub thread_mentions: ThreadMentionsTable,
    clock: Clock,
    extended_indexing: bool,
    signing_key: SigningKey,
    pinned_post: Option<PostRow>,
}

impl Db {
    pub fn open(config: &Config) -> Result<Db> {
        std::fs::create_dir_all(&config.db_dir)
            .with_context(|| format!("create db dir {}", config.db_dir.display()))?;
        SLOW_QUERY_THRESHOLD_MS.store(config.slow_query_threshold_ms, Ordering::Relaxed);

        let signing_key = SigningKey::from_hex(&config.signing_key_hex)?;
        let opts = OpenOptions {
            mmap_size: config.mmap_size,
            synchronous: config.synchronous.clone(),
            wal_autocheckpoint: config.wal_autocheckpoint,
        };
        let dir = config.db_dir.as_path();

        let mut db = Db {
            actors: ActorsTable::open(dir, config.actor_cache_size, &opts)?,
            custom_labels: CustomLabelsTable::open(dir, &opts)?,
            dms: DmsTable::open(dir, &opts)?,
            follows: FollowsTable::open(dir, config.follow_cache_size, &opts)?,
            follows_indexed: FollowsIndexedTable::open(dir, &opts)?,
            labels: LabelsTable::open(dir, config.label_cache_size, &opts)?,
            likes: LikesTable::open(dir, &opts)?,
            mentions: MentionsTable::open(dir, &opts)?,
            posts: PostsTable::open(dir, &opts)?,
            post_labels: PostLabelsTable::open(dir, &opts)?,
            quotes: QuotesTable::open(dir, &opts)?,
            replies: RepliesTable::open(dir, &opts)?,
            reposts: RepostsTable::open(dir, &opts)?,
            thread_mentions: ThreadMentionsTable::open(dir, &opts)?,
            clock: config.clock.clone(),
            extended_indexing: config.extended_indexing,
            signing_key,
            pinned_post: None,
        };

        if let Some(uri) = &config.pinned_post {
            db.pinned_post = db.posts.find_by_uri(uri)?;
        }

        Ok(db)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn extended_indexing(&self) -> bool {
        self.extended_indexing
    }

    pub fn pinned_post(&self) -> Option<&PostRow> {
        self.pinned_post.as_ref()
    }

    /// Build and sign one of our own labels; returns the storage row.
    fn signed_custom_label(
        &self,
        subject_type: i64,
        subject_id: i64,
        uri: String,
        val: &str,
        neg: bool,
        label_id: i64,
        now: i64,
    ) -> Result<CustomLabelRow> {
        let mut label = skygraph_protocol::Label {
            ver: Some(1),
            src: LABELER_DID.to_string(),
            uri,
            cid: None,
            val: val.to_string(),
            neg: if neg { Some(true) } else { None },
            cts: Utc
                .timestamp_opt(now, 0)
                .single()
                .unwrap_or_default()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            exp: None,
            sig: None,
        };
        let cbor = self.signing_key.sign_label_and_encode(&mut label)?;
        Ok(CustomLabelRow {
            custom_label_id: 0,
            subject_type,
            subject_id,
            created_at: now,
            label_id,
            neg: neg as i64,
            cbor,
        })
    }

    fn banger_label_for_post(&self, post: &PostRow, neg: bool) -> Result<CustomLabelRow> {
        let banger = self.labels.find_or_create_label("banger")?;
        self.signed_custom_label(
            POST_LABEL,
            post.post_id,
            crate::uri::hydrate_uri(&post.dehydrated_uri, POST_COLLECTION),
            "banger",
            neg,
            banger.label_id,
            self.clock.now_unix(),
        )
    }

    // ---- write path ----

    pub fn block(&self, did: &str) -> Result<()> {
        let mut actor = self.actors.find_or_create_actor(did)?;
        actor.blocked = true;
        self.init_actor_info(&actor, &[])
    }

    /// Write back an initialized actor and any labels discovered for its
    /// posts along the way.
    pub fn init_actor_info(&self, actor: &ActorRow, post_labels: &[(i64, i64)]) -> Result<()> {
        self.actors.update_actor_info(actor)?;
        for (post_id, label_id) in post_labels {
            if let Err(err) = self.post_labels.insert_post_labels(*post_id, &[*label_id]) {
                warn!(post_id, label_id, "error inserting post label: {err:#}");
            }
        }
        Ok(())
    }

    pub fn label_post(&self, post_id: i64, label_names: &[String]) -> Result<()> {
        let mut label_ids = Vec::with_capacity(label_names.len());
        for name in label_names {
            label_ids.push(self.labels.find_or_create_label(name)?.label_id);
        }
        self.post_labels.insert_post_labels(post_id, &label_ids)?;
        self.posts.mark_labeled(post_id)
    }

    pub fn insert_post(
        &self,
        evt: &PostEvent,
        actor: &ActorRow,
        extra_labels: &[String],
    ) -> Result<Option<PostRow>> {
        let uri = evt.uri.as_str();
        let now = self.clock.now_unix();

        if evt.post.created_at.is_empty() {
            bail!("post {uri} has no createdAt");
        }
        let stated = parse_rfc3339_unix(&evt.post.created_at)?;
        if stated < now - SECONDS_PER_WEEK {
            return Ok(None);
        }

        let mut label_names: Vec<String> = extra_labels.to_vec();
        label_names.extend(evt.post.self_labels());

        let parent_uri = evt.post.parent_uri().to_string();
        let parent_did = if parent_uri.is_empty() {
            String::new()
        } else {
            parse_did(&parent_uri)
        };
        let quote_uri = evt.quote.clone();
        let quoted_did = if quote_uri.is_empty() {
            String::new()
        } else {
            parse_did(&quote_uri)
        };
        let is_reply = !parent_uri.is_empty();
        let ignore_pin_reply = evt.post.text == "📌" && parent_did == PIN_TARGET;

        let deferred_post_id = Deferred::<i64>::new();
        let deferred_parent = Deferred::<PostRow>::new();
        let deferred_quoted = Deferred::<PostRow>::new();
        let deferred_parent_actor = Deferred::<i64>::new();
        let deferred_quoted_actor = Deferred::<i64>::new();
        let deferred_mentioned = Deferred::<Vec<i64>>::new();

        let mut post_row = PostRow {
            post_id: 0,
            dehydrated_uri: dehydrate_uri(uri),
            uri: uri.to_string(),
            actor_id: actor.actor_id,
            created_at: now,
            labeled: if !evt.has_media() || actor.blocked { 1 } else { 0 },
            ..Default::default()
        };

        let mut stages: Vec<Stage<'_>> = Vec::new();

        // Insert the post row and publish its id.
        {
            let row = post_row.clone();
            let cell = &deferred_post_id;
            stages.push(Box::new(move || {
                let _guard = cell.cancel_guard();
                let mut row = row.clone();
                self.posts.insert_post(&mut row)?;
                cell.done(row.post_id);
                Ok(())
            }));
        }

        // Resolve the referenced parent and quoted posts in one query.
        {
            let parent_uri = parent_uri.clone();
            let quote_uri = quote_uri.clone();
            let parent_cell = &deferred_parent;
            let quoted_cell = &deferred_quoted;
            stages.push(Box::new(move || {
                let _parent_guard = parent_cell.cancel_guard();
                let _quoted_guard = quoted_cell.cancel_guard();

                let mut uris = Vec::with_capacity(2);
                if !parent_uri.is_empty() {
                    uris.push(parent_uri.clone());
                }
                if !quote_uri.is_empty() {
                    uris.push(quote_uri.clone());
                }
                if uris.is_empty() {
                    return Ok(());
                }

                for found in self.posts.find_by_uris(&uris)? {
                    if found.uri == parent_uri {
                        parent_cell.done(found.clone());
                    }
                    if found.uri == quote_uri {
                        quoted_cell.done(found);
                    }
                }
                Ok(())
            }));
        }

        // Reply edge.
        if is_reply && !ignore_pin_reply {
            let parent_uri = parent_uri.clone();
            let actor_id = actor.actor_id;
            let post_id_cell = &deferred_post_id;
            let parent_cell = &deferred_parent;
            let parent_actor_cell = &deferred_parent_actor;
            stages.push(Box::new(move || {
                let parent = match parent_cell.get() {
                    Some(parent) => parent,
                    None => {
                        // The parent row is unknown; fall back to its actor.
                        let parent_actor = parent_actor_cell.get().unwrap_or(0);
                        if parent_actor == 0 {
                            return Ok(());
                        }
                        PostRow {
                            actor_id: parent_actor,
                            uri: parent_uri.clone(),
                            ..Default::default()
                        }
                    }
                };

                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }

                self.replies.insert_reply(&ReplyRow {
                    reply_id: 0,
                    post_id,
                    actor_id,
                    parent_id: parent.post_id,
                    parent_actor_id: parent.actor_id,
                })
            }));
        }

        // Resolve mentioned, parent, and quoted actors in one batch.
        {
            let parent_did = parent_did.clone();
            let quoted_did = quoted_did.clone();
            let mentions = evt.mentions.clone();
            let parent_actor_cell = &deferred_parent_actor;
            let quoted_actor_cell = &deferred_quoted_actor;
            let mentioned_cell = &deferred_mentioned;
            stages.push(Box::new(move || {
                let _parent_guard = parent_actor_cell.cancel_guard();
                let _quoted_guard = quoted_actor_cell.cancel_guard();
                let _mentioned_guard = mentioned_cell.cancel_guard();

                let mut dids = Vec::with_capacity(mentions.len() + 2);
                if !parent_did.is_empty() {
                    dids.push(parent_did.clone());
                }
                if !quoted_did.is_empty() {
                    dids.push(quoted_did.clone());
                }
                let mentioned_dids = unique_strings(mentions.iter().cloned());
                let is_mentioned: HashSet<&str> =
                    mentioned_dids.iter().map(|d| d.as_str()).collect();
                dids.extend(mentioned_dids.iter().cloned());

                if dids.is_empty() {
                    return Ok(());
                }

                let rows = self.actors.find_or_create_actors(&unique_strings(dids))?;
                let mut mentioned_ids = Vec::with_capacity(mentioned_dids.len());
                for row in rows {
                    if row.did == parent_did {
                        parent_actor_cell.done(row.actor_id);
                    }
                    if row.did == quoted_did {
                        quoted_actor_cell.done(row.actor_id);
                    }
                    if is_mentioned.contains(row.did.as_str()) {
                        mentioned_ids.push(row.actor_id);
                    }
                }
                mentioned_cell.done(mentioned_ids);
                Ok(())
            }));
        }

        // Quote edge.
        if !quote_uri.is_empty() {
            let quote_uri = quote_uri.clone();
            let actor_id = actor.actor_id;
            let post_id_cell = &deferred_post_id;
            let quoted_cell = &deferred_quoted;
            let quoted_actor_cell = &deferred_quoted_actor;
            stages.push(Box::new(move || {
                let quoted = match quoted_cell.get() {
                    Some(quoted) => quoted,
                    None => {
                        let quoted_actor = quoted_actor_cell.get().unwrap_or(0);
                        if quoted_actor == 0 {
                            return Ok(());
                        }
                        PostRow {
                            actor_id: quoted_actor,
                            uri: quote_uri.clone(),
                            ..Default::default()
                        }
                    }
                };

                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }

                self.quotes.insert_quote(&QuoteRow {
                    quote_id: 0,
                    post_id,
                    actor_id,
                    subject_id: quoted.post_id,
                    subject_actor_id: quoted.actor_id,
                })
            }));
        }

        // Mention edges.
        {
            let actor_id = actor.actor_id;
            let post_id_cell = &deferred_post_id;
            let mentioned_cell = &deferred_mentioned;
            stages.push(Box::new(move || {
                let mentioned = mentioned_cell.get().unwrap_or_default();
                if mentioned.is_empty() {
                    return Ok(());
                }
                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }
                self.mentions.insert_mentions(post_id, actor_id, &mentioned)
            }));
        }

        // Post labels.
        if !label_names.is_empty() {
            let label_names = label_names.clone();
            let post_id_cell = &deferred_post_id;
            stages.push(Box::new(move || {
                let mut label_ids = Vec::with_capacity(label_names.len());
                for name in &label_names {
                    label_ids.push(self.labels.find_or_create_label(name)?.label_id);
                }
                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }
                self.post_labels.insert_post_labels(post_id, &label_ids)
            }));
        }

        // DM edges: a dm post, or a reply continuing a dm thread.
        if evt.is_dm() || is_reply {
            let is_dm = evt.is_dm();
            let actor_id = actor.actor_id;
            let post_id_cell = &deferred_post_id;
            let parent_cell = &deferred_parent;
            let mentioned_cell = &deferred_mentioned;
            stages.push(Box::new(move || {
                let mut actor_ids = Vec::new();
                if let Some(parent) = parent_cell.get() {
                    actor_ids.extend(self.dms.select_dms(parent.post_id)?);
                }
                if !is_dm && actor_ids.is_empty() {
                    return Ok(());
                }

                actor_ids.push(actor_id);
                actor_ids.extend(mentioned_cell.get().unwrap_or_default());

                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }
                self.dms.insert_dms(post_id, &unique_i64s(actor_ids))
            }));
        }

        // Thread-mention edges: everyone pulled into this thread.
        {
            let parent_uri = parent_uri.clone();
            let actor_id = actor.actor_id;
            let post_id_cell = &deferred_post_id;
            let parent_cell = &deferred_parent;
            let parent_actor_cell = &deferred_parent_actor;
            let quoted_actor_cell = &deferred_quoted_actor;
            let mentioned_cell = &deferred_mentioned;
            stages.push(Box::new(move || {
                let mut actor_ids = Vec::new();

                if !parent_uri.is_empty() {
                    match parent_cell.get() {
                        Some(parent) => {
                            if parent.actor_id != actor_id {
                                actor_ids.push(parent.actor_id);
                            }
                            for id in self.thread_mentions.select_thread_mentions(parent.post_id)? {
                                if id != actor_id {
                                    actor_ids.push(id);
                                }
                            }
                        }
                        None => {
                            let parent_actor = parent_actor_cell.get().unwrap_or(0);
                            if parent_actor != 0 {
                                actor_ids.push(parent_actor);
                            }
                        }
                    }
                }

                for id in mentioned_cell.get().unwrap_or_default() {
                    if id != actor_id {
                        actor_ids.push(id);
                    }
                }

                let quoted_actor = quoted_actor_cell.get().unwrap_or(0);
                if quoted_actor != 0 && quoted_actor != actor_id {
                    actor_ids.push(quoted_actor);
                }

                if actor_ids.is_empty() {
                    return Ok(());
                }
                let post_id = post_id_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }
                self.thread_mentions
                    .insert_thread_mentions(post_id, &unique_i64s(actor_ids))
            }));
        }

        // Top-level posts move the author's counter.
        if actor.actor_id != 0 && !is_reply {
            let actor_snapshot = actor.clone();
            let post_id_cell = &deferred_post_id;
            stages.push(Box::new(move || {
                if post_id_cell.get().unwrap_or(0) == 0 {
                    return Ok(());
                }
                let mut actor = actor_snapshot.clone();
                if let Err(err) = self.actors.increment_posts_count(&mut actor, now) {
                    warn!(actor_id = actor.actor_id, "error updating post count: {err:#}");
                }
                Ok(())
            }));
        }

        // The banger account tagging its parent.
        if parse_did(uri) == BANGER_BOT && banger_regex().is_match(&evt.post.text) {
            let parent_cell = &deferred_parent;
            stages.push(Box::new(move || {
                let Some(parent) = parent_cell.get() else {
                    return Ok(());
                };
                let label = match self.banger_label_for_post(&parent, false) {
                    Ok(label) => label,
                    Err(err) => {
                        warn!("error building banger label: {err:#}");
                        return Ok(());
                    }
                };
                self.custom_labels.insert_labels(&[label])
            }));
        }

        if self.extended_indexing {
            let quoted_cell = &deferred_quoted;
            stages.push(Box::new(move || {
                let Some(quoted) = quoted_cell.get() else {
                    return Ok(());
                };
                if let Err(err) =
                    self.posts.bump_counter(PostCounter::Quotes, quoted.post_id, 1)
                {
                    warn!(post_id = quoted.post_id, "error updating quote count: {err:#}");
                }
                Ok(())
            }));

            let parent_cell = &deferred_parent;
            stages.push(Box::new(move || {
                let Some(parent) = parent_cell.get() else {
                    return Ok(());
                };
                if parent.post_id == 0 {
                    return Ok(());
                }
                if let Err(err) =
                    self.posts.bump_counter(PostCounter::Replies, parent.post_id, 1)
                {
                    warn!(post_id = parent.post_id, "error updating reply count: {err:#}");
                }
                Ok(())
            }));
        }

        let errs = parallelize_with_retries(stages);
        post_row.post_id = deferred_post_id.get().unwrap_or(0);
        join_errors(format!("Error indexing post {uri}:"), errs)?;

        Ok(Some(post_row))
    }

    pub fn delete_post(&self, uri: &str) -> Result<()> {
        let Some(post_row) = self.posts.find_by_uri(uri)? else {
            return Ok(());
        };
        if post_row.post_id == 0 {
            return Ok(());
        }
        let post_id = post_row.post_id;

        let deferred_parent_id = Deferred::<i64>::new();
        let deferred_quoted_id = Deferred::<i64>::new();

        let mut stages: Vec<Stage<'_>> = Vec::new();

        stages.push(Box::new(move || {
            let mentioned = self.mentions.select_mentions(post_id)?;
            if mentioned.is_empty() {
                return Ok(());
            }
            self.mentions.delete_by_post_id(post_id)
        }));

        stages.push(Box::new(move || {
            let dm_actors = self.dms.select_dms(post_id)?;
            if dm_actors.is_empty() {
                return Ok(());
            }
            self.dms.delete_by_post_id(post_id)
        }));

        stages.push(Box::new(move || {
            let thread_actors = self.thread_mentions.select_thread_mentions(post_id)?;
            if thread_actors.is_empty() {
                return Ok(());
            }
            self.thread_mentions.delete_by_post_id(post_id)
        }));

        stages.push(Box::new(move || {
            let labels = self.post_labels.select_labels_by_post_id(post_id)?;
            if labels.is_empty() {
                return Ok(());
            }
            self.post_labels.delete_by_post_id(post_id)
        }));

        {
            let parent_cell = &deferred_parent_id;
            stages.push(Box::new(move || {
                let _guard = parent_cell.cancel_guard();
                let Some(reply) = self.replies.find_by_post_id(post_id)? else {
                    return Ok(());
                };
                parent_cell.done(reply.parent_id);
                self.replies.delete_reply(reply.reply_id)
            }));
        }

        {
            let quoted_cell = &deferred_quoted_id;
            stages.push(Box::new(move || {
                let _guard = quoted_cell.cancel_guard();
                let Some(quote) = self.quotes.find_by_post_id(post_id)? else {
                    return Ok(());
                };
                quoted_cell.done(quote.subject_id);
                self.quotes.delete_quote(quote.quote_id)
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error deleting metadata for post {uri}:"), errs)?;

        let was_reply = deferred_parent_id.get().unwrap_or(0) != 0;
        let quoted_id = deferred_quoted_id.get().unwrap_or(0);
        let author_did = parse_did(uri);
        let actor_id = post_row.actor_id;
        let extended = self.extended_indexing;

        let mut stages: Vec<Stage<'_>> = Vec::new();
        stages.push(Box::new(move || self.posts.delete_post(post_id)));
        if !was_reply {
            let author_did = author_did.clone();
            stages.push(Box::new(move || {
                self.actors.decrement_posts_count(actor_id, &author_did)
            }));
        }
        if extended && quoted_id != 0 {
            stages.push(Box::new(move || {
                self.posts.bump_counter(PostCounter::Quotes, quoted_id, -1)
            }));
        }
        if extended && was_reply {
            let parent_id = deferred_parent_id.get().unwrap_or(0);
            stages.push(Box::new(move || {
                self.posts.bump_counter(PostCounter::Replies, parent_id, -1)
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error deleting post {uri}:"), errs)
    }

    pub fn insert_like(&self, evt: &LikeEvent) -> Result<()> {
        let uri = evt.uri.as_str();
        let is_mark = parse_did(uri) == MARK;
        if !(self.extended_indexing || is_mark) {
            return Ok(());
        }

        let deferred_actor_id = Deferred::<i64>::new();
        let deferred_post = Deferred::<PostRow>::new();

        let mut stages: Vec<Stage<'_>> = Vec::new();

        {
            let cell = &deferred_actor_id;
            stages.push(Box::new(move || {
                let _guard = cell.cancel_guard();
                let actor = self.actors.find_or_create_actor(&parse_did(uri))?;
                cell.done(actor.actor_id);
                Ok(())
            }));
        }

        {
            let subject_uri = evt.subject_uri.clone();
            let cell = &deferred_post;
            stages.push(Box::new(move || {
                let _guard = cell.cancel_guard();
                if let Some(post) = self.posts.find_by_uri(&subject_uri)? {
                    cell.done(post);
                }
                Ok(())
            }));
        }

        {
            let actor_cell = &deferred_actor_id;
            let post_cell = &deferred_post;
            stages.push(Box::new(move || {
                let actor_id = actor_cell.get().unwrap_or(0);
                let Some(post) = post_cell.get() else {
                    return Ok(());
                };
                if actor_id == 0 {
                    return Ok(());
                }
                self.likes.insert_like(&LikeRow {
                    like_id: 0,
                    actor_id,
                    dehydrated_uri: dehydrate_uri(uri),
                    uri: uri.to_string(),
                    subject_id: post.post_id,
                    created_at: self.clock.now_unix(),
                })
            }));
        }

        {
            let post_cell = &deferred_post;
            stages.push(Box::new(move || {
                let Some(post) = post_cell.get() else {
                    return Ok(());
                };
                if let Err(err) = self.posts.bump_counter(PostCounter::Likes, post.post_id, 1) {
                    warn!(post_id = post.post_id, "error updating like count: {err:#}");
                }
                Ok(())
            }));
        }

        if is_mark {
            let post_cell = &deferred_post;
            stages.push(Box::new(move || {
                let Some(post) = post_cell.get() else {
                    return Ok(());
                };
                let label = match self.banger_label_for_post(&post, false) {
                    Ok(label) => label,
                    Err(err) => {
                        warn!("error building banger label: {err:#}");
                        return Ok(());
                    }
                };
                self.custom_labels.insert_labels(&[label])
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error indexing like {uri}:"), errs)
    }

    pub fn delete_like(&self, uri: &str) -> Result<()> {
        let is_mark = parse_did(uri) == MARK;
        if !(self.extended_indexing || is_mark) {
            return Ok(());
        }

        let Some(like_row) = self.likes.find_by_uri(uri)? else {
            return Ok(());
        };
        if like_row.like_id == 0 {
            return Ok(());
        }

        let like_id = like_row.like_id;
        let subject_id = like_row.subject_id;

        let mut stages: Vec<Stage<'_>> = Vec::new();
        stages.push(Box::new(move || self.likes.delete_like(like_id)));
        stages.push(Box::new(move || {
            self.posts.bump_counter(PostCounter::Likes, subject_id, -1)
        }));
        if is_mark {
            stages.push(Box::new(move || {
                let posts = self.posts.select_posts_by_id(&[subject_id])?;
                let [post] = posts.as_slice() else {
                    return Ok(());
                };
                let label = match self.banger_label_for_post(post, true) {
                    Ok(label) => label,
                    Err(err) => {
                        warn!("error building banger label: {err:#}");
                        return Ok(());
                    }
                };
                self.custom_labels.insert_labels(&[label])
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error deleting like {uri}:"), errs)
    }

    pub fn insert_repost(&self, evt: &RepostEvent) -> Result<()> {
        if !self.extended_indexing {
            return Ok(());
        }
        let uri = evt.uri.as_str();

        let deferred_actor_id = Deferred::<i64>::new();
        let deferred_post_id = Deferred::<i64>::new();

        let mut stages: Vec<Stage<'_>> = Vec::new();

        {
            let cell = &deferred_actor_id;
            stages.push(Box::new(move || {
                let _guard = cell.cancel_guard();
                let actor = self.actors.find_or_create_actor(&parse_did(uri))?;
                cell.done(actor.actor_id);
                Ok(())
            }));
        }

        {
            let subject_uri = evt.subject_uri.clone();
            let cell = &deferred_post_id;
            stages.push(Box::new(move || {
                let _guard = cell.cancel_guard();
                let post_id = self.posts.find_post_id_by_uri(&subject_uri)?;
                cell.done(post_id);
                Ok(())
            }));
        }

        {
            let actor_cell = &deferred_actor_id;
            let post_cell = &deferred_post_id;
            stages.push(Box::new(move || {
                let actor_id = actor_cell.get().unwrap_or(0);
                let post_id = post_cell.get().unwrap_or(0);
                if actor_id == 0 || post_id == 0 {
                    return Ok(());
                }
                self.reposts.insert_repost(&RepostRow {
                    repost_id: 0,
                    actor_id,
                    dehydrated_uri: dehydrate_uri(uri),
                    uri: uri.to_string(),
                    subject_id: post_id,
                    created_at: self.clock.now_unix(),
                })
            }));
        }

        {
            let post_cell = &deferred_post_id;
            stages.push(Box::new(move || {
                let post_id = post_cell.get().unwrap_or(0);
                if post_id == 0 {
                    return Ok(());
                }
                if let Err(err) = self.posts.bump_counter(PostCounter::Reposts, post_id, 1) {
                    warn!(post_id, "error updating repost count: {err:#}");
                }
                Ok(())
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error indexing repost {uri}:"), errs)
    }

    pub fn delete_repost(&self, uri: &str) -> Result<()> {
        if !self.extended_indexing {
            return Ok(());
        }
        let Some(repost_row) = self.reposts.find_by_uri(uri)? else {
            return Ok(());
        };
        if repost_row.repost_id == 0 {
            return Ok(());
        }

        let repost_id = repost_row.repost_id;
        let subject_id = repost_row.subject_id;
        let errs = parallelize_with_retries(vec![
            Box::new(move || self.reposts.delete_repost(repost_id)),
            Box::new(move || self.posts.bump_counter(PostCounter::Reposts, subject_id, -1)),
        ]);
        join_errors(format!("Error deleting repost {uri}:"), errs)
    }

    pub fn insert_follow(&self, evt: &FollowEvent) -> Result<()> {
        let uri = evt.uri.as_str();

        let deferred_actor_id = Deferred::<i64>::new();
        let deferred_subject_id = Deferred::<i64>::new();
        let deferred_follow_id = Deferred::<i64>::new();

        let mut stages: Vec<Stage<'_>> = Vec::new();

        {
            let subject = evt.subject.clone();
            let actor_cell = &deferred_actor_id;
            let subject_cell = &deferred_subject_id;
            stages.push(Box::new(move || {
                let _actor_guard = actor_cell.cancel_guard();
                let _subject_guard = subject_cell.cancel_guard();

                let author = parse_did(uri);
                if author == subject {
                    info!(uri, "ignoring self follow");
                    return Ok(());
                }

                let rows = self
                    .actors
                    .find_or_create_actors(&[author.clone(), subject.clone()])?;
                for row in rows {
                    if row.did == author {
                        actor_cell.done(row.actor_id);
                    }
                    if row.did == subject {
                        subject_cell.done(row.actor_id);
                    }
                }
                Ok(())
            }));
        }

        {
            let actor_cell = &deferred_actor_id;
            let subject_cell = &deferred_subject_id;
            let follow_cell = &deferred_follow_id;
            stages.push(Box::new(move || {
                let _guard = follow_cell.cancel_guard();
                let actor_id = actor_cell.get().unwrap_or(0);
                let subject_id = subject_cell.get().unwrap_or(0);
                if actor_id == 0 || subject_id == 0 {
                    return Ok(());
                }

                let follow_id = self.follows.insert_follows(&[FollowRow {
                    follow_id: 0,
                    rkey: parse_rkey(uri),
                    actor_id,
                    subject_id,
                    created_at: self.clock.now_unix(),
                }])?;
                if follow_id != 0 {
                    follow_cell.done(follow_id);
                }
                Ok(())
            }));
        }

        {
            let actor_cell = &deferred_actor_id;
            let follow_cell = &deferred_follow_id;
            stages.push(Box::new(move || {
                let actor_id = actor_cell.get().unwrap_or(0);
                if actor_id == 0 {
                    return Ok(());
                }
                let Some(indexed) = self.follows_indexed.find_by_actor_id(actor_id)? else {
                    return Ok(());
                };
                if indexed.last_follow < 0 {
                    return Ok(());
                }
                let follow_id = follow_cell.get().unwrap_or(0);
                if follow_id == 0 {
                    return Ok(());
                }
                self.follows_indexed.set_last_follow(actor_id, follow_id)
            }));
        }

        let errs = parallelize_with_retries(stages);
        join_errors(format!("Error indexing follow {uri}:"), errs)
    }

    pub fn delete_follow(&self, uri: &str) -> Result<()> {
        let did = parse_did(uri);
        if did.is_empty() {
            return Ok(());
        }
        let rkey = parse_rkey(uri);
        if rkey.is_empty() {
            return Ok(());
        }
        let actor = self.actors.find_or_create_actor(&did)?;
        self.follows.delete_by_rkey(actor.actor_id, &rkey)?;
        Ok(())
    }

    // ---- pruning ----

    /// Remove up to `limit` posts older than `since` plus their satellite
    /// rows. Satellites are cleared by post-id range before the posts
    /// themselves so that edges never outlive their posts; the range
    /// predicates key on post-id columns, never on a satellite's own id.
    pub fn prune(&self, since: i64, limit: usize) -> Result<usize> {
        let post_ids = self.posts.select_prunable(since, limit)?;
        if post_ids.is_empty() {
            return Ok(0);
        }
        let cutoff = *post_ids.last().unwrap();

        let errs = parallelize_with_retries(vec![
            Box::new(move || {
                if self.likes.any_for_subjects_up_to(cutoff)? {
                    self.likes.delete_for_subjects_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.reposts.any_for_subjects_up_to(cutoff)? {
                    self.reposts.delete_for_subjects_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.mentions.any_for_posts_up_to(cutoff)? {
                    self.mentions.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.thread_mentions.any_for_posts_up_to(cutoff)? {
                    self.thread_mentions.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.dms.any_for_posts_up_to(cutoff)? {
                    self.dms.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.quotes.any_for_posts_up_to(cutoff)? {
                    self.quotes.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.replies.any_for_posts_up_to(cutoff)? {
                    self.replies.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
            Box::new(move || {
                if self.post_labels.any_for_posts_up_to(cutoff)? {
                    self.post_labels.delete_for_posts_up_to(cutoff)?;
                }
                Ok(())
            }),
        ]);
        join_errors(format!("Error pruning posts up to {cutoff}:"), errs)?;

        retry_busy(|| self.posts.delete_up_to(cutoff))?;
        Ok(post_ids.len())
    }

    pub fn prune_custom_labels(&self) -> Result<usize> {
        let cutoff = self.clock.now_unix() - SECONDS_PER_WEEK;
        self.custom_labels.delete_created_before(cutoff)
    }

    // ---- follow sets ----

    /// The actor's follow set as actor ids, plus whether the backfill has
    /// completed. Cached per actor and extended incrementally.
    pub fn select_follows_for(&self, actor_id: i64) -> Result<(Vec<i64>, bool)> {
        let indexed_row = self.follows_indexed.find_or_create_by_actor_id(actor_id)?;
        let indexed = indexed_row.last_follow >= 0;

        {
            let mut cache = self.follows.cache.lock().unwrap();
            if let Some(entry) = cache.get_mut(&actor_id) {
                if indexed_row.last_follow > entry.last {
                    loop {
                        let rows = self.follows.select_follows(actor_id, entry.last, 100)?;
                        if rows.is_empty() {
                            break;
                        }
                        entry.last = rows.last().unwrap().follow_id;
                        entry.follows.extend(rows.into_iter().map(|r| r.subject_id));
                    }
                }
                return Ok((entry.follows.clone(), indexed));
            }
        }

        let mut follows = Vec::new();
        let mut last = 0i64;
        loop {
            let rows = self.follows.select_follows(actor_id, last, 100)?;
            if rows.is_empty() {
                break;
            }
            last = rows.last().unwrap().follow_id;
            follows.extend(rows.into_iter().map(|r| r.subject_id));
        }

        self.follows.cache.lock().unwrap().put(
            actor_id,
            follows::FollowSetEntry {
                follows: follows.clone(),
                last,
            },
        );
        Ok((follows, indexed))
    }

    // ---- query engine ----

    fn select_mentions_page(
        &self,
        before: i64,
        limit: usize,
        actor_id: i64,
    ) -> Result<(Vec<PostRow>, bool)> {
        let mentions = Deferred::<Vec<i64>>::new();
        let quotes = Deferred::<Vec<i64>>::new();
        let replies = Deferred::<Vec<i64>>::new();

        let errs = parallelize_with_retries(vec![
            {
                let cell = &mentions;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.mentions.select_for_actor(actor_id, before, limit)?);
                    Ok(())
                })
            },
            {
                let cell = &quotes;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.quotes.select_for_actor(actor_id, before, limit)?);
                    Ok(())
                })
            },
            {
                let cell = &replies;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.replies.select_to_actor(actor_id, before, limit)?);
                    Ok(())
                })
            },
        ]);
        join_errors(
            format!("Error selecting mentions for actor id {actor_id}:"),
            errs,
        )?;

        let mut post_ids = mentions.get().unwrap_or_default();
        post_ids.extend(quotes.get().unwrap_or_default());
        post_ids.extend(replies.get().unwrap_or_default());

        let mut posts = self.posts.select_posts_by_id(&unique_i64s(post_ids))?;
        sort_by_post_id_desc(&mut posts);

        if posts.len() <= limit {
            Ok((posts, false))
        } else {
            posts.truncate(limit);
            Ok((posts, true))
        }
    }

    /// Direct mentions, quotes, and replies targeting the viewer.
    pub fn select_mentions(&self, before: i64, limit: usize, did: &str) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.actor_id == 0 {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(limit);
        let mut iter_before = before;
        let mut iter_limit = limit;
        loop {
            let (posts, more) = self.select_mentions_page(iter_before, iter_limit, actor.actor_id)?;
            let last = posts.last().map(|p| p.post_id);
            results.extend(posts);
            if !more {
                break;
            }
            if results.len() >= limit {
                break;
            }
            iter_limit = limit - results.len();
            iter_before = last.unwrap_or(0);
        }
        Ok(results)
    }

    /// Thread-mention ("all mentions") feed for the viewer.
    pub fn select_all_mentions(
        &self,
        before: i64,
        limit: usize,
        did: &str,
    ) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.actor_id == 0 {
            return Ok(Vec::new());
        }
        let post_ids = self
            .thread_mentions
            .select_for_actor(actor.actor_id, before, limit)?;
        let mut posts = self.posts.select_posts_by_id(&post_ids)?;
        sort_by_post_id_desc(&mut posts);
        Ok(posts)
    }

    pub fn select_dms(&self, before: i64, limit: usize, did: &str) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.actor_id == 0 {
            return Ok(Vec::new());
        }
        let post_ids = self.dms.select_for_actor(actor.actor_id, before, limit)?;
        let mut posts = self.posts.select_posts_by_id(&post_ids)?;
        sort_by_post_id_desc(&mut posts);
        Ok(posts)
    }

    pub fn select_quotes(&self, before: i64, limit: usize, did: &str) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.actor_id == 0 {
            return Ok(Vec::new());
        }
        let post_ids = self.quotes.select_for_actor(actor.actor_id, before, limit)?;
        let mut posts = self.posts.select_posts_by_id(&unique_i64s(post_ids))?;
        sort_by_post_id_desc(&mut posts);
        posts.truncate(limit);
        Ok(posts)
    }

    /// Every post quoting the given uri, oldest pages first.
    pub fn select_quotes_for_uri(&self, uri: &str) -> Result<Vec<PostRow>> {
        let Some(post) = self.posts.find_by_uri(uri)? else {
            return Ok(Vec::new());
        };
        if post.post_id == 0 {
            return Ok(Vec::new());
        }

        let chunk = 100usize;
        let mut last = i64::MAX;
        let mut quote_ids = Vec::new();
        loop {
            let ids = self.quotes.select_by_subject(post.post_id, last, chunk)?;
            if ids.is_empty() {
                break;
            }
            quote_ids.extend_from_slice(&ids);
            if ids.len() < chunk {
                break;
            }
            last = *quote_ids.last().unwrap();
        }

        self.posts.select_posts_by_id(&quote_ids)
    }

    pub fn select_latest_posts(&self, before: i64, limit: usize) -> Result<Vec<PostRow>> {
        self.posts.select_latest(before, limit)
    }

    pub fn select_posts_by_labels(
        &self,
        before: i64,
        limit: usize,
        label_names: &[&str],
    ) -> Result<Vec<PostRow>> {
        // Cursorless queries hide the newest five minutes of posts so
        // in-flight labeling can catch up. The resolved id is the newest
        // eligible post and must stay inside the page.
        let mut before = before;
        if before == i64::MAX {
            let resolved = self
                .posts
                .select_post_id_by_epoch(self.clock.now_unix() - 5 * 60)?;
            before = if resolved == 0 { 0 } else { resolved + 1 };
        }

        let mut post_ids = Vec::with_capacity(limit * label_names.len());
        for name in label_names {
            let Some(label) = self.labels.find_label(name)? else {
                continue;
            };
            post_ids.extend(
                self.post_labels
                    .select_posts_by_label(label.label_id, before, limit)?,
            );
        }

        let mut posts = self.posts.select_posts_by_id(&unique_i64s(post_ids))?;
        sort_by_post_id_desc(&mut posts);
        posts.truncate(limit);
        Ok(posts)
    }

    /// Latest banger labels mapped to their posts. The custom-label id
    /// masquerades as the post id so it can serve as the cursor.
    pub fn select_bangers(&self, before: i64, limit: usize) -> Result<Vec<PostRow>> {
        let before = if before == 0 { i64::MAX } else { before };
        let banger = self.labels.find_or_create_label("banger")?;
        let labels = self
            .custom_labels
            .select_post_labels_desc(banger.label_id, before, limit)?;

        let post_ids: Vec<i64> = labels.iter().map(|l| l.subject_id).collect();
        let posts = self.posts.select_posts_by_id(&post_ids)?;
        let by_id: HashMap<i64, &PostRow> = posts.iter().map(|p| (p.post_id, p)).collect();

        let mut out = Vec::with_capacity(labels.len());
        for label in &labels {
            if let Some(post) = by_id.get(&label.subject_id) {
                let mut post = (*post).clone();
                post.post_id = label.custom_label_id;
                out.push(post);
            }
        }
        Ok(out)
    }

    fn select_all_birthday_actors(&self) -> Result<Vec<i64>> {
        let label = self.labels.find_or_create_label("birthday")?;
        let chunk = 100usize;
        let mut since = 0i64;
        let mut actor_ids = Vec::new();
        loop {
            let rows = self
                .custom_labels
                .select_by_label_and_neg(label.label_id, false, since, chunk)?;
            for row in &rows {
                if row.subject_type == ACCOUNT_LABEL {
                    actor_ids.push(row.subject_id);
                }
            }
            if rows.len() < chunk {
                return Ok(actor_ids);
            }
            since = rows.last().unwrap().custom_label_id;
        }
    }

    fn select_birthday_actors_among(&self, actor_ids: &[i64]) -> Result<Vec<i64>> {
        if actor_ids.is_empty() {
            return Ok(Vec::new());
        }
        let label = self.labels.find_or_create_label("birthday")?;
        self.custom_labels
            .select_labeled_subjects(label.label_id, ACCOUNT_LABEL, actor_ids)
    }

    fn collect_posts_by_actors(
        &self,
        actor_ids: &[i64],
        mut before: i64,
        limit: usize,
    ) -> Result<Vec<PostRow>> {
        let allowed: HashSet<i64> = actor_ids.iter().copied().collect();
        let mut results = Vec::with_capacity(limit);
        loop {
            let posts = self.posts.select_posts_by_actor_ids(actor_ids, before, limit)?;
            let page_len = posts.len();
            let last = posts.last().map(|p| p.post_id);
            for post in posts {
                if allowed.contains(&post.actor_id) {
                    results.push(post);
                }
            }
            if page_len < limit || results.len() >= limit {
                break;
            }
            before = last.unwrap_or(0);
        }
        Ok(results)
    }

    pub fn select_birthdays(&self, before: i64, limit: usize) -> Result<Vec<PostRow>> {
        let birthday_actors = self.select_all_birthday_actors()?;
        if birthday_actors.is_empty() {
            return Ok(Vec::new());
        }
        self.collect_posts_by_actors(&birthday_actors, before, limit)
    }

    pub fn select_birthdays_followed(
        &self,
        before: i64,
        limit: usize,
        did: &str,
    ) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.blocked || actor.actor_id == 0 {
            return Ok(Vec::new());
        }

        let (follows, indexed) = self.select_follows_for(actor.actor_id)?;
        if !indexed {
            return Ok(self.pinned_post.iter().cloned().collect());
        }

        let birthday_actors = self.select_birthday_actors_among(&follows)?;
        if birthday_actors.is_empty() {
            return Ok(Vec::new());
        }
        self.collect_posts_by_actors(&birthday_actors, before, limit)
    }

    fn select_followed(
        &self,
        before: i64,
        limit: usize,
        did: &str,
        source: impl Fn(i64, usize) -> Result<Vec<PostRow>> + Send + Sync,
        what: &str,
    ) -> Result<Vec<PostRow>> {
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.blocked {
            return Ok(Vec::new());
        }
        let actor_id = actor.actor_id;

        let deferred_follows = Deferred::<Vec<i64>>::new();
        let deferred_indexed = Deferred::<bool>::new();
        let deferred_results = Deferred::<Vec<PostRow>>::new();

        let errs = parallelize_with_retries(vec![
            {
                let follows_cell = &deferred_follows;
                let indexed_cell = &deferred_indexed;
                Box::new(move || {
                    let _follows_guard = follows_cell.cancel_guard();
                    let _indexed_guard = indexed_cell.cancel_guard();
                    if actor_id == 0 {
                        return Ok(());
                    }
                    let (follows, indexed) = self.select_follows_for(actor_id)?;
                    indexed_cell.done(indexed);
                    follows_cell.done(follows);
                    Ok(())
                })
            },
            {
                let follows_cell = &deferred_follows;
                let results_cell = &deferred_results;
                let source = &source;
                Box::new(move || {
                    let _guard = results_cell.cancel_guard();
                    let mut is_follow: Option<HashSet<i64>> = None;
                    let mut results = Vec::with_capacity(limit);
                    let mut before = before;
                    loop {
                        let posts = source(before, limit)?;
                        if is_follow.is_none() {
                            let follows = follows_cell.get().unwrap_or_default();
                            if follows.is_empty() {
                                results_cell.done(results);
                                return Ok(());
                            }
                            is_follow = Some(follows.into_iter().collect());
                        }
                        let allowed = is_follow.as_ref().unwrap();

                        let page_len = posts.len();
                        let last = posts.last().map(|p| p.post_id);
                        for post in posts {
                            if allowed.contains(&post.actor_id) {
                                results.push(post);
                            }
                        }
                        if page_len < limit || results.len() >= limit {
                            break;
                        }
                        before = last.unwrap_or(0);
                    }
                    results_cell.done(results);
                    Ok(())
                })
            },
        ]);
        join_errors(format!("Error selecting {what} for {did}:"), errs)?;

        let mut results = deferred_results.get().unwrap_or_default();
        sort_by_post_id_desc(&mut results);

        let indexed = deferred_indexed.get().unwrap_or(false);
        if !indexed {
            if let Some(pinned) = &self.pinned_post {
                results.insert(0, pinned.clone());
            }
        }
        results.truncate(limit);
        Ok(results)
    }

    pub fn select_mentions_followed(
        &self,
        before: i64,
        limit: usize,
        did: &str,
    ) -> Result<Vec<PostRow>> {
        self.select_followed(
            before,
            limit,
            did,
            |before, limit| self.select_mentions(before, limit, did),
            "followed mentions",
        )
    }

    pub fn select_all_mentions_followed(
        &self,
        before: i64,
        limit: usize,
        did: &str,
    ) -> Result<Vec<PostRow>> {
        self.select_followed(
            before,
            limit,
            did,
            |before, limit| self.select_all_mentions(before, limit, did),
            "followed thread mentions",
        )
    }

    pub fn select_posts_by_labels_followed(
        &self,
        before: i64,
        limit: usize,
        did: &str,
        label_names: &[&str],
    ) -> Result<Vec<PostRow>> {
        self.select_followed(
            before,
            limit,
            did,
            |before, limit| self.select_posts_by_labels(before, limit, label_names),
            "followed labeled posts",
        )
    }

    fn select_mark_page(
        &self,
        actor_id: i64,
        mark_id: i64,
        before: i64,
        limit: usize,
    ) -> Result<(Vec<PostRow>, bool)> {
        let top_level = Deferred::<Vec<i64>>::new();
        let mentions = Deferred::<Vec<i64>>::new();
        let quotes = Deferred::<Vec<i64>>::new();
        let replies = Deferred::<Vec<i64>>::new();

        let errs = parallelize_with_retries(vec![
            {
                let cell = &top_level;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    let posts = self.select_only_posts_by_ids(&[mark_id], before, limit)?;
                    cell.done(posts.into_iter().map(|p| p.post_id).collect());
                    Ok(())
                })
            },
            {
                let cell = &mentions;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.mentions.select_by_author_for_subject(
                        mark_id, actor_id, before, limit,
                    )?);
                    Ok(())
                })
            },
            {
                let cell = &quotes;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.quotes.select_by_author_for_subject_actor(
                        mark_id, actor_id, before, limit,
                    )?);
                    Ok(())
                })
            },
            {
                let cell = &replies;
                Box::new(move || {
                    let _guard = cell.cancel_guard();
                    cell.done(self.replies.select_by_author_to_actor(
                        mark_id, actor_id, before, limit,
                    )?);
                    Ok(())
                })
            },
        ]);
        join_errors(
            format!("Error selecting mark mentions for actor id {actor_id}:"),
            errs,
        )?;

        let mut post_ids = top_level.get().unwrap_or_default();
        post_ids.extend(mentions.get().unwrap_or_default());
        post_ids.extend(quotes.get().unwrap_or_default());
        post_ids.extend(replies.get().unwrap_or_default());

        let mut posts = self.posts.select_posts_by_id(&unique_i64s(post_ids))?;
        sort_by_post_id_desc(&mut posts);

        if posts.len() <= limit {
            Ok((posts, false))
        } else {
            posts.truncate(limit);
            Ok((posts, true))
        }
    }

    /// Everything mark: his top-level posts plus his mentions, quotes,
    /// and replies that reference the viewer.
    pub fn select_mark(&self, before: i64, limit: usize, did: &str) -> Result<Vec<PostRow>> {
        let mark = self.actors.find_or_create_actor(MARK)?;
        let actor = self.actors.find_or_create_actor(did)?;
        if actor.actor_id == 0 {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(limit);
        let mut iter_before = before;
        let mut iter_limit = limit;
        loop {
            let (posts, more) =
                self.select_mark_page(actor.actor_id, mark.actor_id, iter_before, iter_limit)?;
            let last = posts.last().map(|p| p.post_id);
            results.extend(posts);
            if !more || results.len() >= limit {
                break;
            }
            iter_limit = limit - results.len();
            iter_before = last.unwrap_or(0);
        }
        Ok(results)
    }

    /// Posts by the given actors with their replies filtered out.
    pub fn select_only_posts(
        &self,
        before: i64,
        limit: usize,
        dids: &[String],
    ) -> Result<Vec<PostRow>> {
        let actors = self.actors.find_or_create_actors(dids)?;
        let actor_ids: Vec<i64> = actors.iter().map(|a| a.actor_id).collect();
        self.select_only_posts_by_ids(&actor_ids, before, limit)
    }

    fn select_only_posts_by_ids(
        &self,
        actor_ids: &[i64],
        before: i64,
        limit: usize,
    ) -> Result<Vec<PostRow>> {
        let before = if before == 0 { i64::MAX } else { before };
        let mut is_reply: HashSet<i64> = HashSet::new();
        let mut only_posts = Vec::new();
        let mut last_post = before;
        let mut last_reply = before;

        loop {
            let posts = retry_busy(|| {
                self.posts
                    .select_posts_by_actor_ids(actor_ids, last_post, limit)
            })?;
            if posts.is_empty() {
                return Ok(only_posts);
            }

            // The reply index trails the post page; refresh it only while
            // it can still overlap the current window.
            if (last_post - limit as i64) < last_reply {
                let replies = retry_busy(|| {
                    self.replies
                        .select_from_actor_ids(actor_ids, last_post, limit)
                })?;
                if let Some(last) = replies.last() {
                    last_reply = *last;
                }
                is_reply.extend(replies);
            }

            let page_last = posts.last().unwrap().post_id;
            for post in posts {
                if !is_reply.contains(&post.post_id) {
                    only_posts.push(post);
                }
            }
            if only_posts.len() >= limit {
                only_posts.truncate(limit);
                return Ok(only_posts);
            }
            last_post = page_last;
        }
    }

    // ---- custom labels ----

    pub fn last_custom_label_id(&self) -> Result<i64> {
        self.custom_labels.last_id()
    }

    pub fn select_custom_labels(&self, since: i64, limit: usize) -> Result<Vec<CustomLabelRow>> {
        self.custom_labels.select_labels(since, limit)
    }

    fn birthday_window(&self, years_back: u32, extra_days: i64) -> (i64, i64) {
        let now = Utc
            .timestamp_opt(self.clock.now_unix(), 0)
            .single()
            .unwrap_or_default();
        let end = now
            .checked_sub_months(Months::new(12 * years_back))
            .unwrap_or(now)
            - chrono::Duration::days(extra_days);
        let start = end - chrono::Duration::minutes(10);
        (start.timestamp(), end.timestamp())
    }

    /// Issue positive birthday labels for actors whose account birthday
    /// falls in the ten-minute window one year ago.
    pub fn record_birthday_labels(&self) -> Result<()> {
        let (start, end) = self.birthday_window(1, 0);
        let actors = self.actors.select_actors_with_birthdays_between(start, end)?;
        if actors.is_empty() {
            return Ok(());
        }

        let bday = self.labels.find_or_create_label("birthday")?;
        let now = self.clock.now_unix();
        let mut rows = Vec::with_capacity(actors.len());
        for actor in &actors {
            rows.push(self.signed_custom_label(
                ACCOUNT_LABEL,
                actor.actor_id,
                actor.did.clone(),
                "birthday",
                false,
                bday.label_id,
                now,
            )?);
        }
        self.custom_labels.insert_labels(&rows)
    }

    /// A day after the birthday, negate it and drop the positive row.
    /// The evergreen accounts keep theirs.
    pub fn record_unbirthday_labels(&self) -> Result<()> {
        let (start, end) = self.birthday_window(1, 1);
        let actors = self.actors.select_actors_with_birthdays_between(start, end)?;
        if actors.is_empty() {
            return Ok(());
        }

        let bday = self.labels.find_or_create_label("birthday")?;
        let now = self.clock.now_unix();
        let mut rows = Vec::new();
        let mut expired_ids = Vec::new();
        for actor in &actors {
            if EVERGREEN_BIRTHDAYS.contains(&actor.did.as_str()) {
                continue;
            }
            expired_ids.push(actor.actor_id);
            rows.push(self.signed_custom_label(
                ACCOUNT_LABEL,
                actor.actor_id,
                actor.did.clone(),
                "birthday",
                true,
                bday.label_id,
                now,
            )?);
        }

        self.custom_labels.insert_labels(&rows)?;
        self.custom_labels
            .delete_positive_for_subjects(bday.label_id, ACCOUNT_LABEL, &expired_ids)?;
        Ok(())
    }
}
