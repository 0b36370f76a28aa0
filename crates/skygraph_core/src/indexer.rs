/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Event dispatch for the two streams plus the scheduled work: actor
//! initialization, follow backfill, birthday labels, and pruning.

use crate::client::{AtpClient, FeedViewPost, ProfileView};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{self, ActorRow, Db, FollowRow};
use crate::firehose::{BlockEvent, FollowEvent, LikeEvent, PostEvent, RepostEvent};
use crate::plc;
use crate::uri::{parse_did, parse_rkey};
use anyhow::{Context, Result};
use chrono::DateTime;
use regex::Regex;
use skygraph_protocol::Label;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// High-volume feed bots whose posts are not worth indexing.
const NOISE_BOTS: [&str; 3] = [
    "did:plc:kzkl2onyewbs7pehh2ellzcb",
    "did:plc:4hm6gb7dzobynqrpypif3dck",
    "did:plc:kwmcvt4maab47n7dgvepg4tr",
];

/// Account whose labeled posts additionally get `rembangs`.
const REM_BANGS: &str = "did:plc:3nodfbwjlsd77ckgrodawvpv";

const FOURTEEN_DAYS: i64 = 14 * 24 * 60 * 60;
const AUTHOR_FEED_SAMPLE: i64 = 50;

static GM_REGEX: OnceLock<Regex> = OnceLock::new();
static GN_REGEX: OnceLock<Regex> = OnceLock::new();
static GOOD_AFTERNOON_REGEX: OnceLock<Regex> = OnceLock::new();
static GOOD_EVENING_REGEX: OnceLock<Regex> = OnceLock::new();
static GENERAL_MOTORS_REGEX: OnceLock<Regex> = OnceLock::new();

fn is_gm_post(evt: &PostEvent) -> bool {
    let text = &evt.post.text;
    let gm = GM_REGEX.get_or_init(|| {
        Regex::new(r"(?i)((\b((g'?’?m+(orning?)?)|(g[ou]+d\s?morning?))\b)|(((\(gm\))|(\bgm btw\b))))")
            .unwrap()
    });
    if gm.is_match(text) {
        // A GM with an off-site link might be General Motors news.
        let motors = GENERAL_MOTORS_REGEX.get_or_init(|| Regex::new(r"\bGM\b").unwrap());
        if motors.is_match(text) {
            for facet in &evt.post.facets {
                for feature in &facet.features {
                    if let Some(link) = &feature.uri {
                        if !link.contains("/bsky.app/") {
                            return false;
                        }
                    }
                }
            }
        }
        return true;
    }

    let gn = GN_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b((g'?’?n+(ight|ite)?)|(g[ou]+d\s?(night|nite)))\b").unwrap()
    });
    let afternoon = GOOD_AFTERNOON_REGEX
        .get_or_init(|| Regex::new(r"(?i)\b(g[ou]+d\s?(after)?noon)\b").unwrap());
    let evening = GOOD_EVENING_REGEX
        .get_or_init(|| Regex::new(r"(?i)\b(g[ou]+d\s?evening?)\b").unwrap());
    gn.is_match(text) || afternoon.is_match(text) || evening.is_match(text)
}

fn to_unix_time(timestamp: &str, clock: &Clock) -> i64 {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return parsed.timestamp();
    }
    // Some records carry sub-second garbage or bogus offsets; retry on
    // the truncated form and walk obviously-future stamps back.
    if timestamp.len() >= 20 {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&format!("{}Z", &timestamp[..19])) {
            let mut t = parsed.timestamp();
            let now = clock.now_unix();
            while t > now {
                t -= 3600;
            }
            return t;
        }
    }
    warn!(timestamp, "unparseable timestamp");
    clock.now_unix()
}

fn is_unindexable_actor_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}");
    msg.contains("AccountTakedown")
        || msg.contains("BlockedActor")
        || msg.contains("BlockedByActor")
        || msg.contains("Profile not found")
}

pub struct Indexer {
    pub db: Arc<Db>,
    client: Arc<dyn AtpClient>,
    http: reqwest::Client,
    keep_seconds: i64,
    prune_chunk: usize,
    label_tick_minutes: i64,
    custom_label_tick_minutes: i64,
    pruner_tick_minutes: i64,
}

impl Indexer {
    pub fn new(db: Arc<Db>, client: Arc<dyn AtpClient>, config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Indexer {
            db,
            client,
            http,
            keep_seconds: config.keep_days * 24 * 60 * 60,
            prune_chunk: config.prune_chunk,
            label_tick_minutes: config.label_tick_minutes,
            custom_label_tick_minutes: config.custom_label_tick_minutes,
            pruner_tick_minutes: config.pruner_tick_minutes,
        })
    }

    // ---- stream event dispatch ----

    pub fn post(&self, evt: &PostEvent) -> Result<Option<db::PostRow>> {
        let did = parse_did(&evt.uri);
        if NOISE_BOTS.contains(&did.as_str()) {
            return Ok(None);
        }

        let actor = self.db.actors.find_or_create_actor(&did)?;
        let now = self.db.clock().now_unix();
        let top_level = evt.post.parent_uri().is_empty();

        let mut labels: Vec<String> = Vec::with_capacity(2);
        if !actor.blocked && actor.created_at != 0 && top_level {
            if actor.posts == 0 {
                labels.push("newskie".to_string());
            }
            if actor.last_post > 0 && actor.last_post <= now - FOURTEEN_DAYS {
                labels.push("renewskie".to_string());
            }
        }
        if top_level && is_gm_post(evt) {
            labels.push("gmgn".to_string());
        }
        if did == REM_BANGS && evt.post.text.contains('‼') {
            labels.push("rembangs".to_string());
        }

        self.db.insert_post(evt, &actor, &labels)
    }

    pub fn like(&self, evt: &LikeEvent) -> Result<()> {
        self.db.insert_like(evt)
    }

    pub fn repost(&self, evt: &RepostEvent) -> Result<()> {
        self.db.insert_repost(evt)
    }

    pub fn follow(&self, evt: &FollowEvent) -> Result<()> {
        self.db.insert_follow(evt)
    }

    pub fn delete(&self, uri: &str) -> Result<()> {
        let result = if uri.contains("app.bsky.feed.like") {
            self.db.delete_like(uri)
        } else if uri.contains("app.bsky.feed.post") {
            self.db.delete_post(uri)
        } else if uri.contains("app.bsky.feed.repost") {
            self.db.delete_repost(uri)
        } else if uri.contains("app.bsky.graph.follow") {
            self.db.delete_follow(uri)
        } else {
            Ok(())
        };
        if let Err(err) = &result {
            warn!(uri, "error deleting record: {err:#}");
        }
        result
    }

    /// A block against us (or a tombstoned repo) makes the author
    /// unindexable.
    pub fn block(&self, evt: &BlockEvent) -> Result<()> {
        let did = parse_did(&evt.uri);
        if did.is_empty() {
            return Ok(());
        }
        self.db.block(&did)
    }

    pub fn tombstone(&self, did: &str) -> Result<()> {
        if did.is_empty() {
            return Ok(());
        }
        self.db.block(did)
    }

    /// First sighting of a brand-new account via its profile record.
    pub fn newskie(&self, did: &str) -> Result<()> {
        let mut actor = self.db.actors.find_or_create_actor(did)?;
        if !actor.created {
            return Ok(());
        }

        actor.created_at = self.db.clock().now_unix();
        if let Err(err) = self.db.init_actor_info(&actor, &[]) {
            warn!(did, "error initializing newskie actor: {err:#}");
            return Ok(());
        }
        // A fresh account has no follows to backfill.
        if let Err(err) = self
            .db
            .follows_indexed
            .find_or_create_by_actor_id(actor.actor_id)
            .and_then(|_| self.db.follows_indexed.set_last_follow(actor.actor_id, 0))
        {
            warn!(did, "error seeding newskie follow index: {err:#}");
        }
        Ok(())
    }

    /// Apply labels arriving on the moderation stream to local posts.
    pub fn label(&self, labels: &[Label]) -> Result<()> {
        let mut uri_to_post_id: HashMap<String, i64> = HashMap::new();
        let mut post_labels: HashMap<i64, Vec<String>> = HashMap::new();

        for label in labels {
            let post_id = match uri_to_post_id.get(&label.uri) {
                Some(id) => *id,
                None => {
                    let id = self.db.posts.find_post_id_by_uri(&label.uri)?;
                    uri_to_post_id.insert(label.uri.clone(), id);
                    id
                }
            };
            if post_id == 0 {
                continue;
            }
            post_labels.entry(post_id).or_default().push(label.val.clone());
        }

        for (post_id, names) in post_labels {
            self.db.label_post(post_id, &names)?;
        }
        Ok(())
    }

    // ---- scheduled work ----

    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        if self.label_tick_minutes != 0 {
            let indexer = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { indexer.run_label_ticker(shutdown).await });
        }
        if self.custom_label_tick_minutes != 0 {
            let indexer = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { indexer.run_custom_label_ticker(shutdown).await });
        }
        if self.pruner_tick_minutes != 0 {
            let indexer = self.clone();
            tokio::spawn(async move { indexer.run_pruner_ticker(shutdown).await });
        }
    }

    async fn run_label_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.label_tick_minutes.unsigned_abs() * 60,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_label_tick_once(&shutdown).await;
        }
    }

    /// One label tick: spend the upstream budget half on uninitialized
    /// actors, the rest on follow backfill.
    async fn run_label_tick_once(&self, shutdown: &watch::Receiver<bool>) {
        let rate_limit = (self.label_tick_minutes as f64 * 2750.0 / 5.0) as i64;
        let mut remaining = rate_limit;

        match self.index_uninitialized_actors(remaining / 2, shutdown).await {
            Ok(hits) => remaining -= hits,
            Err(err) => warn!("error indexing actors: {err:#}"),
        }

        if let Err(err) = self.index_unindexed_follows(remaining, shutdown).await {
            warn!("error indexing follows: {err:#}");
        }
    }

    async fn index_uninitialized_actors(
        &self,
        rate_limit: i64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<i64> {
        let mut hits = 0i64;
        let mut last_actor_id = 0i64;
        loop {
            if *shutdown.borrow() {
                return Ok(hits);
            }
            let (actors, spent) = self
                .init_uninitialized_actors(rate_limit - hits, last_actor_id, 25, shutdown)
                .await?;
            hits += spent;
            if actors.is_empty() || hits >= rate_limit {
                return Ok(hits);
            }
            last_actor_id = actors.last().unwrap().actor_id;
        }
    }

    async fn index_unindexed_follows(
        &self,
        rate_limit: i64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<i64> {
        let mut hits = 0i64;
        loop {
            if *shutdown.borrow() || hits >= rate_limit {
                return Ok(hits);
            }
            let rows = {
                let db = self.db.clone();
                let limit = rate_limit.max(1) as usize;
                tokio::task::spawn_blocking(move || db.follows_indexed.select_unindexed(limit))
                    .await??
            };
            if rows.is_empty() {
                return Ok(hits);
            }

            for row in rows {
                if *shutdown.borrow() {
                    return Ok(hits);
                }
                let actor = {
                    let db = self.db.clone();
                    let actor_id = row.actor_id;
                    tokio::task::spawn_blocking(move || db.actors.find_actor_by_id(actor_id))
                        .await??
                };
                let Some(actor) = actor else {
                    continue;
                };
                if actor.blocked {
                    let db = self.db.clone();
                    let actor_id = actor.actor_id;
                    if let Err(err) = tokio::task::spawn_blocking(move || {
                        db.follows_indexed.set_last_follow(actor_id, 0)
                    })
                    .await?
                    {
                        warn!(actor_id = actor.actor_id, "error skipping blocked actor: {err:#}");
                    }
                    continue;
                }

                match self.index_follows(rate_limit - hits, &actor).await {
                    Ok(spent) => hits += spent,
                    Err(err) => {
                        hits += 1;
                        warn!(actor_id = actor.actor_id, "error indexing follows: {err:#}");
                        continue;
                    }
                }
                if hits >= rate_limit {
                    return Ok(hits);
                }
            }
        }
    }

    /// Page through the actor's upstream follow list and materialize
    /// Follow rows. The upstream cursor is persisted per page so a
    /// restart resumes where it left off.
    pub async fn index_follows(&self, rate_limit: i64, actor: &ActorRow) -> Result<i64> {
        let actor_id = actor.actor_id;
        let indexed = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || {
                db.follows_indexed.find_or_create_by_actor_id(actor_id)
            })
            .await??
        };
        if indexed.last_follow >= 0 {
            return Ok(0);
        }

        let mut hits = 0i64;
        let mut cursor = indexed.cursor;
        let mut last_id = 0i64;
        let now = self.db.clock().now_unix();

        loop {
            let (records, next_cursor) =
                match self.client.get_follows(&actor.did, 100, &cursor).await {
                    Ok(page) => page,
                    Err(err) => {
                        if format!("{err:#}").contains("Could not find repo") {
                            let db = self.db.clone();
                            tokio::task::spawn_blocking(move || {
                                db.follows_indexed.set_last_follow(actor_id, 0)
                            })
                            .await??;
                            return Ok(hits + 1);
                        }
                        return Err(err);
                    }
                };
            hits += 1;
            if records.is_empty() {
                break;
            }

            let mut rows = Vec::with_capacity(records.len());
            for record in &records {
                let subject = {
                    let db = self.db.clone();
                    let did = record.value.subject.clone();
                    tokio::task::spawn_blocking(move || db.actors.find_or_create_actor(&did))
                        .await??
                };
                rows.push(FollowRow {
                    follow_id: 0,
                    rkey: parse_rkey(&record.uri),
                    actor_id,
                    subject_id: subject.actor_id,
                    created_at: now,
                });
            }

            let inserted = {
                let db = self.db.clone();
                tokio::task::spawn_blocking(move || db.follows.insert_follows(&rows)).await??
            };
            if inserted != 0 {
                last_id = inserted;
            }

            if next_cursor.is_empty() {
                break;
            }
            cursor = next_cursor;

            if hits >= rate_limit {
                let db = self.db.clone();
                let cursor = cursor.clone();
                tokio::task::spawn_blocking(move || {
                    db.follows_indexed.set_cursor(actor_id, &cursor)
                })
                .await??;
                return Ok(hits);
            }
        }

        if last_id == 0 {
            let db = self.db.clone();
            if let Some(last) =
                tokio::task::spawn_blocking(move || db.follows.find_last_follow(actor_id))
                    .await??
            {
                last_id = last.follow_id;
            }
        }

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.follows_indexed.find_or_create_by_actor_id(actor_id)?;
            db.follows_indexed.set_last_follow(actor_id, last_id)
        })
        .await??;

        Ok(hits)
    }

    /// Batch-initialize actors seen on the firehose but never profiled.
    pub async fn init_uninitialized_actors(
        &self,
        rate_limit: i64,
        cutoff: i64,
        limit: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(Vec<ActorRow>, i64)> {
        if rate_limit <= 0 {
            return Ok((Vec::new(), 0));
        }

        let actors = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || {
                db.actors.select_uninitialized_actors(cutoff, limit)
            })
            .await??
        };
        if actors.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let mut dids = Vec::with_capacity(actors.len());
        let mut rows_by_did: HashMap<String, ActorRow> = HashMap::new();
        // Dids whose rows have already been written back; the final
        // sweep must not touch them again with a stale copy.
        let mut handled: std::collections::HashSet<String> = std::collections::HashSet::new();
        for actor in &actors {
            if !actor.did.starts_with("did:plc:") {
                info!(did = actor.did, "blocking non plc did");
                let mut blocked = actor.clone();
                blocked.blocked = true;
                self.update_actor_blocking(blocked).await?;
                handled.insert(actor.did.clone());
                continue;
            }
            dids.push(actor.did.clone());
            rows_by_did.insert(actor.did.clone(), actor.clone());
        }

        let mut count = 1i64;
        let mut profiles = match self.client.get_actors(&dids).await {
            Ok(profiles) => profiles,
            Err(batch_err) => {
                // Fall back to per-actor lookups so one bad did cannot
                // poison the batch.
                warn!("batch profile fetch failed, falling back: {batch_err:#}");
                let mut singles = Vec::new();
                for did in &dids {
                    if count >= rate_limit || *shutdown.borrow() {
                        return Ok((Vec::new(), count));
                    }
                    count += 1;
                    let actor = rows_by_did.get(did).cloned().unwrap_or_default();
                    match self.client.get_actor(did).await {
                        Ok(Some(profile)) if profile.handle == "handle.invalid" => {
                            let mut row = actor;
                            row.created_at = -1;
                            self.update_actor_blocking(row).await?;
                            handled.insert(did.clone());
                        }
                        Ok(Some(profile)) => singles.push(profile),
                        Ok(None) => {
                            let mut row = actor;
                            row.created_at = -1;
                            self.update_actor_blocking(row).await?;
                            handled.insert(did.clone());
                        }
                        Err(err) if is_unindexable_actor_error(&err) => {
                            let mut row = actor;
                            row.blocked = true;
                            row.created_at = -1;
                            self.update_actor_blocking(row).await?;
                            handled.insert(did.clone());
                        }
                        Err(err) => {
                            warn!(did, "error getting actor: {err:#}");
                        }
                    }
                }
                singles
            }
        };

        if count >= rate_limit {
            return Ok((Vec::new(), count));
        }

        for profile in profiles.drain(..) {
            let Some(actor) = rows_by_did.get(&profile.did).cloned() else {
                continue;
            };
            handled.insert(profile.did.clone());

            if profile.handle == "handle.invalid" {
                let mut row = actor;
                row.created_at = -1;
                self.update_actor_blocking(row).await?;
                continue;
            }

            match self.init_actor_info(actor.clone(), Some(profile)).await {
                Ok(hits) => count += hits,
                Err(err) => warn!(did = actor.did, "error initializing actor: {err:#}"),
            }
            if count >= rate_limit || *shutdown.borrow() {
                return Ok((Vec::new(), count));
            }
        }

        // Anything left neither profiled nor written back is marked
        // unindexable so the tick does not spin on it forever.
        for actor in &actors {
            if actor.did.starts_with("did:plc:") && !handled.contains(&actor.did) {
                let mut row = actor.clone();
                row.created_at = -1;
                self.update_actor_blocking(row).await?;
            }
        }

        Ok((actors, count))
    }

    async fn update_actor_blocking(&self, actor: ActorRow) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.init_actor_info(&actor, &[])).await?
    }

    /// Fill in an actor row from its upstream profile: creation epoch,
    /// counters, and the first-post `newskie` label when the history is
    /// small enough to see all of it.
    pub async fn init_actor_info(
        &self,
        mut actor: ActorRow,
        profile: Option<ProfileView>,
    ) -> Result<i64> {
        let clock = self.db.clock().clone();
        let mut hits = 0i64;

        if actor.created_at != 0 || actor.blocked {
            self.update_actor_blocking(actor).await?;
            return Ok(hits);
        }
        if !actor.did.starts_with("did:plc:") {
            info!(did = actor.did, "blocking non plc did");
            actor.blocked = true;
            self.update_actor_blocking(actor).await?;
            return Ok(hits);
        }

        let Some(profile) = profile else {
            actor.created_at = -1;
            self.update_actor_blocking(actor).await?;
            return Ok(hits);
        };

        if profile
            .viewer
            .as_ref()
            .and_then(|v| v.blocked_by)
            .unwrap_or(false)
        {
            actor.blocked = true;
            actor.created_at = -1;
            self.update_actor_blocking(actor).await?;
            return Ok(hits);
        }

        actor.created_at = match &profile.indexed_at {
            Some(indexed_at) => to_unix_time(indexed_at, &clock),
            None => clock.now_unix(),
        };

        let total_posts = profile.posts_count.unwrap_or(0);
        actor.posts = total_posts;

        let mut first_post: Option<FeedViewPost> = None;
        if total_posts != 0 {
            let feed = self
                .client
                .get_author_feed(&profile.handle, "posts_no_replies", AUTHOR_FEED_SAMPLE, "")
                .await;
            hits += 1;

            let posts = match feed {
                Ok((posts, _)) => posts,
                Err(err) if is_unindexable_actor_error(&err) => {
                    actor.blocked = true;
                    self.update_actor_blocking(actor).await?;
                    return Ok(hits);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("get author feed for {}", actor.did))
                }
            };
            if posts.is_empty() {
                actor.posts = 0;
                self.update_actor_blocking(actor).await?;
                return Ok(hits);
            }

            // Reverse chronological: the earliest original post shows up
            // last.
            let mut original_posts = 0i64;
            let mut last_post: Option<&FeedViewPost> = None;
            for post in &posts {
                let author_matches = post
                    .post
                    .author
                    .as_ref()
                    .map(|a| a.did == actor.did)
                    .unwrap_or(false);
                if !author_matches {
                    continue;
                }
                if post.reply.is_none() {
                    original_posts += 1;
                    first_post = Some(post.clone());
                    if last_post.is_none() {
                        last_post = Some(post);
                    }
                }
            }
            let mut last_post = last_post.cloned();
            if actor.last_post == 0 && last_post.is_none() && total_posts > AUTHOR_FEED_SAMPLE {
                last_post = posts.last().cloned();
            }
            if let Some(last) = &last_post {
                actor.last_post = to_unix_time(&last.post.indexed_at, &clock);
            }
            if total_posts <= AUTHOR_FEED_SAMPLE {
                actor.posts = original_posts;
            } else {
                // More history than the sample; the first post we saw is
                // probably not the actual first.
                first_post = None;
                actor.posts = total_posts;
            }
        }

        let mut post_labels: Vec<(i64, i64)> = Vec::new();
        if let Some(first) = first_post {
            let db = self.db.clone();
            let uri = first.post.uri.clone();
            let first_post_id =
                tokio::task::spawn_blocking(move || db.posts.find_post_id_by_uri(&uri)).await??;
            if first_post_id != 0 {
                let db = self.db.clone();
                let newskie =
                    tokio::task::spawn_blocking(move || db.labels.find_or_create_label("newskie"))
                        .await??;
                if newskie.label_id != 0 {
                    post_labels.push((first_post_id, newskie.label_id));
                }
            }
        }

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.init_actor_info(&actor, &post_labels)).await??;
        Ok(hits)
    }

    /// Label posts whose media we could not classify locally by asking
    /// the app view for their current label set.
    pub async fn batch_label(&self, cutoff: i64, limit: usize) -> Result<Vec<String>> {
        let rows = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || db.posts.select_unlabeled(cutoff, limit)).await??
        };
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let uris: Vec<String> = rows.iter().map(|row| row.uri.clone()).collect();
        let posts = self.client.get_posts(&uris).await?;
        let posts_by_uri: HashMap<&str, &crate::client::PostView> =
            posts.iter().map(|p| (p.uri.as_str(), p)).collect();

        for row in &rows {
            let Some(post) = posts_by_uri.get(row.uri.as_str()) else {
                let db = self.db.clone();
                let post_id = row.post_id;
                tokio::task::spawn_blocking(move || db.label_post(post_id, &[])).await??;
                continue;
            };

            let mut seen = std::collections::HashSet::new();
            let mut labels: Vec<String> = post
                .labels
                .iter()
                .filter(|l| seen.insert(l.val.clone()))
                .map(|l| l.val.clone())
                .collect();
            if !labels.is_empty()
                && post
                    .author
                    .as_ref()
                    .map(|a| a.did == REM_BANGS)
                    .unwrap_or(false)
            {
                labels.push("rembangs".to_string());
            }

            let db = self.db.clone();
            let post_id = row.post_id;
            tokio::task::spawn_blocking(move || db.label_post(post_id, &labels)).await??;
        }

        Ok(uris)
    }

    async fn run_custom_label_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.custom_label_tick_minutes.unsigned_abs() * 60,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_custom_label_tick_once(&shutdown).await;
        }
    }

    async fn run_custom_label_tick_once(&self, shutdown: &watch::Receiver<bool>) {
        let birthdays = async {
            if let Err(err) = self.initialize_actor_birthdays(0, shutdown).await {
                warn!("error initializing birthdays: {err:#}");
            }
        };
        let labels = async {
            let db = self.db.clone();
            let result = tokio::task::spawn_blocking(move || {
                db.record_birthday_labels()?;
                db.record_unbirthday_labels()?;
                db.prune_custom_labels()?;
                Ok::<_, anyhow::Error>(())
            })
            .await;
            match result {
                Ok(Err(err)) => warn!("error running custom labeler: {err:#}"),
                Err(err) => warn!("custom labeler task failed: {err:#}"),
                Ok(Ok(())) => {}
            }
        };
        tokio::join!(birthdays, labels);
    }

    /// Look up account-creation epochs for actors that have none yet.
    pub async fn initialize_actor_birthdays(
        &self,
        limit: i64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let chunk = 100usize;
        let mut count = 0i64;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let actors = self.initialize_actor_birthdays_once(0, chunk).await?;
            if actors.len() < chunk {
                return Ok(());
            }
            if limit != 0 {
                count += actors.len() as i64;
                if count >= limit {
                    return Ok(());
                }
            }
        }
    }

    pub async fn initialize_actor_birthdays_once(
        &self,
        cutoff: i64,
        chunk: usize,
    ) -> Result<Vec<ActorRow>> {
        let actors = {
            let db = self.db.clone();
            tokio::task::spawn_blocking(move || {
                db.actors.select_actors_without_birthdays(cutoff, chunk)
            })
            .await??
        };
        if actors.is_empty() {
            return Ok(Vec::new());
        }

        for actor in &actors {
            let created_at = plc::lookup_plc_created_at(&self.http, &actor.did).await?;
            let db = self.db.clone();
            let mut row = actor.clone();
            tokio::task::spawn_blocking(move || {
                if created_at == 0 {
                    // The directory has never heard of them.
                    row.blocked = true;
                    db.init_actor_info(&row, &[])
                } else {
                    db.actors.initialize_birthday(&row.did, created_at).map(|_| ())
                }
            })
            .await??;
        }

        Ok(actors)
    }

    async fn run_pruner_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.pruner_tick_minutes.unsigned_abs() * 60,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let since = self.db.clock().now_unix() - self.keep_seconds;
            let chunk = self.prune_chunk;
            let mut total = 0usize;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let db = self.db.clone();
                let pruned =
                    match tokio::task::spawn_blocking(move || db.prune(since, chunk)).await {
                        Ok(Ok(pruned)) => pruned,
                        Ok(Err(err)) => {
                            warn!("error pruning: {err:#}");
                            break;
                        }
                        Err(err) => {
                            warn!("pruner task failed: {err:#}");
                            break;
                        }
                    };
                total += pruned;
                if pruned < chunk {
                    break;
                }
            }
            if total > 0 {
                info!(total, "pruned old posts");
            }
        }
    }
}
