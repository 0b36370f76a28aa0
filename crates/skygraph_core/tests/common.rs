/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared harness for the engine integration tests: a temp-dir database
//! with a settable clock, extended indexing, and a throwaway signing
//! key, plus builders for the firehose events the indexer consumes.

#![allow(dead_code)]

use skygraph_core::clock::Clock;
use skygraph_core::config::Config;
use skygraph_core::db::{ActorRow, Db, LikeRow, PostRow};
use skygraph_core::firehose::{FollowEvent, LikeEvent, PostEvent, RepostEvent};
use skygraph_core::signing::SigningKey;
use skygraph_protocol::{
    Facet, FacetFeature, PostEmbed, PostRecord, ReplyRef, SelfLabelValue, SelfLabels, StrongRef,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Frozen test epoch: 2023-06-15T12:00:00Z. The preceding year has no
/// leap day, so "one calendar year ago" is exactly 365 days.
pub const TEST_NOW: i64 = 1_686_830_400;

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

pub fn next_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct TestDb {
    pub db: Arc<Db>,
    pub clock: Clock,
    pub dir: tempfile::TempDir,
    pub config: Config,
}

pub fn test_db() -> TestDb {
    test_db_with(|_| {})
}

pub fn test_db_with(customize: impl FnOnce(&mut Config)) -> TestDb {
    let dir = tempfile::tempdir().expect("create temp dir");
    let clock = Clock::mock(TEST_NOW);

    let mut config = Config {
        db_dir: dir.path().to_path_buf(),
        signing_key_hex: SigningKey::generate().to_hex(),
        extended_indexing: true,
        clock: clock.clone(),
        ..Config::default()
    };
    customize(&mut config);

    let db = Arc::new(Db::open(&config).expect("open test db"));
    TestDb {
        db,
        clock,
        dir,
        config,
    }
}

impl TestDb {
    /// Reopen on the same directory, e.g. after seeding a pinned post.
    pub fn reopen_with(&mut self, customize: impl FnOnce(&mut Config)) {
        customize(&mut self.config);
        self.db = Arc::new(Db::open(&self.config).expect("reopen test db"));
    }

    pub fn create_actor(&self) -> ActorRow {
        self.db
            .actors
            .find_or_create_actor(&new_did())
            .expect("create actor")
    }

    pub fn create_post(&self, input: PostInput) -> PostRow {
        let evt = post_event(&self.clock, &input);
        let actor = self
            .db
            .actors
            .find_or_create_actor(&skygraph_core::uri::parse_did(&evt.uri))
            .expect("create post author");
        self.db
            .insert_post(&evt, &actor, &input.labels)
            .expect("insert post")
            .expect("post accepted")
    }

    pub fn create_like(&self, actor: &ActorRow, post: &PostRow) -> LikeRow {
        let uri = record_uri(&actor.did, "app.bsky.feed.like");
        self.db
            .insert_like(&LikeEvent {
                uri: uri.clone(),
                subject_uri: post.uri.clone(),
                seq: 0,
            })
            .expect("insert like");
        self.db
            .likes
            .find_by_uri(&uri)
            .expect("find like")
            .expect("like row")
    }

    pub fn create_repost(&self, actor: &ActorRow, post: &PostRow) {
        let uri = record_uri(&actor.did, "app.bsky.feed.repost");
        self.db
            .insert_repost(&RepostEvent {
                uri,
                subject_uri: post.uri.clone(),
                seq: 0,
            })
            .expect("insert repost");
    }

    pub fn create_follow(&self, actor: &ActorRow, subject: &ActorRow) {
        self.db
            .insert_follow(&FollowEvent {
                uri: record_uri(&actor.did, "app.bsky.graph.follow"),
                subject: subject.did.clone(),
                seq: 0,
            })
            .expect("insert follow");
    }

    pub fn refetch_post(&self, post: &PostRow) -> PostRow {
        self.db
            .posts
            .find_by_uri(&post.uri)
            .expect("find post")
            .expect("post row")
    }

    pub fn refetch_actor(&self, actor: &ActorRow) -> ActorRow {
        self.db
            .actors
            .find_actor_by_id(actor.actor_id)
            .expect("find actor")
            .expect("actor row")
    }
}

pub fn new_did() -> String {
    format!("did:plc:test{:012}", next_id())
}

pub fn record_uri(did: &str, collection: &str) -> String {
    format!("at://{did}/{collection}/{}", next_id())
}

pub fn post_uri(did: &str) -> String {
    record_uri(did, "app.bsky.feed.post")
}

#[derive(Default)]
pub struct PostInput {
    /// Author did; ignored when `uri` is set.
    pub actor: String,
    pub uri: String,
    pub mentions: Vec<String>,
    pub quote: String,
    pub reply: String,
    pub text: String,
    pub labels: Vec<String>,
    pub self_labels: Vec<String>,
}

pub fn post_event(clock: &Clock, input: &PostInput) -> PostEvent {
    let uri = if input.uri.is_empty() {
        post_uri(&input.actor)
    } else {
        input.uri.clone()
    };

    let mut record = PostRecord {
        text: input.text.clone(),
        created_at: clock.now_string(),
        ..Default::default()
    };
    if !input.reply.is_empty() {
        record.reply = Some(ReplyRef {
            parent: Some(StrongRef {
                uri: input.reply.clone(),
            }),
            root: Some(StrongRef {
                uri: input.reply.clone(),
            }),
        });
    }
    if !input.quote.is_empty() {
        record.embed = Some(PostEmbed {
            kind: "app.bsky.embed.record".to_string(),
            record: Some(skygraph_protocol::EmbedRecordNode::Ref(StrongRef {
                uri: input.quote.clone(),
            })),
        });
    }
    for did in &input.mentions {
        record.facets.push(Facet {
            features: vec![FacetFeature {
                kind: "app.bsky.richtext.facet#mention".to_string(),
                did: Some(did.clone()),
                uri: None,
            }],
        });
    }
    if !input.self_labels.is_empty() {
        record.labels = Some(SelfLabels {
            values: input
                .self_labels
                .iter()
                .map(|val| SelfLabelValue { val: val.clone() })
                .collect(),
        });
    }

    PostEvent::new(record, uri, 0)
}

pub fn post_ids(posts: &[PostRow]) -> Vec<i64> {
    posts.iter().map(|p| p.post_id).collect()
}

pub fn uris(posts: &[PostRow]) -> Vec<String> {
    posts.iter().map(|p| p.uri.clone()).collect()
}
