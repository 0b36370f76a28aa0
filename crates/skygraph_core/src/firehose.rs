/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Typed view over the repo-commit stream: decodes commit frames into
//! per-record events and watches for sequence gaps that would mean
//! silent data loss between reconnects.

use crate::db::MARK;
use crate::subscriber::{fatal, Subscriber, SubscriberEvent, CHANNEL_BUFFER};
use crate::uri::parse_did;
use anyhow::{anyhow, Result};
use regex::Regex;
use skygraph_protocol::{
    car, decode_body, decode_record, is_handled_collection, CommitFrame, PostRecord, Record,
    SubjectRef, TombstoneFrame, COLLECTION_PROFILE, MSG_COMMIT, MSG_TOMBSTONE,
};
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

static DM_REGEX: OnceLock<Regex> = OnceLock::new();

fn dm_regex() -> &'static Regex {
    DM_REGEX.get_or_init(|| Regex::new(r"(?i)^\W*DM\W*\s@\w+\.").unwrap())
}

#[derive(Debug, Clone)]
pub struct PostEvent {
    pub uri: String,
    pub post: PostRecord,
    pub mentions: Vec<String>,
    pub quote: String,
    pub seq: i64,
}

impl PostEvent {
    pub fn new(post: PostRecord, uri: String, seq: i64) -> Self {
        let mentions = post.mentions();
        let quote = post.quoted_uri().to_string();
        PostEvent {
            uri,
            post,
            mentions,
            quote,
            seq,
        }
    }

    pub fn has_media(&self) -> bool {
        self.post.has_media()
    }

    /// A dm-style post: "DM @handle." prefix plus at least one mention.
    pub fn is_dm(&self) -> bool {
        dm_regex().is_match(&self.post.text) && !self.mentions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LikeEvent {
    pub uri: String,
    pub subject_uri: String,
    pub seq: i64,
}

#[derive(Debug, Clone)]
pub struct RepostEvent {
    pub uri: String,
    pub subject_uri: String,
    pub seq: i64,
}

#[derive(Debug, Clone)]
pub struct FollowEvent {
    pub uri: String,
    pub subject: String,
    pub seq: i64,
}

#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub uri: String,
    pub subject: String,
    pub seq: i64,
}

pub enum FirehoseEvent {
    Post(PostEvent),
    Like(LikeEvent),
    Repost(RepostEvent),
    Follow(FollowEvent),
    Block(BlockEvent),
    Delete { uri: String, seq: i64 },
    /// A newly created actor profile.
    Profile { did: String, seq: i64 },
    Tombstone { did: String, seq: i64 },
    Error(anyhow::Error),
}

impl FirehoseEvent {
    pub fn seq(&self) -> i64 {
        match self {
            FirehoseEvent::Post(e) => e.seq,
            FirehoseEvent::Like(e) => e.seq,
            FirehoseEvent::Repost(e) => e.seq,
            FirehoseEvent::Follow(e) => e.seq,
            FirehoseEvent::Block(e) => e.seq,
            FirehoseEvent::Delete { seq, .. } => *seq,
            FirehoseEvent::Profile { seq, .. } => *seq,
            FirehoseEvent::Tombstone { seq, .. } => *seq,
            FirehoseEvent::Error(_) => 0,
        }
    }
}

pub struct CommitStream {
    subscriber: Subscriber,
    own_did: String,
    extended_indexing: bool,
    /// A jump beyond this many sequence numbers means the upstream
    /// skipped data; the exact bound is stream policy, not a constant.
    max_seq_skip: i64,
}

impl CommitStream {
    pub fn new(
        host: &str,
        cursor_path: Option<PathBuf>,
        own_did: String,
        extended_indexing: bool,
        max_seq_skip: i64,
    ) -> Result<Self> {
        let addr = ws_addr(host, "/xrpc/com.atproto.sync.subscribeRepos")?;
        Ok(CommitStream {
            subscriber: Subscriber::new(addr, cursor_path),
            own_did,
            extended_indexing,
            max_seq_skip,
        })
    }

    pub fn ack(&self, seq: i64) {
        self.subscriber.ack(seq);
    }

    pub fn cursor(&self) -> i64 {
        self.subscriber.cursor()
    }

    pub async fn start(&mut self) -> Result<mpsc::Receiver<FirehoseEvent>> {
        let raw = self.subscriber.start().await?;
        Ok(self.decode_stream(raw))
    }

    pub fn stop(&mut self) {
        self.subscriber.stop();
    }

    pub async fn restart(&mut self) -> Result<mpsc::Receiver<FirehoseEvent>> {
        self.stop();
        self.start().await
    }

    fn decode_stream(
        &self,
        mut raw: mpsc::Receiver<SubscriberEvent>,
    ) -> mpsc::Receiver<FirehoseEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let own_did = self.own_did.clone();
        let extended = self.extended_indexing;
        let max_skip = self.max_seq_skip;
        let mut last_seq = self.subscriber.cursor();

        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                match event {
                    SubscriberEvent::Error(err) => {
                        let _ = tx.send(FirehoseEvent::Error(err)).await;
                        break;
                    }
                    SubscriberEvent::StreamError(err) => {
                        let _ = tx.send(FirehoseEvent::Error(fatal(err))).await;
                        break;
                    }
                    SubscriberEvent::Frame { header, body } => {
                        let events = match header.msg_type.as_str() {
                            MSG_COMMIT => match decode_commit(&body, &own_did, extended) {
                                Ok(events) => events,
                                Err(err) => {
                                    warn!("error decoding commit frame: {err:#}");
                                    continue;
                                }
                            },
                            MSG_TOMBSTONE => match decode_body::<TombstoneFrame>(&body) {
                                Ok(frame) => vec![FirehoseEvent::Tombstone {
                                    did: frame.did,
                                    seq: frame.seq,
                                }],
                                Err(err) => {
                                    warn!("error decoding tombstone frame: {err:#}");
                                    continue;
                                }
                            },
                            other => {
                                info!(msg_type = other, "skipping stream frame");
                                continue;
                            }
                        };

                        for event in events {
                            let seq = event.seq();
                            if seq != 0 {
                                if last_seq == 0 {
                                    last_seq = seq;
                                }
                                if seq - last_seq > max_skip {
                                    let err = fatal(anyhow!(
                                        "skipped too many seqs: went from {last_seq} to {seq}"
                                    ));
                                    let _ = tx.send(FirehoseEvent::Error(err)).await;
                                    return;
                                }
                                last_seq = seq;
                            }
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        rx
    }
}

/// Expand one commit frame into typed record events.
fn decode_commit(body: &[u8], own_did: &str, extended_indexing: bool) -> Result<Vec<FirehoseEvent>> {
    let commit: CommitFrame = decode_body(body)?;
    if commit.too_big {
        warn!(seq = commit.seq, "skipping too big commit");
        return Ok(Vec::new());
    }

    let mut events = Vec::new();
    let mut blocks = None;

    for op in &commit.ops {
        let collection = op.collection();
        if !is_handled_collection(collection) {
            continue;
        }
        let uri = format!("at://{}/{}", commit.repo, op.path);

        match op.action.as_str() {
            "create" | "update" => {
                let Some(cid) = &op.cid else {
                    continue;
                };
                if blocks.is_none() {
                    blocks = Some(car::read_blocks(&commit.blocks)?);
                }
                let Some(data) = blocks.as_ref().unwrap().get(cid.cid_bytes()) else {
                    // The op references a block the commit did not carry.
                    continue;
                };

                let record = match decode_record(collection, data) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%uri, "error decoding record: {err:#}");
                        continue;
                    }
                };

                match record {
                    Record::Post(post) => {
                        events.push(FirehoseEvent::Post(PostEvent::new(post, uri, commit.seq)));
                    }
                    Record::Like(SubjectRef { subject, .. }) => {
                        // Likes are indexed only in extended mode, except
                        // for the banger administrator.
                        if extended_indexing || parse_did(&uri) == MARK {
                            events.push(FirehoseEvent::Like(LikeEvent {
                                uri,
                                subject_uri: subject.uri,
                                seq: commit.seq,
                            }));
                        }
                    }
                    Record::Repost(SubjectRef { subject, .. }) => {
                        if extended_indexing {
                            events.push(FirehoseEvent::Repost(RepostEvent {
                                uri,
                                subject_uri: subject.uri,
                                seq: commit.seq,
                            }));
                        }
                    }
                    Record::Follow(follow) => {
                        events.push(FirehoseEvent::Follow(FollowEvent {
                            uri,
                            subject: follow.subject,
                            seq: commit.seq,
                        }));
                    }
                    Record::Block(block) => {
                        if block.subject == own_did {
                            events.push(FirehoseEvent::Block(BlockEvent {
                                uri,
                                subject: block.subject,
                                seq: commit.seq,
                            }));
                        }
                    }
                    Record::Profile(_) => {
                        if op.action == "create" && collection == COLLECTION_PROFILE {
                            events.push(FirehoseEvent::Profile {
                                did: commit.repo.clone(),
                                seq: commit.seq,
                            });
                        }
                    }
                }
            }
            "delete" => {
                events.push(FirehoseEvent::Delete {
                    uri,
                    seq: commit.seq,
                });
            }
            other => {
                warn!(action = other, "unknown commit op action");
            }
        }
    }

    Ok(events)
}

pub(crate) fn ws_addr(host: &str, path: &str) -> Result<String> {
    let (scheme, rest) = if let Some(rest) = host.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = host.strip_prefix("http://") {
        ("ws", rest)
    } else if host.starts_with("ws://") || host.starts_with("wss://") {
        return Ok(format!("{}{}", host.trim_end_matches('/'), path));
    } else {
        return Err(anyhow!("unsupported stream host scheme: {host}"));
    };
    Ok(format!("{scheme}://{}{path}", rest.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::value::Value;

    fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn build_car(cid: &[u8], record: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let header = b"\xa2eroots\x80gversion\x01".to_vec();
        write_uvarint(&mut out, header.len() as u64);
        out.extend_from_slice(&header);
        write_uvarint(&mut out, (cid.len() + record.len()) as u64);
        out.extend_from_slice(cid);
        out.extend_from_slice(record);
        out
    }

    fn to_cbor(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).unwrap();
        buf
    }

    fn commit_body(repo: &str, seq: i64, action: &str, path: &str, record: &Value) -> Vec<u8> {
        let mut cid = vec![0x01, 0x71, 0x12, 0x20];
        cid.extend(std::iter::repeat(9u8).take(32));
        let blocks = build_car(&cid, &to_cbor(record));

        let mut tagged = vec![0u8];
        tagged.extend_from_slice(&cid);

        let op = Value::Map(vec![
            (Value::Text("action".into()), Value::Text(action.into())),
            (Value::Text("path".into()), Value::Text(path.into())),
            (
                Value::Text("cid".into()),
                Value::Tag(42, Box::new(Value::Bytes(tagged))),
            ),
        ]);
        let commit = Value::Map(vec![
            (Value::Text("seq".into()), Value::Integer(seq.into())),
            (Value::Text("repo".into()), Value::Text(repo.into())),
            (Value::Text("tooBig".into()), Value::Bool(false)),
            (Value::Text("blocks".into()), Value::Bytes(blocks)),
            (Value::Text("ops".into()), Value::Array(vec![op])),
            (
                Value::Text("time".into()),
                Value::Text("2024-01-01T00:00:00Z".into()),
            ),
        ]);
        to_cbor(&commit)
    }

    #[test]
    fn decode_commit_extracts_a_post() {
        let record = Value::Map(vec![
            (Value::Text("text".into()), Value::Text("hello".into())),
            (
                Value::Text("createdAt".into()),
                Value::Text("2024-01-01T00:00:00Z".into()),
            ),
        ]);
        let body = commit_body(
            "did:plc:someone",
            77,
            "create",
            "app.bsky.feed.post/3kabc",
            &record,
        );

        let events = decode_commit(&body, "did:plc:feedbot", false).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FirehoseEvent::Post(post) => {
                assert_eq!(post.uri, "at://did:plc:someone/app.bsky.feed.post/3kabc");
                assert_eq!(post.post.text, "hello");
                assert_eq!(post.seq, 77);
            }
            _ => panic!("expected a post event"),
        }
    }

    #[test]
    fn decode_commit_skips_foreign_blocks() {
        let record = Value::Map(vec![(
            Value::Text("subject".into()),
            Value::Text("did:plc:other".into()),
        )]);
        // A block against someone else never becomes an event.
        let body = commit_body(
            "did:plc:someone",
            78,
            "create",
            "app.bsky.graph.block/3kdef",
            &record,
        );
        let events = decode_commit(&body, "did:plc:feedbot", false).unwrap();
        assert!(events.is_empty());

        let record = Value::Map(vec![(
            Value::Text("subject".into()),
            Value::Text("did:plc:feedbot".into()),
        )]);
        let body = commit_body(
            "did:plc:someone",
            79,
            "create",
            "app.bsky.graph.block/3kghi",
            &record,
        );
        let events = decode_commit(&body, "did:plc:feedbot", false).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FirehoseEvent::Block(_)));
    }

    #[test]
    fn decode_commit_emits_deletes_without_blocks() {
        let record = Value::Map(vec![]);
        let body = commit_body(
            "did:plc:someone",
            80,
            "delete",
            "app.bsky.feed.post/3kjkl",
            &record,
        );
        let events = decode_commit(&body, "did:plc:feedbot", false).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FirehoseEvent::Delete { uri, seq } => {
                assert_eq!(uri, "at://did:plc:someone/app.bsky.feed.post/3kjkl");
                assert_eq!(*seq, 80);
            }
            _ => panic!("expected a delete event"),
        }
    }

    #[test]
    fn likes_pass_only_for_extended_indexing_or_mark() {
        let record = Value::Map(vec![(
            Value::Text("subject".into()),
            Value::Map(vec![(
                Value::Text("uri".into()),
                Value::Text("at://did:plc:x/app.bsky.feed.post/1".into()),
            )]),
        )]);
        let body = commit_body(
            "did:plc:someone",
            81,
            "create",
            "app.bsky.feed.like/3kmno",
            &record,
        );

        assert!(decode_commit(&body, "did:plc:feedbot", false)
            .unwrap()
            .is_empty());
        assert_eq!(decode_commit(&body, "did:plc:feedbot", true).unwrap().len(), 1);

        let mark_body = commit_body(MARK, 82, "create", "app.bsky.feed.like/3kpqr", &record);
        assert_eq!(
            decode_commit(&mark_body, "did:plc:feedbot", false)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn ws_addr_maps_schemes() {
        assert_eq!(
            ws_addr("https://bsky.network", "/xrpc/com.atproto.sync.subscribeRepos").unwrap(),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            ws_addr("http://localhost:1234/", "/p").unwrap(),
            "ws://localhost:1234/p"
        );
        assert!(ws_addr("ftp://nope", "/p").is_err());
    }

    #[test]
    fn dm_regex_matches_dm_posts() {
        let mut post = PostRecord {
            text: "DM @friend.bsky.social hey".to_string(),
            ..Default::default()
        };
        post.facets = vec![skygraph_protocol::Facet {
            features: vec![skygraph_protocol::FacetFeature {
                kind: "app.bsky.richtext.facet#mention".to_string(),
                did: Some("did:plc:friend".to_string()),
                uri: None,
            }],
        }];
        let evt = PostEvent::new(post, "at://did:plc:a/app.bsky.feed.post/1".to_string(), 1);
        assert!(evt.is_dm());

        let plain = PostEvent::new(
            PostRecord {
                text: "just chatting".to_string(),
                ..Default::default()
            },
            "at://did:plc:a/app.bsky.feed.post/2".to_string(),
            2,
        );
        assert!(!plain.is_dm());
    }
}
