/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub mod car;

/// Header `op` for a regular message frame.
pub const OP_MESSAGE: i64 = 1;
/// Header `op` for an error frame.
pub const OP_ERROR: i64 = -1;

pub const MSG_COMMIT: &str = "#commit";
pub const MSG_TOMBSTONE: &str = "#tombstone";
pub const MSG_LABELS: &str = "#labels";
pub const MSG_INFO: &str = "#info";

/// CBOR header preceding every binary stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub op: i64,
    #[serde(rename = "t", default, skip_serializing_if = "String::is_empty")]
    pub msg_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A signed label record. Field order matters: the signature covers the
/// CBOR encoding of the record with `sig` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
    pub src: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub val: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    pub cts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_bytes"
    )]
    pub sig: Option<Vec<u8>>,
}

impl Label {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).context("encode label")?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(data).context("decode label")
    }
}

/// Body of a `#labels` frame on the label-subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsFrame {
    pub seq: i64,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoFrame {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A DAG-CBOR link (tag 42). The tagged byte string carries a multibase
/// prefix byte before the CID proper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidLink(pub ciborium::tag::Required<serde_bytes::ByteBuf, 42>);

impl CidLink {
    pub fn cid_bytes(&self) -> &[u8] {
        let raw: &[u8] = &(self.0).0;
        match raw.first() {
            Some(0) => &raw[1..],
            _ => raw,
        }
    }
}

/// Body of a `#commit` frame on the repo stream.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitFrame {
    pub seq: i64,
    pub repo: String,
    #[serde(rename = "tooBig", default)]
    pub too_big: bool,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default, with = "serde_bytes")]
    pub blocks: Vec<u8>,
    #[serde(default)]
    pub ops: Vec<CommitOp>,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitOp {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub cid: Option<CidLink>,
}

impl CommitOp {
    /// Collection segment of the op path (`app.bsky.feed.post/rkey`).
    pub fn collection(&self) -> &str {
        self.path.split('/').next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TombstoneFrame {
    pub seq: i64,
    pub did: String,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    #[serde(default)]
    pub parent: Option<StrongRef>,
    #[serde(default)]
    pub root: Option<StrongRef>,
}

/// `app.bsky.embed.record` holds the ref directly; `recordWithMedia`
/// nests it one level deeper.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EmbedRecordNode {
    Nested { record: StrongRef },
    Ref(StrongRef),
}

impl EmbedRecordNode {
    pub fn uri(&self) -> &str {
        match self {
            EmbedRecordNode::Ref(r) => &r.uri,
            EmbedRecordNode::Nested { record } => &record.uri,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostEmbed {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub record: Option<EmbedRecordNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FacetFeature {
    #[serde(rename = "$type", default)]
    pub kind: String,
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

impl FacetFeature {
    pub fn is_mention(&self) -> bool {
        self.kind.ends_with("#mention") && self.did.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfLabels {
    #[serde(default)]
    pub values: Vec<SelfLabelValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfLabelValue {
    #[serde(default)]
    pub val: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub embed: Option<PostEmbed>,
    #[serde(default)]
    pub facets: Vec<Facet>,
    #[serde(default)]
    pub labels: Option<SelfLabels>,
}

impl PostRecord {
    pub fn parent_uri(&self) -> &str {
        self.reply
            .as_ref()
            .and_then(|r| r.parent.as_ref())
            .map(|p| p.uri.as_str())
            .unwrap_or("")
    }

    pub fn quoted_uri(&self) -> &str {
        self.embed
            .as_ref()
            .and_then(|e| e.record.as_ref())
            .map(|r| r.uri())
            .unwrap_or("")
    }

    /// Mentioned dids: richtext mention facets plus the embedded record's
    /// author.
    pub fn mentions(&self) -> Vec<String> {
        let mut out = Vec::new();
        let quoted = self.quoted_uri();
        if !quoted.is_empty() {
            let did = parse_did_segment(quoted);
            if !did.is_empty() {
                out.push(did.to_string());
            }
        }
        for facet in &self.facets {
            for feature in &facet.features {
                if feature.is_mention() {
                    if let Some(did) = &feature.did {
                        if !did.is_empty() {
                            out.push(did.clone());
                        }
                    }
                }
            }
        }
        out
    }

    /// Anything beyond plain text and mention facets counts as media.
    pub fn has_media(&self) -> bool {
        if self.embed.is_some() {
            return true;
        }
        self.facets
            .iter()
            .flat_map(|f| f.features.iter())
            .any(|feature| !feature.is_mention())
    }

    pub fn self_labels(&self) -> Vec<String> {
        self.labels
            .as_ref()
            .map(|l| {
                l.values
                    .iter()
                    .filter(|v| !v.val.is_empty())
                    .map(|v| v.val.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_did_segment(uri: &str) -> &str {
    let rest = uri.strip_prefix("at://").unwrap_or(uri);
    rest.split('/').next().unwrap_or("")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectRef {
    pub subject: StrongRef,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphRecord {
    pub subject: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileRecord {
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
}

/// Typed view over the record variants the indexer consumes.
#[derive(Debug, Clone)]
pub enum Record {
    Post(PostRecord),
    Like(SubjectRef),
    Repost(SubjectRef),
    Follow(GraphRecord),
    Block(GraphRecord),
    Profile(ProfileRecord),
}

pub const COLLECTION_POST: &str = "app.bsky.feed.post";
pub const COLLECTION_LIKE: &str = "app.bsky.feed.like";
pub const COLLECTION_REPOST: &str = "app.bsky.feed.repost";
pub const COLLECTION_FOLLOW: &str = "app.bsky.graph.follow";
pub const COLLECTION_BLOCK: &str = "app.bsky.graph.block";
pub const COLLECTION_PROFILE: &str = "app.bsky.actor.profile";

/// Decode a raw DAG-CBOR record by its collection name.
pub fn decode_record(collection: &str, data: &[u8]) -> Result<Record> {
    let record = match collection {
        COLLECTION_POST => Record::Post(
            ciborium::de::from_reader(data).context("decode feed post")?,
        ),
        COLLECTION_LIKE => Record::Like(
            ciborium::de::from_reader(data).context("decode feed like")?,
        ),
        COLLECTION_REPOST => Record::Repost(
            ciborium::de::from_reader(data).context("decode feed repost")?,
        ),
        COLLECTION_FOLLOW => Record::Follow(
            ciborium::de::from_reader(data).context("decode graph follow")?,
        ),
        COLLECTION_BLOCK => Record::Block(
            ciborium::de::from_reader(data).context("decode graph block")?,
        ),
        COLLECTION_PROFILE => Record::Profile(
            ciborium::de::from_reader(data).context("decode actor profile")?,
        ),
        other => bail!("unhandled record collection: {other}"),
    };
    Ok(record)
}

pub fn is_handled_collection(collection: &str) -> bool {
    matches!(
        collection,
        COLLECTION_POST
            | COLLECTION_LIKE
            | COLLECTION_REPOST
            | COLLECTION_FOLLOW
            | COLLECTION_BLOCK
            | COLLECTION_PROFILE
    )
}

/// Split a binary stream frame into its header and body bytes.
pub fn decode_frame(data: &[u8]) -> Result<(EventHeader, &[u8])> {
    let mut rest = data;
    let header: EventHeader =
        ciborium::de::from_reader(&mut rest).context("decode frame header")?;
    Ok((header, rest))
}

/// Encode a `(header, body)` pair into one binary frame.
pub fn encode_frame<B: Serialize>(header: &EventHeader, body: &B) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(header, &mut buf).context("encode frame header")?;
    ciborium::ser::into_writer(body, &mut buf).context("encode frame body")?;
    Ok(buf)
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    ciborium::de::from_reader(body).context("decode frame body")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let header = EventHeader {
            op: OP_MESSAGE,
            msg_type: MSG_LABELS.to_string(),
        };
        let body = LabelsFrame {
            seq: 42,
            labels: vec![Label {
                ver: Some(1),
                src: "did:plc:labeler".to_string(),
                uri: "did:plc:someone".to_string(),
                cid: None,
                val: "birthday".to_string(),
                neg: None,
                cts: "2024-01-01T00:00:00Z".to_string(),
                exp: None,
                sig: Some(vec![1, 2, 3]),
            }],
        };

        let frame = encode_frame(&header, &body).unwrap();
        let (decoded_header, rest) = decode_frame(&frame).unwrap();
        assert_eq!(decoded_header.op, OP_MESSAGE);
        assert_eq!(decoded_header.msg_type, MSG_LABELS);

        let decoded: LabelsFrame = decode_body(rest).unwrap();
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.labels, body.labels);
    }

    #[test]
    fn error_frame_header_has_no_type() {
        let header = EventHeader {
            op: OP_ERROR,
            msg_type: String::new(),
        };
        let body = ErrorFrame {
            error: "FutureCursor".to_string(),
            message: Some("cursor in the future".to_string()),
        };
        let frame = encode_frame(&header, &body).unwrap();
        let (decoded, rest) = decode_frame(&frame).unwrap();
        assert_eq!(decoded.op, OP_ERROR);
        assert!(decoded.msg_type.is_empty());
        let err: ErrorFrame = decode_body(rest).unwrap();
        assert_eq!(err.error, "FutureCursor");
    }

    #[test]
    fn post_record_media_and_mentions() {
        let mut post = PostRecord {
            text: "hello @friend".to_string(),
            created_at: "2024-06-01T00:00:00Z".to_string(),
            ..Default::default()
        };
        assert!(!post.has_media());
        assert!(post.mentions().is_empty());

        post.facets = vec![Facet {
            features: vec![FacetFeature {
                kind: "app.bsky.richtext.facet#mention".to_string(),
                did: Some("did:plc:friend".to_string()),
                uri: None,
            }],
        }];
        assert!(!post.has_media());
        assert_eq!(post.mentions(), vec!["did:plc:friend".to_string()]);

        post.facets[0].features.push(FacetFeature {
            kind: "app.bsky.richtext.facet#link".to_string(),
            did: None,
            uri: Some("https://example.com".to_string()),
        });
        assert!(post.has_media());
    }

    #[test]
    fn quoted_uri_via_both_embed_shapes() {
        let direct: PostEmbed = ciborium::de::from_reader(
            to_cbor(&serde_json::json!({
                "$type": "app.bsky.embed.record",
                "record": {"uri": "at://did:plc:a/app.bsky.feed.post/1"}
            }))
            .as_slice(),
        )
        .unwrap();
        assert_eq!(
            direct.record.unwrap().uri(),
            "at://did:plc:a/app.bsky.feed.post/1"
        );

        let nested: PostEmbed = ciborium::de::from_reader(
            to_cbor(&serde_json::json!({
                "$type": "app.bsky.embed.recordWithMedia",
                "record": {"record": {"uri": "at://did:plc:b/app.bsky.feed.post/2"}}
            }))
            .as_slice(),
        )
        .unwrap();
        assert_eq!(
            nested.record.unwrap().uri(),
            "at://did:plc:b/app.bsky.feed.post/2"
        );
    }

    #[test]
    fn decode_record_rejects_unknown_collection() {
        assert!(decode_record("app.bsky.feed.generator", &[]).is_err());
    }

    fn to_cbor(value: &serde_json::Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).unwrap();
        buf
    }
}
