/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::PostInput;
use skygraph_core::client::{FollowListRecord, FollowListValue, MockAtpClient};
use skygraph_core::firehose::FollowEvent;
use skygraph_core::indexer::Indexer;
use std::sync::Arc;

#[test]
fn self_follows_are_ignored() {
    let t = common::test_db();
    let actor = t.create_actor();

    t.db.insert_follow(&FollowEvent {
        uri: common::record_uri(&actor.did, "app.bsky.graph.follow"),
        subject: actor.did.clone(),
        seq: 0,
    })
    .unwrap();

    let (follows, _) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert!(follows.is_empty());
}

#[test]
fn duplicate_follow_records_collapse() {
    let t = common::test_db();
    let actor = t.create_actor();
    let subject = t.create_actor();

    let uri = common::record_uri(&actor.did, "app.bsky.graph.follow");
    for _ in 0..2 {
        t.db.insert_follow(&FollowEvent {
            uri: uri.clone(),
            subject: subject.did.clone(),
            seq: 0,
        })
        .unwrap();
    }

    let (follows, _) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert_eq!(follows, vec![subject.actor_id]);
}

#[test]
fn follow_delete_removes_the_row() {
    let t = common::test_db();
    let actor = t.create_actor();
    let subject = t.create_actor();

    let uri = common::record_uri(&actor.did, "app.bsky.graph.follow");
    t.db.insert_follow(&FollowEvent {
        uri: uri.clone(),
        subject: subject.did.clone(),
        seq: 0,
    })
    .unwrap();
    t.db.delete_follow(&uri).unwrap();

    let rows = t.db.follows.select_follows(actor.actor_id, 0, 10).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn live_follows_extend_a_finished_backfill() {
    let t = common::test_db();
    let actor = t.create_actor();
    let first = t.create_actor();
    let second = t.create_actor();

    t.db.follows_indexed
        .find_or_create_by_actor_id(actor.actor_id)
        .unwrap();
    t.db.follows_indexed
        .set_last_follow(actor.actor_id, 0)
        .unwrap();

    t.create_follow(&actor, &first);
    let indexed = t
        .db
        .follows_indexed
        .find_by_actor_id(actor.actor_id)
        .unwrap()
        .unwrap();
    assert!(indexed.last_follow > 0);

    t.create_follow(&actor, &second);
    let (follows, indexed) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert!(indexed);
    assert_eq!(follows, vec![first.actor_id, second.actor_id]);
}

#[test]
fn backfill_state_is_tristate() {
    let t = common::test_db();
    let actor = t.create_actor();

    // Never seen: the entry is created in the in-progress state.
    assert!(t
        .db
        .follows_indexed
        .find_by_actor_id(actor.actor_id)
        .unwrap()
        .is_none());
    let (_, indexed) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert!(!indexed);
    let row = t
        .db
        .follows_indexed
        .find_by_actor_id(actor.actor_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.last_follow, -1);

    t.db.follows_indexed
        .set_last_follow(actor.actor_id, 0)
        .unwrap();
    let (_, indexed) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert!(indexed);
}

#[tokio::test(flavor = "multi_thread")]
async fn follow_backfill_pages_through_the_upstream_list() {
    let t = common::test_db();
    let actor = t.create_actor();
    let subjects: Vec<_> = (0..5).map(|_| common::new_did()).collect();

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    client.put_follows(
        &actor.did,
        subjects
            .iter()
            .map(|did| FollowListRecord {
                uri: common::record_uri(&actor.did, "app.bsky.graph.follow"),
                value: FollowListValue {
                    subject: did.clone(),
                },
            })
            .collect(),
    );

    let indexer = Arc::new(Indexer::new(t.db.clone(), client, &t.config).unwrap());
    t.db.follows_indexed
        .find_or_create_by_actor_id(actor.actor_id)
        .unwrap();

    let hits = indexer.index_follows(100, &actor).await.unwrap();
    assert!(hits >= 1);

    let (follows, indexed) = t.db.select_follows_for(actor.actor_id).unwrap();
    assert!(indexed);
    assert_eq!(follows.len(), subjects.len());

    // Running again is a no-op once the backfill completed.
    let hits = indexer.index_follows(100, &actor).await.unwrap();
    assert_eq!(hits, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_follow_list_completes_immediately() {
    let t = common::test_db();
    let actor = t.create_actor();

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    // No follows registered: the mock returns an empty page, which reads
    // as a completed (empty) follow list.
    let indexer = Arc::new(Indexer::new(t.db.clone(), client, &t.config).unwrap());

    let hits = indexer.index_follows(100, &actor).await.unwrap();
    assert_eq!(hits, 1);

    let row = t
        .db
        .follows_indexed
        .find_by_actor_id(actor.actor_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.last_follow, 0);
}

#[test]
fn followed_label_feed_uses_the_backfilled_set() {
    let t = common::test_db();
    let viewer = t.create_actor();
    let followed = t.create_actor();

    t.db.follows_indexed
        .find_or_create_by_actor_id(viewer.actor_id)
        .unwrap();
    t.db.follows_indexed
        .set_last_follow(viewer.actor_id, 0)
        .unwrap();
    t.create_follow(&viewer, &followed);

    let labeled = t.create_post(PostInput {
        actor: followed.did.clone(),
        labels: vec!["gmgn".to_string()],
        ..Default::default()
    });
    let stranger = t.create_actor();
    t.create_post(PostInput {
        actor: stranger.did.clone(),
        labels: vec!["gmgn".to_string()],
        ..Default::default()
    });
    t.clock.set_now(common::TEST_NOW + 600);

    let feed = t
        .db
        .select_posts_by_labels_followed(i64::MAX, 25, &viewer.did, &["gmgn"])
        .unwrap();
    assert_eq!(common::post_ids(&feed), vec![labeled.post_id]);
}
