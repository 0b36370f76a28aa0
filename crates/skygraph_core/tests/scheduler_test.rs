/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::{PostInput, TEST_NOW};
use skygraph_core::client::{
    AuthorView, FeedViewPost, MockAtpClient, PostView, ProfileView,
};
use skygraph_core::indexer::Indexer;
use skygraph_protocol::Label;
use std::sync::Arc;
use tokio::sync::watch;

fn indexer_with(t: &common::TestDb, client: Arc<MockAtpClient>) -> Arc<Indexer> {
    Arc::new(Indexer::new(t.db.clone(), client, &t.config).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn uninitialized_actors_get_profiled() {
    let t = common::test_db();
    let actor = t.create_actor();
    let post = t.create_post(PostInput {
        actor: actor.did.clone(),
        ..Default::default()
    });

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    client.put_profile(ProfileView {
        did: actor.did.clone(),
        handle: "someone.test".to_string(),
        indexed_at: Some("2023-01-02T03:04:05Z".to_string()),
        posts_count: Some(1),
        viewer: None,
    });
    client.author_feeds.lock().unwrap().insert(
        "someone.test".to_string(),
        vec![FeedViewPost {
            post: PostView {
                uri: post.uri.clone(),
                indexed_at: "2023-01-02T03:04:05Z".to_string(),
                labels: Vec::new(),
                author: Some(AuthorView {
                    did: actor.did.clone(),
                }),
            },
            reply: None,
        }],
    );

    let indexer = indexer_with(&t, client);
    let (_, shutdown) = watch::channel(false);
    let (actors, hits) = indexer
        .init_uninitialized_actors(100, 0, 25, &shutdown)
        .await
        .unwrap();
    assert_eq!(actors.len(), 1);
    assert!(hits >= 1);

    let initialized = t.refetch_actor(&actor);
    assert_eq!(initialized.created_at, 1672628645);
    assert_eq!(initialized.posts, 1);
    assert!(!initialized.blocked);

    // Exactly one lifetime post: it gets the first-post label.
    let newskie = t.db.labels.find_label("newskie").unwrap().unwrap();
    assert_eq!(
        t.db.post_labels.select_labels_by_post_id(post.post_id).unwrap(),
        vec![newskie.label_id]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn takedowns_mark_the_actor_blocked() {
    let t = common::test_db();
    let actor = t.create_actor();

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    client.fail_actor(&actor.did, "AccountTakedown");

    let indexer = indexer_with(&t, client);
    let (_, shutdown) = watch::channel(false);
    indexer
        .init_uninitialized_actors(100, 0, 25, &shutdown)
        .await
        .unwrap();

    let blocked = t.refetch_actor(&actor);
    assert!(blocked.blocked);
    assert_eq!(blocked.created_at, -1);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_plc_actors_are_blocked_outright() {
    let t = common::test_db();
    let actor = t
        .db
        .actors
        .find_or_create_actor("did:web:weird.example")
        .unwrap();

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);
    let (_, shutdown) = watch::channel(false);
    indexer
        .init_uninitialized_actors(100, 0, 25, &shutdown)
        .await
        .unwrap();

    assert!(t.refetch_actor(&actor).blocked);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_label_applies_upstream_labels() {
    let t = common::test_db();
    let author = t.create_actor();
    // A quote embed counts as media, so the post starts unlabeled.
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        quote: common::post_uri(&common::new_did()),
        ..Default::default()
    });
    assert_eq!(t.refetch_post(&post).labeled, 0);

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    client.put_post(PostView {
        uri: post.uri.clone(),
        indexed_at: String::new(),
        labels: vec![skygraph_core::client::LabelView {
            val: "nudity".to_string(),
        }],
        author: Some(AuthorView {
            did: author.did.clone(),
        }),
    });

    let indexer = indexer_with(&t, client);
    t.clock.set_now(TEST_NOW + 600);
    let labeled = indexer.batch_label(TEST_NOW + 300, 25).await.unwrap();
    assert_eq!(labeled.len(), 1);

    assert_eq!(t.refetch_post(&post).labeled, 1);
    let nudity = t.db.labels.find_label("nudity").unwrap().unwrap();
    assert!(t
        .db
        .post_labels
        .select_labels_by_post_id(post.post_id)
        .unwrap()
        .contains(&nudity.label_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_label_marks_vanished_posts_labeled() {
    let t = common::test_db();
    let author = t.create_actor();
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        quote: common::post_uri(&common::new_did()),
        ..Default::default()
    });

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);
    t.clock.set_now(TEST_NOW + 600);
    indexer.batch_label(TEST_NOW + 300, 25).await.unwrap();

    let row = t.refetch_post(&post);
    assert_eq!(row.labeled, 1);
    assert!(t
        .db
        .post_labels
        .select_labels_by_post_id(post.post_id)
        .unwrap()
        .is_empty());
}

#[test]
fn moderation_stream_labels_land_on_posts() {
    let t = common::test_db();
    let author = t.create_actor();
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        quote: common::post_uri(&common::new_did()),
        ..Default::default()
    });

    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);
    indexer
        .label(&[Label {
            ver: Some(1),
            src: "did:plc:modservice".to_string(),
            uri: post.uri.clone(),
            cid: None,
            val: "porn".to_string(),
            neg: None,
            cts: "2023-06-15T12:00:00Z".to_string(),
            exp: None,
            sig: None,
        }])
        .unwrap();

    assert_eq!(t.refetch_post(&post).labeled, 1);
    let porn = t.db.labels.find_label("porn").unwrap().unwrap();
    assert!(t
        .db
        .post_labels
        .select_labels_by_post_id(post.post_id)
        .unwrap()
        .contains(&porn.label_id));
}

#[test]
fn new_profiles_seed_actor_and_follow_state() {
    let t = common::test_db();
    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);

    let did = common::new_did();
    indexer.newskie(&did).unwrap();

    let actor = t.db.actors.find_actor(&did).unwrap().unwrap();
    assert_eq!(actor.created_at, TEST_NOW);
    let indexed = t
        .db
        .follows_indexed
        .find_by_actor_id(actor.actor_id)
        .unwrap()
        .unwrap();
    assert_eq!(indexed.last_follow, 0);

    // Seeing the same profile again changes nothing.
    indexer.newskie(&did).unwrap();
    let again = t.db.actors.find_actor(&did).unwrap().unwrap();
    assert_eq!(again.created_at, TEST_NOW);
}

#[test]
fn noise_bot_posts_are_dropped() {
    let t = common::test_db();
    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);

    let evt = common::post_event(
        &t.clock,
        &PostInput {
            actor: "did:plc:kzkl2onyewbs7pehh2ellzcb".to_string(),
            text: "breaking news".to_string(),
            ..Default::default()
        },
    );
    let row = indexer.post(&evt).unwrap();
    assert!(row.is_none());
}

#[test]
fn first_posts_get_the_newskie_label_inline() {
    let t = common::test_db();
    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);

    // An initialized actor with no posts yet.
    let did = common::new_did();
    let mut actor = t.db.actors.find_or_create_actor(&did).unwrap();
    actor.created_at = TEST_NOW - 3600;
    t.db.init_actor_info(&actor, &[]).unwrap();

    let evt = common::post_event(
        &t.clock,
        &PostInput {
            actor: did.clone(),
            text: "hello world".to_string(),
            ..Default::default()
        },
    );
    let row = indexer.post(&evt).unwrap().unwrap();

    let newskie = t.db.labels.find_label("newskie").unwrap().unwrap();
    assert!(t
        .db
        .post_labels
        .select_labels_by_post_id(row.post_id)
        .unwrap()
        .contains(&newskie.label_id));
}

#[test]
fn gm_posts_get_the_gmgn_label() {
    let t = common::test_db();
    let client = Arc::new(MockAtpClient::new("did:plc:feedbot"));
    let indexer = indexer_with(&t, client);

    let did = common::new_did();
    let evt = common::post_event(
        &t.clock,
        &PostInput {
            actor: did,
            text: "good morning everyone!".to_string(),
            ..Default::default()
        },
    );
    let row = indexer.post(&evt).unwrap().unwrap();

    let gmgn = t.db.labels.find_label("gmgn").unwrap().unwrap();
    assert!(t
        .db
        .post_labels
        .select_labels_by_post_id(row.post_id)
        .unwrap()
        .contains(&gmgn.label_id));
}
