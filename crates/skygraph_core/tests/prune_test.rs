/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::{PostInput, TEST_NOW};
use skygraph_core::db::MARK;

#[test]
fn prune_removes_satellites_with_the_post() {
    let t = common::test_db();
    let author = t.create_actor();
    let target = t.create_actor();
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        mentions: vec![target.did.clone()],
        ..Default::default()
    });
    let mark = t.db.actors.find_or_create_actor(MARK).unwrap();
    let like = t.create_like(&mark, &post);

    let posts_before = t.refetch_actor(&author).posts;
    assert_eq!(posts_before, 1);

    let pruned = t.db.prune(TEST_NOW + 1, 10).unwrap();
    assert_eq!(pruned, 1);

    assert!(t.db.posts.find_by_uri(&post.uri).unwrap().is_none());
    assert!(t.db.likes.find_by_uri(&like.uri).unwrap().is_none());
    assert!(t.db.mentions.select_mentions(post.post_id).unwrap().is_empty());

    // Pruning deliberately leaves the author's counter alone.
    assert_eq!(t.refetch_actor(&author).posts, posts_before);
}

#[test]
fn prune_is_idempotent_per_window() {
    let t = common::test_db();
    let author = t.create_actor();
    for _ in 0..4 {
        t.create_post(PostInput {
            actor: author.did.clone(),
            ..Default::default()
        });
    }

    let first = t.db.prune(TEST_NOW + 1, 10).unwrap();
    assert_eq!(first, 4);

    let second = t.db.prune(TEST_NOW + 1, 10).unwrap();
    assert_eq!(second, 0);
}

#[test]
fn prune_respects_the_chunk_size() {
    let t = common::test_db();
    let author = t.create_actor();
    for _ in 0..5 {
        t.create_post(PostInput {
            actor: author.did.clone(),
            ..Default::default()
        });
    }

    assert_eq!(t.db.prune(TEST_NOW + 1, 2).unwrap(), 2);
    assert_eq!(t.db.prune(TEST_NOW + 1, 2).unwrap(), 2);
    assert_eq!(t.db.prune(TEST_NOW + 1, 2).unwrap(), 1);
    assert_eq!(t.db.prune(TEST_NOW + 1, 2).unwrap(), 0);
}

#[test]
fn prune_leaves_newer_posts_alone() {
    let t = common::test_db();
    let author = t.create_actor();
    let old = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    t.clock.set_now(TEST_NOW + 3600);
    let fresh = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    let pruned = t.db.prune(TEST_NOW + 1, 10).unwrap();
    assert_eq!(pruned, 1);
    assert!(t.db.posts.find_by_uri(&old.uri).unwrap().is_none());
    assert!(t.db.posts.find_by_uri(&fresh.uri).unwrap().is_some());
}

#[test]
fn prune_clears_reply_edges_before_posts() {
    let t = common::test_db();
    let author = t.create_actor();
    let op = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });
    let replier = t.create_actor();
    let reply = t.create_post(PostInput {
        actor: replier.did.clone(),
        reply: op.uri.clone(),
        ..Default::default()
    });

    let pruned = t.db.prune(TEST_NOW + 1, 10).unwrap();
    assert_eq!(pruned, 2);
    assert!(t.db.replies.find_by_post_id(reply.post_id).unwrap().is_none());
    assert!(t.db.quotes.find_by_post_id(reply.post_id).unwrap().is_none());
}
