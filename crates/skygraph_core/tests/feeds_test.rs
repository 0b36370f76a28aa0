/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::{post_ids, PostInput, TEST_NOW};
use skygraph_core::db::MARK;

#[test]
fn label_feed_pages_by_post_id() {
    let t = common::test_db();
    let author = t.create_actor();

    let mut posts = Vec::new();
    for _ in 0..3 {
        posts.push(t.create_post(PostInput {
            actor: author.did.clone(),
            labels: vec!["a".to_string()],
            ..Default::default()
        }));
    }
    // Step past the five-minute cold-start window.
    t.clock.set_now(TEST_NOW + 600);

    let page = t.db.select_posts_by_labels(i64::MAX, 2, &["a"]).unwrap();
    assert_eq!(
        post_ids(&page),
        vec![posts[2].post_id, posts[1].post_id],
        "first page is the two newest"
    );

    let cursor = page.last().unwrap().post_id;
    let rest = t.db.select_posts_by_labels(cursor, 2, &["a"]).unwrap();
    assert_eq!(post_ids(&rest), vec![posts[0].post_id]);

    // Every page respects the strict upper bound.
    for post in &rest {
        assert!(post.post_id < cursor);
    }
}

#[test]
fn label_feed_hides_the_newest_five_minutes() {
    let t = common::test_db();
    let author = t.create_actor();

    let old = t.create_post(PostInput {
        actor: author.did.clone(),
        labels: vec!["a".to_string()],
        ..Default::default()
    });
    t.clock.set_now(TEST_NOW + 600);
    let fresh = t.create_post(PostInput {
        actor: author.did.clone(),
        labels: vec!["a".to_string()],
        ..Default::default()
    });

    let page = t.db.select_posts_by_labels(i64::MAX, 25, &["a"]).unwrap();
    assert_eq!(post_ids(&page), vec![old.post_id]);
    assert!(!post_ids(&page).contains(&fresh.post_id));
}

#[test]
fn firehose_feed_is_newest_first() {
    let t = common::test_db();
    let author = t.create_actor();
    let mut posts = Vec::new();
    for _ in 0..3 {
        posts.push(t.create_post(PostInput {
            actor: author.did.clone(),
            ..Default::default()
        }));
    }

    let latest = t.db.select_latest_posts(i64::MAX, 2).unwrap();
    assert_eq!(post_ids(&latest), vec![posts[2].post_id, posts[1].post_id]);
}

#[test]
fn bangers_cursor_is_the_custom_label_id() {
    let t = common::test_db();
    let author = t.create_actor();
    let mark = t.db.actors.find_or_create_actor(MARK).unwrap();

    let first = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });
    let second = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });
    t.create_like(&mark, &first);
    t.create_like(&mark, &second);

    let bangers = t.db.select_bangers(0, 10).unwrap();
    assert_eq!(bangers.len(), 2);
    // Newest label first; the row's id field carries the label id.
    assert!(bangers[0].post_id > bangers[1].post_id);
    assert_eq!(bangers[0].uri, second.uri);
    assert_eq!(bangers[1].uri, first.uri);

    let next = t.db.select_bangers(bangers[1].post_id, 10).unwrap();
    assert!(next.is_empty());
}

#[test]
fn followed_feed_cold_start_serves_the_pinned_post() {
    let mut t = common::test_db();

    let pinned_author = t.create_actor();
    let pinned = t.create_post(PostInput {
        actor: pinned_author.did.clone(),
        ..Default::default()
    });
    t.reopen_with(|config| config.pinned_post = Some(pinned.uri.clone()));

    let viewer = t.create_actor();
    let friend = t.create_actor();
    let mention = t.create_post(PostInput {
        actor: friend.did.clone(),
        mentions: vec![viewer.did.clone()],
        ..Default::default()
    });

    // No follows-index entry yet: the pinned placeholder comes back.
    let cold = t
        .db
        .select_mentions_followed(i64::MAX, 25, &viewer.did)
        .unwrap();
    assert_eq!(post_ids(&cold), vec![pinned.post_id]);

    // Backfill done: the real mentions flow and the pin disappears.
    t.db.follows_indexed
        .find_or_create_by_actor_id(viewer.actor_id)
        .unwrap();
    t.db.follows_indexed
        .set_last_follow(viewer.actor_id, 0)
        .unwrap();
    t.create_follow(&viewer, &friend);

    let warm = t
        .db
        .select_mentions_followed(i64::MAX, 25, &viewer.did)
        .unwrap();
    assert_eq!(post_ids(&warm), vec![mention.post_id]);
}

#[test]
fn followed_feeds_intersect_with_the_follow_set() {
    let t = common::test_db();
    let viewer = t.create_actor();
    let followed = t.create_actor();
    let stranger = t.create_actor();

    t.db.follows_indexed
        .find_or_create_by_actor_id(viewer.actor_id)
        .unwrap();
    t.db.follows_indexed
        .set_last_follow(viewer.actor_id, 0)
        .unwrap();
    t.create_follow(&viewer, &followed);

    let from_followed = t.create_post(PostInput {
        actor: followed.did.clone(),
        mentions: vec![viewer.did.clone()],
        ..Default::default()
    });
    t.create_post(PostInput {
        actor: stranger.did.clone(),
        mentions: vec![viewer.did.clone()],
        ..Default::default()
    });

    let feed = t
        .db
        .select_mentions_followed(i64::MAX, 25, &viewer.did)
        .unwrap();
    assert_eq!(post_ids(&feed), vec![from_followed.post_id]);

    // The unfiltered mentions feed sees both.
    let all = t.db.select_mentions(i64::MAX, 25, &viewer.did).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn blocked_viewers_get_nothing_from_followed_feeds() {
    let t = common::test_db();
    let viewer = t.create_actor();
    t.db.block(&viewer.did).unwrap();

    assert!(t
        .db
        .select_mentions_followed(i64::MAX, 25, &viewer.did)
        .unwrap()
        .is_empty());
    assert!(t
        .db
        .select_birthdays_followed(i64::MAX, 25, &viewer.did)
        .unwrap()
        .is_empty());
}

#[test]
fn quotes_feed_and_quote_listing() {
    let t = common::test_db();
    let author = t.create_actor();
    let quoted = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    let quoter = t.create_actor();
    let quote_post = t.create_post(PostInput {
        actor: quoter.did.clone(),
        quote: quoted.uri.clone(),
        ..Default::default()
    });

    let feed = t.db.select_quotes(i64::MAX, 25, &author.did).unwrap();
    assert_eq!(post_ids(&feed), vec![quote_post.post_id]);

    let listing = t.db.select_quotes_for_uri(&quoted.uri).unwrap();
    assert_eq!(post_ids(&listing), vec![quote_post.post_id]);

    // Quoting yourself does not count as a mention of yourself.
    let self_quote = t.create_post(PostInput {
        actor: author.did.clone(),
        quote: quoted.uri.clone(),
        ..Default::default()
    });
    let feed = t.db.select_quotes(i64::MAX, 25, &author.did).unwrap();
    assert!(!post_ids(&feed).contains(&self_quote.post_id));
}

#[test]
fn mark_feed_unions_his_activity_toward_the_viewer() {
    let t = common::test_db();
    let mark = t.db.actors.find_or_create_actor(MARK).unwrap();
    let viewer = t.create_actor();

    let top_level = t.create_post(PostInput {
        actor: MARK.to_string(),
        ..Default::default()
    });
    let viewer_post = t.create_post(PostInput {
        actor: viewer.did.clone(),
        ..Default::default()
    });
    let mark_reply = t.create_post(PostInput {
        actor: MARK.to_string(),
        reply: viewer_post.uri.clone(),
        ..Default::default()
    });
    let _ = mark;

    let feed = t.db.select_mark(i64::MAX, 25, &viewer.did).unwrap();
    let ids = post_ids(&feed);
    assert!(ids.contains(&top_level.post_id));
    assert!(ids.contains(&mark_reply.post_id));
    assert!(!ids.contains(&viewer_post.post_id));
}
