/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::{post_ids, post_uri, PostInput};
use skygraph_core::db::{ACCOUNT_LABEL, MARK, POST_LABEL};

#[test]
fn insert_post_records_uri_and_actor() {
    let t = common::test_db();
    let actor = t.create_actor();
    let uri = post_uri(&actor.did);
    let post = t.create_post(PostInput {
        uri: uri.clone(),
        ..Default::default()
    });

    assert_eq!(post.uri, uri);
    assert_eq!(post.actor_id, actor.actor_id);
    assert!(post.post_id > 0);
}

#[test]
fn stale_posts_are_dropped_silently() {
    let t = common::test_db();
    let actor = t.create_actor();

    let mut input = PostInput {
        actor: actor.did.clone(),
        ..Default::default()
    };
    let mut evt = common::post_event(&t.clock, &input);
    evt.post.created_at = "2020-01-01T00:00:00Z".to_string();
    let row = t.db.insert_post(&evt, &actor, &[]).unwrap();
    assert!(row.is_none());

    input.uri = post_uri(&actor.did);
    let fresh = t.create_post(input);
    assert!(fresh.post_id > 0);
}

#[test]
fn insert_then_delete_reply() {
    let t = common::test_db();
    let op_author = t.create_actor();
    let op = t.create_post(PostInput {
        actor: op_author.did.clone(),
        ..Default::default()
    });

    let reply_guy = t.create_actor();
    let reply = t.create_post(PostInput {
        actor: reply_guy.did.clone(),
        reply: op.uri.clone(),
        ..Default::default()
    });

    let reply_row = t
        .db
        .replies
        .find_by_post_id(reply.post_id)
        .unwrap()
        .expect("reply edge exists");
    assert_eq!(reply_row.parent_id, op.post_id);
    assert_eq!(reply_row.parent_actor_id, op_author.actor_id);

    let mentions = t
        .db
        .select_mentions(i64::MAX, 25, &op_author.did)
        .unwrap();
    assert_eq!(post_ids(&mentions), vec![reply.post_id]);

    t.db.delete_post(&reply.uri).unwrap();
    assert!(t.db.replies.find_by_post_id(reply.post_id).unwrap().is_none());
    assert!(t
        .db
        .select_mentions(i64::MAX, 25, &op_author.did)
        .unwrap()
        .is_empty());
}

#[test]
fn reply_and_quote_edges_are_single() {
    let t = common::test_db();
    let author = t.create_actor();
    let op = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    let other = t.create_actor();
    let both = t.create_post(PostInput {
        actor: other.did.clone(),
        reply: op.uri.clone(),
        quote: op.uri.clone(),
        ..Default::default()
    });

    let reply = t.db.replies.find_by_post_id(both.post_id).unwrap().unwrap();
    let quote = t.db.quotes.find_by_post_id(both.post_id).unwrap().unwrap();
    assert_eq!(reply.parent_id, op.post_id);
    assert_eq!(quote.subject_id, op.post_id);
    assert_eq!(quote.subject_actor_id, author.actor_id);
}

#[test]
fn post_count_moves_only_for_top_level_posts() {
    let t = common::test_db();
    let author = t.create_actor();

    let top = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });
    assert_eq!(t.refetch_actor(&author).posts, 1);

    let other = t.create_actor();
    let reply = t.create_post(PostInput {
        actor: other.did.clone(),
        reply: top.uri.clone(),
        ..Default::default()
    });
    assert_eq!(t.refetch_actor(&other).posts, 0);
    assert_eq!(t.refetch_actor(&author).posts, 1);

    t.db.delete_post(&reply.uri).unwrap();
    assert_eq!(t.refetch_actor(&other).posts, 0);

    t.db.delete_post(&top.uri).unwrap();
    assert_eq!(t.refetch_actor(&author).posts, 0);
}

#[test]
fn mentions_fan_out_and_clean_up() {
    let t = common::test_db();
    let author = t.create_actor();
    let mentioned: Vec<_> = (0..3).map(|_| t.create_actor()).collect();
    let mentioned_dids: Vec<String> = mentioned.iter().map(|a| a.did.clone()).collect();

    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        mentions: mentioned_dids.clone(),
        ..Default::default()
    });

    let mut expected: Vec<i64> = mentioned.iter().map(|a| a.actor_id).collect();
    expected.sort();
    assert_eq!(
        t.db.mentions.select_mentions(post.post_id).unwrap(),
        expected
    );

    // The post shows in each mentioned actor's feed, never the author's.
    for target in &mentioned {
        let feed = t.db.select_mentions(i64::MAX, 25, &target.did).unwrap();
        assert_eq!(post_ids(&feed), vec![post.post_id]);
    }
    assert!(t
        .db
        .select_mentions(i64::MAX, 25, &author.did)
        .unwrap()
        .is_empty());

    t.db.delete_post(&post.uri).unwrap();
    assert!(t.db.mentions.select_mentions(post.post_id).unwrap().is_empty());
}

#[test]
fn indirect_replies_reach_all_mentions_only() {
    let t = common::test_db();
    let alice = t.create_actor();
    let bob = t.create_actor();
    let carol = t.create_actor();

    let root = t.create_post(PostInput {
        actor: alice.did.clone(),
        ..Default::default()
    });
    let reply = t.create_post(PostInput {
        actor: bob.did.clone(),
        reply: root.uri.clone(),
        ..Default::default()
    });
    let indirect = t.create_post(PostInput {
        actor: carol.did.clone(),
        reply: reply.uri.clone(),
        ..Default::default()
    });

    let direct = t.db.select_mentions(i64::MAX, 25, &alice.did).unwrap();
    assert_eq!(post_ids(&direct), vec![reply.post_id]);

    let all = t.db.select_all_mentions(i64::MAX, 25, &alice.did).unwrap();
    assert!(post_ids(&all).contains(&indirect.post_id));
    assert!(post_ids(&all).contains(&reply.post_id));
}

#[test]
fn self_labels_are_indexed_with_the_post() {
    let t = common::test_db();
    let author = t.create_actor();
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        self_labels: vec!["nudity".to_string()],
        ..Default::default()
    });

    let nudity = t.db.labels.find_label("nudity").unwrap().unwrap();
    assert_eq!(
        t.db.post_labels.select_labels_by_post_id(post.post_id).unwrap(),
        vec![nudity.label_id]
    );
}

#[test]
fn like_by_mark_mints_a_banger() {
    let t = common::test_db();
    let author = t.create_actor();
    let post = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    let mark = t.db.actors.find_or_create_actor(MARK).unwrap();
    let like = t.create_like(&mark, &post);
    assert_eq!(like.subject_id, post.post_id);
    assert_eq!(t.refetch_post(&post).likes, 1);

    let banger = t.db.labels.find_label("banger").unwrap().unwrap();
    let labels = t
        .db
        .custom_labels
        .select_by_label_and_neg(banger.label_id, false, 0, 10)
        .unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].subject_type, POST_LABEL);
    assert_eq!(labels[0].subject_id, post.post_id);

    // The stored payload is a decodable signed label for the liked post.
    let decoded = skygraph_protocol::Label::from_cbor(&labels[0].cbor).unwrap();
    assert_eq!(decoded.val, "banger");
    assert_eq!(decoded.uri, post.uri);
    assert!(decoded.sig.is_some());

    t.db.delete_like(&like.uri).unwrap();
    assert_eq!(t.refetch_post(&post).likes, 0);
    let negated = t
        .db
        .custom_labels
        .select_by_label_and_neg(banger.label_id, true, 0, 10)
        .unwrap();
    assert_eq!(negated.len(), 1);
    assert_eq!(negated[0].subject_id, post.post_id);
}

#[test]
fn banger_bot_reply_tags_the_parent() {
    let t = common::test_db();
    let author = t.create_actor();
    let parent = t.create_post(PostInput {
        actor: author.did.clone(),
        ..Default::default()
    });

    let banger_bot = skygraph_core::db::BANGER_BOT;
    t.db.actors.find_or_create_actor(banger_bot).unwrap();
    t.create_post(PostInput {
        actor: banger_bot.to_string(),
        reply: parent.uri.clone(),
        text: "banger fr fr".to_string(),
        ..Default::default()
    });

    let banger = t.db.labels.find_label("banger").unwrap().unwrap();
    let labels = t
        .db
        .custom_labels
        .select_by_label_and_neg(banger.label_id, false, 0, 10)
        .unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].subject_id, parent.post_id);
}

#[test]
fn block_marks_the_actor_and_future_posts_labeled() {
    let t = common::test_db();
    let actor = t.create_actor();
    t.db.block(&actor.did).unwrap();

    let blocked = t.refetch_actor(&actor);
    assert!(blocked.blocked);

    // A blocked author's posts come out pre-labeled even with media.
    let post = t.create_post(PostInput {
        actor: actor.did.clone(),
        quote: post_uri(&common::new_did()),
        ..Default::default()
    });
    assert_eq!(t.refetch_post(&post).labeled, 1);
}

#[test]
fn dm_posts_reach_every_participant() {
    let t = common::test_db();
    let sender = t.create_actor();
    let target = t.create_actor();

    let dm = t.create_post(PostInput {
        actor: sender.did.clone(),
        text: "DM @friend. hello there".to_string(),
        mentions: vec![target.did.clone()],
        ..Default::default()
    });

    let for_target = t.db.select_dms(i64::MAX, 25, &target.did).unwrap();
    assert_eq!(post_ids(&for_target), vec![dm.post_id]);
    let for_sender = t.db.select_dms(i64::MAX, 25, &sender.did).unwrap();
    assert_eq!(post_ids(&for_sender), vec![dm.post_id]);

    // A plain reply into the thread keeps the dm edges flowing.
    let reply = t.create_post(PostInput {
        actor: target.did.clone(),
        reply: dm.uri.clone(),
        text: "replying in thread".to_string(),
        ..Default::default()
    });
    let for_sender = t.db.select_dms(i64::MAX, 25, &sender.did).unwrap();
    assert!(post_ids(&for_sender).contains(&reply.post_id));
}

#[test]
fn pin_replies_to_the_pin_target_are_ignored() {
    let t = common::test_db();
    let pin_target = skygraph_core::db::PIN_TARGET;
    t.db.actors.find_or_create_actor(pin_target).unwrap();
    let parent = t.create_post(PostInput {
        actor: pin_target.to_string(),
        ..Default::default()
    });

    let pinner = t.create_actor();
    let pin = t.create_post(PostInput {
        actor: pinner.did.clone(),
        reply: parent.uri.clone(),
        text: "📌".to_string(),
        ..Default::default()
    });

    assert!(t.db.replies.find_by_post_id(pin.post_id).unwrap().is_none());
}

#[test]
fn account_labels_use_the_account_subject_type() {
    // Guards the subject-type constants against accidental swaps.
    assert_eq!(ACCOUNT_LABEL, 0);
    assert_eq!(POST_LABEL, 1);
}

#[test]
fn every_table_names_its_primary_key() {
    let t = common::test_db();
    assert_eq!(t.db.actors.primary_key_name(), "actor_id");
    assert_eq!(t.db.custom_labels.primary_key_name(), "custom_label_id");
    assert_eq!(t.db.dms.primary_key_name(), "dm_id");
    assert_eq!(t.db.follows.primary_key_name(), "follow_id");
    assert_eq!(t.db.follows_indexed.primary_key_name(), "follow_indexed_id");
    assert_eq!(t.db.labels.primary_key_name(), "label_id");
    assert_eq!(t.db.likes.primary_key_name(), "like_id");
    assert_eq!(t.db.mentions.primary_key_name(), "mention_id");
    assert_eq!(t.db.posts.primary_key_name(), "post_id");
    assert_eq!(t.db.post_labels.primary_key_name(), "post_label_id");
    assert_eq!(t.db.quotes.primary_key_name(), "quote_id");
    assert_eq!(t.db.replies.primary_key_name(), "reply_id");
    assert_eq!(t.db.reposts.primary_key_name(), "repost_id");
    assert_eq!(t.db.thread_mentions.primary_key_name(), "thread_mention_id");
}
