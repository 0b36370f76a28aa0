/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::TEST_NOW;
use skygraph_core::db::{ACCOUNT_LABEL, EVERGREEN_BIRTHDAYS};

const YEAR_AGO: i64 = TEST_NOW - 365 * 24 * 60 * 60;

fn positive_birthdays(t: &common::TestDb) -> Vec<i64> {
    let label = t.db.labels.find_or_create_label("birthday").unwrap();
    t.db.custom_labels
        .select_by_label_and_neg(label.label_id, false, 0, 100)
        .unwrap()
        .into_iter()
        .filter(|row| row.subject_type == ACCOUNT_LABEL)
        .map(|row| row.subject_id)
        .collect()
}

fn negative_birthdays(t: &common::TestDb) -> Vec<i64> {
    let label = t.db.labels.find_or_create_label("birthday").unwrap();
    t.db.custom_labels
        .select_by_label_and_neg(label.label_id, true, 0, 100)
        .unwrap()
        .into_iter()
        .map(|row| row.subject_id)
        .collect()
}

#[test]
fn birthday_emission_waits_for_the_window() {
    let t = common::test_db();
    let actor = t.create_actor();
    // Their account anniversary is five minutes from "now".
    t.db.actors
        .initialize_birthday(&actor.did, YEAR_AGO + 300)
        .unwrap();

    t.db.record_birthday_labels().unwrap();
    assert!(positive_birthdays(&t).is_empty(), "not their birthday yet");

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t), vec![actor.actor_id]);

    // Re-running inside the window does not duplicate the label.
    t.db.record_birthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t), vec![actor.actor_id]);
}

#[test]
fn unbirthday_negates_and_erases_the_positive() {
    let t = common::test_db();
    let actor = t.create_actor();
    t.db.actors
        .initialize_birthday(&actor.did, YEAR_AGO + 300)
        .unwrap();

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t), vec![actor.actor_id]);

    // One day later the label is withdrawn.
    t.clock.set_now(TEST_NOW + 600 + 24 * 60 * 60);
    t.db.record_unbirthday_labels().unwrap();
    assert!(positive_birthdays(&t).is_empty());
    assert_eq!(negative_birthdays(&t), vec![actor.actor_id]);
}

#[test]
fn evergreen_accounts_keep_their_birthday() {
    let t = common::test_db();
    let rem = t
        .db
        .actors
        .find_or_create_actor(EVERGREEN_BIRTHDAYS[0])
        .unwrap();
    t.db.actors
        .initialize_birthday(&rem.did, YEAR_AGO + 300)
        .unwrap();

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t), vec![rem.actor_id]);

    t.clock.set_now(TEST_NOW + 600 + 24 * 60 * 60);
    t.db.record_unbirthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t), vec![rem.actor_id]);
    assert!(negative_birthdays(&t).is_empty());
}

#[test]
fn blocked_actors_never_get_birthday_labels() {
    let t = common::test_db();
    let actor = t.create_actor();
    t.db.actors
        .initialize_birthday(&actor.did, YEAR_AGO + 300)
        .unwrap();
    t.db.block(&actor.did).unwrap();

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();
    assert!(positive_birthdays(&t).is_empty());
}

#[test]
fn birthday_feed_surfaces_their_posts() {
    let t = common::test_db();
    let actor = t.create_actor();
    let post = t.create_post(common::PostInput {
        actor: actor.did.clone(),
        ..Default::default()
    });
    t.db.actors
        .initialize_birthday(&actor.did, YEAR_AGO + 300)
        .unwrap();

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();

    let feed = t.db.select_birthdays(i64::MAX, 25).unwrap();
    assert_eq!(common::post_ids(&feed), vec![post.post_id]);
}

#[test]
fn old_custom_labels_are_pruned() {
    let t = common::test_db();
    let actor = t.create_actor();
    t.db.actors
        .initialize_birthday(&actor.did, YEAR_AGO + 300)
        .unwrap();

    t.clock.set_now(TEST_NOW + 600);
    t.db.record_birthday_labels().unwrap();
    assert_eq!(positive_birthdays(&t).len(), 1);

    // Eight days on, the pruner clears the row.
    t.clock.set_now(TEST_NOW + 600 + 8 * 24 * 60 * 60);
    let pruned = t.db.prune_custom_labels().unwrap();
    assert_eq!(pruned, 1);
    assert!(positive_birthdays(&t).is_empty());
}
