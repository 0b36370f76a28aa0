/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::clock::Clock;
use std::path::PathBuf;

/// Engine configuration, threaded through the constructors instead of
/// living in process globals.
#[derive(Clone)]
pub struct Config {
    pub db_dir: PathBuf,
    pub actor_cache_size: usize,
    pub follow_cache_size: usize,
    pub label_cache_size: usize,
    pub mmap_size: i64,
    pub synchronous: String,
    pub wal_autocheckpoint: i64,
    pub slow_query_threshold_ms: u64,
    pub signing_key_hex: String,
    pub extended_indexing: bool,
    pub keep_days: i64,
    pub prune_chunk: usize,
    pub label_tick_minutes: i64,
    pub custom_label_tick_minutes: i64,
    pub pruner_tick_minutes: i64,
    pub max_seq_skip: i64,
    pub pinned_post: Option<String>,
    pub clock: Clock,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Config {
            db_dir: PathBuf::from(format!("{home}/.bsky/db")),
            actor_cache_size: 500_000,
            follow_cache_size: 50_000,
            label_cache_size: 50_000,
            mmap_size: 0,
            synchronous: "NORMAL".to_string(),
            wal_autocheckpoint: 0,
            slow_query_threshold_ms: 1000,
            signing_key_hex: String::new(),
            extended_indexing: false,
            keep_days: 60,
            prune_chunk: 30,
            label_tick_minutes: 1,
            custom_label_tick_minutes: 1,
            pruner_tick_minutes: 1,
            max_seq_skip: 1000,
            pinned_post: None,
            clock: Clock::System,
        }
    }
}
