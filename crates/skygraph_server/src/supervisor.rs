/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Owns the two stream subscriptions, dispatches their events into the
//! indexer one at a time, and restarts a stream whose acked sequence
//! stops moving.

use anyhow::Result;
use skygraph_core::db::retry_busy;
use skygraph_core::firehose::{CommitStream, FirehoseEvent};
use skygraph_core::indexer::Indexer;
use skygraph_core::labeler::{LabelerEvent, LabelerStream};
use skygraph_core::subscriber::is_fatal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct StreamConfig {
    pub bgs_host: String,
    pub mod_host: String,
    pub cursor_path: Option<PathBuf>,
    pub mod_cursor_path: Option<PathBuf>,
    pub max_seq_skip: i64,
    pub extended_indexing: bool,
    pub own_did: String,
}

pub async fn run(
    indexer: Arc<Indexer>,
    cfg: StreamConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut commits = CommitStream::new(
        &cfg.bgs_host,
        cfg.cursor_path.clone(),
        cfg.own_did.clone(),
        cfg.extended_indexing,
        cfg.max_seq_skip,
    )?;
    let mut labeler = LabelerStream::new(&cfg.mod_host, cfg.mod_cursor_path.clone(), cfg.max_seq_skip)?;

    let mut commit_rx = commits.start().await?;
    let mut labeler_rx = labeler.start().await?;

    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    watchdog.tick().await;

    let mut last_commit_ping = 0i64;
    let mut last_labeler_ping = 0i64;
    let mut last_commit_seen = 0i64;
    let mut last_labeler_seen = 0i64;
    let mut last_post_id = 0i64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("interrupt, stopping streams");
                    break;
                }
            }
            _ = watchdog.tick() => {
                info!(
                    last_post = last_post_id,
                    seq = last_commit_seen,
                    delta = last_commit_seen - last_commit_ping,
                    "stream progress"
                );
                if last_commit_ping == last_commit_seen {
                    warn!("firehose stalled, restarting");
                    commit_rx = commits.restart().await?;
                }
                if last_labeler_ping == last_labeler_seen {
                    warn!("labeler stalled, restarting");
                    labeler_rx = labeler.restart().await?;
                }
                last_commit_ping = last_commit_seen;
                last_labeler_ping = last_labeler_seen;
            }
            evt = labeler_rx.recv() => {
                let Some(evt) = evt else {
                    warn!("labeler channel drained, restarting");
                    labeler_rx = labeler.restart().await?;
                    continue;
                };

                let seq = evt.seq();
                match evt {
                    LabelerEvent::Error(err) => {
                        if is_fatal(&err) {
                            warn!("labeler stream error, restarting: {err:#}");
                            labeler_rx = labeler.restart().await?;
                        } else {
                            warn!("labeler stream error: {err:#}");
                        }
                        continue;
                    }
                    LabelerEvent::Info(frame) => {
                        info!(name = frame.name, "labeler info frame");
                    }
                    LabelerEvent::Labels(frame) => {
                        let indexer = indexer.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.label(&frame.labels))
                        })
                        .await;
                        if let Ok(Err(err)) = result {
                            warn!("error applying labels: {err:#}");
                        }
                    }
                }

                if seq != 0 {
                    labeler.ack(seq);
                    last_labeler_seen = seq;
                    if last_labeler_ping == 0 {
                        last_labeler_ping = seq;
                    }
                }
            }
            evt = commit_rx.recv() => {
                let Some(evt) = evt else {
                    warn!("firehose channel drained, restarting");
                    commit_rx = commits.restart().await?;
                    continue;
                };

                let seq = evt.seq();
                match evt {
                    FirehoseEvent::Error(err) => {
                        if is_fatal(&err) {
                            warn!("firehose stream error, restarting: {err:#}");
                            commit_rx = commits.restart().await?;
                        } else {
                            warn!("firehose stream error: {err:#}");
                        }
                        continue;
                    }
                    FirehoseEvent::Post(post) => {
                        let indexer = indexer.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.post(&post))
                        })
                        .await;
                        match result {
                            Ok(Ok(Some(row))) if row.post_id != 0 => {
                                last_post_id = row.post_id;
                            }
                            Ok(Err(err)) => warn!(seq, "error indexing post: {err:#}"),
                            _ => {}
                        }
                    }
                    FirehoseEvent::Like(like) => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.like(&like))
                        })
                        .await
                        {
                            warn!(seq, "error indexing like: {err:#}");
                        }
                    }
                    FirehoseEvent::Repost(repost) => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.repost(&repost))
                        })
                        .await
                        {
                            warn!(seq, "error indexing repost: {err:#}");
                        }
                    }
                    FirehoseEvent::Follow(follow) => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.follow(&follow))
                        })
                        .await
                        {
                            warn!(seq, "error indexing follow: {err:#}");
                        }
                    }
                    FirehoseEvent::Block(block) => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.block(&block))
                        })
                        .await
                        {
                            warn!(seq, "error indexing block: {err:#}");
                        }
                    }
                    FirehoseEvent::Delete { uri, .. } => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.delete(&uri))
                        })
                        .await
                        {
                            warn!(seq, "error indexing delete: {err:#}");
                        }
                    }
                    FirehoseEvent::Profile { did, .. } => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.newskie(&did))
                        })
                        .await
                        {
                            warn!(seq, "error indexing new profile: {err:#}");
                        }
                    }
                    FirehoseEvent::Tombstone { did, .. } => {
                        let indexer = indexer.clone();
                        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
                            retry_busy(|| indexer.tombstone(&did))
                        })
                        .await
                        {
                            warn!(seq, "error indexing tombstone: {err:#}");
                        }
                    }
                }

                if seq != 0 {
                    commits.ack(seq);
                    last_commit_seen = seq;
                    if last_commit_ping == 0 {
                        last_commit_ping = seq;
                    }
                }
            }
        }
    }

    commits.stop();
    labeler.stop();
    Ok(())
}
