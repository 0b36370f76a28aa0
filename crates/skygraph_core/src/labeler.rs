/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Typed view over the moderation labeler stream.

use crate::subscriber::{fatal, Subscriber, SubscriberEvent, CHANNEL_BUFFER};
use anyhow::{anyhow, Result};
use skygraph_protocol::{decode_body, InfoFrame, LabelsFrame, MSG_INFO, MSG_LABELS};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

pub enum LabelerEvent {
    Labels(LabelsFrame),
    Info(InfoFrame),
    Error(anyhow::Error),
}

impl LabelerEvent {
    pub fn seq(&self) -> i64 {
        match self {
            LabelerEvent::Labels(frame) => frame.seq,
            _ => 0,
        }
    }
}

pub struct LabelerStream {
    subscriber: Subscriber,
    max_seq_skip: i64,
}

impl LabelerStream {
    pub fn new(host: &str, cursor_path: Option<PathBuf>, max_seq_skip: i64) -> Result<Self> {
        let addr = crate::firehose::ws_addr(host, "/xrpc/com.atproto.label.subscribeLabels")?;
        Ok(LabelerStream {
            subscriber: Subscriber::new(addr, cursor_path),
            max_seq_skip,
        })
    }

    pub fn ack(&self, seq: i64) {
        self.subscriber.ack(seq);
    }

    pub fn cursor(&self) -> i64 {
        self.subscriber.cursor()
    }

    pub async fn start(&mut self) -> Result<mpsc::Receiver<LabelerEvent>> {
        let raw = self.subscriber.start().await?;
        Ok(self.decode_stream(raw))
    }

    pub fn stop(&mut self) {
        self.subscriber.stop();
    }

    pub async fn restart(&mut self) -> Result<mpsc::Receiver<LabelerEvent>> {
        self.stop();
        self.start().await
    }

    fn decode_stream(
        &self,
        mut raw: mpsc::Receiver<SubscriberEvent>,
    ) -> mpsc::Receiver<LabelerEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let max_skip = self.max_seq_skip;
        let mut last_seq = self.subscriber.cursor();

        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                let typed = match event {
                    SubscriberEvent::Error(err) => {
                        let _ = tx.send(LabelerEvent::Error(err)).await;
                        break;
                    }
                    SubscriberEvent::StreamError(err) => LabelerEvent::Error(err),
                    SubscriberEvent::Frame { header, body } => match header.msg_type.as_str() {
                        MSG_LABELS => match decode_body::<LabelsFrame>(&body) {
                            Ok(frame) => LabelerEvent::Labels(frame),
                            Err(err) => {
                                warn!("error decoding #labels frame: {err:#}");
                                continue;
                            }
                        },
                        MSG_INFO => match decode_body::<InfoFrame>(&body) {
                            Ok(frame) => LabelerEvent::Info(frame),
                            Err(err) => {
                                warn!("error decoding #info frame: {err:#}");
                                continue;
                            }
                        },
                        other => {
                            warn!(msg_type = other, "unexpected labeler frame");
                            continue;
                        }
                    },
                };

                let seq = typed.seq();
                if seq != 0 {
                    if last_seq == 0 {
                        last_seq = seq;
                    }
                    if seq - last_seq > max_skip {
                        let err = fatal(anyhow!(
                            "skipped too many seqs: went from {last_seq} to {seq} ({})",
                            seq - last_seq
                        ));
                        let _ = tx.send(LabelerEvent::Error(err)).await;
                        return;
                    }
                    last_seq = seq;
                }

                let fatal_event = matches!(&typed, LabelerEvent::Error(e) if crate::subscriber::is_fatal(e));
                if tx.send(typed).await.is_err() || fatal_event {
                    return;
                }
            }
        });

        rx
    }
}
