/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Long-lived websocket subscription to a cursor-based event stream.
//! Frames are forwarded raw; decoding belongs to the per-stream
//! wrappers. The subscriber never reconnects on its own: a fatal event
//! is emitted and the supervisor decides.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use skygraph_protocol::{decode_body, decode_frame, ErrorFrame, EventHeader, OP_ERROR};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{info, warn};

pub const CHANNEL_BUFFER: usize = 100;
const CURSOR_SAVE_EVERY: i64 = 1000;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Marker wrapped into errors that must bubble to the supervisor and
/// restart the stream.
#[derive(Debug)]
pub struct FatalStreamError;

impl fmt::Display for FatalStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fatal subscriber error")
    }
}

impl std::error::Error for FatalStreamError {}

pub fn fatal(err: anyhow::Error) -> anyhow::Error {
    err.context(FatalStreamError)
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<FatalStreamError>())
}

pub enum SubscriberEvent {
    /// A decoded frame header plus its raw body bytes.
    Frame { header: EventHeader, body: Vec<u8> },
    /// An upstream error frame; the stream itself keeps running.
    StreamError(anyhow::Error),
    /// Connection-level failure; tagged fatal, the channel closes after.
    Error(anyhow::Error),
}

pub struct Subscriber {
    addr: String,
    cursor_path: Option<PathBuf>,
    cursor: Arc<AtomicI64>,
    conn_shutdown: Option<watch::Sender<bool>>,
}

impl Subscriber {
    pub fn new(addr: impl Into<String>, cursor_path: Option<PathBuf>) -> Self {
        Subscriber {
            addr: addr.into(),
            cursor_path,
            cursor: Arc::new(AtomicI64::new(0)),
            conn_shutdown: None,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Monotonically advance the cursor; persisted every thousand acks.
    pub fn ack(&self, seq: i64) {
        let prev = self.cursor.fetch_max(seq, Ordering::Relaxed);
        if seq > prev && seq % CURSOR_SAVE_EVERY == 0 {
            self.save_cursor();
        }
    }

    fn load_cursor(&self) -> Result<()> {
        let Some(path) = &self.cursor_path else {
            return Ok(());
        };
        let raw = match std::fs::read_to_string(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            other => other.with_context(|| format!("read cursor {}", path.display()))?,
        };
        let cursor: i64 = raw
            .trim_end_matches('\n')
            .parse()
            .with_context(|| format!("parse cursor {}", path.display()))?;
        self.cursor.store(cursor, Ordering::Relaxed);
        Ok(())
    }

    fn save_cursor(&self) {
        let Some(path) = &self.cursor_path else {
            return;
        };
        let cursor = self.cursor.load(Ordering::Relaxed);
        if cursor == 0 {
            return;
        }
        match write_file_atomic(path, format!("{cursor}").as_bytes()) {
            Ok(()) => info!(cursor, path = %path.display(), "saved cursor"),
            // Never fatal; the stream can replay.
            Err(err) => warn!(cursor, path = %path.display(), "error saving cursor: {err:#}"),
        }
    }

    pub async fn start(&mut self) -> Result<mpsc::Receiver<SubscriberEvent>> {
        if self.cursor.load(Ordering::Relaxed) == 0 {
            self.load_cursor()?;
        }

        let cursor = self.cursor.load(Ordering::Relaxed);
        let addr = if cursor != 0 {
            format!("{}?cursor={cursor}", self.addr)
        } else {
            self.addr.clone()
        };

        info!(%addr, "connecting subscriber");
        let (ws, _) = tokio_tungstenite::connect_async(&addr)
            .await
            .with_context(|| format!("dial {addr}"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.conn_shutdown = Some(shutdown_tx);

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        tokio::spawn(read_loop(ws, tx, shutdown_rx));
        Ok(rx)
    }

    /// Close the connection and persist the cursor.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.conn_shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.save_cursor();
    }

    pub async fn restart(&mut self) -> Result<mpsc::Receiver<SubscriberEvent>> {
        self.stop();
        self.start().await
    }
}

async fn read_loop(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: mpsc::Sender<SubscriberEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(tungstenite::Message::Ping(Vec::new())).await {
                    let _ = tx.send(SubscriberEvent::Error(fatal(
                        anyhow!(e).context("ping failed"),
                    ))).await;
                    return;
                }
            }
            msg = tokio::time::timeout(READ_DEADLINE, ws_rx.next()) => {
                let msg = match msg {
                    Err(_) => {
                        let _ = tx.send(SubscriberEvent::Error(fatal(
                            anyhow!("read deadline exceeded"),
                        ))).await;
                        return;
                    }
                    Ok(None) => {
                        let _ = tx.send(SubscriberEvent::Error(fatal(
                            anyhow!("stream closed by peer"),
                        ))).await;
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(SubscriberEvent::Error(fatal(
                            anyhow!(e).context("stream read error"),
                        ))).await;
                        return;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    tungstenite::Message::Binary(data) => {
                        match split_frame(&data) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(SubscriberEvent::Error(fatal(err))).await;
                                return;
                            }
                        }
                    }
                    tungstenite::Message::Ping(payload) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(payload)).await;
                    }
                    tungstenite::Message::Pong(_) => {}
                    tungstenite::Message::Close(_) => {
                        let _ = tx.send(SubscriberEvent::Error(fatal(
                            anyhow!("stream closed by peer"),
                        ))).await;
                        return;
                    }
                    _ => {
                        let _ = tx.send(SubscriberEvent::Error(fatal(
                            anyhow!("expected binary message from subscription endpoint"),
                        ))).await;
                        return;
                    }
                }
            }
        }
    }
}

fn split_frame(data: &[u8]) -> Result<SubscriberEvent> {
    let (header, body) = decode_frame(data)?;
    if header.op == OP_ERROR {
        let frame: ErrorFrame = decode_body(body).unwrap_or_default();
        let mut err = anyhow!("{}", frame.error);
        if let Some(message) = frame.message {
            err = err.context(message);
        }
        return Ok(SubscriberEvent::StreamError(err));
    }
    Ok(SubscriberEvent::Frame {
        header,
        body: body.to_vec(),
    })
}

/// Temp-file + rename so a crash never leaves a torn cursor.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{base}.{}", std::process::id()));
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename over {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skygraph_protocol::{encode_frame, EventHeader, OP_MESSAGE};

    #[test]
    fn split_frame_forwards_messages() {
        let header = EventHeader {
            op: OP_MESSAGE,
            msg_type: "#labels".to_string(),
        };
        let frame = encode_frame(&header, &serde_json::json!({"seq": 1})).unwrap();
        match split_frame(&frame).unwrap() {
            SubscriberEvent::Frame { header, body } => {
                assert_eq!(header.msg_type, "#labels");
                assert!(!body.is_empty());
            }
            _ => panic!("expected frame event"),
        }
    }

    #[test]
    fn split_frame_surfaces_error_frames() {
        let header = EventHeader {
            op: OP_ERROR,
            msg_type: String::new(),
        };
        let body = ErrorFrame {
            error: "FutureCursor".to_string(),
            message: None,
        };
        let frame = encode_frame(&header, &body).unwrap();
        match split_frame(&frame).unwrap() {
            SubscriberEvent::StreamError(err) => {
                assert!(err.to_string().contains("FutureCursor"));
                assert!(!is_fatal(&err));
            }
            _ => panic!("expected stream error event"),
        }
    }

    #[test]
    fn fatal_marker_round_trips() {
        let err = fatal(anyhow!("boom"));
        assert!(is_fatal(&err));
        assert!(!is_fatal(&anyhow!("plain")));
    }

    #[test]
    fn ack_is_monotone_and_cursor_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        let mut sub = Subscriber::new("wss://example.invalid", Some(path.clone()));

        sub.ack(5);
        sub.ack(3);
        assert_eq!(sub.cursor(), 5);

        sub.stop();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim(), "5");

        let loaded = Subscriber::new("wss://example.invalid", Some(path));
        loaded.load_cursor().unwrap();
        assert_eq!(loaded.cursor(), 5);
    }

    #[test]
    fn cursor_save_every_thousand_acks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor");
        let sub = Subscriber::new("wss://example.invalid", Some(path.clone()));

        sub.ack(999);
        assert!(!path.exists());
        sub.ack(1000);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "1000");
    }
}
