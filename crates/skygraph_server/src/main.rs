/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod server;
mod supervisor;

use anyhow::{Context, Result};
use skygraph_core::client::{AtpClient, HttpAtpClient, MockAtpClient};
use skygraph_core::config::Config;
use skygraph_core::db::Db;
use skygraph_core::indexer::Indexer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

struct ServerOptions {
    listen: String,
    max_web_connections: usize,
    enable_follow_lewds: bool,
    pinned_post: Option<String>,
    bgs_host: String,
    mod_host: String,
    cursor_path: PathBuf,
    mod_cursor_path: PathBuf,
    pds_host: String,
    auth_path: PathBuf,
    username: Option<String>,
    password: Option<String>,
}

fn load_config() -> (Config, ServerOptions) {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let mut config = Config::default();

    if let Some(dir) = env_string("GO_BLUESKY_DB_DIR") {
        config.db_dir = PathBuf::from(dir);
    }
    if let Some(size) = env_parse("GO_BLUESKY_ACTOR_CACHE_SIZE") {
        config.actor_cache_size = size;
    }
    if let Some(size) = env_parse("GO_BLUESKY_FOLLOW_CACHE_SIZE") {
        config.follow_cache_size = size;
    }
    if let Some(size) = env_parse("GO_BLUESKY_LABEL_CACHE_SIZE") {
        config.label_cache_size = size;
    }
    if let Some(size) = env_parse("GO_BLUESKY_DB_MMAP_SIZE") {
        config.mmap_size = size;
    }
    if let Some(mode) = env_string("GO_BLUESKY_DB_SYNCHRONOUS_MODE") {
        config.synchronous = mode;
    }
    if let Some(threshold) = env_parse("GO_BLUESKY_DB_WAL_AUTOCHECKPOINT") {
        config.wal_autocheckpoint = threshold;
    }
    if let Some(threshold) = env_parse("GO_BLUESKY_SLOW_QUERY_THRESHOLD_MS") {
        config.slow_query_threshold_ms = threshold;
    }
    if let Some(days) = env_parse("GO_BLUESKY_KEEP_DAYS") {
        config.keep_days = days;
    }
    if let Some(chunk) = env_parse("GO_BLUESKY_PRUNE_CHUNK") {
        config.prune_chunk = chunk;
    }
    if let Some(minutes) = env_parse("GO_BLUESKY_LABEL_TICK_MINUTES") {
        config.label_tick_minutes = minutes;
    }
    if let Some(minutes) = env_parse("GO_BLUESKY_PRUNER_TICK_MINUTES") {
        config.pruner_tick_minutes = minutes;
    }
    config.extended_indexing = env_bool("GO_BLUESKY_EXTENDED_INDEXING");
    config.signing_key_hex = env_string("GO_BLUESKY_SIGNING_KEY_HEX").unwrap_or_default();
    config.pinned_post = env_string("GO_BLUESKY_PINNED_POST");

    let options = ServerOptions {
        listen: env_string("GO_BLUESKY_LISTEN").unwrap_or_else(|| ":8080".to_string()),
        max_web_connections: env_parse("GO_BLUESKY_MAX_WEB_CONNECTIONS").unwrap_or(5),
        enable_follow_lewds: env_bool("GO_BLUESKY_ENABLE_FOLLOW_LEWDS_FEED"),
        pinned_post: config.pinned_post.clone(),
        bgs_host: env_string("ATP_BGS_HOST").unwrap_or_else(|| "https://bsky.network".to_string()),
        mod_host: env_string("GO_BLUESKY_MOD_HOST")
            .unwrap_or_else(|| "https://mod.bsky.app".to_string()),
        cursor_path: env_string("GO_BLUESKY_CURSOR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{home}/.bsky.cursor"))),
        mod_cursor_path: env_string("GO_BLUESKY_MOD_CURSOR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{home}/.bsky.mod.cursor"))),
        pds_host: env_string("ATP_PDS_HOST").unwrap_or_else(|| "https://bsky.social".to_string()),
        auth_path: env_string("ATP_AUTH_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{home}/.bsky.auth"))),
        username: env_string("GO_BLUESKY_USERNAME"),
        password: env_string("GO_BLUESKY_PASSWORD"),
    };

    (config, options)
}

fn listen_addr(listen: &str) -> Result<SocketAddr> {
    let listen = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    listen.parse().with_context(|| format!("parse listen address {listen}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    let (config, options) = load_config();

    if config.signing_key_hex.is_empty() {
        anyhow::bail!("GO_BLUESKY_SIGNING_KEY_HEX is required");
    }

    let db = Arc::new(Db::open(&config)?);

    let client: Arc<dyn AtpClient> = match (&options.username, &options.password) {
        (Some(username), Some(password)) => Arc::new(
            HttpAtpClient::login(
                &options.pds_host,
                username,
                password,
                options.auth_path.clone(),
            )
            .await?,
        ),
        _ => {
            warn!("no upstream credentials configured, running with a mock client");
            Arc::new(MockAtpClient::new(""))
        }
    };

    let indexer = Arc::new(Indexer::new(db.clone(), client.clone(), &config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = server::AppState {
        db: db.clone(),
        indexer: indexer.clone(),
        client: client.clone(),
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?,
        sem: Arc::new(Semaphore::new(options.max_web_connections)),
        pinned_post: options.pinned_post.clone(),
        enable_follow_lewds: options.enable_follow_lewds,
    };

    let addr = listen_addr(&options.listen)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "serving feeds");

    let app = server::router(state);
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let shutdown = async move {
            while server_shutdown.changed().await.is_ok() {
                if *server_shutdown.borrow() {
                    break;
                }
            }
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("server error: {err:#}");
        }
    });

    match mode.as_str() {
        "server" => {
            server_task.await.ok();
        }
        "run" => {
            indexer.start(shutdown_rx.clone());

            let stream_cfg = supervisor::StreamConfig {
                bgs_host: options.bgs_host.clone(),
                mod_host: options.mod_host.clone(),
                cursor_path: Some(options.cursor_path.clone()),
                mod_cursor_path: Some(options.mod_cursor_path.clone()),
                max_seq_skip: config.max_seq_skip,
                extended_indexing: config.extended_indexing,
                own_did: client.did(),
            };
            // A dead supervisor takes the process down; the outer
            // process manager restarts us with the saved cursors.
            supervisor::run(indexer.clone(), stream_cfg, shutdown_rx)
                .await
                .context("supervisor exited")?;
            server_task.await.ok();
        }
        other => {
            anyhow::bail!("unknown mode {other}; expected \"run\" or \"server\"");
        }
    }

    Ok(())
}
