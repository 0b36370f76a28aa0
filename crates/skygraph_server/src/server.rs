/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! HTTP feed endpoints plus the label-subscription websocket.

use anyhow::{anyhow, Result};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::HeaderMap, Method, StatusCode, Uri},
    response::Response,
    routing::{any, get},
    Router,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use skygraph_core::client::AtpClient;
use skygraph_core::db::{retry_busy, Db, PostRow};
use skygraph_core::indexer::Indexer;
use skygraph_core::plc;
use skygraph_core::uri::{parse_did, parse_rkey};
use skygraph_protocol::{encode_frame, EventHeader, Label, LabelsFrame, MSG_LABELS, OP_MESSAGE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

pub const SERVICE_DID: &str = "did:web:skygraph.social";

const FEEDS: [&str; 19] = [
    "allmentions",
    "f-allmentions",
    "bangers",
    "birthdays",
    "f-birthdays",
    "dms",
    "firehose",
    "gmgn",
    "f-gmgn",
    "lewds",
    "f-lewds",
    "mark",
    "mentions",
    "f-mentions",
    "newskies",
    "noskies",
    "quotes",
    "renewskies",
    "f-renewskies",
];

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub indexer: Arc<Indexer>,
    pub client: Arc<dyn AtpClient>,
    pub http: reqwest::Client,
    pub sem: Arc<Semaphore>,
    pub pinned_post: Option<String>,
    pub enable_follow_lewds: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            any(describe_feed_generator),
        )
        .route("/xrpc/app.bsky.feed.getFeedSkeleton", any(get_feed_skeleton))
        .route("/xrpc/app.bsky.unspecced.getPopular", any(get_popular))
        .route(
            "/xrpc/com.atproto.label.subscribeLabels",
            get(subscribe_labels),
        )
        .route("/pds/*handle", get(pds_lookup))
        .route("/did/*handle", get(did_lookup))
        .route("/skychat/*rest", get(skychat_redirect))
        .route("/quotes/*rest", get(quotes_lookup))
        .fallback(at_fallback)
        .with_state(state)
}

fn cors_headers(origin: Option<&axum::http::HeaderValue>) -> [(&'static str, String); 3] {
    let origin = origin
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    [
        ("access-control-allow-origin", origin),
        ("access-control-allow-methods", "GET".to_string()),
        ("access-control-allow-headers", "*".to_string()),
    ]
}

fn simple(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

fn text(status: StatusCode, cache: &str, body: String) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8");
    if !cache.is_empty() {
        builder = builder.header("cache-control", cache);
    }
    builder.body(Body::from(body)).unwrap()
}

fn html(status: StatusCode, cache: &str, body: String) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", cache)
        .body(Body::from(body))
        .unwrap()
}

fn redirect(location: String, cache: &str) -> Response {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("cache-control", cache)
        .header("location", location)
        .body(Body::empty())
        .unwrap()
}

/// Catch-all: answers CORS preflight and swallows unknown paths the way
/// the original mux did.
async fn root(method: Method, uri: Uri, headers: HeaderMap) -> Response {
    info!("{method} {uri}");
    if method == Method::OPTIONS {
        let mut resp = simple(StatusCode::OK);
        for (name, value) in cors_headers(headers.get("origin")) {
            if let Ok(value) = value.parse() {
                resp.headers_mut().insert(name, value);
            }
        }
        return resp;
    }
    simple(StatusCode::OK)
}

// ---- bearer parsing ----

#[derive(Debug, Deserialize)]
struct BearerClaims {
    #[serde(default)]
    iss: String,
}

/// Viewer did from the bearer token; invalid tokens read as anonymous.
fn did_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let mut parts = header.splitn(2, ' ');
    if !parts.next()?.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?;
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return None;
    }

    let payload = segments[1];
    let padded = format!("{payload}{}", "=".repeat((4 - payload.len() % 4) % 4));
    let decoded = B64.decode(padded).ok()?;
    let claims: BearerClaims = serde_json::from_slice(&decoded).ok()?;
    if claims.iss.is_empty() {
        None
    } else {
        Some(claims.iss)
    }
}

// ---- feed skeletons ----

#[derive(Serialize)]
struct FeedPostJson {
    post: String,
}

#[derive(Serialize)]
struct FeedResponseJson {
    cursor: String,
    feed: Vec<FeedPostJson>,
}

#[derive(Serialize)]
struct DescribeFeedJson {
    uri: String,
}

#[derive(Serialize)]
struct DescribeResponseJson {
    did: String,
    feeds: Vec<DescribeFeedJson>,
}

async fn describe_feed_generator(method: Method, headers: HeaderMap) -> Response {
    if method == Method::OPTIONS {
        return root(method, Uri::from_static("/"), headers).await;
    }

    let response = DescribeResponseJson {
        did: SERVICE_DID.to_string(),
        feeds: FEEDS
            .iter()
            .map(|name| DescribeFeedJson {
                uri: format!("at://{SERVICE_DID}/app.bsky.feed.generator/{name}"),
            })
            .collect(),
    };
    let body = match serde_json::to_vec(&response) {
        Ok(body) => body,
        Err(err) => {
            warn!("describeFeedGenerator encode error: {err:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header("cache-control", "public, max-age=300")
        .header("content-type", "application/json; charset=utf-8")
        .body(Body::from(body))
        .unwrap();
    for (name, value) in cors_headers(headers.get("origin")) {
        if let Ok(value) = value.parse() {
            resp.headers_mut().insert(name, value);
        }
    }
    resp
}

/// Feed uri -> label: the record key names the algorithm.
fn parse_feed_at_uri(uri: &str) -> String {
    parse_rkey(uri)
}

fn normalize_label(label: &str) -> &str {
    match label {
        "newskies" | "newsky" => "newskie",
        "renewskies" => "renewskie",
        other => other,
    }
}

async fn get_feed_skeleton(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if method == Method::OPTIONS {
        return root(method, Uri::from_static("/"), headers).await;
    }

    let did = did_from_headers(&headers);
    let start = Instant::now();
    let feed = query.get("feed").cloned().unwrap_or_default();
    let label = normalize_label(&parse_feed_at_uri(&feed)).to_string();

    let response = generate_feed(
        &state,
        did.clone(),
        &label,
        query.get("cursor").map(|s| s.as_str()).unwrap_or(""),
        query.get("limit").map(|s| s.as_str()).unwrap_or(""),
        &headers,
    )
    .await;

    match &did {
        Some(did) => info!(
            "GET getFeedSkeleton feed={feed} ({did}) {:.3}s",
            start.elapsed().as_secs_f64()
        ),
        None => info!(
            "GET getFeedSkeleton feed={feed} {:.3}s",
            start.elapsed().as_secs_f64()
        ),
    }
    response
}

async fn get_popular(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if method == Method::OPTIONS {
        return root(method, Uri::from_static("/"), headers).await;
    }

    let did = did_from_headers(&headers);
    let label = query.get("label").cloned().unwrap_or_default();
    let label = normalize_label(&label).to_string();
    generate_feed(
        &state,
        did,
        &label,
        query.get("cursor").map(|s| s.as_str()).unwrap_or(""),
        query.get("limit").map(|s| s.as_str()).unwrap_or(""),
        &headers,
    )
    .await
}

enum FeedError {
    Unauthorized,
    UnknownFeed,
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for FeedError {
    fn from(err: anyhow::Error) -> Self {
        FeedError::Internal(err)
    }
}

/// Dispatch a feed query. Runs on a blocking thread behind the query
/// semaphore.
fn dispatch_feed(
    db: &Db,
    label: &str,
    did: Option<&str>,
    cursor: i64,
    limit: usize,
    enable_follow_lewds: bool,
) -> Result<(Vec<PostRow>, bool), FeedError> {
    let viewer = |did: Option<&str>| -> Result<String, FeedError> {
        match did {
            Some(did) if !did.is_empty() => Ok(did.to_string()),
            _ => Err(FeedError::Unauthorized),
        }
    };

    let posts = match label {
        "firehose" => (db.select_latest_posts(cursor, limit)?, false),
        "lewds" => (
            db.select_posts_by_labels(cursor, limit, &["underwear", "nudity", "porn", "sexual"])?,
            false,
        ),
        "f-lewds" => {
            let did = viewer(did)?;
            if enable_follow_lewds {
                (
                    db.select_posts_by_labels_followed(
                        cursor,
                        limit,
                        &did,
                        &["underwear", "nudity", "porn", "sexual"],
                    )?,
                    true,
                )
            } else {
                (Vec::new(), true)
            }
        }
        "mark" => {
            let did = viewer(did)?;
            (db.select_mark(cursor, limit, &did)?, true)
        }
        "allmentions" => {
            let did = viewer(did)?;
            (db.select_all_mentions(cursor, limit, &did)?, true)
        }
        "f-allmentions" => {
            let did = viewer(did)?;
            (db.select_all_mentions_followed(cursor, limit, &did)?, true)
        }
        "bangers" => (db.select_bangers(cursor, limit)?, false),
        "birthdays" => (db.select_birthdays(cursor, limit)?, false),
        "f-birthdays" => {
            let did = viewer(did)?;
            (db.select_birthdays_followed(cursor, limit, &did)?, true)
        }
        "dms" => {
            let did = viewer(did)?;
            (db.select_dms(cursor, limit, &did)?, true)
        }
        "mentions" => {
            let did = viewer(did)?;
            (db.select_mentions(cursor, limit, &did)?, true)
        }
        "f-mentions" => {
            let did = viewer(did)?;
            (db.select_mentions_followed(cursor, limit, &did)?, true)
        }
        "noskies" => (db.select_posts_by_labels(cursor, limit, &["newskie"])?, false),
        "quotes" => {
            let did = viewer(did)?;
            (db.select_quotes(cursor, limit, &did)?, true)
        }
        followed if followed.len() > 2 && followed.starts_with("f-") => {
            let did = viewer(did)?;
            let base = &followed[2..];
            (
                db.select_posts_by_labels_followed(cursor, limit, &did, &[base])?,
                true,
            )
        }
        literal => {
            if db
                .labels
                .find_label(literal)
                .map_err(FeedError::Internal)?
                .is_none()
            {
                return Err(FeedError::UnknownFeed);
            }
            (db.select_posts_by_labels(cursor, limit, &[literal])?, false)
        }
    };
    Ok(posts)
}

async fn generate_feed(
    state: &AppState,
    did: Option<String>,
    label: &str,
    compound_cursor: &str,
    limit_str: &str,
    headers: &HeaderMap,
) -> Response {
    if label.is_empty() {
        return simple(StatusCode::BAD_REQUEST);
    }

    let mut pinned_post = if compound_cursor.is_empty() {
        state.pinned_post.clone()
    } else {
        None
    };

    // Cursor: "<epoch>::P<post-id>". An epoch-only prefix maps to the
    // newest post id at that epoch; "" means latest.
    let mut cache_age = 15u32;
    let mut cursor = i64::MAX;
    let mut cursor_epoch: Option<i64> = None;
    if !compound_cursor.is_empty() {
        cursor = 0;
        let parts: Vec<&str> = compound_cursor.splitn(2, "::").collect();
        if parts.len() == 2 {
            if let Some(post_id) = parts[1].strip_prefix('P') {
                match post_id.parse() {
                    Ok(id) => {
                        cursor = id;
                        cache_age = 600;
                    }
                    Err(err) => {
                        warn!(compound_cursor, "could not parse cursor post id: {err}");
                    }
                }
            } else {
                match parts[0].parse() {
                    Ok(epoch) => {
                        cursor_epoch = Some(epoch);
                        cache_age = 600;
                    }
                    Err(err) => {
                        warn!(compound_cursor, "could not parse cursor epoch: {err}");
                    }
                }
            }
        }
    }

    let mut limit = 25usize;
    if !limit_str.is_empty() {
        match limit_str.parse::<usize>() {
            Ok(parsed) => limit = parsed.min(25),
            Err(err) => {
                warn!(limit_str, "could not parse limit: {err}");
                return simple(StatusCode::BAD_REQUEST);
            }
        }
    }
    if limit <= 1 {
        pinned_post = None;
    }
    if pinned_post.is_some() && limit > 1 {
        limit -= 1;
    }

    let Ok(_permit) = state.sem.clone().acquire_owned().await else {
        return simple(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let result = {
        let db = state.db.clone();
        let label = label.to_string();
        let did = did.clone();
        let enable_follow_lewds = state.enable_follow_lewds;
        tokio::task::spawn_blocking(move || {
            let mut cursor = cursor;
            if let Some(epoch) = cursor_epoch {
                let post_id = retry_busy(|| db.posts.select_post_id_by_epoch(epoch))
                    .map_err(FeedError::Internal)?;
                if post_id != 0 {
                    cursor = post_id;
                }
            }
            let label = label.as_str();
            let did = did.as_deref();
            let mut attempt =
                || dispatch_feed(&db, label, did, cursor, limit, enable_follow_lewds);
            // Busy retries wrap the whole dispatch, matching the write
            // side's contract.
            for _ in 0..4 {
                match attempt() {
                    Err(FeedError::Internal(err)) if skygraph_core::db::is_busy_error(&err) => {
                        continue;
                    }
                    other => return other,
                }
            }
            attempt()
        })
        .await
    };

    let (posts, vary) = match result {
        Ok(Ok(pair)) => pair,
        Ok(Err(FeedError::Unauthorized)) => return simple(StatusCode::UNAUTHORIZED),
        Ok(Err(FeedError::UnknownFeed)) => return simple(StatusCode::NOT_FOUND),
        Ok(Err(FeedError::Internal(err))) => {
            warn!("feed query error: {err:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(err) => {
            warn!("feed task failed: {err:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut feed = FeedResponseJson {
        cursor: String::new(),
        feed: Vec::with_capacity(posts.len() + 1),
    };
    if let Some(last) = posts.last() {
        feed.cursor = format!("{}::P{}", last.created_at, last.post_id);
    }
    if let Some(pinned) = pinned_post {
        feed.feed.push(FeedPostJson { post: pinned });
    }
    for post in &posts {
        feed.feed.push(FeedPostJson {
            post: post.uri.clone(),
        });
    }

    let body = match serde_json::to_vec(&feed) {
        Ok(body) => body,
        Err(err) => {
            warn!("feed encode error: {err:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json; charset=utf-8");
    if label == "firehose" {
        builder = builder.header("cache-control", "no-cache");
    } else {
        if vary {
            builder = builder.header("vary", "authorization");
        }
        builder = builder.header("cache-control", format!("public, max-age={cache_age}"));
    }
    let mut resp = builder.body(Body::from(body)).unwrap();
    for (name, value) in cors_headers(headers.get("origin")) {
        if let Ok(value) = value.parse() {
            resp.headers_mut().insert(name, value);
        }
    }
    resp
}

// ---- label subscription websocket ----

#[derive(Deserialize)]
struct SubscribeLabelsQuery {
    #[serde(default)]
    cursor: Option<String>,
}

async fn subscribe_labels(
    State(state): State<AppState>,
    Query(query): Query<SubscribeLabelsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let cursor = query
        .cursor
        .as_deref()
        .and_then(|raw| match raw.parse::<i64>() {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(raw, "could not parse subscribeLabels cursor: {err}");
                None
            }
        })
        .unwrap_or(0);
    ws.on_upgrade(move |socket| handle_subscribe_labels(state, cursor, socket))
}

fn labels_frame(rows: &[skygraph_core::db::CustomLabelRow]) -> Result<Vec<u8>> {
    let Some(last) = rows.last() else {
        return Err(anyhow!("empty label batch"));
    };
    let mut labels = Vec::with_capacity(rows.len());
    for row in rows {
        labels.push(Label::from_cbor(&row.cbor)?);
    }
    let header = EventHeader {
        op: OP_MESSAGE,
        msg_type: MSG_LABELS.to_string(),
    };
    let body = LabelsFrame {
        seq: last.custom_label_id,
        labels,
    };
    encode_frame(&header, &body)
}

/// Backfill from the caller's cursor, then tail: every thirty seconds
/// ping and drain whatever new labels landed.
async fn handle_subscribe_labels(state: AppState, cursor: i64, socket: WebSocket) {
    const PAGE: usize = 25;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
        let _ = cancel_tx.send(true);
    });

    let last_id = {
        let db = state.db.clone();
        match tokio::task::spawn_blocking(move || db.last_custom_label_id()).await {
            Ok(Ok(last_id)) => last_id,
            Ok(Err(err)) => {
                warn!("last custom label id error: {err:#}");
                return;
            }
            Err(err) => {
                warn!("label backfill task failed: {err:#}");
                return;
            }
        }
    };

    let mut cursor = cursor;
    if cursor == 0 || cursor > last_id {
        cursor = last_id - 1;
    }

    // Backfill.
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        let rows = {
            let db = state.db.clone();
            match tokio::task::spawn_blocking(move || db.select_custom_labels(cursor, PAGE)).await
            {
                Ok(Ok(rows)) => rows,
                Ok(Err(err)) => {
                    warn!("select custom labels error: {err:#}");
                    return;
                }
                Err(err) => {
                    warn!("label backfill task failed: {err:#}");
                    return;
                }
            }
        };
        if rows.is_empty() {
            break;
        }
        cursor = rows.last().unwrap().custom_label_id;

        let frame = match labels_frame(&rows) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("error encoding labels frame: {err:#}");
                return;
            }
        };
        if ws_tx.send(Message::Binary(frame)).await.is_err() {
            return;
        }
        if rows.len() < PAGE {
            break;
        }
    }

    // Tail.
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
                loop {
                    let rows = {
                        let db = state.db.clone();
                        match tokio::task::spawn_blocking(move || {
                            db.select_custom_labels(cursor, PAGE)
                        })
                        .await
                        {
                            Ok(Ok(rows)) => rows,
                            Ok(Err(err)) => {
                                warn!("select custom labels error: {err:#}");
                                return;
                            }
                            Err(err) => {
                                warn!("label tail task failed: {err:#}");
                                return;
                            }
                        }
                    };
                    if rows.is_empty() {
                        break;
                    }
                    cursor = rows.last().unwrap().custom_label_id;

                    let frame = match labels_frame(&rows) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!("error encoding labels frame: {err:#}");
                            return;
                        }
                    };
                    if ws_tx.send(Message::Binary(frame)).await.is_err() {
                        return;
                    }
                    if rows.len() < PAGE {
                        break;
                    }
                }
            }
        }
    }
}

// ---- lookup and redirect endpoints ----

async fn at_redirect(state: &AppState, tail: &str) -> Response {
    let path = tail.trim_start_matches('/');
    let did = parse_did(&format!("at://{path}"));
    if did.is_empty() {
        return simple(StatusCode::BAD_REQUEST);
    }
    let parts: Vec<&str> = path.splitn(3, '/').collect();
    if parts.len() != 3 {
        return simple(StatusCode::BAD_REQUEST);
    }

    let actor = match state.client.get_actor(&did).await {
        Ok(Some(actor)) => actor,
        Ok(None) => {
            warn!(did, "did does not exist");
            return simple(StatusCode::BAD_REQUEST);
        }
        Err(err) => {
            warn!(did, "error getting actor: {err:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    redirect(
        format!("https://bsky.app/profile/{}/post/{}", actor.handle, parts[2]),
        "public, max-age=600",
    )
}

async fn pds_lookup(State(state): State<AppState>, Path(handle): Path<String>) -> Response {
    info!("GET /pds/{handle}");
    if handle == "YOUR-HANDLE-HERE" {
        return text(
            StatusCode::OK,
            "public, max-age=600",
            "Please replace YOUR-HANDLE-HERE in the address bar with your Bluesky handle\n"
                .to_string(),
        );
    }

    let did = match plc::resolve_handle(&state.http, &handle).await {
        Ok(did) => did,
        Err(err) => {
            warn!(handle, "handle lookup failed: {err:#}");
            return text(
                StatusCode::BAD_REQUEST,
                "",
                format!("{handle} does not appear to be a valid Bluesky handle\n"),
            );
        }
    };

    let pds = match plc::lookup_pds(&state.http, &did).await {
        Ok(pds) => pds,
        Err(err) => {
            warn!(did, "pds lookup failed: {err:#}");
            return simple(StatusCode::NOT_FOUND);
        }
    };
    let pds = pds.strip_prefix("https://").unwrap_or(&pds);

    text(
        StatusCode::OK,
        "public, max-age=30",
        format!("{handle} is in {pds}!\n"),
    )
}

async fn did_lookup(State(state): State<AppState>, Path(handle): Path<String>) -> Response {
    info!("GET /did/{handle}");
    match plc::resolve_handle(&state.http, &handle).await {
        Ok(did) => text(StatusCode::OK, "public, max-age=30", did),
        Err(err) => {
            warn!(handle, "handle lookup failed: {err:#}");
            text(
                StatusCode::BAD_REQUEST,
                "",
                format!("{handle} does not appear to be a valid Bluesky handle\n"),
            )
        }
    }
}

/// "<https:/bsky.app/profile/{handle}/post/{rkey}>" with however many
/// slashes survived the client.
fn parse_bsky_post_url(rest: &str) -> Option<(String, String)> {
    let rest = rest
        .trim_start_matches("https:")
        .trim_start_matches('/');
    let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        ["bsky.app", "profile", handle, "post", rkey] => {
            Some((handle.to_string(), rkey.to_string()))
        }
        _ => None,
    }
}

async fn skychat_redirect(State(state): State<AppState>, Path(rest): Path<String>) -> Response {
    info!("GET /skychat/{rest}");
    let Some((handle, rkey)) = parse_bsky_post_url(&rest) else {
        return text(
            StatusCode::BAD_REQUEST,
            "public, max-age=30",
            format!("{rest} does not look like a valid bsky.app post url\n"),
        );
    };

    let did = match plc::resolve_handle(&state.http, &handle).await {
        Ok(did) => did,
        Err(err) => {
            warn!(handle, "handle lookup failed: {err:#}");
            return text(
                StatusCode::BAD_REQUEST,
                "public, max-age=30",
                format!("{rest} does not look like a valid bsky.app post url\n"),
            );
        }
    };

    redirect(
        format!("https://skychat.social/#https://bsky.app/profile/{did}/post/{rkey}"),
        "public, max-age=600",
    )
}

fn quotes_page(url: Option<&str>, error: Option<&str>, posts: &[String]) -> String {
    let mut body = String::from(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />\n\
         <title>Bluesky quotes</title>\n</head>\n<body>\n",
    );
    match url {
        None => {
            body.push_str(
                "<form method=\"get\" id=\"quotes\">\n\
                 <label for=\"url\">Bluesky Post URL:</label>\n\
                 <input type=\"text\" id=\"url\" name=\"url\">\n\
                 <button type=\"submit\">Lookup Quotes!</button>\n</form>\n",
            );
        }
        Some(url) => {
            body.push_str(&format!("<h1>Quote Posts for {url}</h1>\n"));
            if let Some(error) = error {
                body.push_str(&format!(
                    "<div>Error looking up quotes:<pre>{error}</pre></div>\n"
                ));
            } else if posts.is_empty() {
                body.push_str("<div>No quotes found yet</div>\n");
            } else {
                for post in posts {
                    body.push_str(&format!("<p><a href=\"{post}\">{post}</a></p>\n"));
                }
            }
        }
    }
    body.push_str("</body>\n</html>\n");
    body
}

async fn quotes_lookup(
    State(state): State<AppState>,
    rest: Option<Path<String>>,
) -> Response {
    let rest = rest.map(|Path(rest)| rest).unwrap_or_default();
    info!("GET /quotes/{rest}");

    if rest.is_empty() {
        return html(
            StatusCode::OK,
            "public, max-age=600",
            quotes_page(None, None, &[]),
        );
    }

    let display_url = format!("https://{}", rest.trim_start_matches("https:").trim_start_matches('/'));
    let Some((handle, rkey)) = parse_bsky_post_url(&rest) else {
        return html(
            StatusCode::BAD_REQUEST,
            "public, max-age=30",
            quotes_page(
                Some(&display_url),
                Some(&format!("{rest} does not look like a valid bsky.app post url")),
                &[],
            ),
        );
    };

    let did = match plc::resolve_handle(&state.http, &handle).await {
        Ok(did) => did,
        Err(err) => {
            warn!(handle, "handle lookup failed: {err:#}");
            return html(
                StatusCode::BAD_REQUEST,
                "public, max-age=30",
                quotes_page(
                    Some(&display_url),
                    Some(&format!("{rest} does not look like a valid bsky.app post url")),
                    &[],
                ),
            );
        }
    };

    let at_uri = format!("at://{did}/app.bsky.feed.post/{rkey}");
    let quotes = {
        let db = state.db.clone();
        match tokio::task::spawn_blocking(move || db.select_quotes_for_uri(&at_uri)).await {
            Ok(Ok(quotes)) => quotes,
            Ok(Err(err)) => {
                warn!("quote lookup error: {err:#}");
                return html(
                    StatusCode::BAD_REQUEST,
                    "public, max-age=30",
                    quotes_page(Some(&display_url), Some(&format!("{err:#}")), &[]),
                );
            }
            Err(err) => {
                warn!("quote lookup task failed: {err:#}");
                return simple(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };

    let quote_urls: Vec<String> = quotes
        .iter()
        .map(|quote| {
            format!(
                "https://bsky.app/profile/{}/post/{}",
                parse_did(&quote.uri),
                parse_rkey(&quote.uri)
            )
        })
        .collect();

    html(
        StatusCode::OK,
        "public, max-age=30",
        quotes_page(Some(&display_url), None, &quote_urls),
    )
}

/// `/at/<did>/<collection>/<rkey>` and `/at:/<...>` redirects, reached
/// through the fallback because of the `:` in the second form. The bare
/// `/quotes/` lookup form lands here too.
pub async fn at_fallback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path();
    for prefix in ["/at://", "/at:/", "/at/"] {
        if let Some(tail) = path.strip_prefix(prefix) {
            info!("{method} {path}");
            return at_redirect(&state, tail).await;
        }
    }
    if path == "/quotes" || path == "/quotes/" {
        return html(
            StatusCode::OK,
            "public, max-age=600",
            quotes_page(None, None, &[]),
        );
    }
    root(method, uri, headers).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_parsing_takes_iss() {
        let claims = B64.encode(r#"{"iss":"did:plc:viewer","aud":"x"}"#);
        let claims = claims.trim_end_matches('=');
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer aaa.{claims}.zzz").parse().unwrap(),
        );
        assert_eq!(did_from_headers(&headers), Some("did:plc:viewer".to_string()));
    }

    #[test]
    fn bad_bearer_reads_as_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer not-a-jwt".parse().unwrap());
        assert_eq!(did_from_headers(&headers), None);

        headers.insert("authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
        assert_eq!(did_from_headers(&headers), None);

        assert_eq!(did_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn feed_uri_maps_to_label() {
        assert_eq!(
            parse_feed_at_uri("at://did:web:skygraph.social/app.bsky.feed.generator/bangers"),
            "bangers"
        );
        assert_eq!(parse_feed_at_uri("nonsense"), "");
        assert_eq!(normalize_label("newskies"), "newskie");
        assert_eq!(normalize_label("renewskies"), "renewskie");
        assert_eq!(normalize_label("bangers"), "bangers");
    }

    #[test]
    fn bsky_post_urls_parse_with_any_slashing() {
        assert_eq!(
            parse_bsky_post_url("https:/bsky.app/profile/alice.test/post/3k2a"),
            Some(("alice.test".to_string(), "3k2a".to_string()))
        );
        assert_eq!(
            parse_bsky_post_url("https://bsky.app/profile/alice.test/post/3k2a"),
            Some(("alice.test".to_string(), "3k2a".to_string()))
        );
        assert_eq!(parse_bsky_post_url("https:/evil.example/profile/a/post/b"), None);
        assert_eq!(parse_bsky_post_url(""), None);
    }
}
