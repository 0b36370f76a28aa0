/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Upstream app-view client. Only the read surface the indexer needs is
//! modeled; posting and list management live elsewhere.

use crate::subscriber::write_file_atomic;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViewerState {
    #[serde(rename = "blockedBy", default)]
    pub blocked_by: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileView {
    pub did: String,
    #[serde(default)]
    pub handle: String,
    #[serde(rename = "indexedAt", default)]
    pub indexed_at: Option<String>,
    #[serde(rename = "postsCount", default)]
    pub posts_count: Option<i64>,
    #[serde(default)]
    pub viewer: Option<ViewerState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelView {
    #[serde(default)]
    pub val: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorView {
    pub did: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostView {
    pub uri: String,
    #[serde(rename = "indexedAt", default)]
    pub indexed_at: String,
    #[serde(default)]
    pub labels: Vec<LabelView>,
    #[serde(default)]
    pub author: Option<AuthorView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedViewPost {
    pub post: PostView,
    #[serde(default)]
    pub reply: Option<serde_json::Value>,
}

/// One record from the upstream follow list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FollowListRecord {
    pub uri: String,
    pub value: FollowListValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FollowListValue {
    #[serde(default)]
    pub subject: String,
}

#[async_trait]
pub trait AtpClient: Send + Sync {
    fn did(&self) -> String;
    async fn get_actor(&self, did: &str) -> Result<Option<ProfileView>>;
    async fn get_actors(&self, dids: &[String]) -> Result<Vec<ProfileView>>;
    async fn get_author_feed(
        &self,
        actor: &str,
        filter: &str,
        limit: i64,
        cursor: &str,
    ) -> Result<(Vec<FeedViewPost>, String)>;
    async fn get_follows(
        &self,
        did: &str,
        limit: i64,
        cursor: &str,
    ) -> Result<(Vec<FollowListRecord>, String)>;
    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Session {
    #[serde(rename = "accessJwt", default)]
    access_jwt: String,
    #[serde(rename = "refreshJwt", default)]
    refresh_jwt: String,
    #[serde(default)]
    did: String,
    #[serde(default)]
    handle: String,
}

pub struct HttpAtpClient {
    http: reqwest::Client,
    pds_host: String,
    auth_path: PathBuf,
    identifier: String,
    password: String,
    session: Mutex<Session>,
}

impl HttpAtpClient {
    pub async fn login(
        pds_host: &str,
        identifier: &str,
        password: &str,
        auth_path: PathBuf,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;

        let client = HttpAtpClient {
            http,
            pds_host: pds_host.trim_end_matches('/').to_string(),
            auth_path,
            identifier: identifier.to_string(),
            password: password.to_string(),
            session: Mutex::new(Session::default()),
        };

        if let Some(session) = client.load_session()? {
            *client.session.lock().unwrap() = session;
        } else {
            client.create_session().await?;
        }
        Ok(client)
    }

    fn load_session(&self) -> Result<Option<Session>> {
        let raw = match std::fs::read(&self.auth_path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            other => other.with_context(|| format!("read {}", self.auth_path.display()))?,
        };
        match serde_json::from_slice::<Session>(&raw) {
            Ok(session) if !session.access_jwt.is_empty() => Ok(Some(session)),
            _ => Ok(None),
        }
    }

    fn save_session(&self, session: &Session) {
        match serde_json::to_vec(session) {
            Ok(bytes) => {
                if let Err(err) = write_file_atomic(&self.auth_path, &bytes) {
                    warn!("error saving auth file: {err:#}");
                }
            }
            Err(err) => warn!("error serializing auth file: {err:#}"),
        }
    }

    async fn create_session(&self) -> Result<()> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.pds_host);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "identifier": self.identifier,
                "password": self.password,
            }))
            .send()
            .await
            .context("create session")?;
        if !resp.status().is_success() {
            bail!("createSession returned {}", resp.status());
        }
        let session: Session = resp.json().await.context("parse session")?;
        self.save_session(&session);
        *self.session.lock().unwrap() = session;
        Ok(())
    }

    async fn refresh_session(&self) -> Result<()> {
        let refresh_jwt = self.session.lock().unwrap().refresh_jwt.clone();
        if refresh_jwt.is_empty() {
            return self.create_session().await;
        }
        let url = format!("{}/xrpc/com.atproto.server.refreshSession", self.pds_host);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&refresh_jwt)
            .send()
            .await
            .context("refresh session")?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "session refresh failed, recreating");
            return self.create_session().await;
        }
        let session: Session = resp.json().await.context("parse refreshed session")?;
        self.save_session(&session);
        *self.session.lock().unwrap() = session;
        Ok(())
    }

    /// Issue a GET, refreshing the session once on an auth failure.
    /// Upstream error bodies surface as `error: message` strings so the
    /// scheduler can pattern-match takedowns and blocks.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        for attempt in 0..2 {
            let access_jwt = self.session.lock().unwrap().access_jwt.clone();
            let url = format!("{}{path}", self.pds_host);
            let resp = self
                .http
                .get(&url)
                .query(query)
                .bearer_auth(&access_jwt)
                .send()
                .await
                .with_context(|| format!("get {path}"))?;

            let status = resp.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.refresh_session().await?;
                continue;
            }
            if !status.is_success() {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let error = body.get("error").and_then(|v| v.as_str()).unwrap_or("");
                let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("");
                bail!("{path} returned {status}: {error}: {message}");
            }
            return resp.json().await.with_context(|| format!("parse {path}"));
        }
        Err(anyhow!("{path}: out of auth retries"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProfilesResponse {
    #[serde(default)]
    profiles: Vec<ProfileView>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorFeedResponse {
    #[serde(default)]
    feed: Vec<FeedViewPost>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<FollowListRecord>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    posts: Vec<PostView>,
}

#[async_trait]
impl AtpClient for HttpAtpClient {
    fn did(&self) -> String {
        self.session.lock().unwrap().did.clone()
    }

    async fn get_actor(&self, did: &str) -> Result<Option<ProfileView>> {
        if did.is_empty() {
            bail!("did cannot be an empty string");
        }
        let profile: ProfileView = self
            .get_json("/xrpc/app.bsky.actor.getProfile", &[("actor", did)])
            .await?;
        Ok(Some(profile))
    }

    async fn get_actors(&self, dids: &[String]) -> Result<Vec<ProfileView>> {
        let mut profiles = Vec::with_capacity(dids.len());
        for chunk in dids.chunks(25) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|did| ("actors", did.as_str())).collect();
            let resp: ProfilesResponse = self
                .get_json("/xrpc/app.bsky.actor.getProfiles", &query)
                .await?;
            profiles.extend(resp.profiles);
        }
        Ok(profiles)
    }

    async fn get_author_feed(
        &self,
        actor: &str,
        filter: &str,
        limit: i64,
        cursor: &str,
    ) -> Result<(Vec<FeedViewPost>, String)> {
        let limit = limit.to_string();
        let mut query = vec![
            ("actor", actor),
            ("filter", filter),
            ("limit", limit.as_str()),
        ];
        if !cursor.is_empty() {
            query.push(("cursor", cursor));
        }
        let resp: AuthorFeedResponse = self
            .get_json("/xrpc/app.bsky.feed.getAuthorFeed", &query)
            .await?;
        Ok((resp.feed, resp.cursor.unwrap_or_default()))
    }

    async fn get_follows(
        &self,
        did: &str,
        limit: i64,
        cursor: &str,
    ) -> Result<(Vec<FollowListRecord>, String)> {
        let limit = limit.to_string();
        let mut query = vec![
            ("repo", did),
            ("collection", "app.bsky.graph.follow"),
            ("limit", limit.as_str()),
        ];
        if !cursor.is_empty() {
            query.push(("cursor", cursor));
        }
        let resp: ListRecordsResponse = self
            .get_json("/xrpc/com.atproto.repo.listRecords", &query)
            .await?;
        Ok((resp.records, resp.cursor.unwrap_or_default()))
    }

    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        let mut posts = Vec::with_capacity(uris.len());
        for chunk in uris.chunks(25) {
            let query: Vec<(&str, &str)> =
                chunk.iter().map(|uri| ("uris", uri.as_str())).collect();
            let resp: PostsResponse =
                self.get_json("/xrpc/app.bsky.feed.getPosts", &query).await?;
            posts.extend(resp.posts);
        }
        Ok(posts)
    }
}

/// In-memory client for tests and offline runs.
#[derive(Default)]
pub struct MockAtpClient {
    pub own_did: String,
    pub profiles: Mutex<HashMap<String, ProfileView>>,
    pub author_feeds: Mutex<HashMap<String, Vec<FeedViewPost>>>,
    pub follows: Mutex<HashMap<String, Vec<FollowListRecord>>>,
    pub posts: Mutex<HashMap<String, PostView>>,
    pub errors: Mutex<HashMap<String, String>>,
}

impl MockAtpClient {
    pub fn new(own_did: impl Into<String>) -> Self {
        MockAtpClient {
            own_did: own_did.into(),
            ..Default::default()
        }
    }

    pub fn put_profile(&self, profile: ProfileView) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.did.clone(), profile);
    }

    pub fn put_follows(&self, did: &str, records: Vec<FollowListRecord>) {
        self.follows.lock().unwrap().insert(did.to_string(), records);
    }

    pub fn put_post(&self, post: PostView) {
        self.posts.lock().unwrap().insert(post.uri.clone(), post);
    }

    /// Make every lookup of this actor fail with the given upstream
    /// error string.
    pub fn fail_actor(&self, did: &str, error: &str) {
        self.errors
            .lock()
            .unwrap()
            .insert(did.to_string(), error.to_string());
    }
}

#[async_trait]
impl AtpClient for MockAtpClient {
    fn did(&self) -> String {
        self.own_did.clone()
    }

    async fn get_actor(&self, did: &str) -> Result<Option<ProfileView>> {
        if let Some(error) = self.errors.lock().unwrap().get(did) {
            bail!("getProfile failed: {error}");
        }
        Ok(self.profiles.lock().unwrap().get(did).cloned())
    }

    async fn get_actors(&self, dids: &[String]) -> Result<Vec<ProfileView>> {
        {
            let errors = self.errors.lock().unwrap();
            for did in dids {
                if let Some(error) = errors.get(did) {
                    bail!("getProfiles failed: {error}");
                }
            }
        }
        let profiles = self.profiles.lock().unwrap();
        Ok(dids
            .iter()
            .filter_map(|did| profiles.get(did).cloned())
            .collect())
    }

    async fn get_author_feed(
        &self,
        actor: &str,
        _filter: &str,
        limit: i64,
        _cursor: &str,
    ) -> Result<(Vec<FeedViewPost>, String)> {
        let feeds = self.author_feeds.lock().unwrap();
        let mut feed = feeds.get(actor).cloned().unwrap_or_default();
        feed.truncate(limit as usize);
        Ok((feed, String::new()))
    }

    async fn get_follows(
        &self,
        did: &str,
        limit: i64,
        cursor: &str,
    ) -> Result<(Vec<FollowListRecord>, String)> {
        let follows = self.follows.lock().unwrap();
        let all = follows.get(did).cloned().unwrap_or_default();
        let start: usize = cursor.parse().unwrap_or(0);
        let end = (start + limit as usize).min(all.len());
        let page = all[start..end].to_vec();
        let next = if end < all.len() {
            end.to_string()
        } else {
            String::new()
        };
        Ok((page, next))
    }

    async fn get_posts(&self, uris: &[String]) -> Result<Vec<PostView>> {
        let posts = self.posts.lock().unwrap();
        Ok(uris
            .iter()
            .filter_map(|uri| posts.get(uri).cloned())
            .collect())
    }
}
