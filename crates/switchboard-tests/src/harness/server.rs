use anyhow::{Context, Result, bail};
use reqwest::RequestBuilder;
use reqwest::header::{AUTHORIZATION, COOKIE};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use switchboard_protocol::UserId;
use switchboard_server::RunningServer;
use switchboard_server::config::ServerConfig;
use switchboard_server::store::SqliteStore;

/// Service token the harness configures for `POST /api/notifications`.
pub const NOTIFY_TOKEN: &str = "test-notify-token";

/// A seeded user with a live session token.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: UserId,
    pub token: String,
}

/// An in-process server bound to a random loopback port with an in-memory
/// database.
pub struct TestServer {
    server: RunningServer,
    store: SqliteStore,
    http: reqwest::Client,
}

impl TestServer {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with config tweaks applied on top of the test defaults.
    pub async fn spawn_with(tweak: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        super::init_tracing();
        let mut config = ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            database: ":memory:".to_string(),
            allow_origins: vec!["*".to_string()],
            notify_token: Some(NOTIFY_TOKEN.to_string()),
            ..ServerConfig::default()
        };
        tweak(&mut config);

        let store = SqliteStore::open(&config.database)?;
        let server = switchboard_server::spawn(&config, store.clone()).await?;
        Ok(Self {
            server,
            store,
            http: reqwest::Client::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr())
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr(), path)
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Create a user and a session valid for an hour.
    pub async fn user(&self, username: &str, is_public: bool) -> Result<TestUser> {
        let id = self.store.create_user(username, is_public).await?;
        let token = self
            .store
            .create_session(id, Duration::from_secs(3600))
            .await?;
        Ok(TestUser { id, token })
    }

    /// Mutual accepted follow.
    pub async fn befriend(&self, a: &TestUser, b: &TestUser) -> Result<()> {
        self.store.follow(a.id, b.id, true).await?;
        self.store.follow(b.id, a.id, true).await
    }

    /// Wait until the hub reports `user` online (or offline).
    pub async fn wait_online(&self, user: &TestUser, online: bool) -> Result<()> {
        let hub = &self.server.hub;
        let user_id = user.id;
        let reached = super::wait_until(Duration::from_secs(3), || async move {
            hub.is_online(user_id).await == online
        })
        .await;
        if !reached {
            bail!("user {} never became online={online}", user.id);
        }
        Ok(())
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let resp = self
            .http
            .get(self.http_url(path))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        if !resp.status().is_success() {
            bail!("GET {path} returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Unauthenticated POST of a JSON body. Returns the status and the
    /// (possibly empty) body.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<(u16, Value)> {
        self.send_post(path, self.http.post(self.http_url(path)).json(body))
            .await
    }

    /// POST with `user`'s session cookie.
    pub async fn post_json_as(
        &self,
        user: &TestUser,
        path: &str,
        body: &Value,
    ) -> Result<(u16, Value)> {
        let request = self
            .http
            .post(self.http_url(path))
            .header(COOKIE, format!("session_id={}", user.token))
            .json(body);
        self.send_post(path, request).await
    }

    /// POST with a bearer token, as the application backend would.
    pub async fn post_json_bearer(
        &self,
        token: &str,
        path: &str,
        body: &Value,
    ) -> Result<(u16, Value)> {
        let request = self
            .http
            .post(self.http_url(path))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .json(body);
        self.send_post(path, request).await
    }

    async fn send_post(&self, path: &str, request: RequestBuilder) -> Result<(u16, Value)> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok((status, body))
    }

    pub async fn shutdown(self) -> Result<()> {
        self.server.shutdown().await
    }
}
