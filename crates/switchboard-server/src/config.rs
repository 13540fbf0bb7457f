use anyhow::Context;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use axum::http::{HeaderValue, Method};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use switchboard_hub::HubConfig;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// SQLite path, or `:memory:`.
    pub database: String,
    /// CORS origins. `*` allows any.
    pub allow_origins: Vec<String>,
    pub session_cookie: String,
    /// Bearer token the application backend presents on
    /// `POST /api/notifications`. The endpoint refuses every request while
    /// this is unset.
    pub notify_token: Option<String>,
    /// Overrides the default `RUST_LOG`-less filter.
    pub log_filter: Option<String>,
    pub hub: HubSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database: "switchboard.db".to_string(),
            allow_origins: vec!["http://localhost:3000".to_string()],
            session_cookie: "session_id".to_string(),
            notify_token: None,
            log_filter: None,
            hub: HubSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.hub.to_hub_config().validate()?;
        config.cors_layer()?;
        Ok(config)
    }

    /// CORS policy for `allow_origins`. A `*` entry opens it to any origin.
    pub fn cors_layer(&self) -> anyhow::Result<CorsLayer> {
        let origin = if self.allow_origins.iter().any(|o| o == "*") {
            AllowOrigin::any()
        } else {
            let origins = self
                .allow_origins
                .iter()
                .map(|o| {
                    HeaderValue::from_str(o)
                        .with_context(|| format!("invalid allow_origins entry {o:?}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            AllowOrigin::list(origins)
        };
        Ok(CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE, COOKIE]))
    }
}

/// `[hub]` table. Durations are whole seconds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HubSection {
    pub outbound_capacity: usize,
    pub ping_interval_secs: u64,
    pub pong_wait_secs: u64,
    pub max_content_chars: usize,
    pub backlog_limit: usize,
    pub max_frame_bytes: usize,
    pub rate_burst: u32,
    pub rate_per_second: f64,
}

impl Default for HubSection {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            outbound_capacity: hub.outbound_capacity,
            ping_interval_secs: hub.ping_interval.as_secs(),
            pong_wait_secs: hub.pong_wait.as_secs(),
            max_content_chars: hub.max_content_chars,
            backlog_limit: hub.backlog_limit,
            max_frame_bytes: hub.max_frame_bytes,
            rate_burst: hub.rate_burst,
            rate_per_second: hub.rate_per_second,
        }
    }
}

impl HubSection {
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            outbound_capacity: self.outbound_capacity,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            max_content_chars: self.max_content_chars,
            backlog_limit: self.backlog_limit,
            max_frame_bytes: self.max_frame_bytes,
            rate_burst: self.rate_burst,
            rate_per_second: self.rate_per_second,
        }
    }
}
