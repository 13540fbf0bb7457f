//! HTTP and WebSocket front end for the switchboard hub.

pub mod api;
pub mod auth;
pub mod config;
pub mod store;
pub mod ws;

use anyhow::{Context, Result};
use auth::{Authenticator, SessionAuthenticator};
use axum::Router;
use axum::routing::{get, post};
use config::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use store::SqliteStore;
use switchboard_hub::Hub;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub hub: Hub,
    pub auth: Arc<dyn Authenticator>,
    /// Service token for `POST /api/notifications`.
    pub notify_token: Option<String>,
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/online", get(api::list_online))
        .route("/api/online/{user_id}", get(api::user_online))
        .route("/api/groups/{group_id}/online", get(api::group_online))
        .route("/api/notifications", post(api::push_notification))
        .route("/api/typing", post(api::typing))
        .route("/healthz", get(api::healthz))
        .layer(cors)
        .with_state(state)
}

/// A server bound and running in the background.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub hub: Hub,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
    hub_task: JoinHandle<()>,
}

impl RunningServer {
    /// Close every connection, stop accepting, and wait for both to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.hub.shutdown();
        let _ = self.shutdown_tx.send(());
        self.task
            .await
            .context("server task panicked")?
            .context("server failed")?;
        self.hub_task.await.context("hub loop panicked")?;
        Ok(())
    }
}

/// Start the hub and the HTTP listener on `config.listen`.
pub async fn spawn(config: &ServerConfig, store: SqliteStore) -> Result<RunningServer> {
    let backend = Arc::new(store.clone());
    let (hub, hub_task) = Hub::start(config.hub.to_hub_config(), backend.clone(), backend)?;

    let state = Arc::new(AppState {
        hub: hub.clone(),
        auth: Arc::new(SessionAuthenticator::new(store, &config.session_cookie)),
        notify_token: config.notify_token.clone(),
    });
    let app = router(state, config.cors_layer()?);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    Ok(RunningServer {
        local_addr,
        hub,
        shutdown_tx,
        task,
        hub_task,
    })
}
