use crate::AppState;
use crate::auth::TokenQuery;
use axum::Json;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use switchboard_hub::{Handshake, Hub, HubError, run_connection};

/// GET /ws - authenticate, then upgrade.
///
/// Nothing is registered until the upgrade completes, so a rejected
/// handshake leaves no trace in the hub.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let principal = match state
        .auth
        .authenticate(&headers, query.token.as_deref())
        .await
    {
        Ok(principal) => principal,
        Err(err) => {
            tracing::warn!(error = %err, "websocket handshake rejected");
            return err.into_response();
        }
    };

    let handshake = match state.hub.handshake(principal).await {
        Ok(handshake) => handshake,
        Err(err) => {
            tracing::warn!(user_id = principal, error = %err, "failed to prepare connection");
            return handshake_failure(&err);
        }
    };

    let hub = state.hub.clone();
    // Hard transport cap. Frames between the two limits are answered with
    // frame_too_large instead of dropping the socket.
    let transport_limit = hub.config().max_frame_bytes.saturating_mul(2);
    ws.max_message_size(transport_limit)
        .on_upgrade(move |socket| serve_socket(hub, handshake, socket))
}

/// A principal the hub will not register is an authentication failure;
/// anything else means the hub or its graph is unavailable.
fn handshake_failure(err: &HubError) -> Response {
    let (status, message) = match err {
        HubError::Forbidden(_) => (StatusCode::UNAUTHORIZED, "invalid principal"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "hub unavailable"),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

async fn serve_socket(hub: Hub, handshake: Handshake, socket: WebSocket) {
    let user_id = handshake.principal;
    let (sink, stream) = socket.split();
    if let Err(err) = run_connection(hub, handshake, sink, stream).await {
        tracing::warn!(user_id, error = %err, "connection ended with error");
    }
}
