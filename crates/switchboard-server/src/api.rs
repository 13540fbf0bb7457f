use crate::AppState;
use crate::auth::{AuthError, TokenQuery, check_bearer};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use switchboard_hub::{HubError, TypingTarget};
use switchboard_protocol::{ChatKind, ErrorCode, GroupId, UserId};

/// Failures surfaced over HTTP.
pub enum ApiError {
    Auth(AuthError),
    Hub(HubError),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Auth(err) => {
                tracing::debug!(error = %err, "api request rejected");
                return err.into_response();
            }
            ApiError::Hub(err) => err,
        };
        let (code, message) = err.to_error_code();
        let status = match code {
            ErrorCode::Forbidden | ErrorCode::NotGroupMember => StatusCode::FORBIDDEN,
            ErrorCode::Internal | ErrorCode::PersistenceFailed => {
                tracing::warn!(error = %err, "api request failed");
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(json!({ "error": message, "code": code.as_str() })),
        )
            .into_response()
    }
}

/// GET /api/online - every user with a live connection.
pub async fn list_online(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "users": state.hub.list_online().await }))
}

/// GET /api/online/{user_id}
pub async fn user_online(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> Json<Value> {
    let online = state.hub.is_online(user_id).await;
    Json(json!({ "user_id": user_id, "online": online }))
}

/// GET /api/groups/{group_id}/online
pub async fn group_online(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<GroupId>,
) -> Json<Value> {
    let users = state.hub.list_online_group_members(group_id).await;
    Json(json!({ "group_id": group_id, "users": users }))
}

#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub user_id: UserId,
    pub payload: Value,
}

/// POST /api/notifications - queue an out-of-band notification.
///
/// Backend-only: callers present the configured `notify_token` as a bearer
/// token.
pub async fn push_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NotificationRequest>,
) -> Result<StatusCode, ApiError> {
    check_bearer(&headers, state.notify_token.as_deref())?;
    state.hub.push_notification(req.user_id, req.payload)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct TypingRequest {
    pub kind: ChatKind,
    pub target_id: i64,
    #[serde(default = "default_is_typing")]
    pub is_typing: bool,
}

fn default_is_typing() -> bool {
    true
}

/// POST /api/typing - typing indicator raised outside a socket, sent as the
/// session's user.
pub async fn typing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<TypingRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let sender = state
        .auth
        .authenticate(&headers, query.token.as_deref())
        .await?;
    let target = match req.kind {
        ChatKind::Private => TypingTarget::User(req.target_id),
        ChatKind::Group => TypingTarget::Group(req.target_id),
    };
    let delivered = state
        .hub
        .broadcast_typing(sender, target, req.is_typing)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

/// GET /healthz
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    let online = state.hub.list_online().await.len();
    let connections = state.hub.registry().connection_count().await;
    Json(json!({ "status": "ok", "online": online, "connections": connections }))
}
