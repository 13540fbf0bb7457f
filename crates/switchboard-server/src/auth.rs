use crate::store::SqliteStore;
use async_trait::async_trait;
use axum::Json;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use switchboard_protocol::{UserId, now_ms};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("session expired")]
    Expired,
    #[error("endpoint disabled")]
    Disabled,
    #[error("authentication backend unavailable")]
    Unavailable,
}

/// `?token=` fallback for clients that cannot set cookies.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Disabled => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolves the principal behind an upgrade request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserId, AuthError>;
}

/// Session-token authentication: cookie first, then `?token=`.
pub struct SessionAuthenticator {
    store: SqliteStore,
    cookie_name: String,
}

impl SessionAuthenticator {
    pub fn new(store: SqliteStore, cookie_name: impl Into<String>) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserId, AuthError> {
        let token = cookie_value(headers, &self.cookie_name)
            .or(query_token)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;

        let session = self.store.session_principal(token).await.map_err(|e| {
            tracing::error!(error = %e, "session lookup failed");
            AuthError::Unavailable
        })?;
        match session {
            None => Err(AuthError::Invalid),
            Some((_, expires_at_ms)) if expires_at_ms <= now_ms() => Err(AuthError::Expired),
            Some((user_id, _)) => Ok(user_id),
        }
    }
}

/// Check a service-to-service `Authorization: Bearer` token.
///
/// With no token configured the caller is always refused.
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), AuthError> {
    let expected = expected.filter(|t| !t.is_empty()).ok_or(AuthError::Disabled)?;
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AuthError::Missing)?;
    if presented == expected {
        Ok(())
    } else {
        Err(AuthError::Invalid)
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
