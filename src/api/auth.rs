//! Caller authentication.
//!
//! Resolves `Authorization: Bearer <key>` into a [`CallerToken`] through the
//! token store and stores it in the request extensions for the handlers.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::api::models::{CallerToken, TOKEN_STATUS_ENABLED};
use crate::api::AppState;
use crate::core::error::{AppError, Result};

/// Extract the token key, dropping the scheme and an `sk-` prefix.
pub fn extract_token_key(headers: &HeaderMap) -> Result<String> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?;

    let mut parts = header.split_whitespace();
    let (Some(scheme), Some(key), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AppError::Unauthorized("invalid Bearer token".to_string()));
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::Unauthorized("invalid Bearer token".to_string()));
    }

    let key = key.strip_prefix("sk-").unwrap_or(key);
    if key.is_empty() {
        return Err(AppError::Unauthorized("invalid Bearer token".to_string()));
    }
    Ok(key.to_string())
}

/// Reject tokens that are disabled, expired or out of quota.
pub fn validate_token(token: &CallerToken, now_unix: i64) -> Result<()> {
    if token.status != TOKEN_STATUS_ENABLED {
        return Err(AppError::Unauthorized(format!(
            "token {} is not enabled",
            token.name
        )));
    }
    if token.is_expired_at(now_unix) {
        return Err(AppError::Unauthorized(format!("token {} has expired", token.name)));
    }
    if !token.unlimited_quota && token.remain_quota <= 0 {
        return Err(AppError::Unauthorized(format!(
            "token {} has no remaining quota",
            token.name
        )));
    }
    Ok(())
}

/// Resolve the caller behind `headers` without checking its state.
pub async fn resolve_token(headers: &HeaderMap, state: &AppState) -> Result<CallerToken> {
    let key = extract_token_key(headers)?;
    state
        .tokens
        .find_by_key(&key)
        .await?
        .ok_or_else(|| AppError::Unauthorized("invalid token".to_string()))
}

/// Resolve and validate the caller behind `headers`.
pub async fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<CallerToken> {
    let token = resolve_token(headers, state).await?;
    validate_token(&token, Utc::now().timestamp())?;

    tracing::debug!(token_id = token.id, user_id = token.user_id, group = %token.routing_group(), "Authenticated caller");
    Ok(token)
}

/// Authentication middleware for caller-facing routes.
pub async fn token_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(request.headers(), &state).await {
        Ok(token) => {
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Per-token rate limiting. Must run after [`token_auth_middleware`].
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = request.extensions().get::<CallerToken>() {
        if let Err(e) = state.rate_limiter.check_rate_limit(&token.key) {
            return e.into_response();
        }
    }
    next.run(request).await
}
