//! Usage API: token balance and the upstream model catalogue.
//!
//! Both endpoints resolve the first capable channel of the caller's group and
//! talk to the channel's own usage API with the channel credential.

use crate::api::models::{token_status_text, BalanceData, CallerToken, Channel, UsageApiResponse};
use crate::api::AppState;
use crate::core::header_policy::relay_response_headers;
use crate::core::logging::get_request_id;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

/// Timeout for calls to a channel's usage API.
const USAGE_API_TIMEOUT: Duration = Duration::from_secs(30);

const BALANCE_PATH: &str = "/usage/api/balance";
const GET_MODELS_PATH: &str = "/usage/api/get-models";

#[derive(Debug, Deserialize)]
struct UpstreamBalance {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<UpstreamBalanceData>,
}

#[derive(Debug, Deserialize)]
struct UpstreamBalanceData {
    #[serde(default)]
    login_token: Option<Value>,
}

/// Channel base URL with a trailing `/` and relay path removed.
pub fn usage_base_url(base_url: &str, relay_path: &str) -> String {
    let trimmed = base_url.strip_suffix('/').unwrap_or(base_url);
    trimmed
        .strip_suffix(relay_path)
        .unwrap_or(trimmed)
        .to_string()
}

/// Keep the models the channel exposes and the token may use.
///
/// An empty channel model list exposes everything; token limits apply only
/// when enabled and non-empty.
pub fn filter_models(
    upstream: Map<String, Value>,
    channel: &Channel,
    token: &CallerToken,
) -> Map<String, Value> {
    let channel_models: HashSet<&str> = channel
        .models
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    let token_models: HashSet<&str> = token
        .model_limits
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    let limits_active = token.model_limits_enabled && !token_models.is_empty();

    upstream
        .into_iter()
        .filter(|(name, _)| channel_models.is_empty() || channel_models.contains(name.as_str()))
        .filter(|(name, _)| !limits_active || token_models.contains(name.as_str()))
        .collect()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(UsageApiResponse::<()>::failure(message))).into_response()
}

async fn call_usage_api(
    state: &AppState,
    channel: &Channel,
    path: &str,
) -> Result<reqwest::Response, String> {
    if channel.base_url.trim().is_empty() {
        return Err(format!("channel #{} has no base URL", channel.id));
    }
    let url = format!(
        "{}{}",
        usage_base_url(&channel.base_url, &state.config.relay_path),
        path
    );
    tracing::debug!(channel_id = channel.id, url = %url, "Calling channel usage API");

    state
        .http_client
        .get(&url)
        .bearer_auth(&channel.key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .timeout(USAGE_API_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                "connection failed".to_string()
            } else {
                format!("request failed: {}", e.without_url())
            }
        })
}

async fn fetch_login_token(state: &AppState, token: &CallerToken) -> Option<Value> {
    let channel = match state.selector.first_in_group(token.routing_group()).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(error = %e, "No channel for login token lookup");
            return None;
        }
    };

    let response = match call_usage_api(state, &channel, BALANCE_PATH).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(channel_id = channel.id, error = %e, "Login token lookup failed");
            return None;
        }
    };
    if !response.status().is_success() {
        tracing::warn!(
            channel_id = channel.id,
            status = response.status().as_u16(),
            "Login token lookup returned an error status"
        );
        return None;
    }

    match response.json::<UpstreamBalance>().await {
        Ok(UpstreamBalance {
            success: true,
            data: Some(UpstreamBalanceData {
                login_token: Some(login_token),
            }),
        }) => Some(login_token),
        Ok(_) => {
            tracing::warn!(channel_id = channel.id, "Upstream balance carried no login token");
            None
        }
        Err(e) => {
            tracing::warn!(channel_id = channel.id, error = %e, "Failed to parse upstream balance");
            None
        }
    }
}

/// `GET /usage/api/balance`
pub async fn balance(
    State(state): State<AppState>,
    Extension(token): Extension<CallerToken>,
) -> Response {
    let remain_quota = if token.unlimited_quota {
        match state.ledger.user_quota(token.user_id).await {
            Ok(quota) => quota,
            Err(e) => {
                tracing::error!(user_id = token.user_id, error = %e, "Failed to load user quota");
                return e.into_response();
            }
        }
    } else {
        token.remain_quota
    };
    let quota_per_unit = state.reconciler.quota_per_unit();
    let remain_amount = if quota_per_unit > 0.0 {
        remain_quota as f64 / quota_per_unit
    } else {
        0.0
    };

    let data = BalanceData {
        name: token.name.clone(),
        remain_quota,
        remain_amount,
        unlimited: token.unlimited_quota,
        expired_time: token.expired_time,
        status: token.status,
        status_text: token_status_text(token.status).to_string(),
        login_token: fetch_login_token(&state, &token).await,
    };
    Json(UsageApiResponse::ok(data)).into_response()
}

/// `GET /usage/api/get-models`
pub async fn get_models(
    State(state): State<AppState>,
    Extension(token): Extension<CallerToken>,
) -> Response {
    let channel = match state.selector.first_in_group(token.routing_group()).await {
        Ok(channel) => channel,
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("this endpoint requires a capable channel: {}", e),
            )
        }
    };

    let upstream = match call_usage_api(&state, &channel, GET_MODELS_PATH).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(request_id = %get_request_id(), channel_id = channel.id, error = %e, "get-models proxy failed");
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("proxy request failed: {}", e),
            );
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = relay_response_headers(
        upstream
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes())),
    );
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read upstream response: {}", e.without_url()),
            )
        }
    };

    if status != StatusCode::OK {
        tracing::warn!(channel_id = channel.id, status = status.as_u16(), "get-models relayed upstream error");
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return response;
    }

    match serde_json::from_slice::<Map<String, Value>>(&body) {
        Ok(models) => {
            let total = models.len();
            let filtered = filter_models(models, &channel, &token);
            tracing::debug!(total, kept = filtered.len(), "Filtered upstream models");
            Json(Value::Object(filtered)).into_response()
        }
        Err(_) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::test_token;
    use serde_json::json;

    fn channel(models: &[&str]) -> Channel {
        Channel {
            id: 1,
            name: "c".to_string(),
            channel_type: 0,
            base_url: "http://upstream".to_string(),
            key: "k".to_string(),
            tags: vec!["bugment".to_string()],
            groups: vec!["default".to_string()],
            models: models.iter().map(|m| m.to_string()).collect(),
            priority: 0,
            weight: 1,
            enabled: true,
            auto_ban: false,
            model_mapping: Default::default(),
            header_override: Default::default(),
        }
    }

    fn upstream() -> Map<String, Value> {
        match json!({"a": {"id": 1}, "b": {"id": 2}, "c": {"id": 3}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_usage_base_url() {
        assert_eq!(usage_base_url("http://h/chat-stream/", "/chat-stream"), "http://h");
        assert_eq!(usage_base_url("http://h/chat-stream", "/chat-stream"), "http://h");
        assert_eq!(usage_base_url("http://h/", "/chat-stream"), "http://h");
        assert_eq!(usage_base_url("http://h/api", "/chat-stream"), "http://h/api");
    }

    #[test]
    fn test_filter_models_by_channel() {
        let token = test_token("k", 1, "default");
        let kept = filter_models(upstream(), &channel(&["a", " c "]), &token);
        let mut names: Vec<_> = kept.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);

        let all = filter_models(upstream(), &channel(&[]), &token);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_filter_models_by_token_limits() {
        let mut token = test_token("k", 1, "default");
        token.model_limits_enabled = true;
        token.model_limits = vec!["b".to_string(), "c".to_string()];
        let kept = filter_models(upstream(), &channel(&["a", "b"]), &token);
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["b"]);

        token.model_limits.clear();
        assert_eq!(filter_models(upstream(), &channel(&[]), &token).len(), 3);

        token.model_limits = vec!["a".to_string()];
        token.model_limits_enabled = false;
        assert_eq!(filter_models(upstream(), &channel(&[]), &token).len(), 3);
    }
}
