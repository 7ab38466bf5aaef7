//! Error types and handling for the passthrough relay.
//!
//! [`AppError`] carries the whole relay error taxonomy. Every variant maps to a
//! stable error code, an HTTP status and a skip-retry flag that the dispatcher
//! consults when deciding whether another channel may be tried.

use crate::core::error_types::*;
use crate::core::logging::get_request_id;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// No eligible channel for the group/model/capability combination.
    #[error("no available channel for model {model} in group {group}: {reason}")]
    ChannelUnavailable {
        group: String,
        model: String,
        reason: String,
    },

    /// Missing or malformed input fields.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Inbound body exceeded the configured limit.
    #[error("Request body too large: limit is {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// Content policy rejection.
    #[error("Sensitive words detected: {}", .0.join(", "))]
    SensitiveWordsDetected(Vec<String>),

    /// The channel's model mapping could not be resolved.
    #[error("Model mapping failed: {0}")]
    ModelMapping(String),

    /// No ratio or flat price is configured for the model.
    #[error("Model price not configured: {0}")]
    ModelPriceUnavailable(String),

    /// The caller cannot cover the pre-consumed quota.
    #[error("Insufficient quota: required {required}, remaining {remaining}")]
    InsufficientQuota { required: i64, remaining: i64 },

    /// Network or timeout failure reaching a channel.
    #[error("Upstream request to channel #{channel_id} failed: {message}")]
    UpstreamTransport {
        channel_id: i64,
        message: String,
        timeout: bool,
    },

    /// Non-success HTTP status from a channel.
    #[error("Upstream channel #{channel_id} returned {status}: {message}")]
    UpstreamStatus {
        channel_id: i64,
        status: StatusCode,
        message: String,
        skip_retry: bool,
    },

    /// Malformed upstream payload. Never surfaced to the caller on a successful relay.
    #[error("Failed to parse upstream response: {0}")]
    ResponseParse(String),

    /// Failure committing a charge or refund.
    #[error("Failed to apply quota: {0}")]
    QuotaApply(String),

    /// Authentication failures
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ChannelUnavailable { .. } => ERROR_CODE_CHANNEL_UNAVAILABLE,
            AppError::InvalidRequest(_) => ERROR_CODE_INVALID_REQUEST,
            AppError::RequestTooLarge { .. } => ERROR_CODE_REQUEST_TOO_LARGE,
            AppError::SensitiveWordsDetected(_) => ERROR_CODE_SENSITIVE_WORDS,
            AppError::ModelMapping(_) => ERROR_CODE_MODEL_MAPPING,
            AppError::ModelPriceUnavailable(_) => ERROR_CODE_MODEL_PRICE,
            AppError::InsufficientQuota { .. } => ERROR_CODE_INSUFFICIENT_QUOTA,
            AppError::UpstreamTransport { .. } => ERROR_CODE_UPSTREAM_TRANSPORT,
            AppError::UpstreamStatus { .. } => ERROR_CODE_UPSTREAM_STATUS,
            AppError::ResponseParse(_) => ERROR_CODE_BAD_RESPONSE,
            AppError::QuotaApply(_) => ERROR_CODE_QUOTA_APPLY,
            AppError::Unauthorized(_) => ERROR_CODE_UNAUTHORIZED,
            AppError::Forbidden(_) => ERROR_CODE_FORBIDDEN,
            AppError::RateLimitExceeded(_) => ERROR_CODE_RATE_LIMITED,
            AppError::Database(_) => ERROR_CODE_DATABASE,
            AppError::Config(_) | AppError::Internal(_) => ERROR_CODE_INTERNAL,
        }
    }

    /// HTTP status surfaced to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ChannelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidRequest(_)
            | AppError::SensitiveWordsDetected(_)
            | AppError::ModelMapping(_) => StatusCode::BAD_REQUEST,
            AppError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::InsufficientQuota { .. } | AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::UpstreamTransport { timeout, .. } => {
                if *timeout {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::UpstreamStatus { status, .. } => *status,
            AppError::ResponseParse(_) => StatusCode::BAD_GATEWAY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ModelPriceUnavailable(_)
            | AppError::QuotaApply(_)
            | AppError::Database(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatcher must abort instead of trying another channel.
    ///
    /// Only upstream transport errors and upstream statuses not marked
    /// skip-retry by the status mapper are retryable.
    pub fn is_skip_retry(&self) -> bool {
        match self {
            AppError::UpstreamTransport { .. } => false,
            AppError::UpstreamStatus { skip_retry, .. } => *skip_retry,
            _ => true,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_)
            | AppError::RequestTooLarge { .. }
            | AppError::SensitiveWordsDetected(_)
            | AppError::ModelMapping(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::Unauthorized(_) | AppError::Forbidden(_) => ERROR_TYPE_AUTHENTICATION,
            AppError::RateLimitExceeded(_) => ERROR_TYPE_RATE_LIMIT,
            AppError::UpstreamTransport { timeout: true, .. } => ERROR_TYPE_TIMEOUT,
            AppError::UpstreamTransport { .. } | AppError::UpstreamStatus { .. } => {
                ERROR_TYPE_UPSTREAM
            }
            _ => ERROR_TYPE_API,
        }
    }

    /// Client-facing message. Internal details are not leaked.
    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Append the correlation id to a message the way the relay surfaces it.
pub fn message_with_request_id(message: &str, request_id: &str) -> String {
    if request_id.is_empty() {
        message.to_string()
    } else {
        format!("{} (request id: {})", message, request_id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = get_request_id();
        let message = message_with_request_id(&self.public_message(), &request_id);

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, code = self.code(), error = %self, "Request failed");
        } else {
            tracing::warn!(request_id = %request_id, code = self.code(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": self.code()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
