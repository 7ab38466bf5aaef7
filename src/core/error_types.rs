//! Shared constants for structured API errors and relay error semantics.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";

pub const ERROR_CODE_CHANNEL_UNAVAILABLE: &str = "channel_unavailable";
pub const ERROR_CODE_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_CODE_REQUEST_TOO_LARGE: &str = "request_body_too_large";
pub const ERROR_CODE_SENSITIVE_WORDS: &str = "sensitive_words_detected";
pub const ERROR_CODE_MODEL_MAPPING: &str = "channel_model_mapped_error";
pub const ERROR_CODE_MODEL_PRICE: &str = "model_price_error";
pub const ERROR_CODE_INSUFFICIENT_QUOTA: &str = "insufficient_quota";
pub const ERROR_CODE_UPSTREAM_TRANSPORT: &str = "upstream_transport_error";
pub const ERROR_CODE_UPSTREAM_STATUS: &str = "upstream_status_error";
pub const ERROR_CODE_BAD_RESPONSE: &str = "bad_response";
pub const ERROR_CODE_QUOTA_APPLY: &str = "quota_apply_error";
pub const ERROR_CODE_UNAUTHORIZED: &str = "unauthorized";
pub const ERROR_CODE_FORBIDDEN: &str = "forbidden";
pub const ERROR_CODE_RATE_LIMITED: &str = "rate_limited";
pub const ERROR_CODE_DATABASE: &str = "database_error";
pub const ERROR_CODE_INTERNAL: &str = "internal_error";

pub const ATTEMPT_OUTCOME_SUCCESS: &str = "success";
pub const ATTEMPT_OUTCOME_TRANSPORT: &str = "transport";
pub const ATTEMPT_OUTCOME_STATUS: &str = "status";
pub const ATTEMPT_OUTCOME_SKIP_RETRY: &str = "skip_retry";

/// Result label of a single forwarding attempt, used for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Transport,
    Status,
    SkipRetry,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => ATTEMPT_OUTCOME_SUCCESS,
            Self::Transport => ATTEMPT_OUTCOME_TRANSPORT,
            Self::Status => ATTEMPT_OUTCOME_STATUS,
            Self::SkipRetry => ATTEMPT_OUTCOME_SKIP_RETRY,
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_outcome_as_str() {
        assert_eq!(AttemptOutcome::Success.as_str(), "success");
        assert_eq!(AttemptOutcome::Transport.as_str(), "transport");
        assert_eq!(AttemptOutcome::Status.as_str(), "status");
        assert_eq!(AttemptOutcome::SkipRetry.as_str(), "skip_retry");
    }

    #[test]
    fn test_attempt_outcome_display() {
        assert_eq!(format!("{}", AttemptOutcome::Transport), "transport");
        assert_eq!(
            format!("{}", AttemptOutcome::SkipRetry),
            ATTEMPT_OUTCOME_SKIP_RETRY
        );
    }
}
