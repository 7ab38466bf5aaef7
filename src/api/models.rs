//! Request, response and domain models.
//!
//! Channels, caller tokens and price descriptors are request-scoped copies of
//! records owned by external collaborators; the relay never mutates them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

pub const TOKEN_STATUS_ENABLED: i32 = 1;
pub const TOKEN_STATUS_DISABLED: i32 = 2;
pub const TOKEN_STATUS_EXPIRED: i32 = 3;
pub const TOKEN_STATUS_EXHAUSTED: i32 = 4;

pub const CHANNEL_STATUS_ENABLED: i32 = 1;
pub const CHANNEL_STATUS_MANUALLY_DISABLED: i32 = 2;
pub const CHANNEL_STATUS_AUTO_DISABLED: i32 = 3;

/// Split a comma-delimited column into trimmed, non-empty tokens.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// A backend provider endpoint plus credential and capacity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: i32,
    pub base_url: String,
    /// Credential sent as bearer token upstream
    pub key: String,
    pub tags: Vec<String>,
    pub groups: Vec<String>,
    pub models: Vec<String>,
    /// Higher is preferred
    pub priority: i64,
    pub weight: u32,
    pub enabled: bool,
    pub auto_ban: bool,
    /// Requested model name -> upstream model name
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Extra headers; `{api_key}` is replaced by the channel credential
    #[serde(default)]
    pub header_override: HashMap<String, String>,
}

impl Channel {
    /// Whether the channel carries `tag` (case-insensitive exact token).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Eligibility as exact token membership over tags, groups and models.
    pub fn is_eligible(&self, group: &str, model: &str, tag: &str) -> bool {
        self.enabled && self.has_tag(tag) && self.in_group(group) && self.supports_model(model)
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        format!("{}(#{})", self.name, self.id)
    }
}

/// Inbound passthrough envelope.
///
/// Only `model`, `data` and `images` are interpreted. Everything else,
/// including the opaque `encrypted_data`/`iv` pair, is forwarded as-is in the
/// original body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatStreamRequest {
    #[serde(default)]
    pub model: String,

    /// Free-text payload
    #[serde(default)]
    pub data: String,

    /// Base64 encoded images, optionally as data URLs
    #[serde(default)]
    pub images: Vec<String>,

    /// Defaults to streaming when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl ChatStreamRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

/// Caller credential resolved by the authentication layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerToken {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub key: String,
    pub status: i32,
    /// Routing group; empty means "default"
    pub group: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    /// Unix seconds, -1 for never
    pub expired_time: i64,
    pub model_limits_enabled: bool,
    pub model_limits: Vec<String>,
}

impl CallerToken {
    pub fn routing_group(&self) -> &str {
        if self.group.is_empty() {
            "default"
        } else {
            &self.group
        }
    }

    /// Whether the token's model limits permit `model`.
    pub fn allows_model(&self, model: &str) -> bool {
        !self.limits_active() || self.model_limits.iter().any(|m| m == model)
    }

    /// Model limits only apply when enabled and non-empty.
    pub fn limits_active(&self) -> bool {
        self.model_limits_enabled && !self.model_limits.is_empty()
    }

    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        self.expired_time != -1 && self.expired_time < now_unix
    }
}

pub fn token_status_text(status: i32) -> &'static str {
    match status {
        TOKEN_STATUS_ENABLED => "enabled",
        TOKEN_STATUS_DISABLED => "disabled",
        TOKEN_STATUS_EXPIRED => "expired",
        TOKEN_STATUS_EXHAUSTED => "exhausted",
        _ => "unknown",
    }
}

/// Token usage reported by an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: i64,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// A usage object counts only when at least one side is positive.
    pub fn is_valid(&self) -> bool {
        self.prompt_tokens > 0 || self.completion_tokens > 0
    }
}

/// Pricing path chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    Ratio,
    Flat,
}

impl PricingMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ratio => "ratio",
            Self::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceDescriptor {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub group_ratio: f64,
    pub model_price: f64,
    pub mode: PricingMode,
}

impl PriceDescriptor {
    pub fn ratio(model_ratio: f64, completion_ratio: f64, group_ratio: f64) -> Self {
        Self {
            model_ratio,
            completion_ratio,
            group_ratio,
            model_price: 0.0,
            mode: PricingMode::Ratio,
        }
    }

    pub fn flat(model_price: f64, group_ratio: f64) -> Self {
        Self {
            model_ratio: 0.0,
            completion_ratio: 0.0,
            group_ratio,
            model_price,
            mode: PricingMode::Flat,
        }
    }

    pub fn uses_flat_price(&self) -> bool {
        self.mode == PricingMode::Flat
    }
}

/// Per-request transient relay state.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    /// Model name as requested by the caller
    pub origin_model: String,
    /// Model name after the selected channel's mapping
    pub upstream_model: String,
    pub is_stream: bool,
    /// Caller's `Content-Type`, forwarded upstream when present
    pub content_type: Option<String>,
    pub pre_consumed_quota: i64,
    pub price: PriceDescriptor,
    pub estimated_prompt_tokens: i64,
    pub start_time: Instant,
    pub first_response_time: Option<Instant>,
    pub channel_id: i64,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    pub header_override: HashMap<String, String>,
}

impl RelayInfo {
    pub fn new(
        request_id: String,
        token: &CallerToken,
        origin_model: String,
        is_stream: bool,
        price: PriceDescriptor,
    ) -> Self {
        Self {
            request_id,
            user_id: token.user_id,
            token_id: token.id,
            token_name: token.name.clone(),
            group: token.routing_group().to_string(),
            upstream_model: origin_model.clone(),
            origin_model,
            is_stream,
            content_type: None,
            pre_consumed_quota: 0,
            price,
            estimated_prompt_tokens: 0,
            start_time: Instant::now(),
            first_response_time: None,
            channel_id: 0,
            channel_name: String::new(),
            base_url: String::new(),
            api_key: String::new(),
            header_override: HashMap::new(),
        }
    }

    /// Copy the selected channel's routing data into the request state.
    pub fn bind_channel(&mut self, channel: &Channel) {
        self.channel_id = channel.id;
        self.channel_name = channel.name.clone();
        self.base_url = channel.base_url.clone();
        self.api_key = channel.key.clone();
        self.header_override = channel.header_override.clone();
        self.upstream_model = self.origin_model.clone();
    }

    /// Record the first non-empty chunk; later calls are ignored.
    pub fn mark_first_response(&mut self) {
        if self.first_response_time.is_none() {
            self.first_response_time = Some(Instant::now());
        }
    }
}

/// One billing record, written once per completed relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLogEntry {
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    /// Free-text description of the pricing path
    pub content: String,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub group: String,
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Body of `GET /usage/api/balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceData {
    pub name: String,
    pub remain_quota: i64,
    pub remain_amount: f64,
    pub unlimited: bool,
    pub expired_time: i64,
    pub status: i32,
    pub status_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_token: Option<serde_json::Value>,
}

/// `{success, message?, data?}` wrapper used by the usage API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> UsageApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64) -> Channel {
        Channel {
            id,
            name: format!("ch-{}", id),
            channel_type: 1,
            base_url: "http://upstream".to_string(),
            key: "sk-upstream".to_string(),
            tags: vec!["Bugment".to_string()],
            groups: vec!["default".to_string(), "vip".to_string()],
            models: vec!["claude-sonnet".to_string()],
            priority: 0,
            weight: 1,
            enabled: true,
            auto_ban: true,
            model_mapping: HashMap::new(),
            header_override: HashMap::new(),
        }
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_eligibility_is_exact_membership() {
        let ch = channel(1);
        assert!(ch.is_eligible("default", "claude-sonnet", "bugment"));
        assert!(!ch.is_eligible("def", "claude-sonnet", "bugment"));
        assert!(!ch.is_eligible("default", "claude", "bugment"));
        assert!(!ch.is_eligible("default", "claude-sonnet", "bug"));

        let mut prefixed = channel(2);
        prefixed.tags = vec!["bugment-beta".to_string()];
        assert!(!prefixed.is_eligible("default", "claude-sonnet", "bugment"));

        let mut disabled = channel(3);
        disabled.enabled = false;
        assert!(!disabled.is_eligible("default", "claude-sonnet", "bugment"));
    }

    #[test]
    fn test_envelope_defaults() {
        let req: ChatStreamRequest = serde_json::from_str(r#"{"model":"m"}"#).unwrap();
        assert_eq!(req.model, "m");
        assert!(req.data.is_empty());
        assert!(req.images.is_empty());
        assert!(req.wants_stream());

        let req: ChatStreamRequest =
            serde_json::from_str(r#"{"model":"m","stream":false,"iv":"x"}"#).unwrap();
        assert!(!req.wants_stream());
        assert_eq!(req.iv.as_deref(), Some("x"));
    }

    #[test]
    fn test_usage_aliases_and_validity() {
        let usage: Usage =
            serde_json::from_str(r#"{"input_tokens":3,"output_tokens":4}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 4);
        assert!(usage.is_valid());
        assert!(!Usage::default().is_valid());
    }

    #[test]
    fn test_caller_token_limits() {
        let mut token = CallerToken {
            id: 1,
            user_id: 2,
            name: "t".to_string(),
            key: "k".to_string(),
            status: TOKEN_STATUS_ENABLED,
            group: String::new(),
            remain_quota: 0,
            unlimited_quota: false,
            expired_time: -1,
            model_limits_enabled: true,
            model_limits: vec![],
        };
        assert_eq!(token.routing_group(), "default");
        assert!(token.allows_model("anything"));
        token.model_limits = vec!["a".to_string()];
        assert!(token.allows_model("a"));
        assert!(!token.allows_model("b"));
        assert!(!token.is_expired_at(i64::MAX));
        token.expired_time = 100;
        assert!(token.is_expired_at(101));
    }

    #[test]
    fn test_token_status_text() {
        assert_eq!(token_status_text(1), "enabled");
        assert_eq!(token_status_text(4), "exhausted");
        assert_eq!(token_status_text(42), "unknown");
    }

    #[test]
    fn test_relay_info_first_response_is_sticky() {
        let token = CallerToken {
            id: 1,
            user_id: 2,
            name: "t".to_string(),
            key: "k".to_string(),
            status: TOKEN_STATUS_ENABLED,
            group: "vip".to_string(),
            remain_quota: 0,
            unlimited_quota: true,
            expired_time: -1,
            model_limits_enabled: false,
            model_limits: vec![],
        };
        let mut info = RelayInfo::new(
            "r".to_string(),
            &token,
            "m".to_string(),
            true,
            PriceDescriptor::ratio(1.0, 1.0, 1.0),
        );
        assert_eq!(info.group, "vip");
        info.mark_first_response();
        let first = info.first_response_time;
        info.mark_first_response();
        assert_eq!(info.first_response_time, first);

        info.bind_channel(&channel(5));
        assert_eq!(info.channel_id, 5);
        assert_eq!(info.api_key, "sk-upstream");
    }
}
