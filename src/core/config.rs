//! Configuration management for the passthrough relay.
//!
//! Settings are layered with the `config` crate: an optional file named by
//! `RELAY_CONFIG` (YAML, TOML or JSON, chosen by extension) and then
//! `RELAY_*` environment variables, where `__` separates nested keys
//! (`RELAY_SERVER__PORT=9000`, `RELAY_PRICING__QUOTA_PER_UNIT=1000`).
//! The bare `HOST`, `PORT` and `VERIFY_SSL` variables are honoured last.

use crate::api::models::PriceDescriptor;
use crate::core::error::AppError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on `retry_times`; more attempts than this never help a single request.
pub const MAX_RETRY_TIMES: u32 = 5;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Timeout for buffered upstream attempts
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-chunk read deadline for streaming attempts
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    /// Size of the chunks relayed to the caller while streaming
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Retries after the first attempt
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Path appended to a channel's base URL
    #[serde(default = "default_relay_path")]
    pub relay_path: String,

    /// Tag a channel must carry to serve the passthrough endpoint
    #[serde(default = "default_capability_tag")]
    pub capability_tag: String,

    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,

    /// Token cost charged per image when the tokenizer cannot size it
    #[serde(default = "default_image_tokens")]
    pub default_image_tokens: i64,

    /// Disable channels with the auto-ban flag on fatal upstream failures
    #[serde(default = "default_true")]
    pub auto_disable_channel: bool,

    /// Reject prompts containing any of `sensitive_words`
    #[serde(default)]
    pub check_prompt_sensitive: bool,

    #[serde(default)]
    pub sensitive_words: Vec<String>,

    /// Optional per-token request rate limit
    #[serde(default)]
    pub model_request_rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub pricing: PricingConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Rate limiting configuration for a caller token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,

    /// Maximum burst size (allows temporary spikes)
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

/// Pricing tables used for pre-consumption and reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Per-model ratio applied to token counts
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,

    /// Per-model multiplier for completion tokens
    #[serde(default)]
    pub completion_ratio: HashMap<String, f64>,

    /// Per-model flat price per request. Presence selects flat mode.
    #[serde(default)]
    pub model_price: HashMap<String, f64>,

    /// Per-routing-group multiplier
    #[serde(default)]
    pub group_ratio: HashMap<String, f64>,

    #[serde(default = "default_completion_ratio")]
    pub default_completion_ratio: f64,

    /// Quota units per unit of currency
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            model_price: HashMap::new(),
            group_ratio: HashMap::new(),
            default_completion_ratio: default_completion_ratio(),
            quota_per_unit: default_quota_per_unit(),
        }
    }
}

fn lookup<'a>(table: &'a HashMap<String, f64>, key: &str) -> Option<&'a f64> {
    table
        .get(key)
        .or_else(|| table.get(&key.to_ascii_lowercase()))
}

impl PricingConfig {
    /// Group multiplier, 1.0 for groups without an entry.
    pub fn group_ratio_for(&self, group: &str) -> f64 {
        lookup(&self.group_ratio, group).copied().unwrap_or(1.0)
    }

    /// Resolve the price descriptor for a model billed in a routing group.
    ///
    /// A configured flat price wins over a model ratio. A model with
    /// neither is not billable and is rejected.
    pub fn price_for(&self, model: &str, group: &str) -> Result<PriceDescriptor, AppError> {
        let group_ratio = self.group_ratio_for(group);

        if let Some(price) = lookup(&self.model_price, model) {
            return Ok(PriceDescriptor::flat(*price, group_ratio));
        }

        let model_ratio = lookup(&self.model_ratio, model).ok_or_else(|| {
            AppError::ModelPriceUnavailable(format!(
                "model {} has no ratio or price configured",
                model
            ))
        })?;
        let completion_ratio = lookup(&self.completion_ratio, model)
            .copied()
            .unwrap_or(self.default_completion_ratio);

        Ok(PriceDescriptor::ratio(
            *model_ratio,
            completion_ratio,
            group_ratio,
        ))
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_stream_idle_timeout() -> u64 {
    300
}

fn default_stream_chunk_size() -> usize {
    4096
}

fn default_retry_times() -> u32 {
    2
}

fn default_relay_path() -> String {
    "/chat-stream".to_string()
}

fn default_capability_tag() -> String {
    "bugment".to_string()
}

fn default_max_request_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_image_tokens() -> i64 {
    500
}

fn default_burst() -> u32 {
    10
}

fn default_completion_ratio() -> f64 {
    1.0
}

fn default_quota_per_unit() -> f64 {
    500_000.0
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            verify_ssl: true,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            stream_chunk_size: default_stream_chunk_size(),
            retry_times: default_retry_times(),
            relay_path: default_relay_path(),
            capability_tag: default_capability_tag(),
            max_request_body_bytes: default_max_request_body_bytes(),
            default_image_tokens: default_image_tokens(),
            auto_disable_channel: true,
            check_prompt_sensitive: false,
            sensitive_words: Vec::new(),
            model_request_rate_limit: None,
            pricing: PricingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `RELAY_CONFIG` (if set) and the environment.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("RELAY_CONFIG").ok();
        Self::load(path.as_deref())
    }

    /// Load configuration from an optional file plus the environment.
    ///
    /// A named file that does not exist is an error; no file at all means
    /// defaults plus environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("sensitive_words"),
        );

        let mut config: AppConfig = builder
            .build()
            .with_context(|| format!("Failed to read configuration (file: {:?})", path))?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                config.server.port = port;
            }
        }
        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            config.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        config.normalize();
        Ok(config)
    }

    /// Clamp and canonicalize values that the rest of the relay relies on.
    pub fn normalize(&mut self) {
        if self.retry_times > MAX_RETRY_TIMES {
            tracing::warn!(
                "retry_times {} exceeds maximum, clamping to {}",
                self.retry_times,
                MAX_RETRY_TIMES
            );
            self.retry_times = MAX_RETRY_TIMES;
        }
        if self.stream_chunk_size == 0 {
            self.stream_chunk_size = default_stream_chunk_size();
        }
        let trimmed = self.relay_path.trim().trim_end_matches('/');
        self.relay_path = if trimmed.is_empty() {
            default_relay_path()
        } else if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        self.sensitive_words = self
            .sensitive_words
            .iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive) as true.
fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
