//! Collaborator interfaces the relay core depends on.
//!
//! Channel records, caller tokens and the quota ledger are owned by external
//! storage. The core only reaches them through these traits, which are
//! implemented by the PostgreSQL store in production and by
//! [`MemoryStore`](crate::services::memory_store::MemoryStore) in tests.

use crate::api::models::{CallerToken, Channel, ConsumeLogEntry};
use crate::core::error::{AppError, Result};
use async_trait::async_trait;
use axum::http::StatusCode;

/// Filter for channel lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelQuery {
    pub group: String,
    /// `None` matches every model, used by the usage API.
    pub model: Option<String>,
    pub tag: String,
}

impl ChannelQuery {
    pub fn new(group: impl Into<String>, model: Option<String>, tag: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            model,
            tag: tag.into(),
        }
    }

    /// Apply the query to an in-memory record.
    pub fn matches(&self, channel: &Channel) -> bool {
        channel.enabled
            && channel.has_tag(&self.tag)
            && channel.in_group(&self.group)
            && self
                .model
                .as_deref()
                .map_or(true, |m| channel.supports_model(m))
    }
}

/// Supplies channel records matching a routing group, model and capability tag.
#[async_trait]
pub trait ChannelCatalog: Send + Sync + 'static {
    /// Eligible channels, highest priority first.
    async fn find_channels(&self, query: &ChannelQuery) -> Result<Vec<Channel>>;
}

/// Resolves caller credentials.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Look a token up by its key (without the `sk-` prefix).
    async fn find_by_key(&self, key: &str) -> Result<Option<CallerToken>>;
}

/// Atomic operations on the quota ledger.
#[async_trait]
pub trait QuotaLedger: Send + Sync + 'static {
    async fn user_quota(&self, user_id: i64) -> Result<i64>;

    /// Reserve `amount` before dispatch. Fails with
    /// [`AppError::InsufficientQuota`] when the caller cannot cover it.
    async fn pre_consume(&self, token: &CallerToken, amount: i64) -> Result<()>;

    /// Positive `delta` charges more, negative refunds.
    async fn apply_delta(&self, user_id: i64, token_id: i64, delta: i64) -> Result<()>;

    /// Bump the used-quota counters of the user and channel.
    async fn add_used_quota(&self, user_id: i64, channel_id: i64, quota: i64) -> Result<()>;

    async fn record_consumption(&self, entry: ConsumeLogEntry) -> Result<()>;
}

/// Receives failed attempts; may disable the offending channel.
#[async_trait]
pub trait ChannelHealthReporter: Send + Sync + 'static {
    async fn report_failure(&self, channel: &Channel, error: &AppError) -> Result<()>;
}

const ACCOUNT_FAILURE_MARKERS: &[&str] = &[
    "insufficient_quota",
    "insufficient quota",
    "account has been deactivated",
    "account_deactivated",
    "organization has been disabled",
    "credit balance is too low",
    "invalid api key",
    "api key not valid",
    "permission denied",
];

/// Decide whether a failure should disable `channel`, returning the reason.
///
/// Only channels with the auto-ban flag are ever disabled, and only for
/// authentication rejections or messages that indicate a dead upstream account.
pub fn auto_disable_reason(channel: &Channel, error: &AppError, enabled: bool) -> Option<String> {
    if !enabled || !channel.auto_ban {
        return None;
    }
    match error {
        AppError::UpstreamStatus {
            status, message, ..
        } => {
            if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN {
                return Some(format!("upstream returned {}", status.as_u16()));
            }
            let lower = message.to_lowercase();
            ACCOUNT_FAILURE_MARKERS
                .iter()
                .find(|marker| lower.contains(*marker))
                .map(|marker| format!("upstream account failure: {}", marker))
        }
        _ => None,
    }
}
