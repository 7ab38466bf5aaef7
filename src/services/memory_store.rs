//! In-memory implementation of every collaborator trait.
//!
//! Used by the integration tests and benchmarks, and handy for running the
//! relay without a database. Every ledger mutation is recorded so callers can
//! assert on exactly which operations ran.

use crate::api::models::{
    CallerToken, Channel, ConsumeLogEntry, TOKEN_STATUS_ENABLED,
};
use crate::core::error::{AppError, Result};
use crate::services::catalog::{
    auto_disable_reason, ChannelCatalog, ChannelHealthReporter, ChannelQuery, QuotaLedger,
    TokenStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A ledger operation, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    PreConsume { token_id: i64, amount: i64 },
    ApplyDelta { user_id: i64, token_id: i64, delta: i64 },
    AddUsed { user_id: i64, channel_id: i64, quota: i64 },
    Record(ConsumeLogEntry),
}

#[derive(Debug, Default)]
struct Inner {
    channels: Vec<Channel>,
    tokens: HashMap<String, CallerToken>,
    user_quota: HashMap<i64, i64>,
    calls: Vec<LedgerCall>,
    failures: Vec<(i64, String)>,
    fail_apply_delta: bool,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    auto_disable: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            auto_disable: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_channels(self, channels: Vec<Channel>) -> Self {
        self.lock().channels = channels;
        self
    }

    pub fn add_token(&self, token: CallerToken, user_quota: i64) {
        let mut inner = self.lock();
        inner.user_quota.insert(token.user_id, user_quota);
        inner.tokens.insert(token.key.clone(), token);
    }

    /// Make every `apply_delta` call fail.
    pub fn fail_apply_delta(&self, fail: bool) {
        self.lock().fail_apply_delta = fail;
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.lock().calls.clone()
    }

    pub fn records(&self) -> Vec<ConsumeLogEntry> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LedgerCall::Record(entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn delta_calls(&self) -> Vec<i64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                LedgerCall::ApplyDelta { delta, .. } => Some(*delta),
                _ => None,
            })
            .collect()
    }

    /// `(channel_id, error)` for every reported failure.
    pub fn reported_failures(&self) -> Vec<(i64, String)> {
        self.lock().failures.clone()
    }

    pub fn channel(&self, id: i64) -> Option<Channel> {
        self.lock().channels.iter().find(|c| c.id == id).cloned()
    }

    pub fn quota_of(&self, user_id: i64) -> i64 {
        self.lock().user_quota.get(&user_id).copied().unwrap_or(0)
    }
}

/// A plain enabled token, convenient for tests.
pub fn test_token(key: &str, user_id: i64, group: &str) -> CallerToken {
    CallerToken {
        id: user_id * 10,
        user_id,
        name: format!("token-{}", user_id),
        key: key.to_string(),
        status: TOKEN_STATUS_ENABLED,
        group: group.to_string(),
        remain_quota: 0,
        unlimited_quota: true,
        expired_time: -1,
        model_limits_enabled: false,
        model_limits: Vec::new(),
    }
}

#[async_trait]
impl ChannelCatalog for MemoryStore {
    async fn find_channels(&self, query: &ChannelQuery) -> Result<Vec<Channel>> {
        let mut found: Vec<Channel> = self
            .lock()
            .channels
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(found)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<CallerToken>> {
        Ok(self.lock().tokens.get(key).cloned())
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn user_quota(&self, user_id: i64) -> Result<i64> {
        Ok(self.quota_of(user_id))
    }

    async fn pre_consume(&self, token: &CallerToken, amount: i64) -> Result<()> {
        let mut inner = self.lock();
        let remaining = inner.user_quota.get(&token.user_id).copied().unwrap_or(0);
        if remaining < amount {
            return Err(AppError::InsufficientQuota {
                required: amount,
                remaining,
            });
        }
        if let Some(stored) = inner.tokens.values_mut().find(|t| t.id == token.id) {
            if !stored.unlimited_quota {
                if stored.remain_quota < amount {
                    return Err(AppError::InsufficientQuota {
                        required: amount,
                        remaining: stored.remain_quota,
                    });
                }
                stored.remain_quota -= amount;
            }
        }
        inner.user_quota.insert(token.user_id, remaining - amount);
        inner.calls.push(LedgerCall::PreConsume {
            token_id: token.id,
            amount,
        });
        Ok(())
    }

    async fn apply_delta(&self, user_id: i64, token_id: i64, delta: i64) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_apply_delta {
            return Err(AppError::QuotaApply("ledger unavailable".to_string()));
        }
        *inner.user_quota.entry(user_id).or_insert(0) -= delta;
        if let Some(stored) = inner
            .tokens
            .values_mut()
            .find(|t| t.id == token_id && !t.unlimited_quota)
        {
            stored.remain_quota -= delta;
        }
        inner.calls.push(LedgerCall::ApplyDelta {
            user_id,
            token_id,
            delta,
        });
        Ok(())
    }

    async fn add_used_quota(&self, user_id: i64, channel_id: i64, quota: i64) -> Result<()> {
        self.lock().calls.push(LedgerCall::AddUsed {
            user_id,
            channel_id,
            quota,
        });
        Ok(())
    }

    async fn record_consumption(&self, entry: ConsumeLogEntry) -> Result<()> {
        self.lock().calls.push(LedgerCall::Record(entry));
        Ok(())
    }
}

#[async_trait]
impl ChannelHealthReporter for MemoryStore {
    async fn report_failure(&self, channel: &Channel, error: &AppError) -> Result<()> {
        let mut inner = self.lock();
        inner.failures.push((channel.id, error.to_string()));
        if let Some(reason) = auto_disable_reason(channel, error, self.auto_disable) {
            tracing::warn!(channel_id = channel.id, reason = %reason, "Disabling channel");
            if let Some(stored) = inner.channels.iter_mut().find(|c| c.id == channel.id) {
                stored.enabled = false;
            }
        }
        Ok(())
    }
}
