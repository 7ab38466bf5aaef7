//! Per-token request rate limiting.
//!
//! Each caller token gets its own token-bucket limiter (governor), created
//! lazily on the token's first request. With no configured limit every check
//! passes.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::config::RateLimitConfig;
use crate::core::error::AppError;

type RateLimiterInstance = Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub struct RateLimiter {
    quota: Option<Quota>,
    limiters: DashMap<String, RateLimiterInstance>,
}

fn build_quota(config: &RateLimitConfig) -> Quota {
    Quota::per_second(NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32)))
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(nonzero!(10u32)))
}

impl RateLimiter {
    pub fn new(config: Option<&RateLimitConfig>) -> Self {
        Self {
            quota: config.map(build_quota),
            limiters: DashMap::new(),
        }
    }

    /// A limiter that never rejects.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    /// Check one request for `key`.
    pub fn check_rate_limit(&self, key: &str) -> Result<(), AppError> {
        let Some(quota) = self.quota else {
            return Ok(());
        };

        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(quota)))
            .clone();

        limiter.check().map_err(|_| {
            tracing::warn!(
                token_key_prefix = &key[..key.len().min(8)],
                "Rate limit exceeded"
            );
            AppError::RateLimitExceeded("too many requests for this token".to_string())
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.limiters.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}
