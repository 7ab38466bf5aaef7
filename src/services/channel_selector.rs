//! Priority-tier and weight based channel selection.
//!
//! Eligible channels are partitioned into tiers by distinct priority, highest
//! first. The retry index picks the tier and is clamped to the last tier, so
//! retries past the tier count keep sampling the lowest tier. Within a tier a
//! single cumulative-weight draw picks the channel; an all-zero tier is
//! sampled uniformly.

use crate::api::models::Channel;
use crate::core::error::{AppError, Result};
use crate::services::catalog::{ChannelCatalog, ChannelQuery};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Source of uniformly distributed integers.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, upper)`. `upper` is never zero.
    fn next_below(&self, upper: u64) -> u64;
}

/// Thread-local generator for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_below(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Seeded generator for reproducible draws.
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn next_below(&self, upper: u64) -> u64 {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..upper)
    }
}

/// Distinct priorities, descending.
pub fn priority_tiers(channels: &[Channel]) -> Vec<i64> {
    let mut tiers: Vec<i64> = channels.iter().map(|c| c.priority).collect();
    tiers.sort_unstable_by(|a, b| b.cmp(a));
    tiers.dedup();
    tiers
}

/// Map a retry index onto a tier, clamping to the last one.
pub fn tier_index(retry_index: usize, tier_count: usize) -> usize {
    retry_index.min(tier_count.saturating_sub(1))
}

/// Weighted pick among the members of one tier.
fn pick_weighted<'a>(tier: &[&'a Channel], rng: &dyn RandomSource) -> Option<&'a Channel> {
    match tier.len() {
        0 => return None,
        1 => return Some(tier[0]),
        _ => {}
    }

    let total: u64 = tier.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        let idx = rng.next_below(tier.len() as u64) as usize;
        return tier.get(idx).copied();
    }

    let mut remaining = rng.next_below(total) as i64;
    for channel in tier {
        remaining -= i64::from(channel.weight);
        if remaining < 0 {
            return Some(channel);
        }
    }
    tier.first().copied()
}

/// Pick a channel for `retry_index` out of an eligible set.
///
/// Returns `None` only when `channels` is empty.
pub fn pick_channel<'a>(
    channels: &'a [Channel],
    retry_index: usize,
    rng: &dyn RandomSource,
) -> Option<&'a Channel> {
    let tiers = priority_tiers(channels);
    if tiers.is_empty() {
        return None;
    }
    let target = tiers[tier_index(retry_index, tiers.len())];
    let tier: Vec<&Channel> = channels.iter().filter(|c| c.priority == target).collect();
    pick_weighted(&tier, rng)
}

/// Queries the catalog and picks a channel for each attempt.
pub struct ChannelSelector {
    catalog: Arc<dyn ChannelCatalog>,
    rng: Arc<dyn RandomSource>,
    capability_tag: String,
}

impl ChannelSelector {
    pub fn new(
        catalog: Arc<dyn ChannelCatalog>,
        rng: Arc<dyn RandomSource>,
        capability_tag: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            rng,
            capability_tag: capability_tag.into(),
        }
    }

    pub fn capability_tag(&self) -> &str {
        &self.capability_tag
    }

    /// Select a channel for `group`/`model` at the given retry index.
    pub async fn select(&self, group: &str, model: &str, retry_index: usize) -> Result<Channel> {
        let query = ChannelQuery::new(group, Some(model.to_string()), self.capability_tag.clone());
        let mut channels = self.catalog.find_channels(&query).await?;
        // Catalog filters may be coarser than exact membership.
        channels.retain(|c| c.is_eligible(group, model, &self.capability_tag));

        let picked = pick_channel(&channels, retry_index, self.rng.as_ref()).ok_or_else(|| {
            AppError::ChannelUnavailable {
                group: group.to_string(),
                model: model.to_string(),
                reason: format!("no enabled channel tagged {}", self.capability_tag),
            }
        })?;

        tracing::debug!(
            channel_id = picked.id,
            priority = picked.priority,
            retry = retry_index,
            candidates = channels.len(),
            "Selected channel"
        );
        Ok(picked.clone())
    }

    /// First (highest priority) capable channel of a group, any model.
    pub async fn first_in_group(&self, group: &str) -> Result<Channel> {
        let query = ChannelQuery::new(group, None, self.capability_tag.clone());
        let channels = self.catalog.find_channels(&query).await?;
        channels
            .into_iter()
            .filter(|c| c.enabled && c.has_tag(&self.capability_tag) && c.in_group(group))
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
            .ok_or_else(|| AppError::ChannelUnavailable {
                group: group.to_string(),
                model: String::new(),
                reason: format!("no enabled channel tagged {}", self.capability_tag),
            })
    }
}
