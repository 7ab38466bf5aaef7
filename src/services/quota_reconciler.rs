//! Billing arithmetic and settlement against the quota ledger.
//!
//! The quota for a request is computed from the final token counts and the
//! price descriptor chosen before dispatch, then compared with the amount
//! pre-consumed. Only the difference touches the ledger. Exactly one
//! consumption record is written per settled request.

use crate::api::models::{ConsumeLogEntry, PriceDescriptor, PricingMode, RelayInfo};
use crate::core::error::AppError;
use crate::core::metrics::get_metrics;
use crate::core::tokenizer::TokenEstimator;
use crate::services::catalog::QuotaLedger;
use crate::services::usage_extractor::PassthroughResult;
use serde_json::{json, Value};
use std::sync::Arc;

/// Where the billed token counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingSource {
    /// The upstream reported a valid usage object.
    Upstream,
    /// No usage; completion estimated from extracted content.
    LocalEstimate,
    /// No usage and no content; completion billed as zero.
    NoContent,
}

impl BillingSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::LocalEstimate => "local_estimate",
            Self::NoContent => "no_content",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Upstream => "passthrough (upstream usage)",
            Self::LocalEstimate => "passthrough (no upstream usage, local estimate)",
            Self::NoContent => "passthrough (no upstream usage, no content)",
        }
    }
}

/// Token counts that will be billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingTokens {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub source: BillingSource,
}

/// Result of the billing arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub quota: i64,
    /// `quota - pre_consumed`; positive charges more, negative refunds.
    pub delta: i64,
}

/// Quota for the given token counts.
///
/// Ratio mode: `floor((prompt + completion * completion_ratio) * group_ratio * model_ratio)`.
/// Flat mode: `floor(model_price * quota_per_unit * group_ratio)`.
pub fn compute_quota(
    prompt_tokens: i64,
    completion_tokens: i64,
    price: &PriceDescriptor,
    quota_per_unit: f64,
) -> i64 {
    let raw = match price.mode {
        PricingMode::Ratio => {
            (prompt_tokens as f64 + completion_tokens as f64 * price.completion_ratio)
                * price.group_ratio
                * price.model_ratio
        }
        PricingMode::Flat => price.model_price * quota_per_unit * price.group_ratio,
    };
    raw.floor() as i64
}

pub fn reconcile(
    prompt_tokens: i64,
    completion_tokens: i64,
    price: &PriceDescriptor,
    pre_consumed: i64,
    quota_per_unit: f64,
) -> Reconciliation {
    let quota = compute_quota(prompt_tokens, completion_tokens, price, quota_per_unit);
    Reconciliation {
        quota,
        delta: quota - pre_consumed,
    }
}

/// Amount reserved before dispatch.
///
/// Ratio mode reserves the estimated prompt cost; flat mode the full price.
pub fn pre_consume_amount(estimated_prompt: i64, price: &PriceDescriptor, quota_per_unit: f64) -> i64 {
    match price.mode {
        PricingMode::Ratio => {
            (estimated_prompt as f64 * price.model_ratio * price.group_ratio).floor() as i64
        }
        PricingMode::Flat => compute_quota(0, 0, price, quota_per_unit),
    }
}

/// Pick the token counts to bill.
///
/// Upstream usage wins when valid. Otherwise the prompt falls back to the
/// pre-dispatch estimate and the completion is counted from the extracted
/// content (zero when there is none).
pub fn billing_tokens(
    result: &PassthroughResult,
    estimated_prompt: i64,
    estimator: &dyn TokenEstimator,
    model: &str,
) -> BillingTokens {
    if let Some(usage) = result.usage.filter(|u| u.is_valid()) {
        return BillingTokens {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            source: BillingSource::Upstream,
        };
    }
    if result.content.is_empty() {
        return BillingTokens {
            prompt_tokens: estimated_prompt,
            completion_tokens: 0,
            source: BillingSource::NoContent,
        };
    }
    BillingTokens {
        prompt_tokens: estimated_prompt,
        completion_tokens: estimator.count_text(&result.content, model),
        source: BillingSource::LocalEstimate,
    }
}

fn describe(source: BillingSource, price: &PriceDescriptor) -> String {
    match price.mode {
        PricingMode::Ratio => format!(
            "{}, model ratio {:.2}, completion ratio {:.2}, group ratio {:.2}",
            source.description(),
            price.model_ratio,
            price.completion_ratio,
            price.group_ratio
        ),
        PricingMode::Flat => format!(
            "{}, model price {:.2}, group ratio {:.2}",
            source.description(),
            price.model_price,
            price.group_ratio
        ),
    }
}

/// Applies reconciliations to the ledger.
pub struct QuotaReconciler {
    ledger: Arc<dyn QuotaLedger>,
    quota_per_unit: f64,
}

impl QuotaReconciler {
    pub fn new(ledger: Arc<dyn QuotaLedger>, quota_per_unit: f64) -> Self {
        Self {
            ledger,
            quota_per_unit,
        }
    }

    pub fn quota_per_unit(&self) -> f64 {
        self.quota_per_unit
    }

    /// Settle a successful relay.
    ///
    /// Ledger failures are logged and swallowed: the caller already has the
    /// response.
    pub async fn settle(
        &self,
        info: &RelayInfo,
        result: &PassthroughResult,
        tokens: BillingTokens,
    ) -> Reconciliation {
        let recon = reconcile(
            tokens.prompt_tokens,
            tokens.completion_tokens,
            &info.price,
            info.pre_consumed_quota,
            self.quota_per_unit,
        );

        if recon.delta > 0 {
            tracing::info!(
                delta = recon.delta,
                quota = recon.quota,
                pre_consumed = info.pre_consumed_quota,
                "Charging additional quota after pre-consumption"
            );
        } else if recon.delta < 0 {
            tracing::info!(
                refund = -recon.delta,
                quota = recon.quota,
                pre_consumed = info.pre_consumed_quota,
                "Refunding over-reserved quota"
            );
        }

        if recon.delta != 0 {
            if let Err(e) = self
                .ledger
                .apply_delta(info.user_id, info.token_id, recon.delta)
                .await
            {
                let err = AppError::QuotaApply(e.to_string());
                tracing::error!(code = err.code(), delta = recon.delta, "{}", err);
            }
        }

        if recon.quota > 0 {
            if let Err(e) = self
                .ledger
                .add_used_quota(info.user_id, info.channel_id, recon.quota)
                .await
            {
                tracing::error!("Failed to update used quota: {}", e);
            }
            get_metrics()
                .quota_consumed
                .with_label_values(&[info.origin_model.as_str()])
                .inc_by(recon.quota as u64);
        }
        get_metrics()
            .billing_source
            .with_label_values(&[tokens.source.as_str()])
            .inc();

        let entry = self.consume_entry(info, result, tokens, recon.quota);
        if let Err(e) = self.ledger.record_consumption(entry).await {
            tracing::error!("Failed to record consumption: {}", e);
        }

        recon
    }

    /// Return the pre-consumed amount after an aborted relay.
    pub async fn refund(&self, info: &RelayInfo) {
        if info.pre_consumed_quota == 0 {
            return;
        }
        tracing::info!(
            refund = info.pre_consumed_quota,
            "Returning pre-consumed quota after failed relay"
        );
        if let Err(e) = self
            .ledger
            .apply_delta(info.user_id, info.token_id, -info.pre_consumed_quota)
            .await
        {
            let err = AppError::QuotaApply(e.to_string());
            tracing::error!(code = err.code(), "{}", err);
        }
    }

    fn consume_entry(
        &self,
        info: &RelayInfo,
        result: &PassthroughResult,
        tokens: BillingTokens,
        quota: i64,
    ) -> ConsumeLogEntry {
        let mut other = serde_json::Map::new();
        other.insert("passthrough".to_string(), Value::Bool(true));
        other.insert("model_ratio".to_string(), json!(info.price.model_ratio));
        other.insert("group_ratio".to_string(), json!(info.price.group_ratio));
        other.insert(
            "completion_ratio".to_string(),
            json!(info.price.completion_ratio),
        );
        other.insert("model_price".to_string(), json!(info.price.model_price));
        other.insert("pricing_mode".to_string(), json!(info.price.mode.as_str()));
        other.insert("billing_source".to_string(), json!(tokens.source.as_str()));
        if info.upstream_model != info.origin_model {
            other.insert("upstream_model".to_string(), json!(info.upstream_model));
        }
        if let Some(first) = info.first_response_time {
            other.insert(
                "frt".to_string(),
                json!(first.duration_since(info.start_time).as_millis() as u64),
            );
        }
        if let Some(raw) = &result.raw_usage {
            other.insert("usage".to_string(), raw.clone());
        }

        ConsumeLogEntry {
            user_id: info.user_id,
            channel_id: info.channel_id,
            token_id: info.token_id,
            token_name: info.token_name.clone(),
            model_name: info.origin_model.clone(),
            prompt_tokens: tokens.prompt_tokens,
            completion_tokens: tokens.completion_tokens,
            quota,
            content: describe(tokens.source, &info.price),
            use_time_seconds: info.start_time.elapsed().as_secs() as i64,
            is_stream: info.is_stream,
            group: info.group.clone(),
            other,
        }
    }
}
