//! Retry state machine around channel selection and forwarding.
//!
//! ```text
//! SELECTING -> FORWARDING -> SUCCESS
//!                         -> RETRYABLE_FAILURE -> SELECTING
//!                         -> FATAL_FAILURE
//! SELECTING -> NO_CHANNEL
//! ```
//!
//! Attempts are strictly sequential. The inbound body is buffered once and
//! replayed for every attempt.

use crate::api::models::{Channel, RelayInfo};
use crate::core::error::{AppError, Result};
use crate::core::error_types::AttemptOutcome;
use crate::core::metrics::get_metrics;
use crate::services::catalog::ChannelHealthReporter;
use crate::services::channel_selector::ChannelSelector;
use crate::services::transport::{PassthroughTransport, UpstreamReply};
use axum::http::Method;
use bytes::Bytes;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Request-scoped retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub group: String,
    pub model: String,
    pub retry_index: usize,
    /// Channel ids in attempt order
    pub attempted: Vec<i64>,
    pub remaining: usize,
}

impl RetryContext {
    pub fn new(group: impl Into<String>, model: impl Into<String>, retry_times: usize) -> Self {
        Self {
            group: group.into(),
            model: model.into(),
            retry_index: 0,
            attempted: Vec::new(),
            remaining: retry_times,
        }
    }

    /// Consume one retry. Returns false when the budget is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.retry_index += 1;
        true
    }

    /// Attempted channel ids joined as `3->7->9`.
    pub fn chain(&self) -> String {
        self.attempted
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join("->")
    }
}

enum DispatchState {
    Selecting,
    Forwarding(Channel),
    Success(UpstreamReply),
    RetryableFailure(AppError),
    FatalFailure(AppError),
    NoChannel(AppError),
}

/// Follow a channel's model mapping to its final name.
///
/// Chains are followed (`a -> b -> c`); a cycle is an error. An entry mapping
/// a model onto itself ends the chain.
pub fn resolve_model_mapping(mapping: &HashMap<String, String>, model: &str) -> Result<String> {
    let mut current = model.to_string();
    let mut seen = HashSet::from([current.clone()]);
    while let Some(next) = mapping.get(&current) {
        if next.is_empty() || *next == current {
            break;
        }
        if !seen.insert(next.clone()) {
            return Err(AppError::ModelMapping(format!(
                "model mapping for {} contains a cycle",
                model
            )));
        }
        current = next.clone();
    }
    Ok(current)
}

/// Top-level members of a JSON object in document order, values kept verbatim.
struct RawMembers(Vec<(String, Box<RawValue>)>);

impl<'de> Deserialize<'de> for RawMembers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MembersVisitor;

        impl<'de> Visitor<'de> for MembersVisitor {
            type Value = RawMembers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<RawMembers, A::Error> {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, Box<RawValue>>()? {
                    members.push(entry);
                }
                Ok(RawMembers(members))
            }
        }

        deserializer.deserialize_map(MembersVisitor)
    }
}

/// Replace the `model` field of a JSON object body.
///
/// Only the `model` value changes. Member order and every other value's bytes
/// are kept; whitespace between top-level members is dropped. Bodies that are
/// not JSON objects are returned unchanged.
pub fn rewrite_model_in_body(body: &Bytes, model: &str) -> Bytes {
    let Ok(RawMembers(members)) = serde_json::from_slice::<RawMembers>(body) else {
        return body.clone();
    };
    let Ok(replacement) = serde_json::to_string(model) else {
        return body.clone();
    };

    let mut out = Vec::with_capacity(body.len() + replacement.len());
    out.push(b'{');
    let mut replaced = false;
    for (i, (key, raw)) in members.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        if serde_json::to_writer(&mut out, key).is_err() {
            return body.clone();
        }
        out.push(b':');
        if key == "model" {
            out.extend_from_slice(replacement.as_bytes());
            replaced = true;
        } else {
            out.extend_from_slice(raw.get().as_bytes());
        }
    }
    if !replaced {
        if !members.is_empty() {
            out.push(b',');
        }
        out.extend_from_slice(b"\"model\":");
        out.extend_from_slice(replacement.as_bytes());
    }
    out.push(b'}');
    Bytes::from(out)
}

pub struct RelayDispatcher {
    selector: Arc<ChannelSelector>,
    transport: Arc<PassthroughTransport>,
    health: Arc<dyn ChannelHealthReporter>,
    retry_times: usize,
}

impl RelayDispatcher {
    pub fn new(
        selector: Arc<ChannelSelector>,
        transport: Arc<PassthroughTransport>,
        health: Arc<dyn ChannelHealthReporter>,
        retry_times: usize,
    ) -> Self {
        Self {
            selector,
            transport,
            health,
            retry_times,
        }
    }

    pub fn transport(&self) -> &Arc<PassthroughTransport> {
        &self.transport
    }

    /// Drive the retry loop until one attempt succeeds or the request aborts.
    ///
    /// On success `info` is bound to the channel that answered.
    pub async fn dispatch(
        &self,
        info: &mut RelayInfo,
        method: &Method,
        body: &Bytes,
    ) -> Result<UpstreamReply> {
        let mut ctx = RetryContext::new(
            info.group.clone(),
            info.origin_model.clone(),
            self.retry_times,
        );
        let mut state = DispatchState::Selecting;

        loop {
            state = match state {
                DispatchState::Selecting => {
                    match self
                        .selector
                        .select(&ctx.group, &ctx.model, ctx.retry_index)
                        .await
                    {
                        Ok(channel) => DispatchState::Forwarding(channel),
                        Err(e @ AppError::ChannelUnavailable { .. }) => DispatchState::NoChannel(e),
                        Err(e) => DispatchState::FatalFailure(e),
                    }
                }
                DispatchState::Forwarding(channel) => {
                    ctx.attempted.push(channel.id);
                    self.attempt(&channel, info, method, body, &ctx).await
                }
                DispatchState::RetryableFailure(e) => {
                    if ctx.advance() {
                        get_metrics().relay_retries.inc();
                        tracing::info!(
                            retry = ctx.retry_index,
                            remaining = ctx.remaining,
                            error = %e,
                            "Retrying on another channel"
                        );
                        DispatchState::Selecting
                    } else {
                        DispatchState::FatalFailure(e)
                    }
                }
                DispatchState::Success(reply) => {
                    self.log_chain(&ctx, true);
                    return Ok(reply);
                }
                DispatchState::FatalFailure(e) => {
                    self.log_chain(&ctx, false);
                    return Err(e);
                }
                DispatchState::NoChannel(e) => {
                    self.log_chain(&ctx, false);
                    tracing::warn!(
                        group = %ctx.group,
                        model = %ctx.model,
                        retry = ctx.retry_index,
                        "No eligible channel"
                    );
                    return Err(e);
                }
            };
        }
    }

    async fn attempt(
        &self,
        channel: &Channel,
        info: &mut RelayInfo,
        method: &Method,
        body: &Bytes,
        ctx: &RetryContext,
    ) -> DispatchState {
        info.bind_channel(channel);
        tracing::debug!(
            channel_id = channel.id,
            channel = %channel.name,
            group = %ctx.group,
            model = %ctx.model,
            retry = ctx.retry_index,
            "Forwarding attempt"
        );

        let upstream_model = match resolve_model_mapping(&channel.model_mapping, &info.origin_model)
        {
            Ok(m) => m,
            Err(e) => return DispatchState::FatalFailure(e),
        };
        let payload = if upstream_model != info.origin_model {
            tracing::debug!(from = %info.origin_model, to = %upstream_model, "Applying model mapping");
            rewrite_model_in_body(body, &upstream_model)
        } else {
            body.clone()
        };
        info.upstream_model = upstream_model;

        let label = channel.id.to_string();
        match self.transport.forward(info, method, payload).await {
            Ok(reply) => {
                record_attempt(&label, AttemptOutcome::Success);
                DispatchState::Success(reply)
            }
            Err(e) => {
                let outcome = match &e {
                    _ if e.is_skip_retry() => AttemptOutcome::SkipRetry,
                    AppError::UpstreamTransport { .. } => AttemptOutcome::Transport,
                    _ => AttemptOutcome::Status,
                };
                record_attempt(&label, outcome);
                if let Err(report_err) = self.health.report_failure(channel, &e).await {
                    tracing::error!(channel_id = channel.id, error = %report_err, "Failed to report channel failure");
                }
                if e.is_skip_retry() {
                    DispatchState::FatalFailure(e)
                } else {
                    DispatchState::RetryableFailure(e)
                }
            }
        }
    }

    fn log_chain(&self, ctx: &RetryContext, success: bool) {
        if ctx.attempted.len() > 1 {
            tracing::info!(success, "retry: {}", ctx.chain());
        }
    }
}

fn record_attempt(channel: &str, outcome: AttemptOutcome) {
    get_metrics()
        .relay_attempts
        .with_label_values(&[channel, outcome.as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use crate::api::models::PriceDescriptor;
    use crate::core::config::AppConfig;
    use crate::services::channel_selector::SeededRandom;
    use crate::services::memory_store::{test_token, MemoryStore};
    use crate::services::transport::{build_http_client, ReplyBody};
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, method as http_method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn channel(id: i64, priority: i64, base_url: &str) -> Channel {
        Channel {
            id,
            name: format!("c{}", id),
            channel_type: 1,
            base_url: base_url.to_string(),
            key: format!("key-{}", id),
            tags: vec!["bugment".to_string()],
            groups: vec!["default".to_string()],
            models: vec!["m".to_string()],
            priority,
            weight: 1,
            enabled: true,
            auto_ban: false,
            model_mapping: HashMap::new(),
            header_override: HashMap::new(),
        }
    }

    fn dispatcher(store: Arc<MemoryStore>, retry_times: usize) -> RelayDispatcher {
        let config = AppConfig::default();
        let selector = Arc::new(ChannelSelector::new(
            store.clone(),
            Arc::new(SeededRandom::new(11)),
            "bugment",
        ));
        let transport = Arc::new(PassthroughTransport::new(
            build_http_client(&config).unwrap(),
            &config,
        ));
        RelayDispatcher::new(selector, transport, store, retry_times)
    }

    fn relay_info() -> RelayInfo {
        RelayInfo::new(
            "req".to_string(),
            &test_token("k", 1, "default"),
            "m".to_string(),
            false,
            PriceDescriptor::ratio(1.0, 1.0, 1.0),
        )
    }

    async fn upstream(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .respond_with(
                ResponseTemplate::new(status).set_body_raw(r#"{"text":"ok"}"#, "application/json"),
            )
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_retry_context_budget() {
        let mut ctx = RetryContext::new("default", "m", 2);
        assert!(ctx.advance());
        assert!(ctx.advance());
        assert!(!ctx.advance());
        assert_eq!(ctx.retry_index, 2);
        ctx.attempted = vec![3, 7, 9];
        assert_eq!(ctx.chain(), "3->7->9");
    }

    #[test]
    fn test_resolve_model_mapping_chain_and_cycle() {
        let mapping = HashMap::from([
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
            ("x".to_string(), "y".to_string()),
            ("y".to_string(), "x".to_string()),
            ("same".to_string(), "same".to_string()),
        ]);
        assert_eq!(resolve_model_mapping(&mapping, "a").unwrap(), "c");
        assert_eq!(resolve_model_mapping(&mapping, "same").unwrap(), "same");
        assert_eq!(resolve_model_mapping(&mapping, "other").unwrap(), "other");
        let err = resolve_model_mapping(&mapping, "x").unwrap_err();
        assert!(err.is_skip_retry());
        assert_eq!(err.code(), "channel_model_mapped_error");
    }

    #[test]
    fn test_rewrite_model_in_body() {
        let body = Bytes::from_static(br#"{"model":"a","data":"hi"}"#);
        let rewritten: Value = serde_json::from_slice(&rewrite_model_in_body(&body, "b")).unwrap();
        assert_eq!(rewritten["model"], "b");
        assert_eq!(rewritten["data"], "hi");

        let raw = Bytes::from_static(b"not json");
        assert_eq!(rewrite_model_in_body(&raw, "b"), raw);
        let array = Bytes::from_static(b"[1,2]");
        assert_eq!(rewrite_model_in_body(&array, "b"), array);
    }

    #[test]
    fn test_rewrite_model_keeps_order_and_value_bytes() {
        let body = Bytes::from_static(
            br#"{"z": 1.50, "model": "a", "nested": {"y": 1e3, "x": [1, 2]}, "data": "h\u00e9"}"#,
        );
        assert_eq!(
            rewrite_model_in_body(&body, "b").as_ref(),
            br#"{"z":1.50,"model":"b","nested":{"y": 1e3, "x": [1, 2]},"data":"h\u00e9"}"#
        );

        let without = Bytes::from_static(br#"{"data":"x"}"#);
        assert_eq!(
            rewrite_model_in_body(&without, "b").as_ref(),
            br#"{"data":"x","model":"b"}"#
        );
    }

    #[tokio::test]
    async fn test_retry_escalates_to_lower_tier() {
        let bad = upstream(500).await;
        let good = upstream(200).await;
        let store = Arc::new(MemoryStore::new().with_channels(vec![
            channel(1, 10, &bad.uri()),
            channel(2, 0, &good.uri()),
        ]));

        let mut info = relay_info();
        let reply = dispatcher(store.clone(), 2)
            .dispatch(&mut info, &Method::POST, &Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_matches!(reply.body, ReplyBody::Buffered(_));
        assert_eq!(info.channel_id, 2);
        assert_eq!(store.reported_failures().len(), 1);
        assert_eq!(store.reported_failures()[0].0, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_last_error() {
        let bad = upstream(502).await;
        let store = Arc::new(MemoryStore::new().with_channels(vec![channel(1, 0, &bad.uri())]));

        let mut info = relay_info();
        let err = dispatcher(store.clone(), 2)
            .dispatch(&mut info, &Method::POST, &Bytes::new())
            .await
            .unwrap_err();
        assert_matches!(err, AppError::UpstreamStatus { channel_id: 1, .. });
        assert_eq!(bad.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_skip_retry_aborts_immediately() {
        let bad = upstream(400).await;
        let good = upstream(200).await;
        let store = Arc::new(MemoryStore::new().with_channels(vec![
            channel(1, 10, &bad.uri()),
            channel(2, 0, &good.uri()),
        ]));

        let mut info = relay_info();
        let err = dispatcher(store, 3)
            .dispatch(&mut info, &Method::POST, &Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        assert!(good.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_channel_aborts_without_attempts() {
        let store = Arc::new(MemoryStore::new());
        let mut info = relay_info();
        let err = dispatcher(store, 2)
            .dispatch(&mut info, &Method::POST, &Bytes::new())
            .await
            .unwrap_err();
        assert_matches!(err, AppError::ChannelUnavailable { .. });
    }

    #[tokio::test]
    async fn test_model_mapping_rewrites_forwarded_body() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(body_partial_json(serde_json::json!({"model": "upstream-m"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let mut ch = channel(1, 0, &server.uri());
        ch.model_mapping = HashMap::from([("m".to_string(), "upstream-m".to_string())]);
        let store = Arc::new(MemoryStore::new().with_channels(vec![ch]));

        let mut info = relay_info();
        dispatcher(store, 0)
            .dispatch(&mut info, &Method::POST, &Bytes::from_static(br#"{"model":"m"}"#))
            .await
            .unwrap();
        assert_eq!(info.upstream_model, "upstream-m");
        assert_eq!(info.origin_model, "m");
    }
}
