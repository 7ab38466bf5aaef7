//! `POST /chat-stream` passthrough handler.
//!
//! Validates the envelope, prices and pre-consumes the request, runs the
//! dispatcher and relays the upstream reply. Streaming replies are piped by a
//! spawned task that settles billing once the stream ends.

use crate::api::disconnect::DisconnectStream;
use crate::api::models::{CallerToken, ChatStreamRequest, RelayInfo};
use crate::api::AppState;
use crate::core::cancel::StreamCancelHandle;
use crate::core::error::{AppError, Result};
use crate::core::header_policy::set_event_stream_headers;
use crate::core::logging::{get_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use crate::core::tokenizer::{estimate_prompt_tokens, TokenEstimator};
use crate::services::quota_reconciler::{billing_tokens, pre_consume_amount, QuotaReconciler};
use crate::services::transport::{ChannelSink, ReplyBody, UpstreamReply};
use crate::services::usage_extractor::extract;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method},
    response::Response,
    Extension,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Chunks buffered between the pipe task and the response body.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Sensitive words found in `text`, compared case-insensitively.
pub fn find_sensitive_words(text: &str, words: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    words
        .iter()
        .filter(|w| !w.is_empty() && lower.contains(&w.to_lowercase()))
        .cloned()
        .collect()
}

/// Parse and validate the inbound envelope.
pub fn parse_envelope(body: &[u8]) -> Result<ChatStreamRequest> {
    let request: ChatStreamRequest = serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidRequest(format!("invalid request body: {}", e)))?;
    if request.model.trim().is_empty() {
        return Err(AppError::InvalidRequest("model is required".to_string()));
    }
    Ok(request)
}

pub async fn relay_passthrough(
    State(state): State<AppState>,
    Extension(token): Extension<CallerToken>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let limit = state.config.max_request_body_bytes;
    let body = axum::body::to_bytes(body, limit).await.map_err(|e| {
        tracing::warn!(error = %e, limit, "Failed to read request body");
        AppError::RequestTooLarge { limit }
    })?;
    tracing::trace!(body = %String::from_utf8_lossy(&body), "Passthrough inbound body");

    let request = parse_envelope(&body)?;
    let model = request.model.clone();

    if !token.allows_model(&model) {
        return Err(AppError::Forbidden(format!(
            "token is not allowed to use model {}",
            model
        )));
    }

    if state.config.check_prompt_sensitive && !request.data.is_empty() {
        let words = find_sensitive_words(&request.data, &state.config.sensitive_words);
        if !words.is_empty() {
            tracing::warn!(words = %words.join(", "), "Sensitive words detected");
            return Err(AppError::SensitiveWordsDetected(words));
        }
    }

    let estimated = estimate_prompt_tokens(
        state.estimator.as_ref(),
        &request,
        state.config.default_image_tokens,
    );
    let price = state
        .config
        .pricing
        .price_for(&model, token.routing_group())?;

    let mut info = RelayInfo::new(
        get_request_id(),
        &token,
        model,
        request.wants_stream(),
        price,
    );
    info.estimated_prompt_tokens = estimated;
    info.content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let pre_consumed = pre_consume_amount(estimated, &price, state.config.pricing.quota_per_unit);
    if pre_consumed > 0 {
        state.ledger.pre_consume(&token, pre_consumed).await?;
        info.pre_consumed_quota = pre_consumed;
    }
    tracing::debug!(
        model = %info.origin_model,
        group = %info.group,
        estimated_prompt = estimated,
        pre_consumed,
        is_stream = info.is_stream,
        "Passthrough request accepted"
    );

    let reply = match state.dispatcher.dispatch(&mut info, &method, &body).await {
        Ok(reply) => reply,
        Err(e) => {
            state.reconciler.refund(&info).await;
            return Err(e);
        }
    };

    Ok(respond(&state, info, reply).await)
}

async fn respond(state: &AppState, mut info: RelayInfo, reply: UpstreamReply) -> Response {
    let UpstreamReply {
        status,
        mut headers,
        body,
    } = reply;

    let body = match body {
        ReplyBody::Buffered(bytes) => {
            settle_captured(&state.reconciler, state.estimator.as_ref(), &info, &bytes, false)
                .await;
            Body::from(bytes)
        }
        ReplyBody::Streaming(upstream) => {
            set_event_stream_headers(&mut headers);

            let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let cancel = StreamCancelHandle::new();
            let cancel_rx = cancel.subscribe();
            let pipe_cancel = cancel.clone();
            let transport = state.dispatcher.transport().clone();
            let reconciler = state.reconciler.clone();
            let estimator = state.estimator.clone();

            tokio::spawn(REQUEST_ID.scope(info.request_id.clone(), async move {
                let active = &get_metrics().active_streams;
                active.inc();
                let mut sink = ChannelSink::new(tx);
                let captured = transport
                    .pipe(upstream, &mut info, &mut sink, Some(cancel_rx))
                    .await;
                pipe_cancel.mark_completed();
                drop(sink);
                active.dec();

                settle_captured(&reconciler, estimator.as_ref(), &info, &captured, true).await;
            }));

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Body::from_stream(DisconnectStream {
                stream: Box::pin(stream),
                cancel_handle: cancel,
            })
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Extract usage from the captured bytes and settle billing.
async fn settle_captured(
    reconciler: &Arc<QuotaReconciler>,
    estimator: &dyn TokenEstimator,
    info: &RelayInfo,
    captured: &Bytes,
    is_stream: bool,
) {
    let result = extract(captured, is_stream);
    let tokens = billing_tokens(
        &result,
        info.estimated_prompt_tokens,
        estimator,
        &info.origin_model,
    );
    let recon = reconciler.settle(info, &result, tokens).await;
    tracing::info!(
        channel_id = info.channel_id,
        model = %info.origin_model,
        prompt_tokens = tokens.prompt_tokens,
        completion_tokens = tokens.completion_tokens,
        source = tokens.source.as_str(),
        quota = recon.quota,
        delta = recon.delta,
        bytes = captured.len(),
        "Passthrough relay settled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_sensitive_words() {
        let words = vec!["Secret".to_string(), "forbidden".to_string(), String::new()];
        assert_eq!(
            find_sensitive_words("this is a SECRET message", &words),
            vec!["Secret".to_string()]
        );
        assert!(find_sensitive_words("clean", &words).is_empty());
    }

    #[test]
    fn test_parse_envelope() {
        let req = parse_envelope(br#"{"model":"m","data":"x","encrypted_data":"e","iv":"i"}"#)
            .unwrap();
        assert_eq!(req.model, "m");
        assert_eq!(req.encrypted_data.as_deref(), Some("e"));

        let err = parse_envelope(br#"{"data":"x"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: model is required");
        assert!(parse_envelope(b"not json").is_err());
        assert!(parse_envelope(br#"{"model":"  "}"#).is_err());
    }
}
