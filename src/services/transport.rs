//! One forwarding attempt against one channel.
//!
//! [`PassthroughTransport::forward`] sends the buffered inbound body to
//! `base_url + relay_path` and classifies the outcome. Buffered replies are
//! read in full inside the attempt so a read failure can still be retried;
//! streaming replies are handed back unread and copied out by
//! [`PassthroughTransport::pipe`].

use crate::api::models::RelayInfo;
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::header_policy::{apply_header_override, relay_response_headers};
use crate::core::metrics::get_metrics;
use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{self as outbound, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Cap on how much of an upstream error body is read.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Upstream statuses that describe the request itself, so no other channel
/// would accept it either.
const SKIP_RETRY_STATUSES: &[u16] = &[400, 413, 422];

pub enum ReplyBody {
    Buffered(Bytes),
    Streaming(reqwest::Response),
}

impl std::fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            Self::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

/// A successful upstream reply, ready to relay.
#[derive(Debug)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReplyBody,
}

/// Destination of a relayed stream.
#[async_trait]
pub trait StreamSink: Send {
    /// Whether chunks reach the caller as they are sent.
    fn supports_flush(&self) -> bool;

    /// Deliver one chunk. An error means the caller is gone.
    async fn send_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), ()>;
}

/// Sink backed by the response body channel.
pub struct ChannelSink {
    sender: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    fn supports_flush(&self) -> bool {
        true
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), ()> {
        self.sender.send(Ok(chunk)).await.map_err(|_| ())
    }
}

/// Sink that collects everything and releases it at once.
#[derive(Debug, Default)]
pub struct BufferedSink {
    buffer: BytesMut,
}

impl BufferedSink {
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[async_trait]
impl StreamSink for BufferedSink {
    fn supports_flush(&self) -> bool {
        false
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), ()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Build the shared upstream client.
///
/// Idle pooling is disabled: every attempt opens a fresh connection.
pub fn build_http_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .connect_timeout(config.connect_timeout())
        .pool_max_idle_per_host(0)
        .build()?;
    Ok(client)
}

/// `base_url` without trailing slashes, joined with `path`.
pub fn upstream_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn truncate_message(message: &str) -> String {
    let mut chars = message.chars();
    let truncated: String = chars.by_ref().take(MAX_ERROR_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Error message from a provider error payload.
pub fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

/// Map a non-success upstream status to an error.
pub fn map_status_error(channel_id: i64, status: StatusCode, body: &[u8]) -> AppError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .as_ref()
        .and_then(extract_error_message)
        .or_else(|| {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            (!text.is_empty()).then(|| truncate_message(text))
        })
        .unwrap_or_else(|| format!("HTTP {}", status));

    AppError::UpstreamStatus {
        channel_id,
        status,
        message,
        skip_retry: SKIP_RETRY_STATUSES.contains(&status.as_u16()),
    }
}

fn transport_error(channel_id: i64, error: &reqwest::Error) -> AppError {
    // Keep internal URLs out of the caller-facing message.
    let message = if error.is_timeout() {
        "Upstream request timed out"
    } else if error.is_connect() {
        "Failed to connect to upstream channel"
    } else {
        "Upstream request failed"
    };
    tracing::warn!(
        channel_id,
        error = %error,
        is_timeout = error.is_timeout(),
        is_connect = error.is_connect(),
        "Upstream transport failure"
    );
    AppError::UpstreamTransport {
        channel_id,
        message: message.to_string(),
        timeout: error.is_timeout(),
    }
}

fn convert_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn convert_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

fn is_event_stream(headers: &outbound::HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Headers for one outbound attempt.
///
/// Starts from the channel bearer credential and the caller's content type
/// (JSON when absent). Channel overrides replace these rather than append.
pub fn outbound_headers(info: &RelayInfo) -> outbound::HeaderMap {
    let mut headers = outbound::HeaderMap::new();
    let bearer = format!("Bearer {}", info.api_key);
    if let Ok(mut value) = outbound::HeaderValue::from_str(&bearer) {
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    let content_type = info
        .content_type
        .as_deref()
        .and_then(|ct| outbound::HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| outbound::HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, content_type);

    for (name, value) in apply_header_override(&info.header_override, &info.api_key) {
        match (
            outbound::HeaderName::from_bytes(name.as_bytes()),
            outbound::HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid header override"),
        }
    }
    headers
}

pub struct PassthroughTransport {
    client: reqwest::Client,
    relay_path: String,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    chunk_size: usize,
}

impl PassthroughTransport {
    pub fn new(client: reqwest::Client, config: &AppConfig) -> Self {
        Self {
            client,
            relay_path: config.relay_path.clone(),
            request_timeout: config.request_timeout(),
            stream_idle_timeout: config.stream_idle_timeout(),
            chunk_size: config.stream_chunk_size.max(1),
        }
    }

    pub fn relay_path(&self) -> &str {
        &self.relay_path
    }

    /// Perform one attempt against the channel bound in `info`.
    ///
    /// `info.is_stream` is widened when the upstream answers with an event
    /// stream even though the caller did not ask for one.
    pub async fn forward(
        &self,
        info: &mut RelayInfo,
        method: &Method,
        body: Bytes,
    ) -> Result<UpstreamReply> {
        let url = upstream_url(&info.base_url, &self.relay_path);
        tracing::debug!(
            channel_id = info.channel_id,
            url = %url,
            is_stream = info.is_stream,
            "Forwarding passthrough request"
        );
        tracing::trace!(body = %String::from_utf8_lossy(&body), "Passthrough request body");

        let mut request = self
            .client
            .request(convert_method(method), &url)
            .headers(outbound_headers(info))
            .body(body);
        // Streams are bounded by the per-chunk idle deadline instead.
        if !info.is_stream {
            request = request.timeout(self.request_timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(info.channel_id, &e))?;

        let status = convert_status(response.status());
        if !status.is_success() {
            let body = self.read_error_body(response).await;
            let err = map_status_error(info.channel_id, status, &body);
            tracing::warn!(channel_id = info.channel_id, status = %status, error = %err, "Upstream returned error status");
            return Err(err);
        }

        info.is_stream = info.is_stream || is_event_stream(response.headers());
        let headers = relay_response_headers(
            response
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        );

        if info.is_stream {
            return Ok(UpstreamReply {
                status,
                headers,
                body: ReplyBody::Streaming(response),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(info.channel_id, &e))?;
        info.mark_first_response();
        tracing::trace!(body = %String::from_utf8_lossy(&bytes), "Passthrough response body");

        Ok(UpstreamReply {
            status,
            headers,
            body: ReplyBody::Buffered(bytes),
        })
    }

    async fn read_error_body(&self, response: reqwest::Response) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut stream = Box::pin(response.bytes_stream());
        let read = async {
            while let Some(Ok(chunk)) = stream.next().await {
                buffer.extend_from_slice(&chunk);
                if buffer.len() >= MAX_ERROR_BODY_BYTES {
                    buffer.truncate(MAX_ERROR_BODY_BYTES);
                    break;
                }
            }
        };
        if tokio::time::timeout(self.stream_idle_timeout, read).await.is_err() {
            tracing::debug!("Timed out reading upstream error body");
        }
        buffer
    }

    /// Copy a streaming reply into `sink`, returning every byte read.
    ///
    /// Chunks are re-sliced to the configured size and delivered one at a
    /// time. Reading stops on end of stream, read error, idle timeout, sink
    /// failure or cancellation; whatever was captured is still returned for
    /// billing. Dropping the response releases the upstream connection.
    pub async fn pipe<S: StreamSink>(
        &self,
        response: reqwest::Response,
        info: &mut RelayInfo,
        sink: &mut S,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Bytes {
        let flushing = sink.supports_flush();
        if !flushing {
            tracing::warn!(
                channel_id = info.channel_id,
                "Sink cannot flush, falling back to buffered relay"
            );
        }

        let channel = info.channel_id.to_string();
        let mut captured = BytesMut::new();
        let mut stream = Box::pin(response.bytes_stream());

        loop {
            let next = tokio::time::timeout(self.stream_idle_timeout, stream.next());
            let item = match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        item = next => item,
                        _ = rx.changed() => {
                            tracing::info!(channel_id = info.channel_id, "Caller disconnected, stopping upstream read");
                            break;
                        }
                    }
                }
                None => next.await,
            };

            let chunk = match item {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    tracing::error!(channel_id = info.channel_id, error = %e, "Passthrough stream read error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        channel_id = info.channel_id,
                        idle_secs = self.stream_idle_timeout.as_secs(),
                        "Passthrough stream idle timeout"
                    );
                    break;
                }
            };
            if chunk.is_empty() {
                continue;
            }

            if info.first_response_time.is_none() {
                info.mark_first_response();
                get_metrics()
                    .stream_first_byte
                    .with_label_values(&[channel.as_str()])
                    .observe(info.start_time.elapsed().as_secs_f64());
            }
            captured.extend_from_slice(&chunk);

            if flushing && !self.deliver(sink, chunk).await {
                tracing::info!(channel_id = info.channel_id, "Caller went away during stream write");
                break;
            }
        }

        let captured = captured.freeze();
        if !flushing && !captured.is_empty() && sink.send_chunk(captured.clone()).await.is_err() {
            tracing::warn!(channel_id = info.channel_id, "Failed to deliver buffered stream");
        }
        captured
    }

    async fn deliver<S: StreamSink>(&self, sink: &mut S, chunk: Bytes) -> bool {
        let mut offset = 0;
        while offset < chunk.len() {
            let end = (offset + self.chunk_size).min(chunk.len());
            if sink.send_chunk(chunk.slice(offset..end)).await.is_err() {
                return false;
            }
            offset = end;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::PriceDescriptor;
    use crate::services::memory_store::test_token;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(chunk_size: usize) -> PassthroughTransport {
        let config = AppConfig {
            stream_chunk_size: chunk_size,
            ..AppConfig::default()
        };
        PassthroughTransport::new(build_http_client(&config).unwrap(), &config)
    }

    fn info_for(base_url: &str, is_stream: bool) -> RelayInfo {
        let token = test_token("caller", 1, "default");
        let mut info = RelayInfo::new(
            "req".to_string(),
            &token,
            "m".to_string(),
            is_stream,
            PriceDescriptor::ratio(1.0, 1.0, 1.0),
        );
        info.channel_id = 3;
        info.base_url = base_url.to_string();
        info.api_key = "sk-channel".to_string();
        info
    }

    /// Records chunk boundaries.
    #[derive(Default)]
    struct RecordingSink(Vec<Bytes>);

    #[async_trait]
    impl StreamSink for RecordingSink {
        fn supports_flush(&self) -> bool {
            true
        }

        async fn send_chunk(&mut self, chunk: Bytes) -> std::result::Result<(), ()> {
            self.0.push(chunk);
            Ok(())
        }
    }

    #[test]
    fn test_upstream_url() {
        assert_eq!(upstream_url("http://a/", "/chat-stream"), "http://a/chat-stream");
        assert_eq!(upstream_url("http://a", "/chat-stream"), "http://a/chat-stream");
    }

    #[test]
    fn test_map_status_error() {
        let err = map_status_error(1, StatusCode::BAD_REQUEST, br#"{"error":{"message":"bad"}}"#);
        assert_matches!(err, AppError::UpstreamStatus { skip_retry: true, ref message, .. } if message == "bad");

        let err = map_status_error(1, StatusCode::TOO_MANY_REQUESTS, br#"{"message":"slow"}"#);
        assert_matches!(err, AppError::UpstreamStatus { skip_retry: false, ref message, .. } if message == "slow");

        let err = map_status_error(1, StatusCode::BAD_GATEWAY, b"");
        assert_matches!(err, AppError::UpstreamStatus { ref message, .. } if message.starts_with("HTTP 502"));

        let long = "x".repeat(600);
        let err = map_status_error(1, StatusCode::INTERNAL_SERVER_ERROR, long.as_bytes());
        assert_matches!(err, AppError::UpstreamStatus { ref message, .. } if message.len() == 503);
    }

    #[test]
    fn test_outbound_headers_overrides_replace_defaults() {
        let mut info = info_for("http://upstream", false);
        let headers = outbound_headers(&info);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-channel");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");

        info.content_type = Some("application/x-ndjson".to_string());
        info.header_override = HashMap::from([
            ("Authorization".to_string(), "Token {api_key}".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]);
        let headers = outbound_headers(&info);
        let auth: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(auth, vec!["Token sk-channel"]);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/x-ndjson");
        assert_eq!(headers.len(), 2);
    }

    #[tokio::test]
    async fn test_forward_buffered_sends_credentials_and_overrides() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat-stream"))
            .and(header("authorization", "Bearer sk-channel"))
            .and(header("x-tenant", "t-sk-channel"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-upstream", "1")
                    .set_body_raw(r#"{"text":"hi"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut info = info_for(&format!("{}/", server.uri()), false);
        info.header_override =
            HashMap::from([("x-tenant".to_string(), "t-{api_key}".to_string())]);

        let reply = transport(4096)
            .forward(&mut info, &Method::POST, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers.get("x-upstream").unwrap(), "1");
        assert_matches!(reply.body, ReplyBody::Buffered(ref b) if b.as_ref() == br#"{"text":"hi"}"#);
        assert!(info.first_response_time.is_some());
    }

    #[tokio::test]
    async fn test_forward_event_stream_forces_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("data: {}\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut info = info_for(&server.uri(), false);
        let reply = transport(4096)
            .forward(&mut info, &Method::POST, Bytes::new())
            .await
            .unwrap();
        assert!(info.is_stream);
        assert_matches!(reply.body, ReplyBody::Streaming(_));
    }

    #[tokio::test]
    async fn test_forward_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_raw(r#"{"error":{"message":"overloaded"}}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let mut info = info_for(&server.uri(), true);
        let err = transport(4096)
            .forward(&mut info, &Method::POST, Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.is_skip_retry());
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_forward_connect_failure_is_retryable() {
        let mut info = info_for("http://127.0.0.1:1", false);
        let err = transport(4096)
            .forward(&mut info, &Method::POST, Bytes::new())
            .await
            .unwrap_err();
        assert_matches!(err, AppError::UpstreamTransport { channel_id: 3, .. });
        assert!(!err.is_skip_retry());
    }

    #[tokio::test]
    async fn test_pipe_rechunks_and_captures() {
        let server = MockServer::start().await;
        let body = "data: {\"text\":\"abcdefghij\"}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = transport(8);
        let mut info = info_for(&server.uri(), true);
        let reply = transport
            .forward(&mut info, &Method::POST, Bytes::new())
            .await
            .unwrap();
        let ReplyBody::Streaming(response) = reply.body else {
            panic!("expected streaming reply");
        };

        let mut sink = RecordingSink::default();
        let captured = transport.pipe(response, &mut info, &mut sink, None).await;
        assert_eq!(captured.as_ref(), body.as_bytes());
        assert!(sink.0.iter().all(|c| c.len() <= 8));
        assert_eq!(sink.0.concat(), body.as_bytes());
        assert!(info.first_response_time.is_some());
    }

    #[tokio::test]
    async fn test_pipe_falls_back_to_buffered_sink() {
        let server = MockServer::start().await;
        let body = "data: {\"text\":\"x\"}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = transport(4);
        let mut info = info_for(&server.uri(), true);
        let reply = transport
            .forward(&mut info, &Method::POST, Bytes::new())
            .await
            .unwrap();
        let ReplyBody::Streaming(response) = reply.body else {
            panic!("expected streaming reply");
        };

        let mut sink = BufferedSink::default();
        let captured = transport.pipe(response, &mut info, &mut sink, None).await;
        assert_eq!(captured, sink.into_bytes());
        assert_eq!(captured.as_ref(), body.as_bytes());
    }
}
