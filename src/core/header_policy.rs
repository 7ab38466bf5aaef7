//! Header handling between caller, relay and upstream channel.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Placeholder replaced by the channel credential in header overrides.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

/// Connection-scoped headers that never cross the relay.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // The relay frames the body itself.
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Substitute the channel credential into override templates.
///
/// Entries whose name or value is not a valid header are dropped with a warning.
pub fn apply_header_override(
    overrides: &HashMap<String, String>,
    api_key: &str,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = overrides
        .iter()
        .filter_map(|(name, template)| {
            let value = template.replace(API_KEY_PLACEHOLDER, api_key);
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(&value).is_err()
            {
                tracing::warn!(header = %name, "Skipping invalid header override");
                return None;
            }
            Some((name.clone(), value))
        })
        .collect();
    headers.sort();
    headers
}

/// Copy upstream response headers into a caller-facing map.
///
/// Works on name/value bytes so the upstream client's header types do not leak.
pub fn relay_response_headers<'a, I>(upstream: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

/// Force event-stream headers onto a streaming response.
pub fn set_event_stream_headers(headers: &mut HeaderMap) {
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_header_override_substitutes_key() {
        let mut overrides = HashMap::new();
        overrides.insert("x-upstream-key".to_string(), "Key {api_key}".to_string());
        overrides.insert("x-static".to_string(), "v".to_string());

        let headers = apply_header_override(&overrides, "sk-1");
        assert_eq!(
            headers,
            vec![
                ("x-static".to_string(), "v".to_string()),
                ("x-upstream-key".to_string(), "Key sk-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_apply_header_override_skips_invalid() {
        let mut overrides = HashMap::new();
        overrides.insert("bad header".to_string(), "v".to_string());
        overrides.insert("x-newline".to_string(), "a\nb".to_string());
        assert!(apply_header_override(&overrides, "k").is_empty());
    }

    #[test]
    fn test_relay_response_headers_drops_hop_by_hop() {
        let upstream: Vec<(&str, &[u8])> = vec![
            ("Content-Type", b"text/event-stream"),
            ("Transfer-Encoding", b"chunked"),
            ("Connection", b"keep-alive"),
            ("Content-Length", b"42"),
            ("x-upstream-trace", b"abc"),
            ("set-cookie", b"a=1"),
            ("set-cookie", b"b=2"),
        ];
        let headers = relay_response_headers(upstream);
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
        assert_eq!(headers.get("x-upstream-trace").unwrap(), "abc");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn test_set_event_stream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        set_event_stream_headers(&mut headers);
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
        assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    }
}
