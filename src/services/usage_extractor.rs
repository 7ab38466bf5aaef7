//! Usage and content extraction from captured upstream bytes.
//!
//! Upstreams disagree on response shape, so extraction is a fixed list of
//! optional-field probes tried in order. Extraction never fails: a fragment
//! that does not parse is skipped and the rest is still processed.

use crate::api::models::Usage;
use serde_json::Value;

/// Usage field names, most preferred first.
const USAGE_FIELDS: &[&str] = &["usage", "token_usage"];

/// Outcome of one successful forwarding attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassthroughResult {
    /// Last valid usage seen, if any.
    pub usage: Option<Usage>,
    /// The usage object as the upstream sent it.
    pub raw_usage: Option<Value>,
    pub content: String,
    pub is_stream: bool,
}

/// Where content lives inside one choice entry.
#[derive(Debug, Clone, Copy)]
enum ChoiceShape {
    /// `choices[].delta.content`
    Delta,
    /// `choices[].message.content`
    Message,
}

impl ChoiceShape {
    fn container(self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Message => "message",
        }
    }
}

fn token_count(obj: &serde_json::Map<String, Value>, names: &[&str]) -> i64 {
    names
        .iter()
        .find_map(|name| obj.get(*name).and_then(Value::as_i64))
        .unwrap_or(0)
}

/// Parse a usage object, accepting OpenAI and Anthropic style names.
fn parse_usage(value: &Value) -> Option<Usage> {
    let obj = value.as_object()?;
    let prompt = token_count(obj, &["prompt_tokens", "input_tokens"]);
    let completion = token_count(obj, &["completion_tokens", "output_tokens"]);
    let usage = Usage::new(prompt, completion);
    usage.is_valid().then_some(usage)
}

/// First usage field that carries at least one positive count.
fn probe_usage(entry: &Value) -> Option<(Usage, Value)> {
    USAGE_FIELDS.iter().find_map(|field| {
        let raw = entry.get(*field)?;
        parse_usage(raw).map(|usage| (usage, raw.clone()))
    })
}

fn push_str(out: &mut String, value: Option<&Value>) -> bool {
    match value.and_then(Value::as_str) {
        Some(s) if !s.is_empty() => {
            out.push_str(s);
            true
        }
        _ => false,
    }
}

/// Append the content of one parsed entry in document order.
///
/// `nodes[].content` is only a fallback for entries with no other content.
fn collect_content(entry: &Value, shape: ChoiceShape, out: &mut String) {
    let mut found = push_str(out, entry.get("text"));

    if let Some(choices) = entry.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let nested = choice
                .get(shape.container())
                .and_then(|c| c.get("content"));
            found |= push_str(out, nested);
            found |= push_str(out, choice.get("text"));
        }
    }

    if !found {
        if let Some(nodes) = entry.get("nodes").and_then(Value::as_array) {
            for node in nodes {
                push_str(out, node.get("content"));
            }
        }
    }
}

/// Split captured stream bytes into JSON payloads.
///
/// Accepts SSE `data:` lines and bare JSON lines; the `[DONE]` sentinel and
/// every other line are dropped.
pub fn stream_fragments(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split(|b| *b == b'\n').filter_map(|line| {
        let line = line.trim_ascii();
        let payload = if let Some(rest) = line.strip_prefix(b"data:") {
            rest.trim_ascii_start()
        } else if line.starts_with(b"{") {
            line
        } else {
            return None;
        };
        (payload != b"[DONE]" && !payload.is_empty()).then_some(payload)
    })
}

fn extract_buffered(raw: &[u8]) -> PassthroughResult {
    let mut result = PassthroughResult::default();
    let entry: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Upstream body is not JSON, skipping extraction");
            return result;
        }
    };

    if let Some((usage, raw_usage)) = probe_usage(&entry) {
        result.usage = Some(usage);
        result.raw_usage = Some(raw_usage);
    }
    collect_content(&entry, ChoiceShape::Message, &mut result.content);
    result
}

fn extract_stream(raw: &[u8]) -> PassthroughResult {
    let mut result = PassthroughResult {
        is_stream: true,
        ..Default::default()
    };
    let mut skipped = 0usize;

    for fragment in stream_fragments(raw) {
        let entry: Value = match serde_json::from_slice(fragment) {
            Ok(v) => v,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        // Later valid usage overwrites earlier; invalid usage never clears it.
        if let Some((usage, raw_usage)) = probe_usage(&entry) {
            result.usage = Some(usage);
            result.raw_usage = Some(raw_usage);
        }
        collect_content(&entry, ChoiceShape::Delta, &mut result.content);
    }

    if skipped > 0 {
        tracing::debug!(skipped, "Skipped unparseable stream fragments");
    }
    result
}

/// Extract usage and content from the captured upstream body.
pub fn extract(raw: &[u8], is_stream: bool) -> PassthroughResult {
    let result = if is_stream {
        extract_stream(raw)
    } else {
        extract_buffered(raw)
    };
    tracing::debug!(
        is_stream,
        content_len = result.content.len(),
        has_usage = result.usage.is_some(),
        "Extracted passthrough result"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_buffered_prefers_primary_usage() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5},"token_usage":{"prompt_tokens":0,"completion_tokens":0}}"#;
        let result = extract(body, false);
        assert_eq!(result.usage, Some(Usage::new(10, 5)));
        assert!(!result.is_stream);
    }

    #[test]
    fn test_buffered_falls_back_to_alternate_usage() {
        let body = br#"{"usage":{"prompt_tokens":0,"completion_tokens":0},"token_usage":{"input_tokens":7,"output_tokens":3}}"#;
        let result = extract(body, false);
        assert_eq!(result.usage, Some(Usage::new(7, 3)));
        assert_eq!(
            result.raw_usage,
            Some(serde_json::json!({"input_tokens":7,"output_tokens":3}))
        );
    }

    #[test]
    fn test_buffered_zero_usage_is_absent() {
        let result = extract(br#"{"usage":{"prompt_tokens":0,"completion_tokens":0}}"#, false);
        assert_eq!(result.usage, None);
    }

    #[test]
    fn test_buffered_content_order() {
        let body = br#"{"text":"A","choices":[{"message":{"content":"B"},"text":"C"},{"message":{"content":"D"}}],"nodes":[{"content":"N"}]}"#;
        assert_eq!(extract(body, false).content, "ABCD");
    }

    #[test]
    fn test_nodes_used_only_without_other_content() {
        let body = br#"{"nodes":[{"content":"x"},{"content":""},{"content":"y"}]}"#;
        assert_eq!(extract(body, false).content, "xy");
    }

    #[test]
    fn test_buffered_invalid_json() {
        let result = extract(b"<html>bad gateway</html>", false);
        assert_eq!(result, PassthroughResult::default());
    }

    #[test]
    fn test_stream_last_valid_usage_wins() {
        let raw = concat!(
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":0,\"completion_tokens\":0}}\n\n",
            "data: [DONE]\n\n",
        );
        let result = extract(raw.as_bytes(), true);
        assert_eq!(result.usage, Some(Usage::new(5, 2)));
        assert!(result.is_stream);
    }

    #[test]
    fn test_stream_later_valid_usage_overwrites() {
        let raw = concat!(
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n",
            "data: {\"token_usage\":{\"prompt_tokens\":9,\"completion_tokens\":4}}\n",
        );
        assert_eq!(extract(raw.as_bytes(), true).usage, Some(Usage::new(9, 4)));
    }

    #[test]
    fn test_stream_content_concatenates() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        );
        assert_eq!(extract(raw.as_bytes(), true).content, "Hello");
    }

    #[test]
    fn test_stream_mixed_framing_and_garbage() {
        let raw = concat!(
            "event: message\n",
            "{\"text\":\"a\"}\n",
            "data: {not json}\n",
            "data:{\"nodes\":[{\"content\":\"b\"}]}\n",
            ": keep-alive\n",
            "data: {\"text\":\"c\",\"nodes\":[{\"content\":\"ignored\"}]}\r\n",
        );
        assert_eq!(extract(raw.as_bytes(), true).content, "abc");
    }

    #[test]
    fn test_stream_fragments_framing() {
        let raw = b"data: [DONE]\ndata: \n  {\"a\":1}  \nid: 4\ndata: {\"b\":2}";
        let frames: Vec<&[u8]> = stream_fragments(raw).collect();
        assert_eq!(frames, vec![&b"{\"a\":1}"[..], &b"{\"b\":2}"[..]]);
    }

    #[test]
    fn test_stream_without_usage() {
        let result = extract(b"data: {\"text\":\"only text\"}\n", true);
        assert_eq!(result.usage, None);
        assert_eq!(result.content, "only text");
    }
}
