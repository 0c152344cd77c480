//! Parsing of Cortex agent SSE records into typed events.
//!
//! A record looks like
//!
//! ```text
//! event: message.delta
//! data: {"id":"msg_1","object":"message.delta","delta":{"content":[{"type":"text","text":"Hi"}]}}
//! ```
//!
//! Parsing is infallible: anything that cannot be understood comes
//! back as [`StreamEvent::Malformed`] so the caller can log it and move on.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

const DONE_SENTINEL: &str = "[DONE]";
const DELTA_OBJECT: &str = "message.delta";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(MessageDelta),
    Done,
    /// Any other well-formed payload, forwarded for observability only.
    Other(Value),
    Malformed(String),
}

/// Content carried by one `message.delta` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDelta {
    pub text: String,
    pub tool_results: Vec<ToolResult>,
}

/// A `tool_results` entry, kept as the wire JSON until final extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult(pub Value);

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaContent {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolResults {
        tool_results: Value,
    },
    #[serde(other)]
    Unsupported,
}

/// Parses one raw SSE record (all of its lines).
///
/// The payload is the `data:` field; multiple `data:` lines are joined with
/// `\n` as the SSE framing rules require. A record without one is treated as
/// an empty payload.
pub fn parse_record(raw: &str) -> StreamEvent {
    let data: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    parse_payload(&data.join("\n"))
}

/// Parses the `data` payload of a single record.
pub fn parse_payload(data: &str) -> StreamEvent {
    let data = data.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return StreamEvent::Done;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => return StreamEvent::Malformed(format!("invalid JSON payload: {}", e)),
    };

    let is_delta = value.get("object").and_then(Value::as_str) == Some(DELTA_OBJECT);
    let delta = match value.get("delta") {
        Some(delta) if is_delta && delta.get("content").is_some() => delta,
        _ => return StreamEvent::Other(value),
    };

    match DeltaBody::deserialize(delta) {
        Ok(body) => StreamEvent::Message(fold_content(body.content)),
        Err(e) => StreamEvent::Malformed(format!("invalid message.delta content: {}", e)),
    }
}

/// Entries are decoded one at a time; an undecodable entry is skipped
/// without losing the rest of the record.
fn fold_content(content: Vec<Value>) -> MessageDelta {
    let mut delta = MessageDelta::default();
    for entry in content {
        let item = match DeltaContent::deserialize(&entry) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "skipping undecodable delta content entry");
                continue;
            }
        };
        match item {
            DeltaContent::Text { text } => delta.text.push_str(&text),
            DeltaContent::ToolResults { tool_results } => {
                delta.tool_results.push(ToolResult(tool_results))
            }
            DeltaContent::Unsupported => {}
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: &str) -> String {
        format!("event: message.delta\ndata: {}\n\n", payload)
    }

    #[test]
    fn done_sentinel_and_empty_payload() {
        assert_eq!(parse_record("event: done\ndata: [DONE]\n\n"), StreamEvent::Done);
        assert_eq!(parse_record("event: message.delta\ndata: \n\n"), StreamEvent::Done);
        assert_eq!(parse_payload("   "), StreamEvent::Done);
    }

    #[test]
    fn invalid_json_is_malformed() {
        match parse_record(&record("{\"object\": \"message.delta\", ")) {
            StreamEvent::Malformed(reason) => assert!(reason.starts_with("invalid JSON payload")),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn splits_text_and_tool_results() {
        let payload = json!({
            "id": "msg_1",
            "object": "message.delta",
            "delta": {"content": [
                {"index": 0, "type": "text", "text": "Sales "},
                {"index": 1, "type": "tool_use", "tool_use": {"name": "supply_chain"}},
                {"index": 2, "type": "tool_results", "tool_results": {"content": [{"type": "json", "json": {"sql": "SELECT 1"}}]}},
                {"index": 3, "type": "text", "text": "rose."},
                {"index": 4, "type": "tool_results", "tool_results": {"content": []}}
            ]}
        });

        let StreamEvent::Message(delta) = parse_record(&record(&payload.to_string())) else {
            panic!("expected message");
        };
        assert_eq!(delta.text, "Sales rose.");
        assert_eq!(delta.tool_results.len(), 2);
        assert_eq!(
            delta.tool_results[0].0,
            json!({"content": [{"type": "json", "json": {"sql": "SELECT 1"}}]})
        );
    }

    #[test]
    fn non_delta_objects_are_forwarded() {
        let payload = json!({"object": "response.status", "status": "planning"});
        assert_eq!(parse_payload(&payload.to_string()), StreamEvent::Other(payload));

        let no_content = json!({"object": "message.delta", "delta": {}});
        assert_eq!(parse_payload(&no_content.to_string()), StreamEvent::Other(no_content));
    }

    #[test]
    fn delta_with_wrong_content_shape_is_malformed() {
        let payload = json!({"object": "message.delta", "delta": {"content": "oops"}});
        assert!(matches!(parse_payload(&payload.to_string()), StreamEvent::Malformed(_)));
    }

    #[test]
    fn bad_entry_does_not_discard_its_neighbours() {
        let payload = json!({
            "object": "message.delta",
            "delta": {"content": [
                {"type": "text", "text": "kept "},
                {"type": "tool_results"},
                42,
                {"type": "tool_results", "tool_results": {"content": []}},
                {"type": "text", "text": "too"}
            ]}
        });
        let StreamEvent::Message(delta) = parse_payload(&payload.to_string()) else {
            panic!("expected message");
        };
        assert_eq!(delta.text, "kept too");
        assert_eq!(delta.tool_results, vec![ToolResult(json!({"content": []}))]);
    }

    #[test]
    fn parsing_is_repeatable() {
        let raw = record(r#"{"object":"message.delta","delta":{"content":[{"type":"text","text":"x"}]}}"#);
        assert_eq!(parse_record(&raw), parse_record(&raw));
    }

    #[test]
    fn data_line_need_not_be_second() {
        let raw = "data: {\"object\":\"message.delta\",\"delta\":{\"content\":[{\"type\":\"text\",\"text\":\"a\"}]}}\n\n";
        let StreamEvent::Message(delta) = parse_record(raw) else {
            panic!("expected message");
        };
        assert_eq!(delta.text, "a");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let raw = "event: message.delta\ndata: {\"object\":\"message.delta\",\ndata: \"delta\":{\"content\":[{\"type\":\"text\",\"text\":\"b\"}]}}\n\n";
        let StreamEvent::Message(delta) = parse_record(raw) else {
            panic!("expected message");
        };
        assert_eq!(delta.text, "b");
    }
}
