//! The agent stdout contract: newline-delimited JSON, one event per line.
//!
//! Every line carries `{"type": "<kind>", ...}`. The kinds below are the
//! recognized set; anything else is surfaced as [`ParsedLine::Unknown`] so
//! the runner can log and move on instead of dying on a new agent version.

use serde::{Deserialize, Serialize};

/// A recognized event from the agent's stdout stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A completed assistant turn.
    AssistantMessage { content: String },
    /// The agent invoked a tool.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// A tool finished; `is_error` marks failures.
    ToolResult {
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Token accounting for one API round-trip.
    Usage {
        input_tokens: i64,
        output_tokens: i64,
        #[serde(default)]
        cache_read_tokens: i64,
        #[serde(default)]
        cache_creation_tokens: i64,
    },
    /// The agent wants to run something it is not allowed to.
    PermissionRequest {
        tool: String,
        input: serde_json::Value,
    },
    /// The process is done.
    Exit { code: i32 },
}

/// The result of parsing one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Event(AgentEvent),
    /// Valid JSON with an unrecognized `type`; logged and ignored.
    Unknown { kind: String, raw: String },
    /// Not JSON, or JSON without a `type` tag.
    Malformed(String),
}

/// Parse one line of agent stdout. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(event) = serde_json::from_str::<AgentEvent>(trimmed) {
        return Some(ParsedLine::Event(event));
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => Some(ParsedLine::Unknown {
                kind: kind.to_string(),
                raw: trimmed.to_string(),
            }),
            None => Some(ParsedLine::Malformed(trimmed.to_string())),
        },
        Err(_) => Some(ParsedLine::Malformed(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_recognized_kind() {
        let cases = [
            (
                r#"{"type":"assistant_message","content":"done"}"#,
                AgentEvent::AssistantMessage {
                    content: "done".into(),
                },
            ),
            (
                r#"{"type":"tool_use","name":"shell","input":{"command":"ls"}}"#,
                AgentEvent::ToolUse {
                    name: "shell".into(),
                    input: serde_json::json!({"command": "ls"}),
                },
            ),
            (
                r#"{"type":"tool_result","content":"ok"}"#,
                AgentEvent::ToolResult {
                    content: "ok".into(),
                    is_error: false,
                },
            ),
            (
                r#"{"type":"usage","input_tokens":10,"output_tokens":3}"#,
                AgentEvent::Usage {
                    input_tokens: 10,
                    output_tokens: 3,
                    cache_read_tokens: 0,
                    cache_creation_tokens: 0,
                },
            ),
            (
                r#"{"type":"permission_request","tool":"shell","input":{"command":"rm x"}}"#,
                AgentEvent::PermissionRequest {
                    tool: "shell".into(),
                    input: serde_json::json!({"command": "rm x"}),
                },
            ),
            (
                r#"{"type":"exit","code":0}"#,
                AgentEvent::Exit { code: 0 },
            ),
        ];
        for (line, expected) in cases {
            assert_eq!(parse_line(line), Some(ParsedLine::Event(expected)), "{line}");
        }
    }

    #[test]
    fn tool_result_error_flag() {
        let line = r#"{"type":"tool_result","content":"boom","is_error":true}"#;
        assert_eq!(
            parse_line(line),
            Some(ParsedLine::Event(AgentEvent::ToolResult {
                content: "boom".into(),
                is_error: true,
            }))
        );
    }

    #[test]
    fn unknown_kinds_pass_through() {
        let line = r#"{"type":"thinking_delta","delta":"hmm"}"#;
        match parse_line(line) {
            Some(ParsedLine::Unknown { kind, .. }) => assert_eq!(kind, "thinking_delta"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed_not_fatal() {
        assert!(matches!(
            parse_line("plain progress text"),
            Some(ParsedLine::Malformed(_))
        ));
        assert!(matches!(
            parse_line(r#"{"content": "no type tag"}"#),
            Some(ParsedLine::Malformed(_))
        ));
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let line = r#"{"type":"usage","input_tokens":1,"output_tokens":2,"cache_read_tokens":5,"service_tier":"standard"}"#;
        match parse_line(line) {
            Some(ParsedLine::Event(AgentEvent::Usage {
                cache_read_tokens, ..
            })) => assert_eq!(cache_read_tokens, 5),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
