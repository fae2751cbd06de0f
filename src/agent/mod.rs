//! Assistant agent events and the child stdio dialect.
//!
//! The child assistant process speaks line-delimited JSON on stdio. This
//! module defines the normalised [`AgentEvent`] stream the rest of the server
//! consumes, and the parser that maps raw child lines onto it. Unmapped
//! payloads are ignored for forward compatibility.

pub mod claude;
pub mod pool;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One option offered by an `ask_user_question` prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Normalised event stream from the assistant child.
///
/// A stream for one user turn yields any number of non-terminal events and
/// ends with exactly one of [`AgentEvent::Done`], [`AgentEvent::Error`], or
/// [`AgentEvent::Interrupted`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chunk of assistant text (whole block or streaming delta).
    Text { content: String },
    /// The assistant started a tool invocation. Input may be absent; the
    /// child streams it separately.
    ToolCall {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    /// A tool finished and produced output.
    ToolResult { tool_use_id: String, output: String },
    /// The child is blocked on a permission decision.
    PermissionRequest {
        permission_id: String,
        tool_name: String,
        description: String,
    },
    /// The child is blocked on a free-form question to the user.
    AskUserQuestion {
        question_id: String,
        question: String,
        options: Vec<QuestionOption>,
    },
    /// Out-of-band status line from the child.
    System { message: String },
    /// Terminal: the turn completed.
    Done,
    /// Terminal: the turn failed.
    Error { message: String },
    /// Terminal: the turn was interrupted.
    Interrupted,
}

impl AgentEvent {
    /// Whether this event ends the turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Done | AgentEvent::Error { .. } | AgentEvent::Interrupted
        )
    }

    /// Whether the child blocks until a user response is written to stdin.
    pub fn needs_response(&self) -> bool {
        matches!(
            self,
            AgentEvent::PermissionRequest { .. } | AgentEvent::AskUserQuestion { .. }
        )
    }
}

fn get_string(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}

/// Parse one child stdout line into zero or more events.
///
/// The mapping is fixed; lines that parse as JSON but match no known shape
/// yield nothing. A line that is not JSON at all also yields nothing — the
/// child intermixes diagnostics on stdout in some failure modes and those
/// must not kill the stream.
pub fn parse_child_line(line: &str) -> Vec<AgentEvent> {
    let Ok(raw) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };

    match raw["type"].as_str().unwrap_or("") {
        "assistant" => {
            // One event per text block in the message content.
            let mut events = Vec::new();
            if let Some(blocks) = raw["message"]["content"].as_array() {
                for block in blocks {
                    if block["type"].as_str() == Some("text") {
                        events.push(AgentEvent::Text {
                            content: get_string(block, "text"),
                        });
                    }
                }
            }
            events
        }
        "content_block_start" => {
            let block = &raw["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![AgentEvent::ToolCall {
                    tool_use_id: get_string(block, "id"),
                    tool_name: get_string(block, "name"),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                }]
            } else {
                Vec::new()
            }
        }
        "content_block_delta" => {
            let delta = &raw["delta"];
            if delta["type"].as_str() == Some("text_delta") {
                vec![AgentEvent::Text {
                    content: get_string(delta, "text"),
                }]
            } else {
                Vec::new()
            }
        }
        "tool_result" => vec![AgentEvent::ToolResult {
            tool_use_id: get_string(&raw, "tool_use_id"),
            output: get_string(&raw, "content"),
        }],
        "result" => vec![AgentEvent::Done],
        "interrupted" => vec![AgentEvent::Interrupted],
        "permission_request" => vec![AgentEvent::PermissionRequest {
            permission_id: get_string(&raw, "permission_id"),
            tool_name: get_string(&raw, "tool_name"),
            description: get_string(&raw, "description"),
        }],
        "ask_user_question" => {
            let options = raw["options"]
                .as_array()
                .map(|opts| {
                    opts.iter()
                        .map(|o| QuestionOption {
                            label: get_string(o, "label"),
                            description: get_string(o, "description"),
                        })
                        .collect()
                })
                .unwrap_or_default();
            vec![AgentEvent::AskUserQuestion {
                question_id: get_string(&raw, "question_id"),
                question: get_string(&raw, "question"),
                options,
            }]
        }
        "system" => vec![AgentEvent::System {
            message: get_string(&raw, "message"),
        }],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"hello"},
            {"type":"tool_use","id":"t1"},
            {"type":"text","text":"world"}
        ]}}"#
            .replace('\n', "");
        let events = parse_child_line(&line);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::Text { content } if content == "hello"));
        assert!(matches!(&events[1], AgentEvent::Text { content } if content == "world"));
    }

    #[test]
    fn parses_tool_call_start() {
        let line = r#"{"type":"content_block_start","content_block":{"type":"tool_use","id":"tu_1","name":"bash","input":{"command":"ls"}}}"#;
        let events = parse_child_line(line);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::ToolCall {
                tool_use_id,
                tool_name,
                input,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(tool_name, "bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_text_delta() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"chunk"}}"#;
        let events = parse_child_line(line);
        assert!(matches!(&events[0], AgentEvent::Text { content } if content == "chunk"));
    }

    #[test]
    fn parses_tool_result_and_done() {
        let events =
            parse_child_line(r#"{"type":"tool_result","tool_use_id":"tu_1","content":"out"}"#);
        assert!(
            matches!(&events[0], AgentEvent::ToolResult { tool_use_id, output }
                if tool_use_id == "tu_1" && output == "out")
        );

        let events = parse_child_line(r#"{"type":"result","subtype":"success"}"#);
        assert!(matches!(events[0], AgentEvent::Done));
        assert!(events[0].is_terminal());
    }

    #[test]
    fn parses_permission_request() {
        let line = r#"{"type":"permission_request","permission_id":"p1","tool_name":"bash","description":"run ls"}"#;
        let events = parse_child_line(line);
        assert!(events[0].needs_response());
        assert!(
            matches!(&events[0], AgentEvent::PermissionRequest { permission_id, .. }
                if permission_id == "p1")
        );
    }

    #[test]
    fn parses_question_with_options() {
        let line = r#"{"type":"ask_user_question","question_id":"q1","question":"Which?","options":[{"label":"A","description":"first"},{"label":"B"}]}"#;
        let events = parse_child_line(line);
        match &events[0] {
            AgentEvent::AskUserQuestion {
                question_id,
                options,
                ..
            } => {
                assert_eq!(question_id, "q1");
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].label, "A");
                assert_eq!(options[1].description, "");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_system_message() {
        let events = parse_child_line(r#"{"type":"system","message":"compacting"}"#);
        assert!(matches!(&events[0], AgentEvent::System { message } if message == "compacting"));
    }

    #[test]
    fn ignores_unmapped_and_non_json_lines() {
        assert!(parse_child_line(r#"{"type":"usage","tokens":12}"#).is_empty());
        assert!(parse_child_line("plain diagnostic output").is_empty());
        assert!(parse_child_line("").is_empty());
    }
}
