//! Chat pump: drains one turn's agent events into client notifications and
//! durable history.
//!
//! While a turn streams, text chunks and tool calls accumulate in a
//! [`StreamingTurn`]. The aggregate is materialised as a single assistant
//! history message exactly once, when the stream ends in `done` or
//! `interrupted` — and only if anything was actually produced. `system`
//! events are persisted immediately as their own entries. An `error` ending
//! persists nothing.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use super::RpcConn;
use crate::agent::AgentEvent;
use crate::sessions::{HistoryMessage, Role, SessionStore, ToolCall, ToolCallStatus};

/// Aggregator for the assistant message currently being streamed.
pub struct StreamingTurn {
    message_id: String,
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl StreamingTurn {
    pub fn new() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            content: String::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Fold one event into the aggregate. Only text and tool events matter.
    pub fn apply(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { content } => self.content.push_str(content),
            AgentEvent::ToolCall {
                tool_use_id,
                tool_name,
                input,
            } => self.tool_calls.push(ToolCall {
                id: tool_use_id.clone(),
                name: tool_name.clone(),
                input: input.clone(),
                output: String::new(),
                status: ToolCallStatus::Pending,
            }),
            AgentEvent::ToolResult {
                tool_use_id,
                output,
            } => {
                // At most one pending → completed transition per tool call.
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .find(|c| &c.id == tool_use_id && c.status == ToolCallStatus::Pending)
                {
                    call.output = output.clone();
                    call.status = ToolCallStatus::Completed;
                }
            }
            _ => {}
        }
    }

    /// Materialise the aggregate, or nothing if the turn produced nothing.
    pub fn flush(self) -> Option<HistoryMessage> {
        if self.content.is_empty() && self.tool_calls.is_empty() {
            return None;
        }
        Some(HistoryMessage {
            id: self.message_id,
            role: Role::Assistant,
            content: self.content,
            tool_calls: self.tool_calls,
            timestamp: chrono::Utc::now(),
        })
    }
}

impl Default for StreamingTurn {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcConn {
    /// Drain a turn's event stream: one notification per event, aggregator
    /// kept current, history flushed on the terminal event.
    pub(crate) async fn pump_events(
        &self,
        session_id: &str,
        mut events: mpsc::Receiver<AgentEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.handle_event(session_id, event).await;
        }
    }

    async fn handle_event(&self, session_id: &str, event: AgentEvent) {
        {
            let mut streaming = self.streaming.lock().await;
            if let Some(turn) = streaming.as_mut() {
                turn.apply(&event);
            }
        }

        match event {
            AgentEvent::Text { content } => {
                self.notify(
                    "chat.text",
                    json!({"session_id": session_id, "content": content}),
                )
                .await;
            }
            AgentEvent::ToolCall {
                tool_use_id,
                tool_name,
                input,
            } => {
                self.notify(
                    "chat.tool_call",
                    json!({
                        "session_id": session_id,
                        "tool_use_id": tool_use_id,
                        "tool_name": tool_name,
                        "input": input,
                    }),
                )
                .await;
            }
            AgentEvent::ToolResult {
                tool_use_id,
                output,
            } => {
                self.notify(
                    "chat.tool_result",
                    json!({
                        "session_id": session_id,
                        "tool_use_id": tool_use_id,
                        "output": output,
                    }),
                )
                .await;
            }
            AgentEvent::PermissionRequest {
                permission_id,
                tool_name,
                description,
            } => {
                self.notify(
                    "chat.permission_request",
                    json!({
                        "session_id": session_id,
                        "permission_id": permission_id,
                        "tool_name": tool_name,
                        "description": description,
                    }),
                )
                .await;
            }
            AgentEvent::AskUserQuestion {
                question_id,
                question,
                options,
            } => {
                self.notify(
                    "chat.ask_user_question",
                    json!({
                        "session_id": session_id,
                        "question_id": question_id,
                        "question": question,
                        "options": options,
                    }),
                )
                .await;
            }
            AgentEvent::System { message } => {
                let entry = HistoryMessage::new(Role::System, message.clone());
                if let Err(e) = self.state.sessions.append_message(session_id, entry).await {
                    warn!(session_id = %session_id, "Failed to persist system message: {e}");
                }
                self.notify(
                    "chat.system",
                    json!({"session_id": session_id, "message": message}),
                )
                .await;
            }
            AgentEvent::Done => {
                self.flush_streaming(session_id).await;
                self.notify("chat.done", json!({"session_id": session_id}))
                    .await;
            }
            AgentEvent::Interrupted => {
                self.flush_streaming(session_id).await;
                self.notify("chat.interrupted", json!({"session_id": session_id}))
                    .await;
            }
            AgentEvent::Error { message } => {
                // Conservative: a failed turn leaves no partial assistant record.
                *self.streaming.lock().await = None;
                self.notify(
                    "chat.error",
                    json!({"session_id": session_id, "error": message}),
                )
                .await;
            }
        }
    }

    async fn flush_streaming(&self, session_id: &str) {
        let turn = self.streaming.lock().await.take();
        if let Some(message) = turn.and_then(StreamingTurn::flush) {
            if let Err(e) = self
                .state
                .sessions
                .append_message(session_id, message)
                .await
            {
                warn!(session_id = %session_id, "Failed to persist assistant message: {e}");
            }
        }
    }
}

/// Headless variant of the pump for the REST chat API: same aggregation and
/// persistence rules, no notifications.
pub(crate) async fn drain_to_history(
    sessions: &SessionStore,
    session_id: &str,
    mut events: mpsc::Receiver<AgentEvent>,
) {
    let mut turn = StreamingTurn::new();
    while let Some(event) = events.recv().await {
        turn.apply(&event);
        match event {
            AgentEvent::System { message } => {
                let entry = HistoryMessage::new(Role::System, message);
                if let Err(e) = sessions.append_message(session_id, entry).await {
                    warn!(session_id = %session_id, "Failed to persist system message: {e}");
                }
            }
            AgentEvent::Done | AgentEvent::Interrupted => {
                if let Some(message) = std::mem::take(&mut turn).flush() {
                    if let Err(e) = sessions.append_message(session_id, message).await {
                        warn!(session_id = %session_id, "Failed to persist assistant message: {e}");
                    }
                }
            }
            AgentEvent::Error { .. } => {
                turn = StreamingTurn::new();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn text(s: &str) -> AgentEvent {
        AgentEvent::Text {
            content: s.to_string(),
        }
    }

    #[test]
    fn aggregates_text_and_tools() {
        let mut turn = StreamingTurn::new();
        turn.apply(&text("Hello "));
        turn.apply(&AgentEvent::ToolCall {
            tool_use_id: "t1".to_string(),
            tool_name: "bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
        });
        turn.apply(&text("world"));
        turn.apply(&AgentEvent::ToolResult {
            tool_use_id: "t1".to_string(),
            output: "files".to_string(),
        });

        let message = turn.flush().unwrap();
        assert_eq!(message.content, "Hello world");
        assert!(matches!(message.role, Role::Assistant));
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].status, ToolCallStatus::Completed);
        assert_eq!(message.tool_calls[0].output, "files");
    }

    #[test]
    fn empty_turn_flushes_to_nothing() {
        let mut turn = StreamingTurn::new();
        turn.apply(&AgentEvent::Done);
        assert!(turn.flush().is_none());
    }

    #[test]
    fn tool_result_completes_at_most_once() {
        let mut turn = StreamingTurn::new();
        turn.apply(&AgentEvent::ToolCall {
            tool_use_id: "t1".to_string(),
            tool_name: "bash".to_string(),
            input: Value::Null,
        });
        turn.apply(&AgentEvent::ToolResult {
            tool_use_id: "t1".to_string(),
            output: "first".to_string(),
        });
        turn.apply(&AgentEvent::ToolResult {
            tool_use_id: "t1".to_string(),
            output: "second".to_string(),
        });

        let message = turn.flush().unwrap();
        assert_eq!(message.tool_calls[0].output, "first");
    }

    #[test]
    fn result_for_unknown_tool_is_ignored() {
        let mut turn = StreamingTurn::new();
        turn.apply(&AgentEvent::ToolResult {
            tool_use_id: "ghost".to_string(),
            output: "out".to_string(),
        });
        assert!(turn.flush().is_none());
    }
}
