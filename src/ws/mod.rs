//! JSON-RPC 2.0 dispatcher for chat clients.
//!
//! Clients reach this protocol two ways: directly over `GET /ws` on the
//! workstation, or through the relay, where the tunnel client feeds each
//! multiplexed connection's frames into the same dispatcher. Both paths share
//! [`RpcConn`] — one per client connection, holding its auth flag, attached
//! session, and in-flight streaming state.
//!
//! ## Methods
//!
//! | Method                    | Params                                  |
//! |---------------------------|-----------------------------------------|
//! | `auth`                    | `{token}`                               |
//! | `session.list`            | `{}`                                    |
//! | `session.create`          | `{title?}`                              |
//! | `chat.attach`             | `{session_id}`                          |
//! | `chat.message`            | `{session_id, content}`                 |
//! | `chat.interrupt`          | `{session_id}`                          |
//! | `chat.permission_response`| `{session_id, permission_id, allowed}`  |
//! | `chat.question_response`  | `{session_id, question_id, answer}`     |
//!
//! Every method except `auth` requires a prior successful `auth` on the same
//! connection. Server→client pushes (`chat.text`, `chat.done`, …) are JSON-RPC
//! notifications: no `id`, never replied to.

pub mod pump;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::auth::constant_time_eq;
use crate::sessions::{HistoryMessage, Role};
use crate::state::AppState;
use pump::StreamingTurn;

// JSON-RPC 2.0 error codes, including the devport-specific range.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;
pub const ERR_AUTH_FAILED: i64 = -32001;
pub const ERR_UNAUTHORIZED: i64 = -32002;
pub const ERR_SESSION_NOT_FOUND: i64 = -32003;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Per-connection RPC state, shared by the `/ws` handler and the tunnel
/// bridge.
pub struct RpcConn {
    state: AppState,
    outbound: mpsc::Sender<Value>,
    authenticated: AtomicBool,
    /// Session currently attached on this connection; holds one pool borrow.
    attached: Mutex<Option<String>>,
    /// Aggregator for the assistant message being streamed, if any.
    pub(crate) streaming: Mutex<Option<StreamingTurn>>,
}

fn success(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "result": result, "id": id})
}

fn error(id: &Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message.into()},
        "id": id,
    })
}

impl RpcConn {
    /// Create the state for one client connection. `outbound` receives every
    /// response and notification as a JSON value; the owner is responsible
    /// for draining it into the socket (or tunnel).
    pub fn new(state: AppState, outbound: mpsc::Sender<Value>) -> Arc<Self> {
        Arc::new(Self {
            state,
            outbound,
            authenticated: AtomicBool::new(false),
            attached: Mutex::new(None),
            streaming: Mutex::new(None),
        })
    }

    /// Push a server→client notification.
    pub(crate) async fn notify(&self, method: &str, params: Value) {
        let msg = json!({"jsonrpc": "2.0", "method": method, "params": params});
        if self.outbound.send(msg).await.is_err() {
            debug!("Dropping notification {method}: connection gone");
        }
    }

    /// Release per-connection resources. Call exactly once when the client
    /// goes away.
    pub async fn close(&self) {
        if let Some(session_id) = self.attached.lock().await.take() {
            self.state.pool.release(&session_id).await;
        }
    }

    /// Handle one raw text frame from the client.
    ///
    /// Takes the connection by `Arc` so `chat.message` can hand the pump
    /// task its own reference.
    pub async fn handle_frame(conn: &Arc<Self>, text: &str) {
        let Ok(req) = serde_json::from_str::<Value>(text) else {
            let resp = error(&Value::Null, ERR_PARSE, "Parse error");
            let _ = conn.outbound.send(resp).await;
            return;
        };
        let id = req.get("id").cloned();
        let method = req["method"].as_str().unwrap_or("").to_string();
        let params = req.get("params").cloned().unwrap_or(Value::Null);

        let reply_id = id.clone().unwrap_or(Value::Null);
        let response = Self::handle_request(conn, &method, &params, &reply_id).await;

        // Requests without an id are notifications; process but never reply.
        if id.is_some() {
            let _ = conn.outbound.send(response).await;
        }
    }

    async fn handle_request(conn: &Arc<Self>, method: &str, params: &Value, id: &Value) -> Value {
        if method != "auth" && !conn.authenticated.load(Ordering::SeqCst) {
            return error(id, ERR_UNAUTHORIZED, "Not authenticated");
        }

        match method {
            "auth" => conn.handle_auth(params, id),
            "session.list" => conn.handle_session_list(id).await,
            "session.create" => conn.handle_session_create(params, id).await,
            "chat.attach" => conn.handle_chat_attach(params, id).await,
            "chat.message" => Self::handle_chat_message(conn, params, id).await,
            "chat.interrupt" => conn.handle_chat_interrupt(params, id).await,
            "chat.permission_response" => conn.handle_permission_response(params, id).await,
            "chat.question_response" => conn.handle_question_response(params, id).await,
            _ => error(id, ERR_METHOD_NOT_FOUND, format!("Method not found: {method}")),
        }
    }

    fn handle_auth(&self, params: &Value, id: &Value) -> Value {
        let token = params["token"].as_str().unwrap_or("");
        if !constant_time_eq(self.state.config.auth_token.as_bytes(), token.as_bytes()) {
            return error(id, ERR_AUTH_FAILED, "Invalid token");
        }
        self.authenticated.store(true, Ordering::SeqCst);
        success(id, json!({"success": true}))
    }

    async fn handle_session_list(&self, id: &Value) -> Value {
        let sessions = self.state.sessions.list().await;
        success(id, json!({"sessions": sessions}))
    }

    async fn handle_session_create(&self, params: &Value, id: &Value) -> Value {
        let title = match params["title"].as_str() {
            Some(t) if !t.is_empty() => t,
            _ => "New Chat",
        };
        match self.state.sessions.create(title).await {
            Ok(session) => success(id, json!({"session": session})),
            Err(e) => error(id, ERR_INTERNAL, e.to_string()),
        }
    }

    async fn handle_chat_attach(&self, params: &Value, id: &Value) -> Value {
        let Some(session_id) = params["session_id"].as_str() else {
            return error(id, ERR_INVALID_PARAMS, "session_id is required");
        };
        if self.state.sessions.get(session_id).await.is_none() {
            return error(id, ERR_SESSION_NOT_FOUND, "Session not found");
        }

        // Hold one pool borrow per attached session for the connection's
        // lifetime; swap the borrow when the client re-attaches elsewhere.
        let mut attached = self.attached.lock().await;
        if attached.as_deref() != Some(session_id) {
            self.state.pool.get_or_create(session_id).await;
            if let Some(previous) = attached.replace(session_id.to_string()) {
                self.state.pool.release(&previous).await;
            }
        }
        drop(attached);

        let history = self.state.sessions.history(session_id).await;
        success(
            id,
            json!({
                "session_id": session_id,
                "status": "attached",
                "history": history,
            }),
        )
    }

    async fn handle_chat_message(conn: &Arc<Self>, params: &Value, id: &Value) -> Value {
        let (Some(session_id), Some(content)) =
            (params["session_id"].as_str(), params["content"].as_str())
        else {
            return error(id, ERR_INVALID_PARAMS, "session_id and content are required");
        };
        if conn.state.sessions.get(session_id).await.is_none() {
            return error(id, ERR_SESSION_NOT_FOUND, "Session not found");
        }

        let user_msg = HistoryMessage::new(Role::User, content.to_string());
        if let Err(e) = conn.state.sessions.append_message(session_id, user_msg).await {
            return error(id, ERR_INTERNAL, e.to_string());
        }

        // Fresh aggregator for the assistant reply being streamed.
        *conn.streaming.lock().await = Some(StreamingTurn::new());

        let conn = conn.clone();
        let session_id = session_id.to_string();
        let content = content.to_string();
        tokio::spawn(async move {
            // The pool borrow spans the whole turn so the reaper can't kill
            // the child mid-stream.
            let agent = conn.state.pool.get_or_create(&session_id).await;
            match agent.send_message(&content).await {
                Ok(events) => conn.pump_events(&session_id, events).await,
                Err(e) => {
                    warn!(session_id = %session_id, "Failed to start turn: {e}");
                    conn.notify(
                        "chat.error",
                        json!({"session_id": session_id, "error": e.to_string()}),
                    )
                    .await;
                }
            }
            conn.state.pool.release(&session_id).await;
        });

        success(id, json!({"accepted": true}))
    }

    async fn handle_chat_interrupt(&self, params: &Value, id: &Value) -> Value {
        let Some(session_id) = params["session_id"].as_str() else {
            return error(id, ERR_INVALID_PARAMS, "session_id is required");
        };
        let agent = self.state.pool.get_or_create(session_id).await;
        let result = agent.interrupt().await;
        self.state.pool.release(session_id).await;
        match result {
            Ok(()) => success(id, json!({"success": true})),
            Err(e) => error(id, ERR_INTERNAL, e.to_string()),
        }
    }

    async fn handle_permission_response(&self, params: &Value, id: &Value) -> Value {
        let (Some(session_id), Some(permission_id)) = (
            params["session_id"].as_str(),
            params["permission_id"].as_str(),
        ) else {
            return error(
                id,
                ERR_INVALID_PARAMS,
                "session_id and permission_id are required",
            );
        };
        let allowed = params["allowed"].as_bool().unwrap_or(false);

        let agent = self.state.pool.get_or_create(session_id).await;
        let result = agent.respond_to_permission(permission_id, allowed).await;
        self.state.pool.release(session_id).await;
        match result {
            Ok(()) => success(id, json!({"success": true})),
            Err(e) => error(id, ERR_INTERNAL, e.to_string()),
        }
    }

    async fn handle_question_response(&self, params: &Value, id: &Value) -> Value {
        let (Some(session_id), Some(question_id)) =
            (params["session_id"].as_str(), params["question_id"].as_str())
        else {
            return error(
                id,
                ERR_INVALID_PARAMS,
                "session_id and question_id are required",
            );
        };
        let answer = params["answer"].as_str().unwrap_or("");

        let agent = self.state.pool.get_or_create(session_id).await;
        let result = agent.respond_to_question(question_id, answer).await;
        self.state.pool.release(session_id).await;
        match result {
            Ok(()) => success(id, json!({"success": true})),
            Err(e) => error(id, ERR_INTERNAL, e.to_string()),
        }
    }
}

/// `GET /ws` — WebSocket upgrade for the local RPC endpoint.
///
/// No token at upgrade time; the client authenticates in-band with the `auth`
/// method.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Socket loop: funnel outbound values through a channel so the pump and
/// handlers can push concurrently, and feed inbound frames to the dispatcher.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE);
    let conn = RpcConn::new(state, tx);

    info!("RPC client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = msg.to_string();
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => RpcConn::handle_frame(&conn, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn.close().await;
    info!("RPC client disconnected");
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::pool::AgentPool;
    use crate::config::{RelayClientConfig, ServerConfig};
    use crate::sessions::SessionStore;
    use std::time::{Duration, Instant};

    async fn test_state(dir: &std::path::Path) -> AppState {
        let config = ServerConfig {
            auth_token: "T".to_string(),
            server_port: "0".to_string(),
            work_dir: dir.to_str().unwrap().to_string(),
            data_dir: ".devport".to_string(),
            dev_mode: true,
            log_level: "info".to_string(),
            relay: RelayClientConfig {
                enabled: false,
                url: String::new(),
                token: String::new(),
                subdomain: String::new(),
            },
        };
        AppState {
            sessions: SessionStore::open(&config.work_dir, &config.data_dir)
                .await
                .unwrap(),
            pool: AgentPool::new(&config.work_dir, Duration::from_secs(600)),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    async fn conn(state: AppState) -> (Arc<RpcConn>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(64);
        (RpcConn::new(state, tx), rx)
    }

    async fn call(conn: &Arc<RpcConn>, rx: &mut mpsc::Receiver<Value>, frame: &str) -> Value {
        RpcConn::handle_frame(conn, frame).await;
        rx.recv().await.expect("expected a response")
    }

    #[tokio::test]
    async fn auth_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = conn(test_state(dir.path()).await).await;

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"T"},"id":1}"#,
        )
        .await;
        assert_eq!(resp["result"]["success"], true);
        assert_eq!(resp["id"], 1);
        assert!(resp.get("error").is_none());
    }

    #[tokio::test]
    async fn auth_wrong_token_then_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = conn(test_state(dir.path()).await).await;

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"X"},"id":1}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], ERR_AUTH_FAILED);

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"session.list","params":{},"id":2}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], ERR_UNAUTHORIZED);
    }

    async fn authed_conn(
        state: AppState,
    ) -> (Arc<RpcConn>, mpsc::Receiver<Value>) {
        let (conn, mut rx) = conn(state).await;
        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"auth","params":{"token":"T"},"id":0}"#,
        )
        .await;
        assert_eq!(resp["result"]["success"], true);
        (conn, rx)
    }

    #[tokio::test]
    async fn session_create_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = authed_conn(test_state(dir.path()).await).await;

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"session.create","params":{"title":"T1"},"id":1}"#,
        )
        .await;
        let session_id = resp["result"]["session"]["id"].as_str().unwrap().to_string();
        assert_eq!(resp["result"]["session"]["title"], "T1");

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"session.list","params":{},"id":2}"#,
        )
        .await;
        let sessions = resp["result"]["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], session_id.as_str());
    }

    #[tokio::test]
    async fn session_create_defaults_title() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = authed_conn(test_state(dir.path()).await).await;
        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"session.create","params":{},"id":1}"#,
        )
        .await;
        assert_eq!(resp["result"]["session"]["title"], "New Chat");
    }

    #[tokio::test]
    async fn chat_attach_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = authed_conn(test_state(dir.path()).await).await;
        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"chat.attach","params":{"session_id":"nope"},"id":1}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], ERR_SESSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_attach_returns_history() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let session = state.sessions.create("chat").await.unwrap();
        state
            .sessions
            .append_message(
                &session.id,
                HistoryMessage::new(Role::User, "earlier".to_string()),
            )
            .await
            .unwrap();

        let (conn, mut rx) = authed_conn(state).await;
        let frame = format!(
            r#"{{"jsonrpc":"2.0","method":"chat.attach","params":{{"session_id":"{}"}},"id":1}}"#,
            session.id
        );
        let resp = call(&conn, &mut rx, &frame).await;
        assert_eq!(resp["result"]["status"], "attached");
        let history = resp["result"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["content"], "earlier");
    }

    #[tokio::test]
    async fn unknown_method_and_malformed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = authed_conn(test_state(dir.path()).await).await;

        let resp = call(
            &conn,
            &mut rx,
            r#"{"jsonrpc":"2.0","method":"bogus","params":{},"id":9}"#,
        )
        .await;
        assert_eq!(resp["error"]["code"], ERR_METHOD_NOT_FOUND);

        let resp = call(&conn, &mut rx, "not json").await;
        assert_eq!(resp["error"]["code"], ERR_PARSE);
    }

    #[tokio::test]
    async fn notification_requests_get_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, mut rx) = authed_conn(test_state(dir.path()).await).await;

        RpcConn::handle_frame(&conn, r#"{"jsonrpc":"2.0","method":"session.list","params":{}}"#)
            .await;
        assert!(rx.try_recv().is_err());
    }
}
