//! Relay WebSocket endpoints: the tunnel socket and the client socket.
//!
//! ## `/relay` — tunnel socket (workstation side)
//!
//! One long-lived socket per subdomain, dialed outbound by the workstation.
//! The first frame must be a JSON-RPC `register` call carrying the relay
//! token; only after a successful reply does the connection enter the
//! envelope loop. A second dial for the same subdomain wins: the previous
//! socket is closed and its writer replaced.
//!
//! ## `/ws` — client socket (mobile side)
//!
//! Accepted only while a tunnel is attached (`503` otherwise). Each client
//! gets a fresh connection id; its frames are wrapped into `message`
//! envelopes and its lifetime is bracketed by `connected`/`disconnected`
//! envelopes on the tunnel.
//!
//! Text frames only on both legs; binary frames are ignored.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{RelayState, RelayTunnel};
use crate::tunnel::{Envelope, EnvelopeType};

/// How long the tunnel has to send its `register` frame after connecting.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound queue depth per socket writer.
const WRITER_QUEUE: usize = 256;

fn host_subdomain(state: &RelayState, headers: &HeaderMap) -> Option<String> {
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    state.extract_subdomain(host)
}

/// `GET /relay` — tunnel socket upgrade.
pub async fn tunnel_ws(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(subdomain) = host_subdomain(&state, &headers) else {
        return (StatusCode::BAD_REQUEST, "Invalid subdomain").into_response();
    };
    ws.on_upgrade(move |socket| handle_tunnel_socket(socket, state, subdomain))
}

/// JSON-RPC error reply used during the tunnel handshake.
fn auth_error(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": id,
    })
    .to_string()
}

/// Run the handshake: read one frame, validate the register call, reply.
///
/// Returns the authenticated tunnel on success; on failure the error has
/// already been written and the socket should be dropped.
async fn authenticate_tunnel(
    socket: &mut WebSocket,
    state: &RelayState,
    subdomain: &str,
) -> Option<Arc<RelayTunnel>> {
    let frame = tokio::time::timeout(AUTH_DEADLINE, socket.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = frame else {
        warn!(subdomain = %subdomain, "Tunnel closed before authenticating");
        return None;
    };

    let req: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) => {
            let _ = socket
                .send(Message::Text(
                    auth_error(&Value::Null, -32600, "Expected JSON-RPC register call").into(),
                ))
                .await;
            return None;
        }
    };
    let id = req.get("id").cloned().unwrap_or(Value::Null);

    if req["method"].as_str() != Some("register") {
        let _ = socket
            .send(Message::Text(
                auth_error(&id, -32600, "Expected 'register' method").into(),
            ))
            .await;
        return None;
    }
    let token = req["params"]["relay_token"].as_str().unwrap_or("");
    if token.is_empty() {
        let _ = socket
            .send(Message::Text(
                auth_error(&id, -32602, "relay_token is required").into(),
            ))
            .await;
        return None;
    }

    let tunnel = state.tunnel_by_token(token).await;
    let Some(tunnel) = tunnel.filter(|t| t.subdomain == subdomain) else {
        let _ = socket
            .send(Message::Text(
                auth_error(&id, -32001, "Invalid relay token").into(),
            ))
            .await;
        return None;
    };

    let ok = json!({"jsonrpc": "2.0", "result": {"status": "ok"}, "id": id});
    if socket
        .send(Message::Text(ok.to_string().into()))
        .await
        .is_err()
    {
        return None;
    }
    Some(tunnel)
}

/// Envelope loop for an authenticated tunnel socket.
async fn handle_tunnel_socket(mut socket: WebSocket, state: RelayState, subdomain: String) {
    let Some(tunnel) = authenticate_tunnel(&mut socket, &state, &subdomain).await else {
        return;
    };

    let (mut sink, mut stream) = socket.split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(WRITER_QUEUE);

    // Newest dial wins: install our writer and tell the stale socket, if
    // any, to close.
    let generation = RelayState::next_generation(&tunnel);
    if let Some(old_tx) = tunnel.writer.lock().await.replace(writer_tx) {
        warn!(subdomain = %subdomain, "Replacing stale tunnel socket");
        let _ = old_tx.try_send(Message::Close(None));
    }
    *tunnel.last_ping.lock().await = Some(Instant::now());
    info!(subdomain = %subdomain, "Tunnel connected");

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                *tunnel.last_ping.lock().await = Some(Instant::now());
                let envelope = match Envelope::decode(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(subdomain = %subdomain, "{e}");
                        continue;
                    }
                };
                route_downstream(&tunnel, envelope).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Only the connection that still owns the tunnel cleans it up; a stale
    // socket evicted by a newer dial must not tear down its replacement.
    if tunnel.generation.load(Ordering::SeqCst) == generation {
        *tunnel.writer.lock().await = None;
        let mut clients = tunnel.clients.write().await;
        for (_, client_tx) in clients.drain() {
            let _ = client_tx.try_send(Message::Close(None));
        }
        info!(subdomain = %subdomain, "Tunnel disconnected");
    } else {
        debug!(subdomain = %subdomain, "Stale tunnel socket replaced by newer dial");
    }
    writer_task.abort();
}

/// Dispatch one envelope from the workstation to its target client.
async fn route_downstream(tunnel: &RelayTunnel, envelope: Envelope) {
    match envelope.envelope_type {
        EnvelopeType::Message => {
            let Some(payload) = envelope.payload else {
                return;
            };
            let clients = tunnel.clients.read().await;
            // Unknown connection id: the client is already gone, drop silently.
            if let Some(client_tx) = clients.get(&envelope.connection_id) {
                if client_tx
                    .send(Message::Text(payload.get().to_string().into()))
                    .await
                    .is_err()
                {
                    debug!(
                        connection_id = %envelope.connection_id,
                        "Client writer gone, dropping frame"
                    );
                }
            }
        }
        // The tunnel does not initiate clients; these are informational.
        EnvelopeType::Connected | EnvelopeType::Disconnected => {
            debug!(
                connection_id = %envelope.connection_id,
                "Ignoring client lifecycle envelope from tunnel"
            );
        }
        EnvelopeType::Unknown => {
            warn!(
                connection_id = %envelope.connection_id,
                "Unknown envelope type from tunnel, dropping"
            );
        }
    }
}

/// `GET /ws` — client socket upgrade.
pub async fn client_ws(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(subdomain) = host_subdomain(&state, &headers) else {
        return (StatusCode::BAD_REQUEST, "Invalid subdomain").into_response();
    };

    let Some(tunnel) = state.tunnel_by_subdomain(&subdomain).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Relay not connected").into_response();
    };
    if !tunnel.is_connected().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "Relay not connected").into_response();
    }

    ws.on_upgrade(move |socket| handle_client_socket(socket, tunnel, subdomain))
}

/// Bridge one client socket onto the tunnel.
async fn handle_client_socket(socket: WebSocket, tunnel: Arc<RelayTunnel>, subdomain: String) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<Message>(WRITER_QUEUE);

    tunnel
        .clients
        .write()
        .await
        .insert(connection_id.clone(), client_tx);

    let connected = Envelope::control(&connection_id, EnvelopeType::Connected);
    if !tunnel.send(Message::Text(connected.encode().into())).await {
        warn!(connection_id = %connection_id, "Tunnel lost before client could attach");
        tunnel.clients.write().await.remove(&connection_id);
        return;
    }
    info!(connection_id = %connection_id, subdomain = %subdomain, "Client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                // The payload must be embeddable in the envelope, i.e. valid
                // JSON. Anything else can't be framed and is dropped.
                let payload = match serde_json::value::RawValue::from_string(text.to_string()) {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(connection_id = %connection_id, "Dropping non-JSON client frame");
                        continue;
                    }
                };
                let envelope = Envelope::message(&connection_id, payload);
                if !tunnel.send(Message::Text(envelope.encode().into())).await {
                    // Tunnel write failure tears this bridge down.
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    tunnel.clients.write().await.remove(&connection_id);
    let disconnected = Envelope::control(&connection_id, EnvelopeType::Disconnected);
    let _ = tunnel
        .send(Message::Text(disconnected.encode().into()))
        .await;
    info!(connection_id = %connection_id, subdomain = %subdomain, "Client disconnected");
    writer_task.abort();
}
