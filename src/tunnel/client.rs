//! Outbound tunnel client — the workstation's persistent link to the relay.
//!
//! Spawned on startup when `RELAY_ENABLED` is set. The loop:
//!
//! 1. **Bootstrap** — adopt an env-seeded or persisted `(subdomain, token)`
//!    identity if the relay still honours it (`/api/relay/refresh`), else
//!    register fresh and persist the reply with restrictive permissions.
//! 2. **Dial** — `wss://{subdomain}.{relay_server}/relay`, authenticate with
//!    a JSON-RPC `register` call, deadline-bounded.
//! 3. **Bridge** — decode envelopes; `connected`/`disconnected` open and
//!    close per-client RPC connections, `message` frames are dispatched on
//!    their own tasks so a slow handler can't stall the tunnel.
//! 4. **Reconnect** — exponential backoff from 1 s doubling to a 30 s
//!    ceiling, reset after every successful authentication. A token the
//!    relay rejects is discarded and the client re-registers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use super::{Envelope, EnvelopeType, RelayIdentity};
use crate::state::AppState;
use crate::ws::RpcConn;

/// Initial reconnect delay.
const BACKOFF_START: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Deadline for the relay's reply to the auth frame.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound queue depth per bridged client connection.
const CONN_QUEUE: usize = 256;

type WsSink = Arc<
    Mutex<
        futures::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            WsMessage,
        >,
    >,
>;

/// Tunnel client failures.
#[derive(Debug)]
enum TunnelError {
    /// Registration/refresh HTTP call failed at the transport level.
    Http(reqwest::Error),
    /// Registration returned an unexpected status.
    Register(u16),
    /// Refresh returned an unexpected status (stale token, relay reset, …).
    Refresh(u16),
    /// WebSocket connect or I/O failure.
    Ws(tokio_tungstenite::tungstenite::Error),
    /// The relay rejected our token; the cached identity is worthless.
    AuthRejected(String),
    /// The handshake failed for another reason (timeout, bad reply).
    Auth(String),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Http(e) => write!(f, "relay API request failed: {e}"),
            TunnelError::Register(code) => write!(f, "registration failed with status {code}"),
            TunnelError::Refresh(code) => write!(f, "refresh failed with status {code}"),
            TunnelError::Ws(e) => write!(f, "tunnel socket error: {e}"),
            TunnelError::AuthRejected(msg) => write!(f, "relay rejected token: {msg}"),
            TunnelError::Auth(msg) => write!(f, "tunnel auth failed: {msg}"),
        }
    }
}

/// Spawn the tunnel client task. Runs until aborted.
pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let http = reqwest::Client::new();
    let mut backoff = BACKOFF_START;

    loop {
        let identity = match bootstrap(&http, &state).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Tunnel bootstrap failed: {e}, retrying in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        info!(
            "Tunnel identity ready: https://{}.{}",
            identity.subdomain, identity.relay_server
        );

        loop {
            match connect_and_run(&state, &identity).await {
                Ok(()) => {
                    // We were authenticated before losing the socket.
                    backoff = BACKOFF_START;
                    info!("Tunnel disconnected, reconnecting in {}s", backoff.as_secs());
                }
                Err(TunnelError::AuthRejected(msg)) => {
                    warn!("Tunnel identity invalid ({msg}), re-registering");
                    RelayIdentity::discard().await;
                    break;
                }
                Err(e) => {
                    warn!("Tunnel error: {e}, reconnecting in {}s", backoff.as_secs());
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct RefreshReply {
    subdomain: String,
    relay_server: String,
}

/// Resolve a working identity: refresh a cached one, or register fresh.
async fn bootstrap(http: &reqwest::Client, state: &AppState) -> Result<RelayIdentity, TunnelError> {
    let relay = &state.config.relay;

    let cached = if !relay.token.is_empty() && !relay.subdomain.is_empty() {
        Some(RelayIdentity {
            subdomain: relay.subdomain.clone(),
            relay_token: relay.token.clone(),
            relay_server: String::new(),
        })
    } else {
        RelayIdentity::load().await
    };

    if let Some(cached) = cached {
        match refresh(http, &relay.url, &cached.relay_token).await {
            Ok(reply) => {
                return Ok(RelayIdentity {
                    subdomain: reply.subdomain,
                    relay_token: cached.relay_token,
                    relay_server: reply.relay_server,
                });
            }
            Err(e) => info!("Cached relay identity not accepted ({e}), re-registering"),
        }
    }

    let identity = register(http, &relay.url).await?;
    if let Err(e) = identity.save().await {
        warn!("Failed to persist relay identity: {e}");
    }
    info!(subdomain = %identity.subdomain, "Registered with relay");
    Ok(identity)
}

async fn register(http: &reqwest::Client, base_url: &str) -> Result<RelayIdentity, TunnelError> {
    let resp = http
        .post(format!("{}/api/relay/register", base_url.trim_end_matches('/')))
        .json(&json!({"client_version": env!("CARGO_PKG_VERSION")}))
        .send()
        .await
        .map_err(TunnelError::Http)?;
    if resp.status().as_u16() != 201 {
        return Err(TunnelError::Register(resp.status().as_u16()));
    }
    resp.json().await.map_err(TunnelError::Http)
}

async fn refresh(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
) -> Result<RefreshReply, TunnelError> {
    let resp = http
        .post(format!("{}/api/relay/refresh", base_url.trim_end_matches('/')))
        .json(&json!({"relay_token": token}))
        .send()
        .await
        .map_err(TunnelError::Http)?;
    if resp.status().as_u16() != 200 {
        return Err(TunnelError::Refresh(resp.status().as_u16()));
    }
    resp.json().await.map_err(TunnelError::Http)
}

/// Build the tunnel socket URL from the relay base URL and subdomain:
/// `https://cloud.devport.app` + `abcd1234` → `wss://abcd1234.cloud.devport.app/relay`.
fn tunnel_url(relay_url: &str, subdomain: &str) -> String {
    let (scheme, rest) = match relay_url.split_once("://") {
        Some(("http", rest)) => ("ws", rest),
        Some((_, rest)) => ("wss", rest),
        None => ("wss", relay_url),
    };
    format!("{scheme}://{subdomain}.{}/relay", rest.trim_end_matches('/'))
}

/// One connection attempt: dial, authenticate, bridge until disconnect.
///
/// `Ok(())` means the socket was lost after successful auth; errors carry the
/// failure reason for backoff decisions.
async fn connect_and_run(state: &AppState, identity: &RelayIdentity) -> Result<(), TunnelError> {
    let url = tunnel_url(&state.config.relay.url, &identity.subdomain);
    info!("Dialing tunnel: {url}");

    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(TunnelError::Ws)?;
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    // Authenticate before anything else flows.
    {
        let auth = json!({
            "jsonrpc": "2.0",
            "method": "register",
            "params": {"relay_token": identity.relay_token},
            "id": 1,
        });
        let mut sink = sink.lock().await;
        sink.send(WsMessage::Text(auth.to_string().into()))
            .await
            .map_err(TunnelError::Ws)?;
    }

    let reply = tokio::time::timeout(AUTH_DEADLINE, stream.next())
        .await
        .map_err(|_| TunnelError::Auth("timed out waiting for auth reply".to_string()))?;
    let Some(Ok(WsMessage::Text(text))) = reply else {
        return Err(TunnelError::Auth("socket closed during handshake".to_string()));
    };
    let reply: Value = serde_json::from_str(&text)
        .map_err(|e| TunnelError::Auth(format!("unparseable auth reply: {e}")))?;
    if !reply["error"].is_null() {
        let code = reply["error"]["code"].as_i64().unwrap_or(0);
        let message = reply["error"]["message"].as_str().unwrap_or("").to_string();
        // Invalid token / unknown subdomain invalidate the cached identity.
        if code == -32001 || code == -32002 {
            return Err(TunnelError::AuthRejected(message));
        }
        return Err(TunnelError::Auth(message));
    }

    info!("Tunnel connected");

    // One RpcConn per multiplexed client, plus the task draining its
    // outbound channel back into `message` envelopes.
    let mut conns: HashMap<String, (Arc<RpcConn>, tokio::task::JoinHandle<()>)> = HashMap::new();

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Tunnel read error: {e}");
                break;
            }
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        match envelope.envelope_type {
            EnvelopeType::Connected => {
                let cid = envelope.connection_id;
                info!(connection_id = %cid, "Remote client connected");
                let entry = open_conn(state.clone(), &cid, &sink);
                if let Some((old_conn, old_task)) = conns.insert(cid, entry) {
                    old_conn.close().await;
                    old_task.abort();
                }
            }
            EnvelopeType::Disconnected => {
                if let Some((conn, task)) = conns.remove(&envelope.connection_id) {
                    info!(connection_id = %envelope.connection_id, "Remote client disconnected");
                    conn.close().await;
                    task.abort();
                }
            }
            EnvelopeType::Message => {
                let Some(payload) = envelope.payload else {
                    continue;
                };
                let Some((conn, _)) = conns.get(&envelope.connection_id) else {
                    warn!(
                        connection_id = %envelope.connection_id,
                        "Message for unknown connection, dropping"
                    );
                    continue;
                };
                // Per-message task: a blocked handler must not stall the tunnel.
                let conn = conn.clone();
                tokio::spawn(async move {
                    RpcConn::handle_frame(&conn, payload.get()).await;
                });
            }
            EnvelopeType::Unknown => {
                warn!(
                    connection_id = %envelope.connection_id,
                    "Unknown envelope type from relay, dropping"
                );
            }
        }
    }

    for (_, (conn, task)) in conns.drain() {
        conn.close().await;
        task.abort();
    }
    Ok(())
}

/// Create the RPC connection state for one multiplexed client and the task
/// that wraps its outbound traffic into envelopes.
fn open_conn(
    state: AppState,
    connection_id: &str,
    sink: &WsSink,
) -> (Arc<RpcConn>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Value>(CONN_QUEUE);
    let conn = RpcConn::new(state, tx);
    let sink = sink.clone();
    let cid = connection_id.to_string();
    let task = tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let Ok(payload) = serde_json::value::RawValue::from_string(value.to_string()) else {
                continue;
            };
            let envelope = Envelope::message(&cid, payload);
            let mut sink = sink.lock().await;
            if sink
                .send(WsMessage::Text(envelope.encode().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });
    (conn, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_inserts_subdomain_and_scheme() {
        assert_eq!(
            tunnel_url("https://cloud.devport.app", "abcd1234"),
            "wss://abcd1234.cloud.devport.app/relay"
        );
        assert_eq!(
            tunnel_url("http://localhost:8080", "abcd1234"),
            "ws://abcd1234.localhost:8080/relay"
        );
        assert_eq!(
            tunnel_url("https://cloud.devport.app/", "ff00ff00"),
            "wss://ff00ff00.cloud.devport.app/relay"
        );
    }
}
