//! Cloud relay — subdomain registry and shared state.
//!
//! The relay owns one [`RelayTunnel`] per registered workstation. A tunnel is
//! created by `POST /api/relay/register` (see [`http`]) and lives for the
//! registry's lifetime; the WebSocket from the workstation attaches to it on
//! dial and detaches on disconnect (see [`ws`]). Subdomains are never reused,
//! even after a tunnel is gone, so a stale client can't be captured by a new
//! registrant.

pub mod http;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::RelayConfig;

/// Relay-wide shared state, cloned into every handler.
#[derive(Clone)]
pub struct RelayState {
    /// Wildcard DNS zone tunnels are addressed under.
    pub domain: String,
    /// Accept any first DNS label as a subdomain (local development).
    pub dev_mode: bool,
    /// Live registrations keyed by subdomain.
    tunnels: Arc<RwLock<HashMap<String, Arc<RelayTunnel>>>>,
    /// Token → subdomain lookup.
    tokens: Arc<RwLock<HashMap<String, String>>>,
    /// Every subdomain ever handed out, including ones whose tunnel is gone.
    allocated: Arc<Mutex<HashSet<String>>>,
}

/// One registered workstation and its connected clients.
pub struct RelayTunnel {
    pub subdomain: String,
    pub relay_token: String,
    pub created_at: Instant,
    /// Sender feeding the tunnel socket's writer task. `None` while the
    /// workstation is disconnected. A single writer task serialises frames in
    /// submission order.
    pub writer: Mutex<Option<mpsc::Sender<Message>>>,
    /// Connected client sockets, keyed by connection id. Each value feeds
    /// that client's writer task.
    pub clients: RwLock<HashMap<String, mpsc::Sender<Message>>>,
    /// Generation counter for duplicate dials: the newest dial wins and stale
    /// connections recognise themselves by a mismatched generation.
    pub generation: AtomicU64,
    /// Instant of the last frame seen from the workstation.
    pub last_ping: Mutex<Option<Instant>>,
}

impl RelayTunnel {
    fn new(subdomain: String, relay_token: String) -> Self {
        Self {
            subdomain,
            relay_token,
            created_at: Instant::now(),
            writer: Mutex::new(None),
            clients: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            last_ping: Mutex::new(None),
        }
    }

    /// Whether a workstation socket is currently attached.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Send a frame up the tunnel. Returns `false` if no socket is attached
    /// or its writer task has died (the caller tears down on that signal).
    pub async fn send(&self, msg: Message) -> bool {
        let writer = self.writer.lock().await;
        match writer.as_ref() {
            Some(tx) => tx.send(msg).await.is_ok(),
            None => false,
        }
    }
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            dev_mode: config.dev_mode,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            allocated: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Allocate a fresh subdomain and token and create its tunnel record.
    ///
    /// Subdomains are 8 hex chars drawn by rejection sampling against the
    /// ever-allocated set; tokens are 32 random bytes, hex-encoded with an
    /// `rt_` prefix.
    pub async fn register(&self) -> (String, String) {
        let subdomain = {
            let mut allocated = self.allocated.lock().await;
            loop {
                let candidate = random_hex(4);
                if allocated.insert(candidate.clone()) {
                    break candidate;
                }
            }
        };
        let token = format!("rt_{}", random_hex(32));

        let tunnel = Arc::new(RelayTunnel::new(subdomain.clone(), token.clone()));
        self.tunnels
            .write()
            .await
            .insert(subdomain.clone(), tunnel);
        self.tokens
            .write()
            .await
            .insert(token.clone(), subdomain.clone());

        (subdomain, token)
    }

    /// Look up a tunnel by its relay token.
    pub async fn tunnel_by_token(&self, token: &str) -> Option<Arc<RelayTunnel>> {
        let subdomain = self.tokens.read().await.get(token).cloned()?;
        self.tunnels.read().await.get(&subdomain).cloned()
    }

    /// Look up a tunnel by subdomain.
    pub async fn tunnel_by_subdomain(&self, subdomain: &str) -> Option<Arc<RelayTunnel>> {
        self.tunnels.read().await.get(subdomain).cloned()
    }

    /// Validate a token for refresh; returns the bound subdomain.
    pub async fn refresh(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    /// Extract the subdomain from a request `Host` header.
    ///
    /// Expects `{subdomain}.{domain}`. In dev mode any multi-label host's
    /// first label is accepted so `abcd1234.localhost:8080` works without DNS.
    pub fn extract_subdomain(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host);
        if let Some(sub) = host.strip_suffix(&format!(".{}", self.domain)) {
            if !sub.is_empty() && !sub.contains('.') {
                return Some(sub.to_string());
            }
        }
        if self.dev_mode {
            let mut parts = host.split('.');
            if let (Some(first), Some(_)) = (parts.next(), parts.next()) {
                return Some(first.to_string());
            }
        }
        None
    }

    /// Bump the generation counter for `tunnel` and return the new value.
    /// Used by a fresh dial to invalidate any previous socket.
    pub fn next_generation(tunnel: &RelayTunnel) -> u64 {
        tunnel.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn state() -> RelayState {
        RelayState::new(&RelayConfig {
            server_port: "8080".to_string(),
            server_host: "0.0.0.0".to_string(),
            domain: "cloud.devport.app".to_string(),
            dev_mode: false,
        })
    }

    #[tokio::test]
    async fn register_allocates_well_formed_ids() {
        let state = state();
        let (subdomain, token) = state.register().await;
        assert_eq!(subdomain.len(), 8);
        assert!(subdomain.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(token.starts_with("rt_"));
        assert_eq!(token.len(), 3 + 64);
        assert!(token[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn register_twice_yields_distinct_subdomains() {
        let state = state();
        let (a, _) = state.register().await;
        let (b, _) = state.register().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let state = state();
        let (subdomain, token) = state.register().await;
        assert_eq!(state.refresh(&token).await.as_deref(), Some(subdomain.as_str()));
        assert_eq!(state.refresh(&token).await.as_deref(), Some(subdomain.as_str()));
        assert!(state.refresh("rt_bogus").await.is_none());
    }

    #[tokio::test]
    async fn lookups_agree() {
        let state = state();
        let (subdomain, token) = state.register().await;
        let by_token = state.tunnel_by_token(&token).await.unwrap();
        let by_sub = state.tunnel_by_subdomain(&subdomain).await.unwrap();
        assert_eq!(by_token.subdomain, by_sub.subdomain);
        assert!(!by_token.is_connected().await);
    }

    #[test]
    fn extract_subdomain_strips_domain_and_port() {
        let state = state();
        assert_eq!(
            state.extract_subdomain("abcd1234.cloud.devport.app"),
            Some("abcd1234".to_string())
        );
        assert_eq!(
            state.extract_subdomain("abcd1234.cloud.devport.app:443"),
            Some("abcd1234".to_string())
        );
        assert_eq!(state.extract_subdomain("cloud.devport.app"), None);
        assert_eq!(state.extract_subdomain("localhost"), None);
    }

    #[test]
    fn extract_subdomain_dev_mode_takes_first_label() {
        let mut state = state();
        state.dev_mode = true;
        assert_eq!(
            state.extract_subdomain("abcd1234.localhost:8080"),
            Some("abcd1234".to_string())
        );
        assert_eq!(state.extract_subdomain("localhost:8080"), None);
    }
}
