//! Shared application state for the workstation server.

use std::sync::Arc;
use std::time::Instant;

use crate::agent::pool::AgentPool;
use crate::config::ServerConfig;
use crate::sessions::SessionStore;

/// Passed to every handler via Axum's `State` extractor; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<ServerConfig>,
    /// Monotonic instant when the server started.
    pub start_time: Instant,
    /// Durable chat sessions and history.
    pub sessions: SessionStore,
    /// Assistant processes keyed by session id.
    pub pool: AgentPool,
}
