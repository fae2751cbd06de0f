#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! devport library — exposes the building blocks of both daemons:
//!
//! - `relay` — cloud relay: registration API, tunnel + client sockets,
//!   envelope multiplexer
//! - `tunnel` — envelope codec and the workstation's outbound tunnel client
//! - `ws` — JSON-RPC dispatcher and chat pump
//! - `agent` — assistant child process adapter and keyed process pool
//! - `sessions` — durable session metadata and message history
//! - `routes` — REST handlers (health, files, git, chat)
//! - `auth` — pre-shared token authentication
//! - `config` — environment-based configuration

pub mod agent;
pub mod auth;
pub mod config;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod tunnel;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use agent::pool::AgentPool;
pub use config::{RelayConfig, ServerConfig};
pub use relay::RelayState;
pub use sessions::SessionStore;
pub use state::AppState;
