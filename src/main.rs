#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # devport
//!
//! Exposes a developer workstation — its working directory, a git view of
//! it, and a long-running AI coding assistant — to a remote client through a
//! cloud relay.
//!
//! ## Subcommands
//!
//! - `devport serve` (default) — workstation server: local HTTP/WS APIs,
//!   assistant process pool, durable sessions, outbound tunnel client
//! - `devport relay` — cloud relay: registration API and the wildcard-host
//!   tunnel/client WebSocket endpoints
//!
//! ## Workstation API surface
//!
//! | Method   | Path                          | Auth   | Description                    |
//! |----------|-------------------------------|--------|--------------------------------|
//! | GET      | `/health`                     | No     | Liveness probe                 |
//! | GET      | `/ws`                         | In-band| JSON-RPC chat protocol         |
//! | GET/PUT/DELETE | `/api/fs[/path]`        | Yes    | Jailed file browser            |
//! | GET      | `/api/git/status`             | Yes    | Porcelain status               |
//! | GET      | `/api/git/diff`               | Yes    | Diff + numstat                 |
//! | GET/POST | `/api/sessions/{id}/messages` | Yes    | History / send message         |
//! | POST     | `/api/sessions/{id}/cancel`   | Yes    | Interrupt a turn               |
//! | POST     | `/api/permissions/{id}`       | Yes    | Answer permission prompt       |
//! | POST     | `/api/questions/{id}`         | Yes    | Answer user question           |

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use devport::agent::pool::AgentPool;
use devport::auth::AuthToken;
use devport::config::{RelayConfig, ServerConfig};
use devport::relay::{http::relay_router, RelayState};
use devport::sessions::SessionStore;
use devport::state::AppState;
use devport::{auth, routes, tunnel, ws};

/// Idle assistant processes are reaped after this long without borrowers.
const AGENT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How long in-flight HTTP connections get to drain on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Remote workstation access through a cloud relay.
#[derive(Parser)]
#[command(name = "devport", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workstation server (default when no subcommand given).
    Serve,
    /// Run the cloud relay.
    Relay,
}

#[tokio::main]
async fn main() {
    match Cli::parse().command {
        Some(Commands::Relay) => run_relay().await,
        Some(Commands::Serve) | None => run_server().await,
    }
}

fn init_tracing(default_level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_server() {
    let config = ServerConfig::load();
    init_tracing(&config.log_level);

    if config.auth_token.is_empty() {
        error!("AUTH_TOKEN environment variable is required");
        std::process::exit(1);
    }

    info!("devport v{} starting", env!("CARGO_PKG_VERSION"));
    if config.dev_mode {
        info!("Development mode enabled");
    }

    let sessions = match SessionStore::open(&config.work_dir, &config.data_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open session store: {e}");
            std::process::exit(1);
        }
    };
    let pool = AgentPool::new(&config.work_dir, AGENT_IDLE_TIMEOUT);

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        sessions,
        pool,
    };

    let public_routes = Router::new()
        .route("/health", get(routes::health::health))
        .route("/ws", get(ws::ws_upgrade));

    let authed_routes = Router::new()
        .route(
            "/api/fs",
            get(routes::fs::get_root),
        )
        .route(
            "/api/fs/{*path}",
            get(routes::fs::get_path)
                .put(routes::fs::put_path)
                .delete(routes::fs::delete_path),
        )
        .route("/api/git/status", get(routes::git::status))
        .route("/api/git/diff", get(routes::git::diff))
        .route(
            "/api/sessions/{id}/messages",
            get(routes::chat::get_messages).post(routes::chat::send_message),
        )
        .route("/api/sessions/{id}/cancel", post(routes::chat::cancel))
        .route(
            "/api/permissions/{id}",
            post(routes::chat::permission_response),
        )
        .route(
            "/api/questions/{id}",
            post(routes::chat::question_response),
        )
        .layer(middleware::from_fn(auth::require_token))
        .layer(Extension(AuthToken(state.config.auth_token.clone())));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.server_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "Local: http://localhost:{}  (work dir: {})",
        state.config.server_port, state.config.work_dir
    );

    // Outbound tunnel: the remote URL is logged once registration completes.
    let tunnel_task = if state.config.relay.enabled {
        Some(tunnel::client::spawn(state.clone()))
    } else {
        info!("Relay is disabled");
        None
    };

    let reaper_task = state.pool.spawn_reaper();

    // Serve until signalled, then: stop the tunnel, close all assistants,
    // and give in-flight HTTP a bounded drain.
    let drain = Arc::new(Notify::new());
    let drain_trigger = drain.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain_trigger.notified().await });
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server error: {e}");
        }
    });

    shutdown_signal().await;
    info!("Shutting down...");

    if let Some(task) = tunnel_task {
        task.abort();
    }
    reaper_task.abort();
    state.pool.close_all().await;

    drain.notify_one();
    if tokio::time::timeout(SHUTDOWN_DRAIN, server_task).await.is_err() {
        warn!("Drain deadline reached, exiting with connections open");
    }
    info!("Goodbye");
}

async fn run_relay() {
    let config = RelayConfig::load();
    init_tracing("info");

    let state = RelayState::new(&config);
    let app = relay_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("Relay server starting on {addr}");
    info!("  Health:    http://{addr}/health");
    info!("  Register:  http://{addr}/api/relay/register");
    info!("  Tunnel WS: ws://{{subdomain}}.{}/relay", config.domain);
    info!("  Client WS: ws://{{subdomain}}.{}/ws", config.domain);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
    info!("Goodbye");
}
