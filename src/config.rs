//! Environment-based configuration for both run modes.
//!
//! All settings come from environment variables with compiled defaults, so a
//! bare `devport serve` works from any checkout:
//!
//! | Variable        | Default                     | Role        |
//! |-----------------|-----------------------------|-------------|
//! | `AUTH_TOKEN`    | *(required)*                | workstation |
//! | `SERVER_PORT`   | `9870` / `8080` (relay)     | both        |
//! | `SERVER_HOST`   | `0.0.0.0`                   | relay       |
//! | `WORK_DIR`      | `.`                         | workstation |
//! | `DATA_DIR`      | `.devport`                  | workstation |
//! | `RELAY_ENABLED` | `true`                      | workstation |
//! | `RELAY_URL`     | `https://cloud.devport.app` | workstation |
//! | `RELAY_TOKEN`   | *(empty)*                   | workstation |
//! | `SUBDOMAIN`     | *(empty)*                   | workstation |
//! | `DOMAIN`        | `cloud.devport.app`         | relay       |
//! | `DEV_MODE`      | `false`                     | both        |
//! | `LOG_LEVEL`     | `info`                      | workstation |
//!
//! `LOG_LEVEL` feeds the tracing filter and is overridden by `RUST_LOG`.

use std::env;

/// Read an environment variable, falling back to `default` when unset or empty.
fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v == "true",
        _ => default,
    }
}

/// Configuration for the workstation server (`devport serve`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Pre-shared token required by every RPC and REST call. Required.
    pub auth_token: String,
    /// TCP port for the local HTTP/WS server.
    pub server_port: String,
    /// Working directory exposed through `/api/fs` and handed to agents.
    pub work_dir: String,
    /// Directory name (under `work_dir`) for persisted session state.
    pub data_dir: String,
    /// Development mode flag; surfaced in startup logs.
    pub dev_mode: bool,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Outbound tunnel settings.
    pub relay: RelayClientConfig,
}

/// Tunnel-client settings embedded in [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Whether to maintain an outbound tunnel at all.
    pub enabled: bool,
    /// Base URL of the relay's registration API.
    pub url: String,
    /// Pre-seeded relay token. Empty means load from disk or register fresh.
    pub token: String,
    /// Pre-seeded subdomain paired with `token`.
    pub subdomain: String,
}

impl ServerConfig {
    /// Load workstation configuration from the environment.
    ///
    /// Does not validate `auth_token`; the caller decides whether an empty
    /// token is fatal (it is for `devport serve`).
    pub fn load() -> Self {
        Self {
            auth_token: env_or("AUTH_TOKEN", ""),
            server_port: env_or("SERVER_PORT", "9870"),
            work_dir: env_or("WORK_DIR", "."),
            data_dir: env_or("DATA_DIR", ".devport"),
            dev_mode: env_bool("DEV_MODE", false),
            log_level: env_or("LOG_LEVEL", "info"),
            relay: RelayClientConfig {
                enabled: env_bool("RELAY_ENABLED", true),
                url: env_or("RELAY_URL", "https://cloud.devport.app"),
                token: env_or("RELAY_TOKEN", ""),
                subdomain: env_or("SUBDOMAIN", ""),
            },
        }
    }
}

/// Configuration for the cloud relay (`devport relay`).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port to bind.
    pub server_port: String,
    /// Interface to bind.
    pub server_host: String,
    /// Wildcard DNS zone; tunnels live at `{subdomain}.{domain}`.
    pub domain: String,
    /// Development mode: accept any first DNS label as the subdomain.
    pub dev_mode: bool,
}

impl RelayConfig {
    /// Load relay configuration from the environment.
    pub fn load() -> Self {
        Self {
            server_port: env_or("SERVER_PORT", "8080"),
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            domain: env_or("DOMAIN", "cloud.devport.app"),
            dev_mode: env_bool("DEV_MODE", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_empty() {
        std::env::set_var("DEVPORT_TEST_EMPTY", "");
        assert_eq!(env_or("DEVPORT_TEST_EMPTY", "fallback"), "fallback");
        assert_eq!(env_or("DEVPORT_TEST_UNSET_XYZ", "fallback"), "fallback");
    }

    #[test]
    fn env_bool_parses_true_only() {
        std::env::set_var("DEVPORT_TEST_BOOL_A", "true");
        assert!(env_bool("DEVPORT_TEST_BOOL_A", false));
        std::env::set_var("DEVPORT_TEST_BOOL_B", "1");
        assert!(!env_bool("DEVPORT_TEST_BOOL_B", false));
        assert!(env_bool("DEVPORT_TEST_BOOL_UNSET", true));
    }
}
