//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rendezvous_shared::constants::{
    BROADCAST_INTERVAL_SECS, DEFAULT_HTTP_PORT, DEFAULT_SERVER_PORT,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// TCP address of the rendezvous listener.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// Socket address for the HTTP (axum) admin API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8081`
    pub http_addr: SocketAddr,

    /// JSON file holding the account table.
    /// Env: `ACCOUNTS_PATH`
    /// Default: `./users.json`
    pub accounts_path: PathBuf,

    /// Period between presence broadcasts.
    /// Env: `BROADCAST_INTERVAL_SECS`
    /// Default: 30 seconds.
    pub broadcast_interval: Duration,

    /// Address advertised to friends instead of the observed peer IP.
    /// Useful behind NAT where the observed address is not routable.
    /// Env: `ADVERTISE_ADDR`
    /// Default: unset.
    pub advertise_addr: Option<String>,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Whether REGISTER requests are accepted.
    /// Env: `REGISTRATION_OPEN` (true/false)
    /// Default: `true`
    pub registration_open: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_SERVER_PORT).into(),
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            accounts_path: PathBuf::from("./users.json"),
            broadcast_interval: Duration::from_secs(BROADCAST_INTERVAL_SECS),
            advertise_addr: None,
            admin_token: None,
            registration_open: true,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("http_addr", &self.http_addr)
            .field("accounts_path", &self.accounts_path)
            .field("broadcast_interval", &self.broadcast_interval)
            .field("advertise_addr", &self.advertise_addr)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("registration_open", &self.registration_open)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("ACCOUNTS_PATH") {
            config.accounts_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("BROADCAST_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.broadcast_interval = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid BROADCAST_INTERVAL_SECS, using default"
                ),
            }
        }

        if let Some(addr) = lookup("ADVERTISE_ADDR") {
            let addr = addr.trim();
            if !addr.is_empty() {
                config.advertise_addr = Some(addr.to_string());
            }
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = lookup("REGISTRATION_OPEN") {
            config.registration_open = val != "false" && val != "0";
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8081).into());
        assert_eq!(config.broadcast_interval, Duration::from_secs(30));
        assert!(config.registration_open);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("ACCOUNTS_PATH", "/tmp/accounts.json"),
            ("BROADCAST_INTERVAL_SECS", "5"),
            ("ADVERTISE_ADDR", "203.0.113.7"),
            ("ADMIN_TOKEN", "secret"),
            ("REGISTRATION_OPEN", "false"),
        ]));
        assert_eq!(config.listen_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.accounts_path, PathBuf::from("/tmp/accounts.json"));
        assert_eq!(config.broadcast_interval, Duration::from_secs(5));
        assert_eq!(config.advertise_addr.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert!(!config.registration_open);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("LISTEN_ADDR", "not-an-address"),
            ("BROADCAST_INTERVAL_SECS", "0"),
            ("ADMIN_TOKEN", ""),
        ]));
        assert_eq!(config.listen_addr, ServerConfig::default().listen_addr);
        assert_eq!(config.broadcast_interval, Duration::from_secs(30));
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_debug_hides_admin_token() {
        let config = ServerConfig {
            admin_token: Some("hunter2-token".into()),
            ..ServerConfig::default()
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2-token"));
        assert!(printed.contains("<redacted>"));
    }
}
