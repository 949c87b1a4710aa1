//! Client configuration loaded from environment variables.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rendezvous_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_SERVER_PORT, MAX_CONCURRENT_TRANSFERS,
};
use rendezvous_transfer::TransportConfig;

#[derive(Clone)]
pub struct ClientConfig {
    /// Rendezvous server, `host:port`.
    /// Env: `SERVER_ADDR`
    /// Default: `127.0.0.1:8080`
    pub server_addr: String,

    /// Bound on connecting to the server and to peers.
    /// Env: `CONNECT_TIMEOUT_SECS`
    /// Default: 5 seconds.
    pub connect_timeout: Duration,

    /// Where received files are written.
    /// Env: `DOWNLOAD_DIR`
    /// Default: the user's download directory, or `./downloads`.
    pub download_dir: PathBuf,

    /// Env: `MAX_CONCURRENT_TRANSFERS`
    /// Default: `10`
    pub max_concurrent_transfers: usize,

    /// Env: `CLIENT_USERNAME`
    pub username: Option<String>,

    /// Env: `CLIENT_SECRET`
    pub secret: Option<String>,

    /// Register the account before logging in.
    /// Env: `CLIENT_REGISTER` (true/false)
    /// Default: `false`
    pub register: bool,

    /// Friend to offer `send_files` to once logged in.
    /// Env: `SEND_TO`
    pub send_to: Option<String>,

    /// Env: `SEND_FILES` (comma-separated paths)
    pub send_files: Vec<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_SERVER_PORT),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            download_dir: default_download_dir(),
            max_concurrent_transfers: MAX_CONCURRENT_TRANSFERS,
            username: None,
            secret: None,
            register: false,
            send_to: None,
            send_files: Vec::new(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("connect_timeout", &self.connect_timeout)
            .field("download_dir", &self.download_dir)
            .field("max_concurrent_transfers", &self.max_concurrent_transfers)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("register", &self.register)
            .field("send_to", &self.send_to)
            .field("send_files", &self.send_files)
            .finish()
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("SERVER_ADDR") {
            config.server_addr = addr;
        }

        if let Some(val) = lookup("CONNECT_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.connect_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid CONNECT_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(dir) = lookup("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }

        if let Some(val) = lookup("MAX_CONCURRENT_TRANSFERS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_concurrent_transfers = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid MAX_CONCURRENT_TRANSFERS, using default"
                ),
            }
        }

        config.username = lookup("CLIENT_USERNAME").filter(|s| !s.is_empty());
        config.secret = lookup("CLIENT_SECRET").filter(|s| !s.is_empty());

        if let Some(val) = lookup("CLIENT_REGISTER") {
            config.register = val == "true" || val == "1";
        }

        config.send_to = lookup("SEND_TO").filter(|s| !s.is_empty());

        if let Some(files) = lookup("SEND_FILES") {
            config.send_files = files
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        config
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            download_dir: self.download_dir.clone(),
            connect_timeout: self.connect_timeout,
            max_concurrent: self.max_concurrent_transfers,
            ..TransportConfig::default()
        }
    }
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("./downloads"))
}
