//! Configuration file parser for Backhaul
//!
//! Supports an optional backhaul.yml; command-line flags override any
//! value it sets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use backhaul_shared::protocol::{
    max_frame_size, tunnel_ws_url, DEFAULT_RECONNECT_DELAY, DEFAULT_REQUEST_TIMEOUT, MAX_BODY_SIZE,
};
use serde::{Deserialize, Deserializer};

/// Tunnel client settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay base URL (http, https, ws or wss)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Host the backend listens on
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Port the backend listens on
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Delay between reconnect attempts, in seconds
    #[serde(default = "default_reconnect_delay", deserialize_with = "seconds")]
    pub reconnect_delay: Duration,

    /// Per-request limit on the backend call, in seconds
    #[serde(default = "default_backend_timeout", deserialize_with = "seconds")]
    pub backend_timeout: Duration,

    /// Largest backend response body sent back through the tunnel.
    /// Keep it equal to the relay's `--max-body-bytes`.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    5252
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

fn default_backend_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_max_body_size() -> usize {
    MAX_BODY_SIZE
}

fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            local_host: default_host(),
            local_port: default_local_port(),
            reconnect_delay: default_reconnect_delay(),
            backend_timeout: default_backend_timeout(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if url.is_empty() {
            anyhow::bail!("Relay URL cannot be empty");
        }
        if !["http://", "https://", "ws://", "wss://"].iter().any(|s| url.starts_with(s)) {
            anyhow::bail!("Unsupported relay URL '{}': expected http(s):// or ws(s)://", url);
        }
        if self.local_host.trim().is_empty() {
            anyhow::bail!("Local host cannot be empty");
        }
        if self.local_port == 0 {
            anyhow::bail!("Invalid local port 0");
        }
        if self.backend_timeout.is_zero() {
            anyhow::bail!("Backend timeout must be greater than zero");
        }
        if self.max_body_size == 0 {
            anyhow::bail!("Max body size must be greater than zero");
        }
        Ok(())
    }

    /// WebSocket URL of the relay's tunnel endpoint.
    pub fn tunnel_url(&self) -> String {
        tunnel_ws_url(&self.server_url)
    }

    /// Base URL requests are replayed against.
    pub fn local_base(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }

    /// WebSocket frame and message limit for the tunnel connection.
    pub fn max_frame_size(&self) -> usize {
        max_frame_size(self.max_body_size)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "backhaul.yml",
            "backhaul.yaml",
            ".backhaul.yml",
            ".backhaul.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
