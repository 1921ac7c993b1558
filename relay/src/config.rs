//! Relay configuration
//!
//! Every flag can also be supplied through the environment, which is how
//! the relay is usually deployed.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use backhaul_shared::protocol::{DEFAULT_REQUEST_TIMEOUT, MAX_BODY_SIZE};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "backhaul-relay")]
#[command(version)]
#[command(about = "Public relay that forwards HTTP requests through an attached tunnel client", long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "BACKHAUL_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Backend the tunnel client serves (shown on the info page)
    #[arg(long, env = "BACKHAUL_BACKEND_URL", default_value = "http://localhost:5252")]
    pub backend_url: String,

    /// Seconds to wait for a tunnel round trip
    #[arg(long, env = "BACKHAUL_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Largest request body the relay will buffer
    #[arg(long, env = "BACKHAUL_MAX_BODY_BYTES", default_value_t = MAX_BODY_SIZE)]
    pub max_body_bytes: usize,
}

impl Args {
    pub fn into_config(self) -> Result<RelayConfig> {
        if self.timeout_secs == 0 {
            anyhow::bail!("--timeout-secs must be greater than zero");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("--max-body-bytes must be greater than zero");
        }
        Ok(RelayConfig {
            bind: SocketAddr::new(self.host, self.port),
            backend_url: self.backend_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(self.timeout_secs),
            max_body_size: self.max_body_bytes,
        })
    }
}

/// Resolved relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub backend_url: String,
    pub request_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend_url: "http://localhost:5252".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_size: MAX_BODY_SIZE,
        }
    }
}
