use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use backhaul::{ClientConfig, TunnelClient};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backhaul")]
#[command(author = "Backhaul Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a Backhaul relay", long_about = None)]
struct Cli {
    /// Relay URL (http(s):// is translated to ws(s)://.../tunnel)
    #[arg(short, long)]
    url: Option<String>,

    /// Local port to forward requests to
    #[arg(short, long)]
    local: Option<u16>,

    /// Local host to forward requests to
    #[arg(long)]
    local_host: Option<String>,

    /// Seconds between reconnect attempts
    #[arg(long)]
    reconnect_secs: Option<f64>,

    /// Seconds before a backend call is abandoned
    #[arg(long)]
    backend_timeout_secs: Option<u64>,

    /// Largest backend response body to send back (match the relay's limit)
    #[arg(long)]
    max_body_bytes: Option<usize>,

    /// Config file (defaults to backhaul.yml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match self.config.or_else(ClientConfig::find_config) {
            Some(path) => ClientConfig::load(&path)?,
            None => ClientConfig::default(),
        };

        if let Some(url) = self.url {
            config.server_url = url;
        }
        if let Some(port) = self.local {
            config.local_port = port;
        }
        if let Some(host) = self.local_host {
            config.local_host = host;
        }
        if let Some(secs) = self.reconnect_secs {
            config.reconnect_delay =
                Duration::try_from_secs_f64(secs).context("Invalid --reconnect-secs")?;
        }
        if let Some(secs) = self.backend_timeout_secs {
            config.backend_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.max_body_bytes {
            config.max_body_size = bytes;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "backhaul=debug" } else { "backhaul=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = cli.into_config()?;
    let client = TunnelClient::new(config)?;

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  Backhaul Tunnel Client                                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Relay:  {:<51} ║", client.config().tunnel_url());
    println!("║  Local:  {:<51} ║", client.config().local_base());
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    client.run(cancel).await;
    info!("Bye.");
    Ok(())
}
