//! Backhaul Relay
//!
//! Public-facing half of the tunnel: accepts the tunnel client's
//! WebSocket on `/tunnel` and forwards every other HTTP request through it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod config;
pub mod forward;
pub mod headers;
pub mod metrics;
pub mod pending;
pub mod router;
pub mod session;

pub use config::RelayConfig;
pub use router::router;

use metrics::Metrics;
use pending::PendingTable;
use session::SessionSlot;

/// How often expired pending entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub sessions: Arc<SessionSlot>,
    pub pending: PendingTable,
    pub metrics: Metrics,
    /// Cancelled when the relay shuts down; ends session read loops.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionSlot::new()),
            pending: PendingTable::new(),
            metrics: Metrics::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Serve the relay on `listener` until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let sweeper = spawn_sweeper(state.pending.clone(), state.shutdown.clone());
    let shutdown = state.shutdown.clone();

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    sweeper.abort();
    Ok(())
}

/// Backstop for entries whose waiter never ran its own cleanup.
fn spawn_sweeper(pending: PendingTable, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = pending.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired pending requests");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
