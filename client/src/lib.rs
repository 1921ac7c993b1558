//! Backhaul tunnel client
//!
//! Dials out to a relay, receives forwarded HTTP requests over the
//! WebSocket and replays them against a local backend.

pub mod config;
pub mod proxy;
pub mod tunnel;

pub use config::ClientConfig;
pub use tunnel::{ConnectionState, TunnelClient};
