//! Backhaul Shared Library
//!
//! Wire envelopes, header helpers and error types used by both the
//! relay and the tunnel client.

pub mod protocol;
pub mod headers;
pub mod error;

pub use error::{Error, Result};
pub use protocol::{Headers, RequestEnvelope, ResponseEnvelope};
