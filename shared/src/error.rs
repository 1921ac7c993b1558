//! Error types for Backhaul.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}
