//! Wire envelopes exchanged over the tunnel WebSocket.
//!
//! Every text frame carries exactly one JSON object: a [`RequestEnvelope`]
//! travelling relay → client, or a [`ResponseEnvelope`] travelling back.
//! Bodies are base64 encoded inside the JSON; binary frames are never used.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;

/// Path on the relay that accepts the tunnel client's WebSocket upgrade.
pub const TUNNEL_PATH: &str = "/tunnel";

/// How long the relay waits for a response envelope.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed delay between tunnel client reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// `Retry-After` hint sent with 503 when no tunnel client is attached.
pub const RETRY_AFTER_SECS: u64 = 5;

/// Maximum buffered request body (10 MB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Room left in a frame for the id, status and headers around the body.
pub const FRAME_OVERHEAD: usize = 1024 * 1024;

/// Largest WebSocket message an envelope with a body of at most
/// `max_body` bytes can encode to.
///
/// Both ends configure their sockets with this so a body that passed the
/// size check never trips the transport limit.
pub fn max_frame_size(max_body: usize) -> usize {
    max_body
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(FRAME_OVERHEAD)
}

/// Header map carried inside an envelope.
///
/// Keys are compared case-insensitively; see [`crate::headers`].
pub type Headers = HashMap<String, String>;

/// An inbound HTTP request wrapped for the trip through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(alias = "Method", default = "default_method")]
    pub method: String,
    /// Path including the query string.
    #[serde(alias = "Path", default)]
    pub path: String,
    #[serde(alias = "Headers", default, deserialize_with = "nullable_headers")]
    pub headers: Headers,
    #[serde(alias = "BodyBase64", default)]
    pub body_base64: Option<String>,
}

/// The replayed response, correlated to its request by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(alias = "StatusCode")]
    pub status_code: u16,
    #[serde(alias = "Headers", default, deserialize_with = "nullable_headers")]
    pub headers: Headers,
    #[serde(alias = "BodyBase64", default)]
    pub body_base64: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn nullable_headers<'de, D>(deserializer: D) -> std::result::Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Headers>::deserialize(deserializer)?.unwrap_or_default())
}

impl RequestEnvelope {
    /// Wrap a request under a freshly generated correlation id.
    pub fn new(method: impl Into<String>, path: impl Into<String>, headers: Headers, body: Option<&[u8]>) -> Self {
        Self {
            id: new_request_id(),
            method: method.into(),
            path: path.into(),
            headers,
            body_base64: body.map(|b| BASE64.encode(b)),
        }
    }

    /// Decoded request body, `None` when the envelope carries none.
    pub fn body(&self) -> Result<Option<Vec<u8>>> {
        decode_body(self.body_base64.as_deref())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ResponseEnvelope {
    pub fn new(id: impl Into<String>, status_code: u16, headers: Headers, body: Option<&[u8]>) -> Self {
        Self {
            id: id.into(),
            status_code,
            headers,
            body_base64: body.map(|b| BASE64.encode(b)),
        }
    }

    /// Synthetic 502 used when the backend could not be reached.
    pub fn bad_gateway(id: impl Into<String>, message: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        let body = format!("Bad Gateway: {}", message);
        Self::new(id, 502, headers, Some(body.as_bytes()))
    }

    /// Decoded response body, `None` when the envelope carries none.
    pub fn body(&self) -> Result<Option<Vec<u8>>> {
        decode_body(self.body_base64.as_deref())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn decode_body(encoded: Option<&str>) -> Result<Option<Vec<u8>>> {
    match encoded {
        Some(s) => Ok(Some(BASE64.decode(s)?)),
        None => Ok(None),
    }
}

/// Fresh correlation id: 32 hex chars from a v4 UUID.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Translate a relay base URL into the WebSocket URL of its tunnel endpoint.
///
/// `https://relay.example.com/` becomes `wss://relay.example.com/tunnel`.
pub fn tunnel_ws_url(server_url: &str) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}{}", base, TUNNEL_PATH)
}
