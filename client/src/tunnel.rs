//! Connect/reconnect loop for the tunnel client

use std::sync::Arc;

use anyhow::Result;
use backhaul_shared::{RequestEnvelope, ResponseEnvelope};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::proxy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the tunnel connection, shared by every reply task.
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: only reached through cancellation.
    Stopped,
}

pub struct TunnelClient {
    config: ClientConfig,
    http: reqwest::Client,
    state: watch::Sender<ConnectionState>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = proxy::build_http_client(config.backend_timeout)?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self { config, http, state })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Observe connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Tunnel state: {:?} → {:?}", prev, next);
        }
    }

    /// Keep a tunnel connection up until `cancel` fires.
    ///
    /// Retries forever with a fixed delay; there is no backoff or
    /// retry limit.
    pub async fn run(&self, cancel: CancellationToken) {
        let url = self.config.tunnel_url();
        let limit = self.config.max_frame_size();
        let ws_config = WebSocketConfig {
            max_message_size: Some(limit),
            max_frame_size: Some(limit),
            ..Default::default()
        };

        while !cancel.is_cancelled() {
            self.transition(ConnectionState::Connecting);
            info!("Connecting to relay: {}", url);

            let connected = tokio::select! {
                r = connect_async_with_config(url.as_str(), Some(ws_config), false) => r,
                _ = cancel.cancelled() => break,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    self.transition(ConnectionState::Connected);
                    info!("Connected. Forwarding requests to {}", self.config.local_base());
                    match self.serve_connection(ws_stream, &cancel).await {
                        Ok(()) => info!("Tunnel connection closed"),
                        Err(e) => warn!("Tunnel connection lost: {:#}", e),
                    }
                }
                Err(e) => warn!("Failed to connect to relay: {}", e),
            }

            if cancel.is_cancelled() {
                break;
            }
            self.transition(ConnectionState::Disconnected);
            info!("Reconnecting in {:?}...", self.config.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.transition(ConnectionState::Stopped);
        info!("Tunnel client stopped");
    }

    /// Receive loop for one connection. Returns when the relay closes the
    /// socket or on cancellation; transport errors are returned.
    ///
    /// Pings are answered by tungstenite.
    async fn serve_connection(&self, ws_stream: WsStream, cancel: &CancellationToken) -> Result<()> {
        let (write, mut read) = ws_stream.split();
        let write: SharedSink = Arc::new(Mutex::new(write));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text, &write),
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Shutting down...");
                    let _ = write.lock().await.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Hand one frame to its own task so a slow backend call never stalls
    /// the receive loop.
    fn dispatch(&self, text: &str, write: &SharedSink) {
        let request = match RequestEnvelope::from_json(text) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let http = self.http.clone();
        let local_base = self.config.local_base();
        let max_body = self.config.max_body_size;
        let max_frame = self.config.max_frame_size();
        let write = write.clone();

        tokio::spawn(async move {
            info!("Proxying {} {} to {}", request.method, request.path, local_base);
            let response = proxy::replay(&http, &local_base, max_body, &request).await;

            let text = match encode_reply(&response, max_frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!(id = %request.id, error = %e, "Failed to encode response");
                    return;
                }
            };
            let mut sink = write.lock().await;
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!(id = %request.id, error = %e, "Failed to send response");
            }
        });
    }
}

/// Encode a reply, swapping in a 502 when the frame would exceed the
/// connection's message limit (oversized headers can still get there).
fn encode_reply(response: &ResponseEnvelope, max_frame: usize) -> backhaul_shared::Result<String> {
    let text = response.to_json()?;
    if text.len() <= max_frame {
        return Ok(text);
    }
    warn!(id = %response.id, bytes = text.len(), limit = max_frame, "Response too large for the tunnel");
    ResponseEnvelope::bad_gateway(&response.id, "response too large for the tunnel").to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_shared::Headers;

    #[test]
    fn test_encode_reply_within_limit() {
        let resp = ResponseEnvelope::new("r1", 200, Headers::new(), Some(b"hello"));
        let text = encode_reply(&resp, 4096).unwrap();
        assert_eq!(ResponseEnvelope::from_json(&text).unwrap(), resp);
    }

    #[test]
    fn test_encode_reply_oversize_becomes_502() {
        let mut headers = Headers::new();
        headers.insert("X-Huge".into(), "y".repeat(8192));
        let resp = ResponseEnvelope::new("r2", 200, headers, None);

        let text = encode_reply(&resp, 4096).unwrap();
        assert!(text.len() <= 4096);
        let sent = ResponseEnvelope::from_json(&text).unwrap();
        assert_eq!(sent.id, "r2");
        assert_eq!(sent.status_code, 502);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ClientConfig { local_port: 0, ..Default::default() };
        assert!(TunnelClient::new(config).is_err());
    }

    #[test]
    fn test_starts_disconnected() {
        let client = TunnelClient::new(ClientConfig::default()).unwrap();
        assert_eq!(*client.subscribe().borrow(), ConnectionState::Disconnected);
    }
}
