//! Tunnel session management for Backhaul Relay
//!
//! At most one tunnel client is attached at a time. A newly accepted
//! connection replaces the previous one, which is abandoned rather than
//! closed.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use backhaul_shared::{Error, ResponseEnvelope, Result};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::pending::PendingTable;
use crate::AppState;

/// Unique session identifier
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// Outbound half of an attached tunnel connection.
pub struct Session {
    id: SessionId,
    connected_at: DateTime<Utc>,
    /// Send lock: one frame on the wire at a time.
    sink: Mutex<FrameSink>,
}

impl Session {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
            sink: Mutex::new(Box::pin(sink)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Write one text frame, holding the send lock for the duration.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| Error::Connection(format!("session {}: {}", self.id, e)))
    }
}

/// Single slot holding the current session.
#[derive(Default)]
pub struct SessionSlot {
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` as current, returning whatever it replaced.
    pub async fn install(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.current.write().await.replace(session)
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.read().await.clone()
    }

    /// Clear the slot only if it still holds session `id`.
    pub async fn clear_if(&self, id: SessionId) -> bool {
        let mut current = self.current.write().await;
        match current.as_ref() {
            Some(session) if session.id == id => {
                *current = None;
                true
            }
            _ => false,
        }
    }
}

/// Run an upgraded tunnel connection until the peer goes away or the
/// relay shuts down.
///
/// Pings are answered by the WebSocket layer itself.
pub async fn accept_session(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let session = Arc::new(Session::new(sink));
    let id = session.id();

    match state.sessions.install(session.clone()).await {
        Some(previous) => info!(session = id, previous = previous.id(), "Tunnel session replaced"),
        None => info!(session = id, "Tunnel session attached"),
    }
    state.metrics.session_opened();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(&state.pending, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session = id, error = %e, "Tunnel session read failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = state.shutdown.cancelled() => break,
        }
    }

    if state.sessions.clear_if(id).await {
        info!(session = id, "Tunnel session detached");
    } else {
        debug!(session = id, "Superseded tunnel session closed");
    }
}

/// Route one inbound text frame to its pending request.
///
/// Malformed frames and unknown ids are dropped.
pub fn handle_frame(pending: &PendingTable, text: &str) {
    match ResponseEnvelope::from_json(text) {
        Ok(resp) => {
            let id = resp.id.clone();
            if !pending.resolve(resp) {
                debug!(id = %id, "No pending request for response, dropped");
            }
        }
        Err(e) => debug!(error = %e, "Dropping malformed frame"),
    }
}
