//! Pending-request table
//!
//! Correlates in-flight HTTP requests with the response envelope that
//! will eventually come back over the tunnel session.

use std::sync::Arc;
use std::time::Duration;

use backhaul_shared::ResponseEnvelope;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct PendingEntry {
    tx: oneshot::Sender<ResponseEnvelope>,
    deadline: Instant,
}

/// Why a pending request finished without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no response before the deadline")]
    Timeout,
    #[error("entry removed without a response")]
    Abandoned,
}

/// Map from correlation id to the waiter for that id.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` that expires after `timeout`.
    ///
    /// The entry lives as long as the returned guard.
    pub fn register(&self, id: String, timeout: Duration) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.entries.insert(id.clone(), PendingEntry { tx, deadline });
        PendingRequest {
            id,
            rx,
            deadline,
            table: self.clone(),
        }
    }

    /// Complete the waiter matching `response.id`.
    ///
    /// Returns false for unknown ids (timed out, cancelled, or bogus).
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        match self.entries.remove(&response.id) {
            Some((_, entry)) => entry.tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose deadline has passed. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.deadline > now;
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }
}

/// Guard for one registered entry. Dropping it removes the entry, so an
/// aborted HTTP caller never leaks a table slot.
pub struct PendingRequest {
    id: String,
    rx: oneshot::Receiver<ResponseEnvelope>,
    deadline: Instant,
    table: PendingTable,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the matching response until the deadline.
    pub async fn wait(mut self) -> Result<ResponseEnvelope, WaitError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.entries.remove(&self.id);
    }
}
