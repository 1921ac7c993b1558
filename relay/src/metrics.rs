//! Metrics Collection for Backhaul Relay
//!
//! Atomic counters and a latency ring buffer, reported inside the
//! `GET /` info document.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Requests that went through the tunnel (any outcome)
    forwarded: AtomicU64,
    /// Status code counts
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Request/response body bytes
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Fast-failed with 503 because no client was attached
    rejected_no_session: AtomicU64,
    /// Round trips that hit the deadline
    timeouts: AtomicU64,
    sessions_accepted: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub forwarded: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rejected_no_session: u64,
    pub timeouts: u64,
    pub sessions_accepted: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub latency_avg_us: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                forwarded: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                rejected_no_session: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                sessions_accepted: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a request that made the tunnel round trip (or tried to)
    pub async fn record_request(&self, status: u16, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_no_session(&self) {
        self.inner.rejected_no_session.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.inner.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let lat = self.inner.latencies.lock().await;
        let (p50, p95, p99, avg) = (
            lat.percentile(50.0),
            lat.percentile(95.0),
            lat.percentile(99.0),
            lat.average(),
        );
        drop(lat);

        MetricsSnapshot {
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            status_2xx: self.inner.status_2xx.load(Ordering::Relaxed),
            status_3xx: self.inner.status_3xx.load(Ordering::Relaxed),
            status_4xx: self.inner.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.inner.status_5xx.load(Ordering::Relaxed),
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            rejected_no_session: self.inner.rejected_no_session.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            sessions_accepted: self.inner.sessions_accepted.load(Ordering::Relaxed),
            latency_p50_us: p50,
            latency_p95_us: p95,
            latency_p99_us: p99,
            latency_avg_us: avg,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
