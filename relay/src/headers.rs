//! Header translation between HTTP messages and envelopes.
//!
//! Headers pass through verbatim in both directions; only hop-by-hop
//! headers and names/values the HTTP stack rejects are left behind.

use axum::http::HeaderMap;
use backhaul_shared::headers::{insert_header, is_hop_by_hop};
use backhaul_shared::Headers;
use hyper::header::{HeaderName, HeaderValue};
use tracing::debug;

/// Collapse an inbound request's headers into an envelope map.
///
/// Repeated values are joined with `", "`.
pub fn collect_request_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for name in map.keys() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let values: Vec<&str> = map
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        insert_header(&mut headers, name.as_str(), values.join(", "));
    }
    headers
}

/// Write envelope response headers onto an outgoing response.
pub fn apply_response_headers(target: &mut HeaderMap, headers: &Headers) {
    for (k, v) in headers {
        if is_hop_by_hop(k) {
            continue;
        }
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            (Ok(hn), Ok(hv)) => {
                target.insert(hn, hv);
            }
            _ => debug!(header = %k, "Skipping invalid response header"),
        }
    }
}
