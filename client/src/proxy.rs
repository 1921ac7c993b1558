//! Local proxy for replaying tunnel requests against the backend

use std::time::Duration;

use anyhow::{Context, Result};
use backhaul_shared::headers::{insert_header, is_hop_by_hop};
use backhaul_shared::{Headers, RequestEnvelope, ResponseEnvelope};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{redirect, Method};
use tracing::{debug, warn};

/// HTTP client shared by every replayed request.
///
/// Redirects are handed back to the public caller instead of followed.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(redirect::Policy::none())
        .build()
        .context("Failed to build HTTP client")
}

/// Replay `req` against the backend. Never fails: any error becomes a
/// 502 envelope so the tunnel itself stays up.
pub async fn replay(
    http: &reqwest::Client,
    local_base: &str,
    max_body: usize,
    req: &RequestEnvelope,
) -> ResponseEnvelope {
    match forward(http, local_base, max_body, req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(id = %req.id, "Error forwarding {} {}: {:#}", req.method, req.path, e);
            ResponseEnvelope::bad_gateway(&req.id, &format!("{:#}", e))
        }
    }
}

/// Forward one request to the backend and capture the full response.
///
/// Response bodies over `max_body` bytes are refused.
pub async fn forward(
    http: &reqwest::Client,
    local_base: &str,
    max_body: usize,
    req: &RequestEnvelope,
) -> Result<ResponseEnvelope> {
    let method = Method::from_bytes(req.method.as_bytes())
        .with_context(|| format!("Invalid method '{}'", req.method))?;
    let url = format!("{}{}", local_base.trim_end_matches('/'), normalize_path(&req.path));

    let mut request = http.request(method, &url).headers(outbound_headers(&req.headers));
    if let Some(body) = req.body()? {
        request = request.body(body);
    }

    let mut resp = request.send().await.with_context(|| format!("Request to {} failed", url))?;
    let status = resp.status().as_u16();
    let mut headers = collect_headers(resp.headers());
    if let Some(ct) = resp.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        insert_header(&mut headers, "Content-Type", ct);
    }

    if let Some(len) = resp.content_length() {
        if len > max_body as u64 {
            anyhow::bail!("Response body too large ({} bytes, limit {})", len, max_body);
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.context("Failed to read backend response")? {
        if body.len() + chunk.len() > max_body {
            anyhow::bail!("Response body too large (over {} bytes)", max_body);
        }
        body.extend_from_slice(&chunk);
    }

    debug!(id = %req.id, status, bytes = body.len(), "Backend responded");
    Ok(ResponseEnvelope::new(&req.id, status, headers, Some(&body[..])))
}

/// Make an envelope path absolute: `?a=1` → `/?a=1`, `foo` → `/foo`.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Envelope headers minus `Host` (the backend supplies its own) and
/// hop-by-hop headers. Names or values reqwest rejects are skipped.
fn outbound_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("host") || is_hop_by_hop(k) {
            continue;
        }
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!(header = %k, "Skipping invalid request header"),
        }
    }
    map
}

fn collect_headers(map: &HeaderMap) -> Headers {
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
        if !values.is_empty() {
            insert_header(&mut headers, name.as_str(), values.join(", "));
        }
    }
    headers
}
