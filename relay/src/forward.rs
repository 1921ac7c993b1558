//! Request forwarding through the attached tunnel session.

use axum::{
    body::Body,
    extract::State,
    http::{header::RETRY_AFTER, Request, StatusCode},
    response::{IntoResponse, Response},
};
use backhaul_shared::protocol::RETRY_AFTER_SECS;
use backhaul_shared::{RequestEnvelope, ResponseEnvelope};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::headers::{apply_response_headers, collect_request_headers};
use crate::pending::WaitError;
use crate::AppState;

/// Fallback handler: every request that is not tunnel-control traffic.
pub async fn forward_request(State(state): State<AppState>, req: Request<Body>) -> Response {
    let started = Instant::now();

    // Fail fast without creating a pending entry.
    let Some(session) = state.sessions.current().await else {
        state.metrics.record_no_session();
        return no_session_response();
    };

    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_request_headers(&parts.headers);

    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Failed to buffer request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };
    let body = (!body_bytes.is_empty()).then(|| &body_bytes[..]);

    let envelope = RequestEnvelope::new(method, path, headers, body);
    let text = match envelope.to_json() {
        Ok(t) => t,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response();
        }
    };

    // Register before sending so a fast reply always finds its entry.
    let pending = state.pending.register(envelope.id.clone(), state.config.request_timeout);
    let deadline = pending.deadline();

    let response = match tokio::time::timeout_at(deadline, session.send_text(text)).await {
        Ok(Ok(())) => {
            debug!(id = %envelope.id, method = %envelope.method, path = %envelope.path, session = session.id(), "Request forwarded");
            match pending.wait().await {
                Ok(resp) => build_response(resp),
                Err(WaitError::Timeout) | Err(WaitError::Abandoned) => {
                    warn!(id = %envelope.id, path = %envelope.path, "Tunnel round trip timed out");
                    state.metrics.record_timeout();
                    timeout_response()
                }
            }
        }
        Ok(Err(e)) => {
            warn!(id = %envelope.id, error = %e, "Tunnel send failed");
            (StatusCode::BAD_GATEWAY, "Tunnel send failed").into_response()
        }
        Err(_) => {
            warn!(id = %envelope.id, "Timed out waiting for the tunnel send lock");
            state.metrics.record_timeout();
            timeout_response()
        }
    };

    state
        .metrics
        .record_request(
            response.status().as_u16(),
            started.elapsed().as_micros() as u64,
            body_bytes.len() as u64,
            body_len_hint(&response),
        )
        .await;

    response
}

/// Translate a response envelope into the public-facing HTTP response.
pub fn build_response(resp: ResponseEnvelope) -> Response {
    let status = match StatusCode::from_u16(resp.status_code) {
        Ok(s) => s,
        Err(_) => {
            warn!(id = %resp.id, status = resp.status_code, "Invalid status in tunnel response");
            return (StatusCode::BAD_GATEWAY, "Invalid tunnel response").into_response();
        }
    };
    let body = match resp.body() {
        Ok(b) => b.unwrap_or_default(),
        Err(e) => {
            warn!(id = %resp.id, error = %e, "Undecodable body in tunnel response");
            return (StatusCode::BAD_GATEWAY, "Invalid tunnel response").into_response();
        }
    };

    let mut builder = hyper::Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        apply_response_headers(headers_mut, &resp.headers);
    }
    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

fn no_session_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
        "Tunnel client disconnected. Start the tunnel client so requests reach the backend, then retry.",
    )
        .into_response()
}

fn timeout_response() -> Response {
    (StatusCode::GATEWAY_TIMEOUT, "Tunnel client timeout.").into_response()
}

fn body_len_hint(response: &Response) -> u64 {
    use axum::body::HttpBody;
    response.body().size_hint().exact().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_shared::Headers;

    #[tokio::test]
    async fn test_build_response_passes_through() {
        let mut h = Headers::new();
        h.insert("Content-Type".into(), "text/plain".into());
        let resp = build_response(ResponseEnvelope::new("r", 201, h, Some(b"created")));

        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"created");
    }

    #[test]
    fn test_build_response_rejects_bad_status() {
        let resp = build_response(ResponseEnvelope::new("r", 42, Headers::new(), None));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_build_response_rejects_bad_body() {
        let mut env = ResponseEnvelope::new("r", 200, Headers::new(), None);
        env.body_base64 = Some("!!".into());
        assert_eq!(build_response(env).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_no_session_has_retry_after() {
        let resp = no_session_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), "5");
    }
}
