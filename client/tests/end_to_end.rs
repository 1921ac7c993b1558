//! End-to-end tests: public caller → relay → tunnel client → backend.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use backhaul::{ClientConfig, ConnectionState, TunnelClient};
use backhaul_relay::{serve, AppState, RelayConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn backend_handler(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    match uri.path() {
        "/bytes" => {
            let mut resp = body.into_response();
            if let Some(ct) = headers.get(CONTENT_TYPE) {
                resp.headers_mut().insert(CONTENT_TYPE, ct.clone());
            }
            resp
        }
        "/teapot" => (StatusCode::IM_A_TEAPOT, "short and stout").into_response(),
        "/redirect" => (StatusCode::FOUND, [(LOCATION, "/elsewhere")]).into_response(),
        "/large" => vec![b'z'; 64 * 1024].into_response(),
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "slow done".into_response()
        }
        _ => {
            let x_test = headers.get("x-test").and_then(|v| v.to_str().ok()).unwrap_or("");
            let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
            format!("{} {} {}", method, path, x_test).into_response()
        }
    }
}

async fn start_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(backend_handler);
    tokio::spawn(async move { axum::serve(listener, app).await });
    addr
}

async fn start_relay_on(listener: TcpListener) -> (AppState, JoinHandle<anyhow::Result<()>>) {
    let state = AppState::new(RelayConfig {
        bind: listener.local_addr().unwrap(),
        request_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    let handle = tokio::spawn(serve(listener, state.clone()));
    (state, handle)
}

fn client_config(relay: SocketAddr, backend_port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("http://{}", relay),
        local_port: backend_port,
        reconnect_delay: Duration::from_millis(100),
        backend_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

type Running = (CancellationToken, tokio::sync::watch::Receiver<ConnectionState>, JoinHandle<()>);

fn start_client(relay: SocketAddr, backend_port: u16) -> Running {
    start_client_with(client_config(relay, backend_port))
}

fn start_client_with(config: ClientConfig) -> Running {
    let client = TunnelClient::new(config).unwrap();
    let states = client.subscribe();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { client.run(token).await });
    (cancel, states, handle)
}

async fn wait_for_session(state: &AppState) {
    for _ in 0..500 {
        if state.sessions.current().await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tunnel client never attached");
}

struct Harness {
    relay: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        let backend = start_backend().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = listener.local_addr().unwrap();
        let (state, _) = start_relay_on(listener).await;
        let (cancel, _, _) = start_client(relay, backend.port());
        wait_for_session(&state).await;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        Self { relay, state, cancel, http }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.relay, path)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.state.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_echo_scenario() {
    let h = Harness::start().await;
    let resp = h.http.get(h.url("/foo?x=1")).header("X-Test", "abc").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "GET /foo?x=1 abc");
}

#[tokio::test]
async fn test_binary_body_fidelity() {
    let h = Harness::start().await;
    let payload: Vec<u8> = (0..10 * 1024).map(|_| rand::random::<u8>()).collect();

    let resp = h
        .http
        .post(h.url("/bytes"))
        .header("Content-Type", "application/octet-stream")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "application/octet-stream");
    assert_eq!(resp.headers().get("content-length").unwrap(), "10240");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), payload.as_slice());
}

#[tokio::test]
async fn test_status_and_redirect_passthrough() {
    let h = Harness::start().await;

    let teapot = h.http.get(h.url("/teapot")).send().await.unwrap();
    assert_eq!(teapot.status(), 418);
    assert_eq!(teapot.text().await.unwrap(), "short and stout");

    let redirect = h.http.get(h.url("/redirect")).send().await.unwrap();
    assert_eq!(redirect.status(), 302);
    assert_eq!(redirect.headers().get("location").unwrap(), "/elsewhere");
}

#[tokio::test]
async fn test_concurrent_requests_correlate() {
    let h = Harness::start().await;

    let calls = (0..20).map(|i| {
        let http = h.http.clone();
        let url = h.url(&format!("/item/{}?n={}", i, i));
        let slow = i % 4 == 0;
        async move {
            let url = if slow { url.replace("/item/", "/slow?item=") } else { url };
            let resp = http.get(&url).header("X-Test", format!("caller-{}", i)).send().await.unwrap();
            (i, slow, resp.text().await.unwrap())
        }
    });

    for (i, slow, body) in futures_util::future::join_all(calls).await {
        if slow {
            assert_eq!(body, "slow done");
        } else {
            assert_eq!(body, format!("GET /item/{}?n={} caller-{}", i, i, i));
        }
    }
    assert!(h.state.pending.is_empty());
}

#[tokio::test]
async fn test_slow_backend_does_not_block_others() {
    let h = Harness::start().await;

    let slow = {
        let http = h.http.clone();
        let url = h.url("/slow");
        tokio::spawn(async move { http.get(&url).send().await.unwrap().text().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let fast = h.http.get(h.url("/fast")).send().await.unwrap().text().await.unwrap();
    assert_eq!(fast, "GET /fast ");
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(slow.await.unwrap(), "slow done");
}

#[tokio::test]
async fn test_backend_down_returns_502() {
    let dead_port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = listener.local_addr().unwrap();
    let (state, _) = start_relay_on(listener).await;
    let (cancel, _, _) = start_client(relay, dead_port);
    wait_for_session(&state).await;

    let resp = reqwest::get(format!("http://{}/api", relay)).await.unwrap();
    assert_eq!(resp.status(), 502);
    assert!(resp.text().await.unwrap().starts_with("Bad Gateway: "));

    // The tunnel stays up after a failed forward.
    assert!(state.sessions.current().await.is_some());
    cancel.cancel();
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_client_reconnects_after_relay_restart() {
    let backend = start_backend().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = listener.local_addr().unwrap();

    let (first, first_handle) = start_relay_on(listener).await;
    let (cancel, mut states, _) = start_client(relay, backend.port());
    wait_for_session(&first).await;
    let resp = reqwest::get(format!("http://{}/one", relay)).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "GET /one ");

    // Take the relay down; the client drops back to reconnecting.
    first.shutdown.cancel();
    first_handle.await.unwrap().unwrap();
    states.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();

    // Same address, fresh relay.
    let listener = TcpListener::bind(relay).await.unwrap();
    let (second, _) = start_relay_on(listener).await;
    wait_for_session(&second).await;

    let resp = reqwest::get(format!("http://{}/two", relay)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "GET /two ");

    cancel.cancel();
    second.shutdown.cancel();
}

#[tokio::test]
async fn test_client_retries_until_relay_appears() {
    let backend = start_backend().await;
    let relay = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };

    let (cancel, mut states, _) = start_client(relay, backend.port());
    states.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();

    let listener = TcpListener::bind(relay).await.unwrap();
    let (state, _) = start_relay_on(listener).await;
    wait_for_session(&state).await;

    let resp = reqwest::get(format!("http://{}/late", relay)).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "GET /late ");

    cancel.cancel();
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_stops_client_and_detaches() {
    let backend = start_backend().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = listener.local_addr().unwrap();
    let (state, _) = start_relay_on(listener).await;
    let (cancel, states, handle) = start_client(relay, backend.port());
    wait_for_session(&state).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert_eq!(*states.borrow(), ConnectionState::Stopped);

    for _ in 0..200 {
        if state.sessions.current().await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(state.sessions.current().await.is_none());

    let resp = reqwest::get(format!("http://{}/gone", relay)).await.unwrap();
    assert_eq!(resp.status(), 503);
    state.shutdown.cancel();
}

#[tokio::test]
async fn test_oversize_backend_response_becomes_502() {
    let backend = start_backend().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = listener.local_addr().unwrap();
    let (state, _) = start_relay_on(listener).await;
    let config = ClientConfig {
        max_body_size: 16 * 1024,
        ..client_config(relay, backend.port())
    };
    let (cancel, _, _) = start_client_with(config);
    wait_for_session(&state).await;
    let session = state.sessions.current().await.unwrap().id();

    let resp = reqwest::get(format!("http://{}/large", relay)).await.unwrap();
    assert_eq!(resp.status(), 502);
    assert!(resp.text().await.unwrap().contains("too large"));

    // Same session keeps serving.
    let resp = reqwest::get(format!("http://{}/after", relay)).await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "GET /after ");
    assert_eq!(state.sessions.current().await.unwrap().id(), session);

    cancel.cancel();
    state.shutdown.cancel();
}
