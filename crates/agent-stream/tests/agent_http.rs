//! End-to-end checks against a local HTTP server that speaks the client
//! agent's fs and stats endpoints. The "direct" address points at a closed
//! port so every session has to fall back to the proxied server.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_stream::{
    PollOutcome, PollingTracker, ReadMode, ReqwestIssuer, ResourceHandle, ResourceLimits,
    StaticAddresses, StatsTarget, StreamConfig, TransportState, ViewEvent, ViewSession,
};
use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use tokio::net::TcpListener;

const TOKEN: &str = "secret-token";
const STDOUT: &str = "booting\nlistening on :8080\n";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value == format!("Bearer {TOKEN}"))
}

async fn stat(headers: HeaderMap, Path(_alloc): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    axum::Json(json!({
        "Name": "stdout",
        "IsDir": false,
        "Size": STDOUT.len(),
        "FileMode": "-rw-r--r--",
        "ModTime": "2024-01-01T00:00:00Z",
        "ContentType": "text/plain",
    }))
    .into_response()
}

async fn cat(
    headers: HeaderMap,
    Path(alloc): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if alloc != "alloc-1" || query.get("path").map(String::as_str) != Some("web/stdout") {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    }
    STDOUT.into_response()
}

async fn stream_file(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let start: u64 = query
        .get("offset")
        .and_then(|offset| offset.parse().ok())
        .unwrap_or_default();
    let lines = ["first\n", "second\n"];
    let mut offset = start;
    let mut frames = Vec::new();
    for line in lines {
        offset += line.len() as u64;
        let frame = json!({ "Offset": offset, "Data": STANDARD.encode(line) });
        frames.push(Ok::<_, Infallible>(Bytes::from(frame.to_string())));
    }
    frames.push(Ok(Bytes::from_static(b"{}")));
    let body = stream::iter(frames).chain(stream::pending());
    Response::new(Body::from_stream(body))
}

async fn node_stats(Query(query): Query<HashMap<String, String>>) -> Response {
    if query.get("node_id").map(String::as_str) != Some("node-1") {
        return StatusCode::NOT_FOUND.into_response();
    }
    axum::Json(json!({
        "Timestamp": 1_700_000_000_000_000_000u64,
        "CPUTicksConsumed": 500.0,
        "Memory": { "Total": 4096, "Available": 3072, "Used": 1024, "Free": 3072 },
        "Uptime": 10,
    }))
    .into_response()
}

async fn spawn_agent() -> String {
    let router = Router::new()
        .route("/v1/client/fs/stat/:alloc", get(stat))
        .route("/v1/client/fs/cat/:alloc", get(cat))
        .route("/v1/client/fs/stream/:alloc", get(stream_file))
        .route("/v1/client/stats", get(node_stats));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind agent listener");
    let addr = listener.local_addr().expect("agent addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}/v1/client")
}

fn addresses(proxied: &str) -> Arc<StaticAddresses> {
    Arc::new(StaticAddresses::new(Some("http://127.0.0.1:1/v1/client"), proxied).expect("addresses"))
}

fn issuer() -> Arc<ReqwestIssuer> {
    Arc::new(ReqwestIssuer::new().expect("client").with_bearer_token(TOKEN))
}

#[tokio::test]
async fn head_read_falls_back_to_proxy_over_http() {
    let proxied = spawn_agent().await;
    let mut view = ViewSession::new(
        ResourceHandle::file("alloc-1", "web/stdout"),
        issuer(),
        addresses(&proxied),
        StreamConfig::default(),
    )
    .expect("session");

    view.open(ReadMode::Head).await.expect("head read");

    let state = view.state();
    assert_eq!(state.content, STDOUT);
    assert_eq!(state.known_size, Some(STDOUT.len() as u64));
    assert_eq!(state.transport_state, TransportState::Proxied);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn missing_credential_is_reported_as_error() {
    let proxied = spawn_agent().await;
    let mut view = ViewSession::new(
        ResourceHandle::file("alloc-1", "web/stdout"),
        Arc::new(ReqwestIssuer::new().expect("client")),
        addresses(&proxied),
        StreamConfig::default(),
    )
    .expect("session");

    assert!(view.open(ReadMode::Head).await.is_err());
    let state = view.state();
    assert!(state.error.is_some());
    assert!(!state.no_connection);
    assert_eq!(state.transport_state, TransportState::Proxied);
}

#[tokio::test]
async fn follow_decodes_streamed_frames() {
    let proxied = spawn_agent().await;
    let mut view = ViewSession::new(
        ResourceHandle::file("alloc-1", "web/stdout"),
        issuer(),
        addresses(&proxied),
        StreamConfig::default(),
    )
    .expect("session");
    let mut events = view.subscribe();

    view.open(ReadMode::Follow).await.expect("follow");

    let mut appended = Vec::new();
    while appended.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("stream event")
            .expect("event channel");
        if let ViewEvent::Appended(text) = event {
            appended.push(text);
        }
    }
    assert_eq!(appended, vec!["first\n", "second\n"]);
    assert!(view.state().is_streaming);

    view.close().await;
    assert!(!view.state().is_streaming);
}

#[tokio::test]
async fn node_telemetry_is_polled_through_proxy() {
    let proxied = spawn_agent().await;
    let tracker = PollingTracker::new(
        issuer(),
        addresses(&proxied).as_ref(),
        StatsTarget::Node("node-1".into()),
        ResourceLimits {
            cpu_mhz: 1000,
            memory_bytes: 4096,
        },
        &StreamConfig::default(),
    );

    assert_eq!(tracker.poll().await, PollOutcome::Appended);
    let memory = tracker.memory();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].used, 1024);
    assert_eq!(memory[0].percent, 0.25);
    assert_eq!(tracker.cpu()[0].percent, 0.5);
    assert_eq!(tracker.transport_state(), TransportState::Proxied);
}
