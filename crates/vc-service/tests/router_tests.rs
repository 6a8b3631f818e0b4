//! HTTP router tests: health checks, metrics, the upgrade guard and a full
//! WebSocket round trip over a real TCP listener.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::{SinkExt, Stream, StreamExt};
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tower::util::ServiceExt;
use vc_service::observability::health::LIVENESS_BODY;
use vc_service::observability::HealthState;
use vc_service::routes::build_routes;
use vc_test_utils::TestRig;

fn app(rig: &TestRig, health: Arc<HealthState>) -> Router {
    let handle = PrometheusBuilder::new().build_recorder().handle();
    build_routes(rig.ctx.clone(), health, handle)
}

#[tokio::test]
async fn test_health_and_ready() {
    let rig = TestRig::new();
    let health = Arc::new(HealthState::new());

    let response = app(&rig, Arc::clone(&health))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), LIVENESS_BODY.as_bytes());

    let response = app(&rig, Arc::clone(&health))
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    health.set_ready();
    let response = app(&rig, Arc::clone(&health))
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_renders() {
    let rig = TestRig::new();
    let response = app(&rig, Arc::new(HealthState::new()))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_socket_without_upgrade_returns_426() {
    let rig = TestRig::new();
    let response = app(&rig, Arc::new(HealthState::new()))
        .oneshot(
            Request::builder()
                .uri("/socket?auth=alice&channelId=chan-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    assert!(rig.validator.calls().is_empty());
}

// ============================================================================
// Real sockets
// ============================================================================

async fn serve(rig: &TestRig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(rig, Arc::new(HealthState::new()));
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_json<S>(socket: &mut S) -> Option<Value>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn next_of_type<S>(socket: &mut S, frame_type: &str) -> Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = next_json(socket)
            .await
            .unwrap_or_else(|| panic!("socket closed while waiting for {frame_type}"));
        if frame["type"] == frame_type {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let rig = TestRig::new();
    let addr = serve(&rig).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/socket?auth=alice&channelId=chan-1"))
            .await
            .unwrap();

    let connected = next_of_type(&mut socket, "connected").await;
    assert_eq!(connected["data"]["userId"], "alice");

    socket
        .send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    next_of_type(&mut socket, "pong").await;

    socket
        .send(Message::Text(json!({"type": "create-transport"}).to_string()))
        .await
        .unwrap();
    let params = next_of_type(&mut socket, "transport-params").await;
    assert_eq!(params["data"]["id"], "t1");

    socket.close(None).await.unwrap();

    // Closing the socket stages the participant
    let mut staged = false;
    for _ in 0..50 {
        let state = rig.controller.channel_state("chan-1").await.unwrap().unwrap();
        if state.staged_users == vec!["alice".to_string()] {
            staged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(staged);
}

#[tokio::test]
async fn test_websocket_missing_identity_gets_error_then_close() {
    let rig = TestRig::new();
    let addr = serve(&rig).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/socket?auth=alice"))
        .await
        .unwrap();

    let error = next_json(&mut socket).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"], "Missing auth or channelId in query params");
    assert!(next_json(&mut socket).await.is_none());
}
