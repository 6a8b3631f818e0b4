//! Interop relay against a real WebSocket peer standing in for the backend.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use vc_service::backend::run_interop_relay;
use vc_test_utils::TestRig;

async fn next_event<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for an interop event")
            .expect("relay closed the link")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_relay_publishes_events_and_applies_commands() {
    let mut rig = TestRig::new();
    let events = rig.take_interop_events();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    let relay = tokio::spawn(run_interop_relay(
        Some(url),
        events,
        rig.controller.clone(),
        cancel.clone(),
    ));

    let (stream, _) = listener.accept().await.unwrap();
    let mut backend = tokio_tungstenite::accept_async(stream).await.unwrap();

    let (mut alice, _) = rig.join("alice", "chan-1").await;

    let join = next_event(&mut backend).await;
    assert_eq!(join["type"], "media_presence");
    assert_eq!(join["event"], "join");
    assert_eq!(join["userId"], "alice");
    assert_eq!(join["channelId"], "chan-1");

    let sync = next_event(&mut backend).await;
    assert_eq!(sync["type"], "channel_presence_sync");
    assert_eq!(sync["userIds"], json!(["alice"]));

    // Unknown commands are ignored, force_disconnect is applied
    backend
        .send(Message::Text(json!({"type": "reboot"}).to_string()))
        .await
        .unwrap();
    backend
        .send(Message::Text(
            json!({"type": "force_disconnect", "userId": "alice", "channelId": "chan-1"})
                .to_string(),
        ))
        .await
        .unwrap();

    let frame = alice.expect("force_disconnect").await;
    assert!(!frame["reason"].as_str().unwrap().is_empty());
    alice.expect_closed().await;

    let leave = loop {
        let event = next_event(&mut backend).await;
        if event["type"] == "media_presence" {
            break event;
        }
    };
    assert_eq!(leave["event"], "leave");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_relay_without_url_drains_until_cancelled() {
    let mut rig = TestRig::new();
    let events = rig.take_interop_events();
    let cancel = CancellationToken::new();

    let relay = tokio::spawn(run_interop_relay(
        None,
        events,
        rig.controller.clone(),
        cancel.clone(),
    ));

    let (_alice, _) = rig.join("alice", "chan-1").await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not stop")
        .unwrap();
}
