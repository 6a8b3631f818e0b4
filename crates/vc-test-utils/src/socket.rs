//! In-memory WebSocket client.
//!
//! Drives `run_session` over a pair of unbounded channels instead of a real
//! socket, so tests see exactly the frames the connection actor writes.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use vc_service::media::network::NetworkFamily;
use vc_service::signaling::session::{run_session, Identity};
use vc_service::signaling::SessionContext;

/// How long `expect` waits for a frame before failing the test.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of an in-memory socket.
pub struct TestClient {
    to_server: mpsc::UnboundedSender<Result<Message, Infallible>>,
    from_server: mpsc::UnboundedReceiver<Message>,
    session: JoinHandle<()>,
}

impl TestClient {
    /// Open a socket with the given query values.
    #[must_use]
    pub fn connect(ctx: SessionContext, auth: Option<&str>, channel_id: Option<&str>) -> Self {
        Self::connect_from(ctx, auth, channel_id, NetworkFamily::Ipv4)
    }

    #[must_use]
    pub fn connect_from(
        ctx: SessionContext,
        auth: Option<&str>,
        channel_id: Option<&str>,
        family: NetworkFamily,
    ) -> Self {
        let (to_server, server_stream) = mpsc::unbounded();
        let (server_sink, from_server) = mpsc::unbounded();
        let identity = Identity::from_query(
            auth.map(ToString::to_string),
            channel_id.map(ToString::to_string),
        );

        let session = tokio::spawn(run_session(
            ctx,
            identity,
            family,
            server_sink,
            server_stream,
        ));

        Self {
            to_server,
            from_server,
            session,
        }
    }

    pub fn send(&self, message: Message) {
        let _ = self.to_server.unbounded_send(Ok(message));
    }

    pub fn send_text(&self, text: &str) {
        self.send(Message::Text(text.to_string()));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(&value.to_string());
    }

    /// Next frame from the server, `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(FRAME_TIMEOUT, self.from_server.next())
            .await
            .expect("timed out waiting for a server frame")
    }

    /// Next JSON frame. Pings are skipped; `None` on close.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"))
                }
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    /// Skip frames until one of `frame_type` arrives.
    pub async fn expect(&mut self, frame_type: &str) -> Value {
        loop {
            match self.next_json().await {
                Some(frame) if frame["type"] == frame_type => return frame,
                Some(_) => {}
                None => panic!("socket closed while waiting for {frame_type}"),
            }
        }
    }

    /// The very next JSON frame, which must be of `frame_type`.
    pub async fn expect_next(&mut self, frame_type: &str) -> Value {
        let frame = self
            .next_json()
            .await
            .unwrap_or_else(|| panic!("socket closed while waiting for {frame_type}"));
        assert_eq!(frame["type"], frame_type, "unexpected frame: {frame}");
        frame
    }

    /// Drain until the server closes the socket.
    pub async fn expect_closed(&mut self) {
        while self.next_json().await.is_some() {}
    }

    /// Whether a frame is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.from_server.try_recv().ok()
    }

    /// Close from the client side and wait for the session task to finish.
    pub async fn disconnect(self) {
        self.to_server.close_channel();
        let _ = tokio::time::timeout(FRAME_TIMEOUT, self.session).await;
    }

    /// Drop the socket without waiting.
    pub fn abort(self) {
        self.to_server.close_channel();
    }

    // ------------------------------------------------------------------
    // Request helpers
    // ------------------------------------------------------------------

    /// Announce capabilities and wait for the ack.
    pub async fn announce_capabilities(&mut self) {
        self.send_json(&json!({
            "type": "client-rtp-capabilities",
            "data": crate::fixtures::client_capabilities(),
        }));
        self.expect("rtp-capabilities-ack").await;
    }

    /// Create a transport and return its id.
    pub async fn create_transport(&mut self) -> String {
        self.send_json(&json!({"type": "create-transport"}));
        let params = self.expect("transport-params").await;
        params["data"]["id"]
            .as_str()
            .expect("transport-params without id")
            .to_string()
    }

    /// Produce audio on a transport and return the producer id.
    pub async fn produce(&mut self, transport_id: &str) -> String {
        self.send_json(&json!({
            "type": "produce",
            "data": {
                "transportId": transport_id,
                "kind": "audio",
                "rtpParameters": {"codecs": [{"mimeType": "audio/opus"}]},
            },
        }));
        let frame = self.expect("producer-id").await;
        frame["data"]["id"]
            .as_str()
            .expect("producer-id without id")
            .to_string()
    }
}
