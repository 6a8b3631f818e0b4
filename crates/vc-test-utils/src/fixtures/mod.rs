//! Pre-configured test rig.
//!
//! Wires a `ChannelControllerHandle` to the mock engine and validator and
//! builds the `SessionContext` sockets run against.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use vc_service::actors::{ActorMetrics, ChannelContext, ChannelControllerHandle};
use vc_service::backend::{InteropEvent, InteropPublisher};
use vc_service::media::network::{ListenerPlan, NetworkFamily};
use vc_service::signaling::SessionContext;

use crate::mock_engine::MockMediaEngine;
use crate::mock_validator::MockValidator;
use crate::socket::TestClient;

/// Announced IPv4 address of the test listener.
pub const ANNOUNCED_IPV4: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

/// Grace window used unless a test overrides it.
pub const DEFAULT_TEST_GRACE: Duration = Duration::from_secs(60);

/// Client capabilities with a single Opus codec.
#[must_use]
pub fn client_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        }],
        "headerExtensions": []
    })
}

/// Everything a signaling test needs.
pub struct TestRig {
    pub engine: MockMediaEngine,
    pub validator: MockValidator,
    pub controller: ChannelControllerHandle,
    pub ctx: SessionContext,
    pub interop_events: mpsc::UnboundedReceiver<InteropEvent>,
}

impl TestRig {
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> TestRigBuilder {
        TestRigBuilder::default()
    }

    /// Open a socket for `user_id` in `channel_id`.
    #[must_use]
    pub fn connect(&self, user_id: &str, channel_id: &str) -> TestClient {
        TestClient::connect(self.ctx.clone(), Some(user_id), Some(channel_id))
    }

    /// Open a socket and wait for `connected`.
    pub async fn join(&self, user_id: &str, channel_id: &str) -> (TestClient, Value) {
        let mut client = self.connect(user_id, channel_id);
        let connected = client.expect("connected").await;
        (client, connected)
    }

    /// Presence as the channel sees it, empty if the channel does not exist.
    pub async fn presence(&self, channel_id: &str) -> Vec<String> {
        self.controller
            .channel_state(channel_id)
            .await
            .ok()
            .flatten()
            .map(|state| state.presence)
            .unwrap_or_default()
    }

    /// Hand the interop queue to a relay under test.
    pub fn take_interop_events(&mut self) -> mpsc::UnboundedReceiver<InteropEvent> {
        std::mem::replace(&mut self.interop_events, mpsc::unbounded_channel().1)
    }

    /// Drain interop events published so far.
    pub fn drain_interop(&mut self) -> Vec<InteropEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.interop_events.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct TestRigBuilder {
    engine: Option<MockMediaEngine>,
    validator: Option<MockValidator>,
    grace: Option<Duration>,
    public_port: Option<u16>,
}

impl TestRigBuilder {
    #[must_use]
    pub fn engine(mut self, engine: MockMediaEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: MockValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    #[must_use]
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Rewrite ICE candidates from port 40000 to this public port.
    #[must_use]
    pub fn public_port(mut self, port: u16) -> Self {
        self.public_port = Some(port);
        self
    }

    #[must_use]
    pub fn build(self) -> TestRig {
        let engine = self.engine.unwrap_or_default();
        let validator = self.validator.unwrap_or_default();
        let (interop, interop_events) = InteropPublisher::channel();
        let metrics = ActorMetrics::new();

        let controller = ChannelControllerHandle::new(
            "vc-test".to_string(),
            ChannelContext {
                engine: Arc::new(engine.clone()),
                interop,
                metrics: Arc::clone(&metrics),
                disconnect_grace: self.grace.unwrap_or(DEFAULT_TEST_GRACE),
            },
        );

        let listeners = ListenerPlan::new(
            Some(IpAddr::V4(ANNOUNCED_IPV4)),
            None,
            Some(40000),
            NetworkFamily::Ipv4,
            self.public_port,
        );

        let ctx = SessionContext {
            controller: controller.clone(),
            validator: Arc::new(validator.clone()),
            engine: Arc::new(engine.clone()),
            listeners: Arc::new(listeners),
            ice_servers: Arc::new(vec![json!({"urls": "stun:stun.example.org:3478"})]),
            metrics,
        };

        TestRig {
            engine,
            validator,
            controller,
            ctx,
            interop_events,
        }
    }
}
