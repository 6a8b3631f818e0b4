//! Mock media engine for session and channel tests.
//!
//! Hands out sequential ids (`t1`, `p1`, `c1`, ...) and records every call
//! so tests can assert which handles were created and closed.
//!
//! # Example
//!
//! ```rust,ignore
//! use vc_test_utils::MockMediaEngine;
//!
//! let engine = MockMediaEngine::builder()
//!     .incompatible_producer("p2")
//!     .fail_connect()
//!     .build();
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use vc_service::errors::{EngineAction, VcError};
use vc_service::media::{
    ConsumerInfo, IceCandidate, MediaEngine, MediaKind, ProducerInfo, RtpCapabilities,
    TransportListener, TransportParams,
};

/// Calls observed by the mock.
#[derive(Debug, Default, Clone)]
pub struct EngineLog {
    pub transports_created: Vec<String>,
    /// Listener used for each created transport, in order.
    pub listeners: Vec<TransportListener>,
    pub transports_connected: Vec<String>,
    pub producers_created: Vec<String>,
    /// `(consumer_id, transport_id, producer_id)`
    pub consumers_created: Vec<(String, String, String)>,
    pub paused: Vec<String>,
    pub resumed: Vec<String>,
    pub transports_closed: Vec<String>,
    pub producers_closed: Vec<String>,
    pub consumers_closed: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    next_transport: u64,
    next_producer: u64,
    next_consumer: u64,
    log: EngineLog,
}

/// Scripted in-memory media engine.
#[derive(Debug, Clone)]
pub struct MockMediaEngine {
    state: Arc<Mutex<State>>,
    incompatible: Arc<HashSet<String>>,
    fail_connect: bool,
    fail_produce: bool,
    fail_consume: bool,
    unreachable: bool,
    candidate_port: u16,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    /// Snapshot of the call log.
    #[must_use]
    pub fn log(&self) -> EngineLog {
        self.state.lock().unwrap().log.clone()
    }

    /// Ids of every closed handle, in close order per kind.
    #[must_use]
    pub fn closed(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let log = self.log();
        (
            log.transports_closed,
            log.producers_closed,
            log.consumers_closed,
        )
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn check_reachable(&self, action: EngineAction) -> Result<(), VcError> {
        if self.unreachable {
            Err(VcError::engine(action, "engine unreachable"))
        } else {
            Ok(())
        }
    }
}

/// Builder for `MockMediaEngine`.
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    incompatible: HashSet<String>,
    fail_connect: bool,
    fail_produce: bool,
    fail_consume: bool,
    unreachable: bool,
    candidate_port: Option<u16>,
}

impl MockMediaEngineBuilder {
    /// `can_consume` answers false for this producer.
    #[must_use]
    pub fn incompatible_producer(mut self, producer_id: impl Into<String>) -> Self {
        self.incompatible.insert(producer_id.into());
        self
    }

    #[must_use]
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    #[must_use]
    pub fn fail_produce(mut self) -> Self {
        self.fail_produce = true;
        self
    }

    #[must_use]
    pub fn fail_consume(mut self) -> Self {
        self.fail_consume = true;
        self
    }

    /// Every call fails, as if the engine were down.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Port placed on generated ICE candidates.
    #[must_use]
    pub fn candidate_port(mut self, port: u16) -> Self {
        self.candidate_port = Some(port);
        self
    }

    #[must_use]
    pub fn build(self) -> MockMediaEngine {
        MockMediaEngine {
            state: Arc::new(Mutex::new(State::default())),
            incompatible: Arc::new(self.incompatible),
            fail_connect: self.fail_connect,
            fail_produce: self.fail_produce,
            fail_consume: self.fail_consume,
            unreachable: self.unreachable,
            candidate_port: self.candidate_port.unwrap_or(40000),
        }
    }
}

/// Router capabilities the mock reports.
#[must_use]
pub fn router_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "preferredPayloadType": 100
        }],
        "headerExtensions": []
    })
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    async fn router_rtp_capabilities(&self) -> Result<Value, VcError> {
        self.check_reachable(EngineAction::GetCapabilities)?;
        Ok(router_capabilities())
    }

    async fn create_transport(
        &self,
        listener: &TransportListener,
        _ice_servers: &[Value],
    ) -> Result<TransportParams, VcError> {
        self.check_reachable(EngineAction::CreateTransport)?;
        let address = listener
            .announced_address
            .unwrap_or(listener.listen_ip)
            .to_string();
        let port = self.candidate_port;

        let id = self.with_state(|s| {
            s.next_transport += 1;
            let id = format!("t{}", s.next_transport);
            s.log.transports_created.push(id.clone());
            s.log.listeners.push(listener.clone());
            id
        });

        Ok(TransportParams {
            id,
            ice_parameters: json!({"usernameFragment": "frag", "password": "pwd"}),
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                address,
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
                extra: serde_json::Map::new(),
            }],
            dtls_parameters: json!({"role": "auto", "fingerprints": []}),
            sctp_parameters: None,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: &Value,
    ) -> Result<(), VcError> {
        self.check_reachable(EngineAction::ConnectTransport)?;
        if self.fail_connect {
            return Err(VcError::engine(EngineAction::ConnectTransport, "dtls failed"));
        }
        self.with_state(|s| s.log.transports_connected.push(transport_id.to_string()));
        Ok(())
    }

    async fn produce(
        &self,
        _transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerInfo, VcError> {
        self.check_reachable(EngineAction::Produce)?;
        if self.fail_produce {
            return Err(VcError::engine(EngineAction::Produce, "produce failed"));
        }
        let id = self.with_state(|s| {
            s.next_producer += 1;
            let id = format!("p{}", s.next_producer);
            s.log.producers_created.push(id.clone());
            id
        });
        Ok(ProducerInfo {
            id,
            kind,
            rtp_parameters: rtp_parameters.clone(),
        })
    }

    async fn can_consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, VcError> {
        self.check_reachable(EngineAction::CheckCapabilities)?;
        Ok(!self.incompatible.contains(producer_id))
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, VcError> {
        self.check_reachable(EngineAction::Consume)?;
        if self.fail_consume {
            return Err(VcError::engine(EngineAction::Consume, "consume failed"));
        }
        let id = self.with_state(|s| {
            s.next_consumer += 1;
            let id = format!("c{}", s.next_consumer);
            s.log.consumers_created.push((
                id.clone(),
                transport_id.to_string(),
                producer_id.to_string(),
            ));
            id
        });
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: json!({"codecs": [{"mimeType": "audio/opus"}]}),
        })
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        self.check_reachable(EngineAction::Pause)?;
        self.with_state(|s| s.log.paused.push(consumer_id.to_string()));
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        self.check_reachable(EngineAction::Resume)?;
        self.with_state(|s| s.log.resumed.push(consumer_id.to_string()));
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), VcError> {
        self.with_state(|s| s.log.transports_closed.push(transport_id.to_string()));
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), VcError> {
        self.with_state(|s| s.log.producers_closed.push(producer_id.to_string()));
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        self.with_state(|s| s.log.consumers_closed.push(consumer_id.to_string()));
        Ok(())
    }
}
