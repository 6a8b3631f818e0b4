//! Media engine boundary.
//!
//! The SFU itself (ICE, DTLS/SRTP, RTP forwarding) runs out of process. This
//! module defines the capability set the coordinator consumes:
//!
//! - [`MediaEngine`] - async trait over the engine's operations
//! - [`remote::RemoteMediaEngine`] - HTTP/JSON client for the engine worker
//! - [`network`] - listener selection by client network family, ICE rewriting
//! - [`types`] - transport, producer, consumer and capability types
//!
//! Engine handles are id-based. Closing is best-effort: [`release`] never
//! returns an error, failures are logged and counted.

pub mod network;
pub mod remote;
pub mod types;

pub use types::{
    ConsumerInfo, IceCandidate, MediaKind, ProducerInfo, RtpCapabilities, TransportListener,
    TransportParams,
};

use crate::errors::VcError;
use crate::observability::metrics;

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Operations the coordinator needs from the SFU engine.
///
/// Implementations must be cheap to share (`Arc<dyn MediaEngine>`) and safe to
/// call concurrently from many connection tasks.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router RTP capabilities, forwarded verbatim to clients.
    async fn router_rtp_capabilities(&self) -> Result<Value, VcError>;

    /// Create a WebRTC transport on the given listener.
    async fn create_transport(
        &self,
        listener: &TransportListener,
        ice_servers: &[Value],
    ) -> Result<TransportParams, VcError>;

    /// Complete the DTLS handshake parameters for a transport.
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), VcError>;

    /// Create a producer on a transport.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerInfo, VcError>;

    /// Whether a consumer with these capabilities can receive the producer.
    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, VcError>;

    /// Create a consumer of `producer_id` on a transport.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, VcError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), VcError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), VcError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), VcError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), VcError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), VcError>;
}

/// Engine resources evicted from the registries and awaiting close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasedResources {
    pub transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
}

impl ReleasedResources {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    /// Total number of handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len() + self.producers.len() + self.consumers.len()
    }

    /// Move everything from `other` into `self`.
    pub fn merge(&mut self, other: ReleasedResources) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }
}

/// Close every resource, consumers first, then producers, then transports.
///
/// Failures are swallowed: a close error must never propagate past here.
pub async fn release(engine: &dyn MediaEngine, resources: ReleasedResources) {
    if resources.is_empty() {
        return;
    }

    debug!(
        target: "vc.media",
        transports = resources.transports.len(),
        producers = resources.producers.len(),
        consumers = resources.consumers.len(),
        "Releasing media resources"
    );

    for consumer_id in &resources.consumers {
        if let Err(e) = engine.close_consumer(consumer_id).await {
            warn!(target: "vc.media", consumer_id = %consumer_id, error = %e, "Failed to close consumer");
            metrics::record_engine_close_failure("consumer");
        }
    }

    for producer_id in &resources.producers {
        if let Err(e) = engine.close_producer(producer_id).await {
            warn!(target: "vc.media", producer_id = %producer_id, error = %e, "Failed to close producer");
            metrics::record_engine_close_failure("producer");
        }
    }

    for transport_id in &resources.transports {
        if let Err(e) = engine.close_transport(transport_id).await {
            warn!(target: "vc.media", transport_id = %transport_id, error = %e, "Failed to close transport");
            metrics::record_engine_close_failure("transport");
        }
    }
}

/// Release in a detached task so the caller never waits on engine I/O.
pub fn spawn_release(engine: &Arc<dyn MediaEngine>, resources: ReleasedResources) {
    if resources.is_empty() {
        return;
    }
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        release(engine.as_ref(), resources).await;
    });
}
