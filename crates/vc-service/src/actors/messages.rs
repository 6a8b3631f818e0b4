//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::channel::ChannelActorHandle;
use super::connection::ConnectionActorHandle;
use crate::errors::VcError;
use crate::media::network::NetworkFamily;
use crate::media::{ReleasedResources, RtpCapabilities};
use crate::registry::{
    ConnectionId, ConsumePlan, ConsumeTarget, ConsumerEntry, ProducerEntry, RestoreSummary,
    StageReason,
};
use crate::signaling::protocol::ServerMessage;

use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `ChannelControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Route a validated connection to its channel, creating it on first use.
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, VcError>>,
    },

    /// Run a liveness sweep on every channel and reap idle ones.
    Sweep {
        threshold: Duration,
        respond_to: oneshot::Sender<SweepSummary>,
    },

    /// Close and finalize a user's connections in one channel.
    ForceDisconnect {
        channel_id: String,
        user_id: String,
        reason: String,
        respond_to: oneshot::Sender<usize>,
    },

    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Look up the actor of a live channel.
    GetChannel {
        channel_id: String,
        respond_to: oneshot::Sender<Option<ChannelActorHandle>>,
    },

    /// Stop accepting joins and cancel every channel.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },
}

/// Messages sent to `ChannelActor`.
///
/// Every request carrying a `connection_id` fails with `VcError::Stale` once
/// that connection has left the Active state.
#[derive(Debug)]
pub enum ChannelMessage {
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, VcError>>,
    },

    /// The socket closed. Stages the participant.
    Disconnected {
        connection_id: ConnectionId,
        reason: StageReason,
    },

    /// A ping, pong or WebSocket Pong arrived.
    Heartbeat { connection_id: ConnectionId },

    /// Record announced capabilities. With `catch_up`, returns consumers to
    /// create for producers the connection is missing.
    AnnounceCapabilities {
        connection_id: ConnectionId,
        capabilities: RtpCapabilities,
        catch_up: bool,
        respond_to: oneshot::Sender<Result<Vec<ConsumeTarget>, VcError>>,
    },

    AddTransport {
        connection_id: ConnectionId,
        transport_id: String,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    PlanConnect {
        connection_id: ConnectionId,
        transport_id: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, VcError>>,
    },

    /// Pick the produce transport and evict the user's current producer.
    PrepareProduce {
        connection_id: ConnectionId,
        transport_id: Option<String>,
        respond_to: oneshot::Sender<Result<PreparedProduce, VcError>>,
    },

    /// Install a created producer. Returns auto-consume targets.
    SetProducer {
        connection_id: ConnectionId,
        producer: ProducerEntry,
        respond_to: oneshot::Sender<Result<Vec<ConsumeTarget>, VcError>>,
    },

    PlanConsume {
        connection_id: ConnectionId,
        transport_id: Option<String>,
        producer_id: Option<String>,
        respond_to: oneshot::Sender<Result<ConsumePlan, VcError>>,
    },

    /// Install a created consumer and deliver `consumer-params`.
    AddConsumer {
        connection_id: ConnectionId,
        consumer: ConsumerEntry,
        producer_user_id: String,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    PlanFlowControl {
        connection_id: ConnectionId,
        transport_id: String,
        consumer_id: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, VcError>>,
    },

    CloseTransport {
        connection_id: ConnectionId,
        transport_id: String,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    /// A staged participant's grace timer fired.
    StagedExpired { user_id: String, generation: u64 },

    Sweep {
        threshold: Duration,
        respond_to: oneshot::Sender<SweepReport>,
    },

    ForceDisconnect {
        user_id: String,
        reason: String,
        respond_to: oneshot::Sender<usize>,
    },

    GetState {
        respond_to: oneshot::Sender<ChannelState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write a frame to the client.
    Send { message: ServerMessage },

    /// Send a WebSocket Ping; the client's Pong counts as a heartbeat.
    SendPing,

    /// Optionally write a last frame, then close the socket.
    Close { frame: Option<ServerMessage> },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// A validated connection asking to enter its channel.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub channel_id: String,
    pub user_id: String,
    pub family: NetworkFamily,
    pub connection: ConnectionActorHandle,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub channel: ChannelActorHandle,
    /// Present when the join restored a staged participant.
    pub restored: Option<RestoreSummary>,
}

#[derive(Debug, Clone)]
pub struct PreparedProduce {
    pub transport_id: String,
    /// The user's previous producer and its consumers, to close before
    /// creating the new one.
    pub evicted: ReleasedResources,
}

/// One channel's sweep result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub staged: usize,
    pub idle: bool,
}

/// Aggregated sweep result across channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub channels_swept: usize,
    pub staged: usize,
    pub channels_reaped: usize,
}

#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub channel_count: usize,
    pub connection_count: usize,
    pub staged_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Snapshot of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub channel_id: String,
    /// Users with an active connection, sorted.
    pub presence: Vec<String>,
    pub producer_ids: Vec<String>,
    pub connection_count: usize,
    /// Users inside the grace window, sorted.
    pub staged_users: Vec<String>,
}
