//! Per-connection session task.
//!
//! One task per WebSocket drives the session state machine:
//!
//! 1. **Connecting**: identity comes from the `auth` and `channelId` query
//!    parameters; a missing one is rejected before anything else happens
//! 2. **Validating**: the backend decides whether the user may open media
//!    in the channel
//! 3. **Active**: the connection is joined to its channel (fresh or
//!    restored) and inbound frames are dispatched one at a time
//! 4. **Staged**: when the read loop ends, the channel stages the
//!    participant and keeps its media for the grace window
//!
//! Media-engine calls happen here, never inside the channel actor. Each
//! result is committed through the channel afterwards; a commit that finds
//! the connection gone fails with `Stale` and the fresh engine handle is
//! closed again.

use super::protocol::{
    ClientMessage, CloseTransportRequest, ConnectTransportRequest, ConsumeRequest,
    FlowControlRequest, ProduceRequest, ServerMessage, TransportIdData, TransportRef,
};
use super::SessionContext;
use crate::actors::{ChannelActorHandle, ConnectionActor, ConnectionActorHandle, JoinRequest};
use crate::errors::{ConsumeRejection, VcError};
use crate::media::network::NetworkFamily;
use crate::media::{self, ReleasedResources, RtpCapabilities};
use crate::observability::metrics as prom;
use crate::registry::{ConsumeTarget, ConsumerEntry, ProducerEntry, StageReason};

use axum::extract::ws::Message;
use futures::future::join_all;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Who the socket claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub channel_id: String,
}

impl Identity {
    /// Build an identity from the raw query values.
    ///
    /// # Errors
    ///
    /// `MissingIdentity` if either value is absent or empty.
    pub fn from_query(auth: Option<String>, channel_id: Option<String>) -> Result<Self, VcError> {
        match (auth, channel_id) {
            (Some(user_id), Some(channel_id)) if !user_id.is_empty() && !channel_id.is_empty() => {
                Ok(Self {
                    user_id,
                    channel_id,
                })
            }
            _ => Err(VcError::MissingIdentity),
        }
    }
}

/// Run one socket from accept to disconnect.
///
/// `sink` and `stream` are the two halves of the WebSocket.
#[instrument(skip_all, name = "vc.signaling.session", fields(family = %family))]
pub async fn run_session<S, R, E>(
    ctx: SessionContext,
    identity: Result<Identity, VcError>,
    family: NetworkFamily,
    mut sink: S,
    stream: R,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "vc.signaling", "Socket rejected: missing identity");
            reject(&mut sink, &e).await;
            return;
        }
    };

    if let Err(e) = ctx
        .validator
        .validate(&identity.user_id, &identity.channel_id)
        .await
    {
        info!(
            target: "vc.signaling",
            user_id = %identity.user_id,
            channel_id = %identity.channel_id,
            error = %e,
            "Channel validation rejected socket"
        );
        reject(&mut sink, &e).await;
        return;
    }

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (connection, _task) = ConnectionActor::spawn(
        connection_id.clone(),
        identity.user_id.clone(),
        identity.channel_id.clone(),
        sink,
        ctx.controller.child_token(),
        Arc::clone(&ctx.metrics),
    );

    let outcome = match ctx
        .controller
        .join(JoinRequest {
            channel_id: identity.channel_id.clone(),
            user_id: identity.user_id.clone(),
            family,
            connection: connection.clone(),
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(
                target: "vc.signaling",
                connection_id = %connection_id,
                error = %e,
                "Join refused"
            );
            prom::record_error(e.error_type_label());
            connection.close(Some(ServerMessage::error(&e)));
            return;
        }
    };

    let mut session = Session {
        ctx,
        channel: outcome.channel,
        connection,
        connection_id,
        user_id: identity.user_id,
        channel_id: identity.channel_id,
        family,
    };
    session.read_loop(stream).await;
}

/// Send a rejection frame straight to the socket and close it.
async fn reject<S>(sink: &mut S, err: &VcError)
where
    S: Sink<Message> + Unpin,
{
    prom::record_error(err.error_type_label());
    let _ = sink
        .send(Message::Text(ServerMessage::error(err).to_json()))
        .await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// An Active connection.
struct Session {
    ctx: SessionContext,
    channel: ChannelActorHandle,
    connection: ConnectionActorHandle,
    connection_id: String,
    user_id: String,
    channel_id: String,
    family: NetworkFamily,
}

impl Session {
    async fn read_loop<R, E>(&mut self, mut stream: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        loop {
            let frame = tokio::select! {
                () = self.connection.closed() => {
                    debug!(
                        target: "vc.signaling",
                        connection_id = %self.connection_id,
                        "Connection closed by server"
                    );
                    break;
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if !self.handle_text(&text).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => self.fail(&VcError::MalformedJson),
                Some(Ok(Message::Pong(_))) => {
                    let _ = self.channel.heartbeat(self.connection_id.clone()).await;
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(
                        target: "vc.signaling",
                        connection_id = %self.connection_id,
                        error = %e,
                        "Socket read failed"
                    );
                    break;
                }
            }
        }

        // A no-op when the channel already removed or staged this connection.
        if let Err(e) = self
            .channel
            .disconnected(self.connection_id.clone(), StageReason::Close)
            .await
        {
            debug!(
                target: "vc.signaling",
                connection_id = %self.connection_id,
                error = %e,
                "Channel gone before disconnect"
            );
        }
        self.connection.cancel();
    }

    /// Handle one text frame. Returns false if the socket must close.
    async fn handle_text(&mut self, text: &str) -> bool {
        let start = Instant::now();

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.fail(&e);
                return true;
            }
        };

        let label = message.type_label();
        let result = self.dispatch(message).await;
        prom::record_message_latency(label, start.elapsed());

        match result {
            Ok(()) => true,
            Err(e) if e.closes_connection() => {
                prom::record_error(e.error_type_label());
                self.connection.close(Some(ServerMessage::error(&e)));
                false
            }
            Err(e) => {
                self.fail(&e);
                true
            }
        }
    }

    /// Report a recoverable failure with exactly one error frame.
    fn fail(&self, err: &VcError) {
        match err {
            VcError::Engine { .. } | VcError::Internal(_) => warn!(
                target: "vc.signaling",
                connection_id = %self.connection_id,
                error = %err,
                "Request failed"
            ),
            _ => debug!(
                target: "vc.signaling",
                connection_id = %self.connection_id,
                error = %err,
                "Request rejected"
            ),
        }
        prom::record_error(err.error_type_label());
        self.connection.send(ServerMessage::error(err));
    }

    fn reply(&self, message: ServerMessage) {
        self.connection.send(message);
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<(), VcError> {
        match message {
            ClientMessage::Ping => {
                self.channel.heartbeat(self.connection_id.clone()).await?;
                self.reply(ServerMessage::pong_now());
                Ok(())
            }
            ClientMessage::Pong => self.channel.heartbeat(self.connection_id.clone()).await,
            ClientMessage::ClientRtpCapabilities(payload) => {
                self.announce_capabilities(&payload).await
            }
            ClientMessage::GetRtpCapabilities => {
                let data = self.ctx.engine.router_rtp_capabilities().await?;
                self.reply(ServerMessage::RtpCapabilities { data });
                Ok(())
            }
            ClientMessage::CreateTransport => self.create_transport().await,
            ClientMessage::ConnectTransport(request) => self.connect_transport(request).await,
            ClientMessage::Produce(request) => self.produce(request).await,
            ClientMessage::Consume(request) => self.consume(request).await,
            ClientMessage::Resume(request) => self.flow_control(request, true).await,
            ClientMessage::Pause(request) => self.flow_control(request, false).await,
            ClientMessage::CloseTransport(request) => self.close_transport(request).await,
        }
    }

    async fn announce_capabilities(&self, payload: &serde_json::Value) -> Result<(), VcError> {
        let capabilities = RtpCapabilities::normalize(payload)?;
        let catch_up = self
            .channel
            .announce_capabilities(self.connection_id.clone(), capabilities, true)
            .await?;
        self.reply(ServerMessage::RtpCapabilitiesAck);

        if !catch_up.is_empty() {
            debug!(
                target: "vc.signaling",
                connection_id = %self.connection_id,
                producers = catch_up.len(),
                "Creating catch-up consumers"
            );
            self.auto_consume(catch_up).await;
        }
        Ok(())
    }

    async fn create_transport(&self) -> Result<(), VcError> {
        let listener = self.ctx.listeners.select(self.family);
        let mut params = self
            .ctx
            .engine
            .create_transport(&listener, &self.ctx.ice_servers)
            .await?;
        self.ctx
            .listeners
            .rewrite_ice_candidates(&listener, &mut params.ice_candidates);

        if let Err(e) = self
            .channel
            .add_transport(self.connection_id.clone(), params.id.clone())
            .await
        {
            self.discard(ReleasedResources {
                transports: vec![params.id],
                ..ReleasedResources::default()
            });
            return Err(e);
        }

        debug!(
            target: "vc.signaling",
            connection_id = %self.connection_id,
            transport_id = %params.id,
            family = %listener.family,
            "Transport created"
        );
        self.reply(ServerMessage::TransportParams { data: params });
        Ok(())
    }

    async fn connect_transport(&self, request: ConnectTransportRequest) -> Result<(), VcError> {
        let named = request.transport_id.is_some();
        let transport_ids = self
            .channel
            .plan_connect(self.connection_id.clone(), request.transport_id)
            .await?;

        if named {
            for transport_id in &transport_ids {
                self.ctx
                    .engine
                    .connect_transport(transport_id, &request.dtls_parameters)
                    .await?;
            }
            let data = transport_ids
                .into_iter()
                .next()
                .map(|id| TransportRef { id });
            self.reply(ServerMessage::TransportConnected { data });
            return Ok(());
        }

        // Without an id every transport is tried; one success is enough.
        let mut last_error = None;
        let mut connected = 0usize;
        for transport_id in &transport_ids {
            match self
                .ctx
                .engine
                .connect_transport(transport_id, &request.dtls_parameters)
                .await
            {
                Ok(()) => connected += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if connected == 0 => Err(e),
            _ => {
                self.reply(ServerMessage::TransportConnected { data: None });
                Ok(())
            }
        }
    }

    async fn produce(&self, request: ProduceRequest) -> Result<(), VcError> {
        let prepared = self
            .channel
            .prepare_produce(self.connection_id.clone(), request.transport_id)
            .await?;

        // The previous producer is gone before the new one exists.
        media::release(self.ctx.engine.as_ref(), prepared.evicted).await;

        let producer = self
            .ctx
            .engine
            .produce(&prepared.transport_id, request.kind, &request.rtp_parameters)
            .await?;

        let targets = match self
            .channel
            .set_producer(
                self.connection_id.clone(),
                ProducerEntry {
                    id: producer.id.clone(),
                    transport_id: prepared.transport_id,
                    kind: producer.kind,
                },
            )
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                self.discard(ReleasedResources {
                    producers: vec![producer.id],
                    ..ReleasedResources::default()
                });
                return Err(e);
            }
        };

        info!(
            target: "vc.signaling",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            channel_id = %self.channel_id,
            producer_id = %producer.id,
            auto_consumers = targets.len(),
            "Producer created"
        );

        self.auto_consume(targets).await;
        Ok(())
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<(), VcError> {
        if let Some(raw) = &request.rtp_capabilities {
            let capabilities = RtpCapabilities::normalize(raw)?;
            self.channel
                .announce_capabilities(self.connection_id.clone(), capabilities, false)
                .await?;
        }

        let named = request.producer_id.is_some();
        let plan = self
            .channel
            .plan_consume(
                self.connection_id.clone(),
                request.transport_id,
                request.producer_id,
            )
            .await?;

        let mut delivered = plan.existing.len();
        for (existing, user_id) in plan.existing {
            self.reply(ServerMessage::ConsumerParams {
                data: super::protocol::ConsumerParams {
                    id: existing.id,
                    producer_id: existing.producer_id,
                    kind: existing.kind,
                    rtp_parameters: existing.rtp_parameters,
                    user_id,
                },
            });
        }

        let mut first_error = None;
        for target in plan.targets {
            match self.create_consumer(target).await {
                Ok(()) => delivered += 1,
                Err(e) if named => return Err(e),
                Err(e) => {
                    debug!(
                        target: "vc.signaling",
                        connection_id = %self.connection_id,
                        error = %e,
                        "Skipping producer"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Create one consumer and hand it to the channel, which delivers
    /// `consumer-params` to the target connection.
    async fn create_consumer(&self, target: ConsumeTarget) -> Result<(), VcError> {
        let compatible = self
            .ctx
            .engine
            .can_consume(&target.producer_id, &target.rtp_capabilities)
            .await?;
        if !compatible {
            return Err(ConsumeRejection::IncompatibleCapabilities.into());
        }

        let consumer = self
            .ctx
            .engine
            .consume(
                &target.transport_id,
                &target.producer_id,
                &target.rtp_capabilities,
            )
            .await?;

        self.channel
            .add_consumer(
                target.connection_id,
                ConsumerEntry {
                    id: consumer.id,
                    producer_id: consumer.producer_id,
                    transport_id: target.transport_id,
                    kind: consumer.kind,
                    rtp_parameters: consumer.rtp_parameters,
                },
                target.producer_user_id,
            )
            .await
    }

    /// Best-effort consumer creation for other peers; one failure never
    /// blocks the rest.
    async fn auto_consume(&self, targets: Vec<ConsumeTarget>) {
        let attempts = targets.into_iter().map(|target| {
            let connection_id = target.connection_id.clone();
            async move { (connection_id, self.create_consumer(target).await) }
        });

        for (connection_id, result) in join_all(attempts).await {
            let outcome = match &result {
                Ok(()) => "created",
                Err(VcError::ConsumeRejected(ConsumeRejection::IncompatibleCapabilities)) => {
                    "incompatible"
                }
                Err(VcError::Stale) => "stale",
                Err(_) => "failed",
            };
            prom::record_auto_consume(outcome);

            if let Err(e) = result {
                debug!(
                    target: "vc.signaling",
                    connection_id = %connection_id,
                    outcome,
                    error = %e,
                    "Auto-consume skipped"
                );
            }
        }
    }

    async fn flow_control(&self, request: FlowControlRequest, resume: bool) -> Result<(), VcError> {
        let consumer_ids = self
            .channel
            .plan_flow_control(
                self.connection_id.clone(),
                request.transport_id.clone(),
                request.consumer_id,
            )
            .await?;

        for consumer_id in &consumer_ids {
            if resume {
                self.ctx.engine.resume_consumer(consumer_id).await?;
            } else {
                self.ctx.engine.pause_consumer(consumer_id).await?;
            }
        }

        let data = TransportIdData::new(&request.transport_id);
        self.reply(if resume {
            ServerMessage::Resumed { data }
        } else {
            ServerMessage::Paused { data }
        });
        Ok(())
    }

    async fn close_transport(&self, request: CloseTransportRequest) -> Result<(), VcError> {
        self.channel
            .close_transport(self.connection_id.clone(), request.transport_id.clone())
            .await?;
        self.reply(ServerMessage::TransportClosed {
            data: TransportIdData::new(&request.transport_id),
        });
        Ok(())
    }

    /// Close engine handles whose commit was refused.
    fn discard(&self, resources: ReleasedResources) {
        debug!(
            target: "vc.signaling",
            connection_id = %self.connection_id,
            handles = resources.len(),
            "Discarding uncommitted media"
        );
        media::spawn_release(&self.ctx.engine, resources);
    }
}
