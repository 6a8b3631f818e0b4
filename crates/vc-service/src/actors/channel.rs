//! `ChannelActor` - single writer for one channel's state.
//!
//! Each `ChannelActor`:
//! - Owns the [`ChannelRegistry`] for one channel (connections, media,
//!   producer index, staged participants)
//! - Holds the outbound handle of every Active connection and fans out
//!   presence and producer broadcasts
//! - Arms and consumes the grace-window expiry timers
//!
//! The actor never awaits the media engine. Session tasks do the engine I/O
//! and commit results here; handles this actor evicts are closed in
//! detached tasks.
//!
//! # Disconnect Handling
//!
//! When a connection drops or misses heartbeats:
//! 1. It leaves presence at once and its media moves to a staged snapshot
//! 2. Nothing is closed; an expiry timer runs for the grace window
//! 3. A rejoin inside the window restores the snapshot to the new connection
//! 4. Otherwise the snapshot is finalized and every handle is closed

use super::connection::ConnectionActorHandle;
use super::messages::{
    ChannelMessage, ChannelState, JoinOutcome, JoinRequest, PreparedProduce, SweepReport,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::backend::{InteropPublisher, PresenceEvent};
use crate::errors::VcError;
use crate::media::{self, MediaEngine, ReleasedResources, RtpCapabilities};
use crate::observability::metrics as prom;
use crate::registry::{
    ChannelRegistry, ConnectionId, ConsumePlan, ConsumeTarget, ConsumerEntry, ConsumerInstall,
    ExpiryTimer, ProducerEntry, Registration, StageReason,
};
use crate::signaling::protocol::{
    ConnectedData, ConsumerParams, ProducerIdData, ProducerRef, ServerMessage, CONNECTED_MESSAGE,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the channel mailbox.
const CHANNEL_MAILBOX_BUFFER: usize = 500;

/// Upper bound on closing a channel's media during shutdown.
const SHUTDOWN_RELEASE_DEADLINE: Duration = Duration::from_secs(10);

/// Collaborators shared by every channel.
#[derive(Clone)]
pub struct ChannelContext {
    pub engine: Arc<dyn MediaEngine>,
    pub interop: InteropPublisher,
    pub metrics: Arc<ActorMetrics>,
    pub disconnect_grace: Duration,
}

/// Handle to a `ChannelActor`.
#[derive(Clone, Debug)]
pub struct ChannelActorHandle {
    sender: mpsc::Sender<ChannelMessage>,
    cancel_token: CancellationToken,
    channel_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl ChannelActorHandle {
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ChannelMessage,
    ) -> Result<T, VcError> {
        let (tx, rx) = oneshot::channel();
        self.notify(build(tx)).await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    async fn notify(&self, message: ChannelMessage) -> Result<(), VcError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(message)
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))
    }

    /// Queue a join, handing the reply slot to the channel.
    ///
    /// Used by the controller so it never waits on a channel.
    pub(super) async fn forward_join(
        &self,
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, VcError>>,
    ) {
        let message = ChannelMessage::Join {
            request,
            respond_to,
        };
        self.mailbox.record_enqueue();
        if let Err(mpsc::error::SendError(ChannelMessage::Join { respond_to, .. })) =
            self.sender.send(message).await
        {
            let _ = respond_to.send(Err(VcError::Internal(
                "channel actor unavailable".to_string(),
            )));
        }
    }

    /// Report a closed socket. Stages the participant.
    pub async fn disconnected(
        &self,
        connection_id: ConnectionId,
        reason: StageReason,
    ) -> Result<(), VcError> {
        self.notify(ChannelMessage::Disconnected {
            connection_id,
            reason,
        })
        .await
    }

    pub async fn heartbeat(&self, connection_id: ConnectionId) -> Result<(), VcError> {
        self.notify(ChannelMessage::Heartbeat { connection_id })
            .await
    }

    /// Record capabilities; with `catch_up`, returns consumers to create.
    pub async fn announce_capabilities(
        &self,
        connection_id: ConnectionId,
        capabilities: RtpCapabilities,
        catch_up: bool,
    ) -> Result<Vec<ConsumeTarget>, VcError> {
        self.request(|respond_to| ChannelMessage::AnnounceCapabilities {
            connection_id,
            capabilities,
            catch_up,
            respond_to,
        })
        .await?
    }

    pub async fn add_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: String,
    ) -> Result<(), VcError> {
        self.request(|respond_to| ChannelMessage::AddTransport {
            connection_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    pub async fn plan_connect(
        &self,
        connection_id: ConnectionId,
        transport_id: Option<String>,
    ) -> Result<Vec<String>, VcError> {
        self.request(|respond_to| ChannelMessage::PlanConnect {
            connection_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    pub async fn prepare_produce(
        &self,
        connection_id: ConnectionId,
        transport_id: Option<String>,
    ) -> Result<PreparedProduce, VcError> {
        self.request(|respond_to| ChannelMessage::PrepareProduce {
            connection_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    pub async fn set_producer(
        &self,
        connection_id: ConnectionId,
        producer: ProducerEntry,
    ) -> Result<Vec<ConsumeTarget>, VcError> {
        self.request(|respond_to| ChannelMessage::SetProducer {
            connection_id,
            producer,
            respond_to,
        })
        .await?
    }

    pub async fn plan_consume(
        &self,
        connection_id: ConnectionId,
        transport_id: Option<String>,
        producer_id: Option<String>,
    ) -> Result<ConsumePlan, VcError> {
        self.request(|respond_to| ChannelMessage::PlanConsume {
            connection_id,
            transport_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Install a consumer. On any rejection the channel closes it.
    pub async fn add_consumer(
        &self,
        connection_id: ConnectionId,
        consumer: ConsumerEntry,
        producer_user_id: String,
    ) -> Result<(), VcError> {
        self.request(|respond_to| ChannelMessage::AddConsumer {
            connection_id,
            consumer,
            producer_user_id,
            respond_to,
        })
        .await?
    }

    pub async fn plan_flow_control(
        &self,
        connection_id: ConnectionId,
        transport_id: String,
        consumer_id: Option<String>,
    ) -> Result<Vec<String>, VcError> {
        self.request(|respond_to| ChannelMessage::PlanFlowControl {
            connection_id,
            transport_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn close_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: String,
    ) -> Result<(), VcError> {
        self.request(|respond_to| ChannelMessage::CloseTransport {
            connection_id,
            transport_id,
            respond_to,
        })
        .await?
    }

    /// Stage silent connections and ping the rest.
    pub async fn sweep(&self, threshold: Duration) -> Result<SweepReport, VcError> {
        self.request(|respond_to| ChannelMessage::Sweep {
            threshold,
            respond_to,
        })
        .await
    }

    /// Close and finalize every trace of a user. Returns sockets closed.
    pub async fn force_disconnect(&self, user_id: String, reason: String) -> Result<usize, VcError> {
        self.request(|respond_to| ChannelMessage::ForceDisconnect {
            user_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<ChannelState, VcError> {
        self.request(|respond_to| ChannelMessage::GetState { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ChannelActor` implementation.
pub struct ChannelActor {
    channel_id: String,
    receiver: mpsc::Receiver<ChannelMessage>,
    /// Own handle, given to joiners and expiry timers.
    handle: ChannelActorHandle,
    cancel_token: CancellationToken,
    registry: ChannelRegistry,
    /// Outbound handles of Active connections.
    connections: HashMap<ConnectionId, ConnectionActorHandle>,
    ctx: ChannelContext,
    /// Shared with the handle, which records enqueues.
    mailbox: Arc<MailboxMonitor>,
    next_generation: u64,
}

impl ChannelActor {
    /// Spawn a new channel actor.
    pub fn spawn(
        channel_id: String,
        cancel_token: CancellationToken,
        ctx: ChannelContext,
    ) -> (ChannelActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_MAILBOX_BUFFER);

        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Channel, &channel_id));
        let handle = ChannelActorHandle {
            sender,
            cancel_token: cancel_token.clone(),
            channel_id: channel_id.clone(),
            mailbox: Arc::clone(&mailbox),
        };

        let actor = Self {
            mailbox,
            channel_id,
            receiver,
            handle: handle.clone(),
            cancel_token,
            registry: ChannelRegistry::new(),
            connections: HashMap::new(),
            ctx,
            next_generation: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "vc.actor.channel", fields(channel_id = %self.channel_id))]
    async fn run(mut self) {
        debug!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            "ChannelActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "vc.actor.channel",
                        channel_id = %self.channel_id,
                        "ChannelActor received cancellation signal"
                    );
                    self.shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                            self.ctx.metrics.record_message_processed();
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            messages_processed = self.mailbox.messages_processed(),
            "ChannelActor stopped"
        );
    }

    fn handle_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Join {
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.join(request));
            }

            ChannelMessage::Disconnected {
                connection_id,
                reason,
            } => self.stage_connection(&connection_id, reason),

            ChannelMessage::Heartbeat { connection_id } => {
                if !self.registry.touch_heartbeat(&connection_id, Instant::now()) {
                    debug!(
                        target: "vc.actor.channel",
                        connection_id = %connection_id,
                        "Heartbeat for inactive connection ignored"
                    );
                }
            }

            ChannelMessage::AnnounceCapabilities {
                connection_id,
                capabilities,
                catch_up,
                respond_to,
            } => {
                let result = self
                    .registry
                    .set_capabilities(&connection_id, capabilities)
                    .map(|()| {
                        if catch_up {
                            self.registry.catch_up_targets(&connection_id)
                        } else {
                            Vec::new()
                        }
                    });
                let _ = respond_to.send(result);
            }

            ChannelMessage::AddTransport {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.add_transport(&connection_id, &transport_id));
            }

            ChannelMessage::PlanConnect {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(
                    self.registry
                        .connect_targets(&connection_id, transport_id.as_deref()),
                );
            }

            ChannelMessage::PrepareProduce {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.prepare_produce(&connection_id, transport_id.as_deref()));
            }

            ChannelMessage::SetProducer {
                connection_id,
                producer,
                respond_to,
            } => {
                let _ = respond_to.send(self.set_producer(&connection_id, producer));
            }

            ChannelMessage::PlanConsume {
                connection_id,
                transport_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.plan_consume(
                    &connection_id,
                    transport_id.as_deref(),
                    producer_id.as_deref(),
                ));
            }

            ChannelMessage::AddConsumer {
                connection_id,
                consumer,
                producer_user_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.add_consumer(&connection_id, consumer, producer_user_id));
            }

            ChannelMessage::PlanFlowControl {
                connection_id,
                transport_id,
                consumer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.flow_control_targets(
                    &connection_id,
                    &transport_id,
                    consumer_id.as_deref(),
                ));
            }

            ChannelMessage::CloseTransport {
                connection_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_transport(&connection_id, &transport_id));
            }

            ChannelMessage::StagedExpired {
                user_id,
                generation,
            } => self.finalize(&user_id, generation),

            ChannelMessage::Sweep {
                threshold,
                respond_to,
            } => {
                let _ = respond_to.send(self.sweep(threshold));
            }

            ChannelMessage::ForceDisconnect {
                user_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(self.force_disconnect(&user_id, reason));
            }

            ChannelMessage::GetState { respond_to } => {
                let _ = respond_to.send(ChannelState {
                    channel_id: self.channel_id.clone(),
                    presence: self.registry.presence(),
                    producer_ids: self.registry.producer_ids(),
                    connection_count: self.registry.connection_count(),
                    staged_users: self.registry.staged_users(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    fn join(&mut self, request: JoinRequest) -> Result<JoinOutcome, VcError> {
        let JoinRequest {
            user_id,
            family,
            connection,
            ..
        } = request;

        // The socket died while the join was queued.
        if connection.is_cancelled() {
            return Err(VcError::Stale);
        }

        let connection_id = connection.connection_id().to_string();
        let already_present = !self.registry.connections_of(&user_id).is_empty();

        let registration =
            self.registry
                .register(connection_id.clone(), &user_id, family, Instant::now());
        self.connections
            .insert(connection_id.clone(), connection.clone());
        self.ctx.metrics.connection_registered();

        let restored = match registration {
            Registration::Fresh => {
                prom::record_join("fresh");
                if !already_present {
                    self.ctx
                        .interop
                        .presence(PresenceEvent::Join, &user_id, &self.channel_id);
                }
                None
            }
            Registration::Restored(summary) => {
                prom::record_join("restore");
                prom::record_reconnect_latency(summary.staged_for);
                self.ctx.metrics.participant_unstaged();
                self.ctx
                    .interop
                    .presence(PresenceEvent::Rejoin, &user_id, &self.channel_id);

                info!(
                    target: "vc.actor.channel",
                    channel_id = %self.channel_id,
                    user_id = %user_id,
                    connection_id = %connection_id,
                    staged_for_ms = u64::try_from(summary.staged_for.as_millis()).unwrap_or(u64::MAX),
                    staged_reason = summary.reason.as_str(),
                    transports = summary.transport_ids.len(),
                    "Participant restored from staged state"
                );
                Some(summary)
            }
        };

        self.publish_presence();
        self.broadcast_in_channel();

        connection.send(ServerMessage::Connected {
            data: ConnectedData {
                channel_id: self.channel_id.clone(),
                user_id: user_id.clone(),
                message: CONNECTED_MESSAGE.to_string(),
                restored: restored.is_some(),
                transport_ids: restored.as_ref().map(|s| s.transport_ids.clone()),
                producer_id: restored.as_ref().and_then(|s| s.producer_id.clone()),
            },
        });

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            user_id = %user_id,
            connection_id = %connection_id,
            family = %family,
            restored = restored.is_some(),
            connections = self.registry.connection_count(),
            "Connection joined channel"
        );

        Ok(JoinOutcome {
            channel: self.handle.clone(),
            restored,
        })
    }

    /// Move an Active connection to the staged state.
    fn stage_connection(&mut self, connection_id: &str, reason: StageReason) {
        let Some(user_id) = self
            .registry
            .connection(connection_id)
            .map(|entry| entry.user_id.clone())
        else {
            debug!(
                target: "vc.actor.channel",
                connection_id = %connection_id,
                "Disconnect for inactive connection ignored"
            );
            return;
        };

        self.next_generation += 1;
        let timer = self.arm_expiry(&user_id, self.next_generation);

        let Some(outcome) = self
            .registry
            .stage(connection_id, reason, Instant::now(), timer)
        else {
            return;
        };

        if let Some(connection) = self.connections.remove(connection_id) {
            connection.cancel();
        }
        self.ctx.metrics.connection_unregistered();
        if !outcome.merged {
            self.ctx.metrics.participant_staged();
        }
        prom::record_staged(reason.as_str());
        media::spawn_release(&self.ctx.engine, outcome.released);

        if !outcome.still_present {
            self.ctx
                .interop
                .presence(PresenceEvent::StagedLeave, &user_id, &self.channel_id);
        }

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            user_id = %user_id,
            connection_id = %connection_id,
            reason = reason.as_str(),
            merged = outcome.merged,
            grace_secs = self.ctx.disconnect_grace.as_secs(),
            "Participant staged"
        );

        self.publish_presence();
        self.broadcast_in_channel();
    }

    fn arm_expiry(&self, user_id: &str, generation: u64) -> ExpiryTimer {
        let handle = self.handle.clone();
        let user_id = user_id.to_string();

        ExpiryTimer::arm(
            &self.cancel_token,
            generation,
            self.ctx.disconnect_grace,
            async move {
                let _ = handle
                    .notify(ChannelMessage::StagedExpired {
                        user_id,
                        generation,
                    })
                    .await;
            },
        )
    }

    fn finalize(&mut self, user_id: &str, generation: u64) {
        let Some(outcome) = self.registry.finalize(user_id, generation) else {
            debug!(
                target: "vc.actor.channel",
                channel_id = %self.channel_id,
                user_id = %user_id,
                generation,
                "Stale expiry ignored"
            );
            return;
        };

        self.ctx.metrics.participant_unstaged();
        prom::record_finalized();
        let released_count = outcome.released.len();
        media::spawn_release(&self.ctx.engine, outcome.released);

        if self.registry.connections_of(user_id).is_empty() {
            self.ctx
                .interop
                .presence(PresenceEvent::Leave, user_id, &self.channel_id);
        }

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            user_id = %user_id,
            released = released_count,
            "Staged participant finalized"
        );

        self.broadcast_in_channel();
        if !outcome.producer_ids.is_empty() {
            self.broadcast_available_producers();
        }
    }

    fn sweep(&mut self, threshold: Duration) -> SweepReport {
        let stale = self.registry.sweep(Instant::now(), threshold);

        for connection_id in &stale {
            warn!(
                target: "vc.actor.channel",
                channel_id = %self.channel_id,
                connection_id = %connection_id,
                threshold_secs = threshold.as_secs(),
                "Heartbeat missed, staging connection"
            );
            self.stage_connection(connection_id, StageReason::HeartbeatTimeout);
        }

        for connection in self.connections.values() {
            connection.ping();
        }

        SweepReport {
            staged: stale.len(),
            idle: self.registry.is_idle(),
        }
    }

    fn force_disconnect(&mut self, user_id: &str, reason: String) -> usize {
        let removed = self.registry.remove_user(user_id);
        if removed.connection_ids.is_empty() && !removed.had_staged {
            return 0;
        }

        let frame = ServerMessage::ForceDisconnect { reason };
        for connection_id in &removed.connection_ids {
            if let Some(connection) = self.connections.remove(connection_id) {
                connection.close(Some(frame.clone()));
            }
            self.ctx.metrics.connection_unregistered();
        }
        if removed.had_staged {
            self.ctx.metrics.participant_unstaged();
        }

        prom::record_finalized();
        let producers_changed = !removed.released.producers.is_empty();
        media::spawn_release(&self.ctx.engine, removed.released);
        self.ctx
            .interop
            .presence(PresenceEvent::Leave, user_id, &self.channel_id);

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            user_id = %user_id,
            connections = removed.connection_ids.len(),
            had_staged = removed.had_staged,
            "Participant force-disconnected"
        );

        self.publish_presence();
        self.broadcast_in_channel();
        if producers_changed {
            self.broadcast_available_producers();
        }

        removed.connection_ids.len()
    }

    // ------------------------------------------------------------------------
    // Media commits
    // ------------------------------------------------------------------------

    fn prepare_produce(
        &mut self,
        connection_id: &str,
        transport_id: Option<&str>,
    ) -> Result<PreparedProduce, VcError> {
        let transport_id = self
            .registry
            .transport_for_produce(connection_id, transport_id)?;
        let (evicted, producer_ids) = self.registry.evict_user_producers(connection_id)?;

        if !producer_ids.is_empty() {
            debug!(
                target: "vc.actor.channel",
                channel_id = %self.channel_id,
                connection_id = %connection_id,
                evicted = producer_ids.len(),
                "Evicted previous producer of user"
            );
            self.broadcast_in_channel();
            self.broadcast_available_producers();
        }

        Ok(PreparedProduce {
            transport_id,
            evicted,
        })
    }

    fn set_producer(
        &mut self,
        connection_id: &str,
        producer: ProducerEntry,
    ) -> Result<Vec<ConsumeTarget>, VcError> {
        let user_id = self
            .registry
            .connection(connection_id)
            .ok_or(VcError::Stale)?
            .user_id
            .clone();
        let producer_id = producer.id.clone();

        let (released, _) = self.registry.set_producer(connection_id, producer)?;
        media::spawn_release(&self.ctx.engine, released);

        if let Some(origin) = self.connections.get(connection_id) {
            origin.send(ServerMessage::ProducerId {
                data: ProducerIdData {
                    id: producer_id.clone(),
                    user_id: user_id.clone(),
                    channel_id: self.channel_id.clone(),
                },
            });
        }

        self.broadcast_in_channel();
        self.broadcast_available_producers();

        let announcement = ServerMessage::NewProducer {
            data: ProducerRef {
                producer_id: producer_id.clone(),
                user_id: user_id.clone(),
            },
        };
        for (id, connection) in &self.connections {
            if id != connection_id {
                connection.send(announcement.clone());
            }
        }

        self.ctx
            .interop
            .producer_added(&user_id, &self.channel_id, &producer_id);

        info!(
            target: "vc.actor.channel",
            channel_id = %self.channel_id,
            user_id = %user_id,
            producer_id = %producer_id,
            "Producer installed"
        );

        Ok(self.registry.auto_consume_targets(&producer_id))
    }

    fn add_consumer(
        &mut self,
        connection_id: &str,
        consumer: ConsumerEntry,
        producer_user_id: String,
    ) -> Result<(), VcError> {
        let discard = ReleasedResources {
            consumers: vec![consumer.id.clone()],
            ..ReleasedResources::default()
        };

        let delivered = match self.registry.add_consumer(connection_id, consumer.clone()) {
            Ok(ConsumerInstall::Inserted) => consumer,
            Ok(ConsumerInstall::Existing(existing)) => {
                media::spawn_release(&self.ctx.engine, discard);
                existing
            }
            Err(e) => {
                media::spawn_release(&self.ctx.engine, discard);
                return Err(e);
            }
        };

        if let Some(connection) = self.connections.get(connection_id) {
            connection.send(ServerMessage::ConsumerParams {
                data: ConsumerParams {
                    id: delivered.id,
                    producer_id: delivered.producer_id,
                    kind: delivered.kind,
                    rtp_parameters: delivered.rtp_parameters,
                    user_id: producer_user_id,
                },
            });
        }
        Ok(())
    }

    fn close_transport(&mut self, connection_id: &str, transport_id: &str) -> Result<(), VcError> {
        let closed = self.registry.close_transport(connection_id, transport_id)?;
        media::spawn_release(&self.ctx.engine, closed.released);

        if closed.producer_evicted.is_some() {
            self.broadcast_in_channel();
            self.broadcast_available_producers();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Broadcasts
    // ------------------------------------------------------------------------

    fn broadcast(&self, message: &ServerMessage) {
        for connection in self.connections.values() {
            connection.send(message.clone());
        }
    }

    fn broadcast_in_channel(&self) {
        self.broadcast(&ServerMessage::CurrentlyInChannel {
            in_room: self.registry.presence(),
            producers: self.registry.producer_ids(),
        });
    }

    fn broadcast_available_producers(&self) {
        self.broadcast(&ServerMessage::AvailableProducers {
            producers: self.registry.available_producers(),
        });
    }

    fn publish_presence(&self) {
        self.ctx
            .interop
            .presence_sync(&self.channel_id, self.registry.presence());
    }

    /// Close every socket and every live or staged handle.
    async fn shutdown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.cancel();
            self.ctx.metrics.connection_unregistered();
        }
        for _ in 0..self.registry.staged_count() {
            self.ctx.metrics.participant_unstaged();
        }

        let released = self.registry.drain();
        if released.is_empty() {
            return;
        }

        let count = released.len();
        match tokio::time::timeout(
            SHUTDOWN_RELEASE_DEADLINE,
            media::release(self.ctx.engine.as_ref(), released),
        )
        .await
        {
            Ok(()) => debug!(
                target: "vc.actor.channel",
                channel_id = %self.channel_id,
                released = count,
                "Channel media released"
            ),
            Err(_) => warn!(
                target: "vc.actor.channel",
                channel_id = %self.channel_id,
                released = count,
                "Channel media release timed out"
            ),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::backend::InteropEvent;
    use crate::media::network::NetworkFamily;
    use crate::media::{
        ConsumerInfo, MediaKind, ProducerInfo, TransportListener, TransportParams,
    };
    use axum::extract::ws::Message;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const GRACE: Duration = Duration::from_secs(60);

    /// Engine stub that only records closes.
    #[derive(Default)]
    struct ClosingEngine {
        closed: Mutex<Vec<String>>,
    }

    impl ClosingEngine {
        fn closed(&self) -> Vec<String> {
            let mut closed = self.closed.lock().unwrap().clone();
            closed.sort();
            closed
        }

        fn record(&self, id: &str) -> Result<(), VcError> {
            self.closed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MediaEngine for ClosingEngine {
        async fn router_rtp_capabilities(&self) -> Result<Value, VcError> {
            Ok(json!({}))
        }
        async fn create_transport(
            &self,
            _listener: &TransportListener,
            _ice_servers: &[Value],
        ) -> Result<TransportParams, VcError> {
            Err(VcError::Internal("unused".to_string()))
        }
        async fn connect_transport(&self, _: &str, _: &Value) -> Result<(), VcError> {
            Ok(())
        }
        async fn produce(&self, _: &str, _: MediaKind, _: &Value) -> Result<ProducerInfo, VcError> {
            Err(VcError::Internal("unused".to_string()))
        }
        async fn can_consume(&self, _: &str, _: &RtpCapabilities) -> Result<bool, VcError> {
            Ok(true)
        }
        async fn consume(
            &self,
            _: &str,
            _: &str,
            _: &RtpCapabilities,
        ) -> Result<ConsumerInfo, VcError> {
            Err(VcError::Internal("unused".to_string()))
        }
        async fn pause_consumer(&self, _: &str) -> Result<(), VcError> {
            Ok(())
        }
        async fn resume_consumer(&self, _: &str) -> Result<(), VcError> {
            Ok(())
        }
        async fn close_transport(&self, id: &str) -> Result<(), VcError> {
            self.record(id)
        }
        async fn close_producer(&self, id: &str) -> Result<(), VcError> {
            self.record(id)
        }
        async fn close_consumer(&self, id: &str) -> Result<(), VcError> {
            self.record(id)
        }
    }

    struct Rig {
        channel: ChannelActorHandle,
        engine: Arc<ClosingEngine>,
        interop: mpsc::UnboundedReceiver<InteropEvent>,
        root: CancellationToken,
    }

    fn rig() -> Rig {
        let engine = Arc::new(ClosingEngine::default());
        let (interop, events) = InteropPublisher::channel();
        let root = CancellationToken::new();
        let ctx = ChannelContext {
            engine: Arc::clone(&engine) as Arc<dyn MediaEngine>,
            interop,
            metrics: ActorMetrics::new(),
            disconnect_grace: GRACE,
        };
        let (channel, _task) = ChannelActor::spawn("chan-1".to_string(), root.child_token(), ctx);
        Rig {
            channel,
            engine,
            interop: events,
            root,
        }
    }

    struct Client {
        handle: ConnectionActorHandle,
        outbound: fmpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        /// Next JSON frame, skipping liveness pings.
        async fn next(&mut self) -> Value {
            loop {
                match self.outbound.next().await {
                    Some(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(Message::Ping(_)) => {}
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }

        async fn next_of(&mut self, kind: &str) -> Value {
            loop {
                let frame = self.next().await;
                if frame["type"] == kind {
                    return frame;
                }
            }
        }
    }

    async fn join(rig: &Rig, connection_id: &str, user_id: &str) -> Client {
        let (sink, outbound) = fmpsc::unbounded::<Message>();
        let (handle, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user_id.to_string(),
            "chan-1".to_string(),
            sink,
            rig.root.child_token(),
            ActorMetrics::new(),
        );
        let (tx, rx) = oneshot::channel();
        rig.channel
            .forward_join(
                JoinRequest {
                    channel_id: "chan-1".to_string(),
                    user_id: user_id.to_string(),
                    family: NetworkFamily::Ipv4,
                    connection: handle.clone(),
                },
                tx,
            )
            .await;
        rx.await.unwrap().unwrap();
        Client { handle, outbound }
    }

    fn caps() -> RtpCapabilities {
        RtpCapabilities::normalize(&json!({
            "codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000}]
        }))
        .unwrap()
    }

    fn producer(id: &str, transport_id: &str) -> ProducerEntry {
        ProducerEntry {
            id: id.to_string(),
            transport_id: transport_id.to_string(),
            kind: MediaKind::Audio,
        }
    }

    #[tokio::test]
    async fn test_fresh_join_broadcasts_then_greets() {
        let mut rig = rig();
        let mut alice = join(&rig, "conn-a", "alice").await;

        let presence = alice.next().await;
        assert_eq!(presence["type"], "currentlyInChannel");
        assert_eq!(presence["inRoom"], json!(["alice"]));

        let connected = alice.next().await;
        assert_eq!(connected["type"], "connected");
        assert_eq!(connected["data"]["message"], "socket connection successful");
        assert_eq!(connected["data"]["restored"], false);

        match rig.interop.recv().await.unwrap() {
            InteropEvent::MediaPresence { event, .. } => assert_eq!(event, PresenceEvent::Join),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rig.interop.recv().await.unwrap(),
            InteropEvent::ChannelPresenceSync { .. }
        ));

        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_mailbox_depth_tracks_unprocessed_messages() {
        let rig = rig();

        for _ in 0..3 {
            rig.channel
                .heartbeat("conn-x".to_string())
                .await
                .unwrap();
        }
        assert_eq!(rig.channel.mailbox.current_depth(), 3);

        // Replies only after everything queued before it
        rig.channel.get_state().await.unwrap();
        assert_eq!(rig.channel.mailbox.current_depth(), 0);

        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_join_with_dead_socket_is_stale() {
        let rig = rig();
        let (sink, _outbound) = fmpsc::unbounded::<Message>();
        let (handle, _task) = ConnectionActor::spawn(
            "conn-x".to_string(),
            "ghost".to_string(),
            "chan-1".to_string(),
            sink,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        handle.cancel();

        let (tx, rx) = oneshot::channel();
        rig.channel
            .forward_join(
                JoinRequest {
                    channel_id: "chan-1".to_string(),
                    user_id: "ghost".to_string(),
                    family: NetworkFamily::Ipv4,
                    connection: handle,
                },
                tx,
            )
            .await;
        assert!(matches!(rx.await.unwrap(), Err(VcError::Stale)));
        assert!(rig.channel.get_state().await.unwrap().presence.is_empty());
        rig.root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_and_restore_keeps_media() {
        let rig = rig();
        let mut bob = join(&rig, "conn-b", "bob").await;
        let _alice = join(&rig, "conn-a", "alice").await;

        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();
        rig.channel
            .set_producer("conn-a".to_string(), producer("p-a", "t-a"))
            .await
            .unwrap();

        rig.channel
            .disconnected("conn-a".to_string(), StageReason::Close)
            .await
            .unwrap();

        let state = rig.channel.get_state().await.unwrap();
        assert_eq!(state.presence, vec!["bob"]);
        assert_eq!(state.staged_users, vec!["alice"]);
        assert_eq!(state.producer_ids, vec!["p-a"], "staged producer keeps forwarding");

        let presence = loop {
            let frame = bob.next_of("currentlyInChannel").await;
            if frame["inRoom"] == json!(["bob"]) {
                break frame;
            }
        };
        assert_eq!(presence["producers"], json!(["p-a"]));

        tokio::time::advance(Duration::from_secs(5)).await;
        let mut alice = join(&rig, "conn-a2", "alice").await;
        let connected = alice.next_of("connected").await;
        assert_eq!(connected["data"]["restored"], true);
        assert_eq!(connected["data"]["transportIds"], json!(["t-a"]));
        assert_eq!(connected["data"]["producerId"], "p-a");

        tokio::time::advance(GRACE * 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = rig.channel.get_state().await.unwrap();
        assert!(state.staged_users.is_empty());
        assert_eq!(state.producer_ids, vec!["p-a"]);
        assert!(rig.engine.closed().is_empty(), "restore closes nothing");

        rig.root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_finalizes_once() {
        let rig = rig();
        let mut bob = join(&rig, "conn-b", "bob").await;
        let _alice = join(&rig, "conn-a", "alice").await;

        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();
        rig.channel
            .set_producer("conn-a".to_string(), producer("p-a", "t-a"))
            .await
            .unwrap();
        rig.channel
            .disconnected("conn-a".to_string(), StageReason::Close)
            .await
            .unwrap();

        tokio::time::advance(GRACE + Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = rig.channel.get_state().await.unwrap();
        assert!(state.staged_users.is_empty());
        assert!(state.producer_ids.is_empty());
        assert_eq!(rig.engine.closed(), vec!["p-a", "t-a"]);

        let mut saw_staged_producer = false;
        loop {
            let frame = bob.next_of("currentlyInChannel").await;
            if frame["producers"] == json!(["p-a"]) {
                saw_staged_producer = true;
            } else if saw_staged_producer && frame["producers"] == json!([]) {
                assert_eq!(frame["inRoom"], json!(["bob"]));
                break;
            }
        }

        rig.root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stages_silent_connection() {
        let rig = rig();
        let _alice = join(&rig, "conn-a", "alice").await;
        let _bob = join(&rig, "conn-b", "bob").await;

        tokio::time::advance(Duration::from_secs(40)).await;
        rig.channel.heartbeat("conn-b".to_string()).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let report = rig.channel.sweep(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.staged, 1);
        assert!(!report.idle);

        let state = rig.channel.get_state().await.unwrap();
        assert_eq!(state.presence, vec!["bob"]);
        assert_eq!(state.staged_users, vec!["alice"]);

        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_set_producer_fans_out() {
        let rig = rig();
        let mut alice = join(&rig, "conn-a", "alice").await;
        let mut bob = join(&rig, "conn-b", "bob").await;

        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();
        rig.channel
            .add_transport("conn-b".to_string(), "t-b".to_string())
            .await
            .unwrap();
        rig.channel
            .announce_capabilities("conn-b".to_string(), caps(), false)
            .await
            .unwrap();

        let targets = rig
            .channel
            .set_producer("conn-a".to_string(), producer("p-a", "t-a"))
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].connection_id, "conn-b");
        assert_eq!(targets[0].producer_user_id, "alice");

        let reply = alice.next_of("producer-id").await;
        assert_eq!(reply["data"]["id"], "p-a");
        assert_eq!(reply["data"]["channelId"], "chan-1");

        let available = bob.next_of("available-producers").await;
        assert_eq!(
            available["producers"],
            json!([{"producerId": "p-a", "userId": "alice"}])
        );
        let announced = bob.next_of("new-producer").await;
        assert_eq!(announced["data"]["userId"], "alice");

        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_consumer_closed_and_existing_returned() {
        let rig = rig();
        let _alice = join(&rig, "conn-a", "alice").await;
        let mut bob = join(&rig, "conn-b", "bob").await;
        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();
        rig.channel
            .add_transport("conn-b".to_string(), "t-b".to_string())
            .await
            .unwrap();
        rig.channel
            .set_producer("conn-a".to_string(), producer("p-a", "t-a"))
            .await
            .unwrap();

        let consumer = |id: &str| ConsumerEntry {
            id: id.to_string(),
            producer_id: "p-a".to_string(),
            transport_id: "t-b".to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: json!({}),
        };
        rig.channel
            .add_consumer("conn-b".to_string(), consumer("c-1"), "alice".to_string())
            .await
            .unwrap();
        rig.channel
            .add_consumer("conn-b".to_string(), consumer("c-2"), "alice".to_string())
            .await
            .unwrap();

        assert_eq!(bob.next_of("consumer-params").await["data"]["id"], "c-1");
        assert_eq!(bob.next_of("consumer-params").await["data"]["id"], "c-1");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.engine.closed(), vec!["c-2"]);
        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_force_disconnect_finalizes_immediately() {
        let rig = rig();
        let mut alice = join(&rig, "conn-a", "alice").await;
        let _bob = join(&rig, "conn-b", "bob").await;
        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();

        let closed = rig
            .channel
            .force_disconnect("alice".to_string(), "kicked".to_string())
            .await
            .unwrap();
        assert_eq!(closed, 1);

        let frame = alice.next_of("force_disconnect").await;
        assert_eq!(frame["reason"], "kicked");
        tokio::time::timeout(Duration::from_secs(1), alice.handle.closed())
            .await
            .unwrap();

        let state = rig.channel.get_state().await.unwrap();
        assert_eq!(state.presence, vec!["bob"]);
        assert!(state.staged_users.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.engine.closed(), vec!["t-a"]);

        assert_eq!(
            rig.channel
                .force_disconnect("nobody".to_string(), "x".to_string())
                .await
                .unwrap(),
            0
        );
        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_commands_after_stage_are_stale() {
        let rig = rig();
        let _alice = join(&rig, "conn-a", "alice").await;
        rig.channel
            .disconnected("conn-a".to_string(), StageReason::Close)
            .await
            .unwrap();

        assert!(matches!(
            rig.channel
                .add_transport("conn-a".to_string(), "t-late".to_string())
                .await,
            Err(VcError::Stale)
        ));
        rig.root.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let rig = rig();
        let _alice = join(&rig, "conn-a", "alice").await;
        rig.channel
            .add_transport("conn-a".to_string(), "t-a".to_string())
            .await
            .unwrap();
        rig.channel
            .disconnected("conn-a".to_string(), StageReason::Close)
            .await
            .unwrap();

        rig.root.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rig.channel.is_cancelled());
        assert_eq!(rig.engine.closed(), vec!["t-a"]);
    }
}
