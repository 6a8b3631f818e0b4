//! `ChannelControllerActor` - singleton supervisor for channel actors.
//!
//! The controller is the top-level actor of the coordinator:
//!
//! - Singleton per process
//! - Creates a `ChannelActor` on the first join of a channel and reaps it
//!   once the channel is idle
//! - Routes forced disconnects from the backend to the owning channel
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Joins are forwarded, never awaited: the channel answers the session
//! directly, so a busy channel cannot stall joins to other channels.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the controller:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all children)
//! 3. Waits for every channel to close its sockets and release its media

use crate::errors::VcError;

use super::channel::{ChannelActor, ChannelActorHandle, ChannelContext};
use super::messages::{
    ChannelState, ControllerMessage, ControllerStatus, JoinOutcome, JoinRequest, SweepReport,
    SweepSummary,
};
use super::metrics::{ActorType, MailboxMonitor};

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How long a removed channel may take to stop before we stop waiting.
const CHANNEL_REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for each channel.
const CHANNEL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `ChannelControllerActor`.
#[derive(Clone, Debug)]
pub struct ChannelControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl ChannelControllerHandle {
    /// Create a new `ChannelControllerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(vc_id: String, ctx: ChannelContext) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Controller, &vc_id));

        let actor = ChannelControllerActor {
            vc_id,
            receiver,
            cancel_token: cancel_token.clone(),
            channels: HashMap::new(),
            accepting_new: true,
            ctx,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    /// Queue a message, counting it against the mailbox depth.
    async fn send(&self, message: ControllerMessage) -> Result<(), VcError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(message)
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))
    }

    /// Admit a validated connection to its channel.
    ///
    /// # Errors
    ///
    /// - `Draining` once shutdown has begun
    /// - `Stale` if the socket closed while the join was queued
    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Join {
            request,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Sweep every channel for silent connections.
    pub async fn sweep(&self, threshold: Duration) -> Result<SweepSummary, VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Sweep {
            threshold,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    /// Close a user's sockets in a channel and finalize their media.
    ///
    /// Returns the number of sockets closed; an unknown channel yields 0.
    pub async fn force_disconnect(
        &self,
        channel_id: String,
        user_id: String,
        reason: String,
    ) -> Result<usize, VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::ForceDisconnect {
            channel_id,
            user_id,
            reason,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    /// Snapshot of one channel, `None` if it has no live actor.
    pub async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelState>, VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::GetChannel {
            channel_id: channel_id.to_string(),
            respond_to: tx,
        })
        .await?;

        let handle = rx
            .await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?;

        match handle {
            Some(handle) => handle.get_state().await.map(Some),
            None => Ok(None),
        }
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), VcError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Shutdown { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the controller is cancelled.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }

    /// Get a child token for tasks that should stop with the controller.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed channel.
struct ManagedChannel {
    handle: ChannelActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `ChannelControllerActor` implementation.
pub struct ChannelControllerActor {
    vc_id: String,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    channels: HashMap<String, ManagedChannel>,
    accepting_new: bool,
    ctx: ChannelContext,
    /// Shared with the handle, which records enqueues.
    mailbox: Arc<MailboxMonitor>,
}

impl ChannelControllerActor {
    #[instrument(skip_all, name = "vc.actor.controller", fields(vc_id = %self.vc_id))]
    async fn run(mut self) {
        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            "ChannelControllerActor started"
        );

        loop {
            self.check_channel_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        "ChannelControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                            self.ctx.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "vc.actor.controller",
                                vc_id = %self.vc_id,
                                "ChannelControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            channels_remaining = self.channels.len(),
            messages_processed = self.mailbox.messages_processed(),
            "ChannelControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Join {
                request,
                respond_to,
            } => self.join(request, respond_to).await,

            ControllerMessage::Sweep {
                threshold,
                respond_to,
            } => {
                let summary = self.sweep(threshold).await;
                let _ = respond_to.send(summary);
            }

            ControllerMessage::ForceDisconnect {
                channel_id,
                user_id,
                reason,
                respond_to,
            } => {
                let closed = self.force_disconnect(&channel_id, user_id, reason).await;
                let _ = respond_to.send(closed);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::GetChannel {
                channel_id,
                respond_to,
            } => {
                let handle = self
                    .channels
                    .get(&channel_id)
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(handle);
            }

            ControllerMessage::Shutdown { respond_to } => {
                info!(
                    target: "vc.actor.controller",
                    vc_id = %self.vc_id,
                    channel_count = self.channels.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn join(
        &mut self,
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, VcError>>,
    ) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(VcError::Draining));
            return;
        }

        let channel_id = request.channel_id.clone();
        let handle = self.channel_or_spawn(&channel_id);
        handle.forward_join(request, respond_to).await;
    }

    fn channel_or_spawn(&mut self, channel_id: &str) -> ChannelActorHandle {
        if let Some(managed) = self.channels.get(channel_id) {
            return managed.handle.clone();
        }

        let (handle, task_handle) = ChannelActor::spawn(
            channel_id.to_string(),
            self.cancel_token.child_token(),
            self.ctx.clone(),
        );
        self.channels.insert(
            channel_id.to_string(),
            ManagedChannel {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.ctx.metrics.channel_created();

        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            channel_id = %channel_id,
            total_channels = self.channels.len(),
            "Channel actor created"
        );

        handle
    }

    /// Sweep all channels concurrently, then reap the idle ones.
    async fn sweep(&mut self, threshold: Duration) -> SweepSummary {
        let sweeps = self.channels.iter().map(|(channel_id, managed)| {
            let handle = managed.handle.clone();
            let channel_id = channel_id.clone();
            async move { (channel_id, handle.sweep(threshold).await) }
        });
        let reports: Vec<(String, Result<SweepReport, VcError>)> = join_all(sweeps).await;

        let mut summary = SweepSummary {
            channels_swept: reports.len(),
            ..SweepSummary::default()
        };

        for (channel_id, report) in reports {
            match report {
                Ok(report) => {
                    summary.staged += report.staged;
                    if report.idle {
                        self.remove_channel(&channel_id);
                        summary.channels_reaped += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        channel_id = %channel_id,
                        error = %e,
                        "Channel sweep failed"
                    );
                }
            }
        }

        if summary.staged > 0 || summary.channels_reaped > 0 {
            debug!(
                target: "vc.actor.controller",
                vc_id = %self.vc_id,
                staged = summary.staged,
                reaped = summary.channels_reaped,
                "Liveness sweep complete"
            );
        }

        summary
    }

    async fn force_disconnect(&mut self, channel_id: &str, user_id: String, reason: String) -> usize {
        let Some(managed) = self.channels.get(channel_id) else {
            debug!(
                target: "vc.actor.controller",
                vc_id = %self.vc_id,
                channel_id = %channel_id,
                "Force disconnect for unknown channel"
            );
            return 0;
        };

        match managed.handle.force_disconnect(user_id, reason).await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(
                    target: "vc.actor.controller",
                    vc_id = %self.vc_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Force disconnect failed"
                );
                0
            }
        }
    }

    /// Remove a channel without blocking the message loop on its exit.
    fn remove_channel(&mut self, channel_id: &str) {
        let Some(managed) = self.channels.remove(channel_id) else {
            return;
        };

        managed.handle.cancel();

        let channel_id_owned = channel_id.to_string();
        let vc_id = self.vc_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(CHANNEL_REMOVAL_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "vc.actor.controller",
                        vc_id = %vc_id,
                        channel_id = %channel_id_owned,
                        "Channel actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "vc.actor.controller",
                        vc_id = %vc_id,
                        channel_id = %channel_id_owned,
                        error = ?e,
                        "Channel actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "vc.actor.controller",
                        vc_id = %vc_id,
                        channel_id = %channel_id_owned,
                        "Channel actor task cleanup timed out"
                    );
                }
            }
        });

        self.ctx.metrics.channel_removed();

        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            channel_id = %channel_id,
            total_channels = self.channels.len(),
            "Idle channel removed"
        );
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            channel_count: self.channels.len(),
            connection_count: self.ctx.metrics.connection_count(),
            staged_count: self.ctx.metrics.staged_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            channel_count = self.channels.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        // Already cancelled through the parent token; explicit for clarity.
        for managed in self.channels.values() {
            managed.handle.cancel();
        }

        for (channel_id, managed) in self.channels.drain() {
            match tokio::time::timeout(CHANNEL_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        channel_id = %channel_id,
                        "Channel actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        channel_id = %channel_id,
                        error = ?e,
                        "Channel actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        channel_id = %channel_id,
                        "Channel actor shutdown timed out"
                    );
                }
            }
            self.ctx.metrics.channel_removed();
        }

        info!(
            target: "vc.actor.controller",
            vc_id = %self.vc_id,
            "Graceful shutdown complete"
        );
    }

    /// Drop channels whose task ended on its own.
    async fn check_channel_health(&mut self) {
        let finished: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(channel_id, _)| channel_id.clone())
            .collect();

        for channel_id in finished {
            let Some(managed) = self.channels.remove(&channel_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "vc.actor.controller",
                        vc_id = %self.vc_id,
                        channel_id = %channel_id,
                        "Channel actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "vc.actor.controller",
                            vc_id = %self.vc_id,
                            channel_id = %channel_id,
                            error = ?join_error,
                            "Channel actor panicked"
                        );
                        self.ctx.metrics.record_panic(ActorType::Channel);
                    }
                }
            }

            self.ctx.metrics.channel_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::connection::{ConnectionActor, ConnectionActorHandle};
    use crate::actors::metrics::ActorMetrics;
    use crate::backend::InteropPublisher;
    use crate::media::network::NetworkFamily;
    use crate::media::{
        ConsumerInfo, MediaEngine, MediaKind, ProducerInfo, RtpCapabilities, TransportListener,
        TransportParams,
    };
    use axum::extract::ws::Message;
    use futures::channel::mpsc as fmpsc;
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Engine that accepts every close and is never asked for anything else.
    struct IdleEngine;

    #[async_trait::async_trait]
    impl MediaEngine for IdleEngine {
        async fn router_rtp_capabilities(&self) -> Result<Value, VcError> {
            Ok(json!({}))
        }
        async fn create_transport(
            &self,
            _: &TransportListener,
            _: &[Value],
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
            Ok(false)
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
        async fn close_transport(&self, _: &str) -> Result<(), VcError> {
            Ok(())
        }
        async fn close_producer(&self, _: &str) -> Result<(), VcError> {
            Ok(())
        }
        async fn close_consumer(&self, _: &str) -> Result<(), VcError> {
            Ok(())
        }
    }

    fn controller(name: &str) -> (ChannelControllerHandle, Arc<ActorMetrics>) {
        let metrics = ActorMetrics::new();
        let ctx = ChannelContext {
            engine: Arc::new(IdleEngine),
            interop: InteropPublisher::disabled(),
            metrics: Arc::clone(&metrics),
            disconnect_grace: Duration::from_secs(60),
        };
        (ChannelControllerHandle::new(name.to_string(), ctx), metrics)
    }

    fn connection(
        handle: &ChannelControllerHandle,
        connection_id: &str,
        user_id: &str,
    ) -> (ConnectionActorHandle, fmpsc::UnboundedReceiver<Message>) {
        let (sink, outbound) = fmpsc::unbounded::<Message>();
        let (connection, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            user_id.to_string(),
            "chan".to_string(),
            sink,
            handle.child_token(),
            ActorMetrics::new(),
        );
        (connection, outbound)
    }

    fn request(channel_id: &str, connection: ConnectionActorHandle) -> JoinRequest {
        JoinRequest {
            channel_id: channel_id.to_string(),
            user_id: connection.user_id().to_string(),
            family: NetworkFamily::Ipv4,
            connection,
        }
    }

    #[tokio::test]
    async fn test_join_creates_channel_once() {
        let (handle, _metrics) = controller("vc-test-001");

        let (a, _a_out) = connection(&handle, "conn-a", "alice");
        let (b, _b_out) = connection(&handle, "conn-b", "bob");

        let first = handle.join(request("chan-1", a)).await.unwrap();
        let second = handle.join(request("chan-1", b)).await.unwrap();
        assert_eq!(first.channel.channel_id(), "chan-1");
        assert_eq!(second.channel.channel_id(), "chan-1");
        assert!(first.restored.is_none());

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.channel_count, 1);
        assert_eq!(status.connection_count, 2);
        assert!(!status.is_draining);

        let state = first.channel.get_state().await.unwrap();
        assert_eq!(state.presence, vec!["alice", "bob"]);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_queued_messages() {
        let (handle, _metrics) = controller("vc-test-depth");

        // Current-thread runtime: nothing is processed until we await a reply
        let mut replies = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            handle
                .send(ControllerMessage::GetStatus { respond_to: tx })
                .await
                .unwrap();
            replies.push(rx);
        }
        assert_eq!(handle.mailbox.current_depth(), 3);

        let mut depths = Vec::new();
        for rx in replies {
            depths.push(rx.await.unwrap().mailbox_depth);
        }
        assert_eq!(depths, vec![2, 1, 0]);
        assert_eq!(handle.mailbox.current_depth(), 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_force_disconnect_unknown_channel() {
        let (handle, _metrics) = controller("vc-test-002");

        let closed = handle
            .force_disconnect("nope".to_string(), "alice".to_string(), "x".to_string())
            .await
            .unwrap();
        assert_eq!(closed, 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_force_disconnect_routes_to_channel() {
        let (handle, metrics) = controller("vc-test-003");
        let (a, _a_out) = connection(&handle, "conn-a", "alice");
        handle.join(request("chan-1", a.clone())).await.unwrap();

        let closed = handle
            .force_disconnect("chan-1".to_string(), "alice".to_string(), "bye".to_string())
            .await
            .unwrap();
        assert_eq!(closed, 1);
        assert_eq!(metrics.connection_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .unwrap();
        handle.cancel();
    }

    #[tokio::test]
    async fn test_sweep_reaps_idle_channel() {
        let (handle, metrics) = controller("vc-test-004");
        let (a, _a_out) = connection(&handle, "conn-a", "alice");
        let outcome = handle.join(request("chan-1", a)).await.unwrap();

        outcome
            .channel
            .force_disconnect("alice".to_string(), "bye".to_string())
            .await
            .unwrap();

        let summary = handle.sweep(Duration::from_secs(60)).await.unwrap();
        assert_eq!(summary.channels_swept, 1);
        assert_eq!(summary.channels_reaped, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(outcome.channel.is_cancelled());
        assert_eq!(handle.get_status().await.unwrap().channel_count, 0);
        assert_eq!(metrics.channel_count(), 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_sweep_keeps_busy_channel() {
        let (handle, _metrics) = controller("vc-test-005");
        let (a, _a_out) = connection(&handle, "conn-a", "alice");
        handle.join(request("chan-1", a)).await.unwrap();

        let summary = handle.sweep(Duration::from_secs(60)).await.unwrap();
        assert_eq!(summary.channels_swept, 1);
        assert_eq!(summary.staged, 0);
        assert_eq!(summary.channels_reaped, 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_joins() {
        let (handle, _metrics) = controller("vc-test-006");
        let (a, _a_out) = connection(&handle, "conn-a", "alice");
        let outcome = handle.join(request("chan-1", a.clone())).await.unwrap();

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(outcome.channel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .unwrap();

        let (b, _b_out) = connection(&handle, "conn-b", "bob");
        let result = handle.join(request("chan-1", b)).await;
        assert!(result.is_err(), "no joins after shutdown");
    }

    #[tokio::test]
    async fn test_controller_cancellation_token() {
        let (handle, _metrics) = controller("vc-test-007");

        assert!(!handle.is_cancelled());

        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
