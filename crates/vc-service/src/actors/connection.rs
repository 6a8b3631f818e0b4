//! `ConnectionActor` - owns the outbound half of one WebSocket.
//!
//! Every frame sent to a client goes through this actor's mailbox, so
//! replies and broadcasts reach the socket in the order they were queued.
//! The mailbox is bounded. [`ConnectionActorHandle::send`] never waits:
//! when the mailbox is full the frame is dropped and counted, so a slow
//! client can never stall its channel.
//!
//! # Lifecycle
//!
//! 1. Spawned by the session task once the backend accepts the socket
//! 2. Runs until closed by its channel, cancelled, or the socket fails
//! 3. Cancels its own token on exit so the session's read loop stops too

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::observability::metrics as prom;
use crate::signaling::protocol::ServerMessage;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    connection_id: String,
    user_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a frame. Returns false if it was dropped.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.enqueue(ConnectionMessage::Send { message })
    }

    /// Queue a WebSocket Ping.
    pub fn ping(&self) -> bool {
        self.enqueue(ConnectionMessage::SendPing)
    }

    /// Queue a close, optionally preceded by a last frame.
    ///
    /// If the mailbox is full the actor is cancelled instead, which closes
    /// the socket without the frame.
    pub fn close(&self, frame: Option<ServerMessage>) {
        if !self.enqueue(ConnectionMessage::Close { frame }) {
            self.cancel_token.cancel();
        }
    }

    fn enqueue(&self, message: ConnectionMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.mailbox.record_enqueue();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                prom::record_frame_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "vc.actor.connection",
                    connection_id = %self.connection_id,
                    "Connection actor gone, frame discarded"
                );
                false
            }
        }
    }

    /// Resolves once the actor has stopped or been cancelled.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S> {
    connection_id: String,
    user_id: String,
    channel_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    sink: S,
    /// Set once the close frame went out or the socket failed.
    is_closed: bool,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    /// Spawn a new connection actor over the socket's outbound half.
    pub fn spawn(
        connection_id: String,
        user_id: String,
        channel_id: String,
        sink: S,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let actor = Self {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            channel_id,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
            sink,
            is_closed: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            mailbox,
            connection_id,
            user_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "vc.actor.connection",
        fields(
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            channel_id = %self.channel_id
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "vc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "vc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close(None).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "vc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            self.graceful_close(None).await;
                            break;
                        }
                    }
                }
            }
        }

        // Wake the session's read loop.
        self.cancel_token.cancel();

        info!(
            target: "vc.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => {
                self.write(Message::Text(message.to_json()), message.type_label())
                    .await;
                self.is_closed
            }

            ConnectionMessage::SendPing => {
                self.write(Message::Ping(Vec::new()), "ping").await;
                self.is_closed
            }

            ConnectionMessage::Close { frame } => {
                self.graceful_close(frame).await;
                true
            }
        }
    }

    async fn write(&mut self, frame: Message, label: &'static str) {
        if self.is_closed {
            return;
        }

        if let Err(e) = self.sink.send(frame).await {
            warn!(
                target: "vc.actor.connection",
                connection_id = %self.connection_id,
                frame = label,
                error = %e,
                "Socket write failed"
            );
            self.is_closed = true;
        }
    }

    async fn graceful_close(&mut self, frame: Option<ServerMessage>) {
        if let Some(frame) = frame {
            self.write(Message::Text(frame.to_json()), frame.type_label())
                .await;
        }

        if self.is_closed {
            return;
        }
        self.is_closed = true;

        debug!(
            target: "vc.actor.connection",
            connection_id = %self.connection_id,
            "Closing socket"
        );

        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use std::time::Duration;

    fn spawn_actor(
        cancel_token: CancellationToken,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        fmpsc::UnboundedReceiver<Message>,
    ) {
        let (sink, outbound) = fmpsc::unbounded::<Message>();
        let (handle, task) = ConnectionActor::spawn(
            "conn-1".to_string(),
            "user-1".to_string(),
            "chan-1".to_string(),
            sink,
            cancel_token,
            ActorMetrics::new(),
        );
        (handle, task, outbound)
    }

    async fn next_text(outbound: &mut fmpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        match outbound.next().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_writes_frames_in_order() {
        let (handle, _task, mut outbound) = spawn_actor(CancellationToken::new());
        assert_eq!(handle.connection_id(), "conn-1");
        assert_eq!(handle.user_id(), "user-1");

        assert!(handle.send(ServerMessage::RtpCapabilitiesAck));
        assert!(handle.send(ServerMessage::pong_now()));

        assert_eq!(next_text(&mut outbound).await["type"], "rtp-capabilities-ack");
        assert_eq!(next_text(&mut outbound).await["type"], "pong");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_ping_sends_ws_ping() {
        let (handle, _task, mut outbound) = spawn_actor(CancellationToken::new());
        assert!(handle.ping());
        assert!(matches!(outbound.next().await, Some(Message::Ping(_))));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_with_frame() {
        let (handle, task, mut outbound) = spawn_actor(CancellationToken::new());

        handle.close(Some(ServerMessage::ForceDisconnect {
            reason: "kicked".to_string(),
        }));

        let frame = next_text(&mut outbound).await;
        assert_eq!(frame["type"], "force_disconnect");
        assert_eq!(frame["reason"], "kicked");
        assert!(matches!(outbound.next().await, Some(Message::Close(_))));

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled(), "actor exit cancels its token");
    }

    #[tokio::test]
    async fn test_parent_cancellation_closes_socket() {
        let parent = CancellationToken::new();
        let (handle, task, mut outbound) = spawn_actor(parent.child_token());

        parent.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled());
        assert!(matches!(outbound.next().await, Some(Message::Close(_))));
        assert!(!handle.send(ServerMessage::RtpCapabilitiesAck));
    }

    #[tokio::test]
    async fn test_socket_failure_stops_actor() {
        let (handle, task, outbound) = spawn_actor(CancellationToken::new());
        drop(outbound);

        handle.send(ServerMessage::RtpCapabilitiesAck);

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
    }
}
