//! Interop event relay.
//!
//! Presence and producer events are published fire-and-forget to the
//! backend over a WebSocket link. The same link carries control commands
//! back, currently only `force_disconnect`.
//!
//! Publishing never blocks: [`InteropPublisher`] pushes onto an unbounded
//! queue drained by [`run_interop_relay`]. While the link is down, queued
//! events are dropped and counted.

use crate::actors::ChannelControllerHandle;
use crate::observability::metrics;
use crate::signaling::protocol::DEFAULT_FORCE_DISCONNECT_REASON;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Delay before redialing after the link drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceEvent {
    Join,
    Leave,
    StagedLeave,
    Rejoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerEvent {
    Add,
}

/// Outbound interop event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteropEvent {
    #[serde(rename_all = "camelCase")]
    MediaPresence {
        event: PresenceEvent,
        user_id: String,
        channel_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ChannelPresenceSync {
        channel_id: String,
        user_ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    MediaProducer {
        event: ProducerEvent,
        user_id: String,
        channel_id: String,
        producer_id: String,
    },
}

/// Inbound control command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteropCommand {
    ForceDisconnect {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Cloneable, never-blocking handle for publishing interop events.
#[derive(Debug, Clone)]
pub struct InteropPublisher {
    sender: mpsc::UnboundedSender<InteropEvent>,
}

impl InteropPublisher {
    /// Create a publisher and the queue the relay drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InteropEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// A publisher whose events go nowhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self::channel().0
    }

    pub fn publish(&self, event: InteropEvent) {
        if self.sender.send(event).is_err() {
            debug!(target: "vc.interop", "Interop relay stopped, event discarded");
        }
    }

    pub fn presence(&self, event: PresenceEvent, user_id: &str, channel_id: &str) {
        self.publish(InteropEvent::MediaPresence {
            event,
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn presence_sync(&self, channel_id: &str, user_ids: Vec<String>) {
        self.publish(InteropEvent::ChannelPresenceSync {
            channel_id: channel_id.to_string(),
            user_ids,
        });
    }

    pub fn producer_added(&self, user_id: &str, channel_id: &str, producer_id: &str) {
        self.publish(InteropEvent::MediaProducer {
            event: ProducerEvent::Add,
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            producer_id: producer_id.to_string(),
        });
    }
}

/// Run the relay until cancelled or every publisher is dropped.
///
/// With no URL the relay only drains and logs.
#[instrument(skip_all, name = "vc.interop.relay")]
pub async fn run_interop_relay(
    url: Option<String>,
    mut events: mpsc::UnboundedReceiver<InteropEvent>,
    controller: ChannelControllerHandle,
    cancel_token: CancellationToken,
) {
    let Some(url) = url else {
        info!(target: "vc.interop", "No interop URL configured, relay draining only");
        drain(&mut events, &cancel_token).await;
        return;
    };

    loop {
        let connected = tokio::select! {
            () = cancel_token.cancelled() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((stream, _)) => {
                info!(target: "vc.interop", "Interop link established");
                let (mut write, mut read) = stream.split();

                let keep_running = loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            break false;
                        }

                        event = events.recv() => {
                            let Some(event) = event else {
                                let _ = write.send(Message::Close(None)).await;
                                break false;
                            };
                            let Ok(json) = serde_json::to_string(&event) else {
                                metrics::record_interop_event("dropped");
                                continue;
                            };
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!(target: "vc.interop", error = %e, "Interop send failed");
                                metrics::record_interop_event("dropped");
                                break true;
                            }
                            metrics::record_interop_event("sent");
                        }

                        inbound = read.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                metrics::record_interop_event("received");
                                handle_command(&text, &controller).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!(target: "vc.interop", "Interop link closed by peer");
                                break true;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(target: "vc.interop", error = %e, "Interop link error");
                                break true;
                            }
                        },
                    }
                };

                if !keep_running {
                    break;
                }
            }
            Err(e) => {
                warn!(target: "vc.interop", error = %e, "Interop connect failed");
            }
        }

        if !wait_for_redial(&mut events, &cancel_token).await {
            break;
        }
    }

    info!(target: "vc.interop", "Interop relay stopped");
}

/// Sit out the redial delay, dropping events. Returns false on shutdown.
async fn wait_for_redial(
    events: &mut mpsc::UnboundedReceiver<InteropEvent>,
    cancel_token: &CancellationToken,
) -> bool {
    let delay = tokio::time::sleep(RECONNECT_DELAY);
    tokio::pin!(delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => return false,
            () = &mut delay => return true,
            event = events.recv() => {
                if event.is_none() {
                    return false;
                }
                metrics::record_interop_event("dropped");
            }
        }
    }
}

async fn drain(
    events: &mut mpsc::UnboundedReceiver<InteropEvent>,
    cancel_token: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => {
                    debug!(target: "vc.interop", event = ?event, "Interop event (no link)");
                    metrics::record_interop_event("dropped");
                }
                None => return,
            },
        }
    }
}

async fn handle_command(text: &str, controller: &ChannelControllerHandle) {
    let command = match serde_json::from_str::<InteropCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(target: "vc.interop", error = %e, "Ignoring unrecognized interop message");
            return;
        }
    };

    match command {
        InteropCommand::ForceDisconnect {
            user_id,
            channel_id,
            reason,
        } => {
            let reason = reason.unwrap_or_else(|| DEFAULT_FORCE_DISCONNECT_REASON.to_string());
            match controller
                .force_disconnect(channel_id.clone(), user_id.clone(), reason)
                .await
            {
                Ok(closed) => info!(
                    target: "vc.interop",
                    user_id = %user_id,
                    channel_id = %channel_id,
                    closed,
                    "Forced disconnect applied"
                ),
                Err(e) => warn!(
                    target: "vc.interop",
                    user_id = %user_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Forced disconnect failed"
                ),
            }
        }
    }
}
