//! Actor bookkeeping: live counts and mailbox pressure.
//!
//! Each actor owns a [`MailboxMonitor`] sized for its kind. Pressure is
//! logged when it changes level, not on every message:
//!
//! | Actor      | Elevated above | Saturated above |
//! |------------|----------------|-----------------|
//! | Controller | 100            | 500             |
//! | Channel    | 100            | 500             |
//! | Connection | 32             | 128             |
//!
//! Connection limits sit below the connection mailbox capacity, so a slow
//! socket shows up as saturated before frames start being dropped.

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Which actor a monitor or panic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Controller,
    Channel,
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Controller => "controller",
            ActorType::Channel => "channel",
            ActorType::Connection => "connection",
        }
    }

    /// `(elevated, saturated)` depth limits.
    #[must_use]
    pub const fn mailbox_limits(&self) -> (usize, usize) {
        match self {
            ActorType::Controller | ActorType::Channel => (100, 500),
            ActorType::Connection => (32, 128),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MailboxPressure {
    Calm = 0,
    Elevated = 1,
    Saturated = 2,
}

impl MailboxPressure {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MailboxPressure::Calm,
            1 => MailboxPressure::Elevated,
            _ => MailboxPressure::Saturated,
        }
    }
}

/// Queue depth and throughput of one actor's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    kind: ActorType,
    owner: String,
    depth: AtomicUsize,
    pressure: AtomicU8,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(kind: ActorType, owner: impl Into<String>) -> Self {
        Self {
            kind,
            owner: owner.into(),
            depth: AtomicUsize::new(0),
            pressure: AtomicU8::new(MailboxPressure::Calm as u8),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.observe(depth);
    }

    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.observe(previous.saturating_sub(1));
    }

    /// A message could not be queued because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        // First drop and then every hundredth, to keep a stalled socket quiet
        if dropped == 1 || dropped % 100 == 0 {
            warn!(
                target: "vc.actor.mailbox",
                actor_type = self.kind.as_str(),
                owner = %self.owner,
                dropped,
                "Mailbox full, message dropped"
            );
        }
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pressure(&self) -> MailboxPressure {
        MailboxPressure::from_u8(self.pressure.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn observe(&self, depth: usize) {
        let (elevated, saturated) = self.kind.mailbox_limits();
        let now = if depth > saturated {
            MailboxPressure::Saturated
        } else if depth > elevated {
            MailboxPressure::Elevated
        } else {
            MailboxPressure::Calm
        };

        let before = MailboxPressure::from_u8(self.pressure.swap(now as u8, Ordering::Relaxed));
        if before == now {
            return;
        }
        if now > before {
            warn!(
                target: "vc.actor.mailbox",
                actor_type = self.kind.as_str(),
                owner = %self.owner,
                depth,
                pressure = ?now,
                "Mailbox pressure rising"
            );
        } else {
            info!(
                target: "vc.actor.mailbox",
                actor_type = self.kind.as_str(),
                owner = %self.owner,
                depth,
                pressure = ?now,
                "Mailbox pressure easing"
            );
        }
    }
}

/// A count that never goes below zero.
#[derive(Debug, Default)]
pub struct LiveCount(AtomicUsize);

impl LiveCount {
    /// Returns the new value.
    pub fn up(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the new value.
    pub fn down(&self) -> usize {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1)
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counts shared by every actor, mirrored into the
/// `vc_channels_active`, `vc_connections_active` and
/// `vc_staged_participants` gauges.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    channels: LiveCount,
    connections: LiveCount,
    staged: LiveCount,
    panics: AtomicU64,
    processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel_created(&self) {
        prom::set_channels_active(self.channels.up() as u64);
    }

    pub fn channel_removed(&self) {
        prom::set_channels_active(self.channels.down() as u64);
    }

    pub fn connection_registered(&self) {
        prom::set_connections_active(self.connections.up() as u64);
    }

    pub fn connection_unregistered(&self) {
        prom::set_connections_active(self.connections.down() as u64);
    }

    pub fn participant_staged(&self) {
        prom::set_staged_participants(self.staged.up() as u64);
    }

    /// A staged participant was restored or finalized.
    pub fn participant_unstaged(&self) {
        prom::set_staged_participants(self.staged.down() as u64);
    }

    /// A channel task ended without going through shutdown.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!(
            target: "vc.actor.panic",
            actor_type = actor_type.as_str(),
            total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.get()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.get()
    }

    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staged.get()
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_limits_are_tighter() {
        let (channel_elevated, _) = ActorType::Channel.mailbox_limits();
        let (connection_elevated, connection_saturated) = ActorType::Connection.mailbox_limits();
        assert!(connection_elevated < channel_elevated);
        assert!(connection_elevated < connection_saturated);
    }

    #[test]
    fn test_pressure_follows_depth_both_ways() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-a");
        assert_eq!(monitor.pressure(), MailboxPressure::Calm);

        for _ in 0..33 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.pressure(), MailboxPressure::Elevated);

        for _ in 0..96 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_depth(), 129);
        assert_eq!(monitor.pressure(), MailboxPressure::Saturated);

        for _ in 0..129 {
            monitor.record_dequeue();
        }
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.pressure(), MailboxPressure::Calm);
        assert_eq!(monitor.messages_processed(), 129);
    }

    #[test]
    fn test_dequeue_on_empty_mailbox_stays_at_zero() {
        let monitor = MailboxMonitor::new(ActorType::Channel, "chan-a");
        monitor.record_dequeue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 1);
    }

    #[test]
    fn test_drops_are_counted() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-b");
        for _ in 0..3 {
            monitor.record_drop();
        }
        assert_eq!(monitor.messages_dropped(), 3);
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_live_counts_saturate() {
        let metrics = ActorMetrics::new();

        metrics.channel_created();
        metrics.connection_registered();
        metrics.connection_registered();
        metrics.participant_staged();
        assert_eq!(
            (metrics.channel_count(), metrics.connection_count(), metrics.staged_count()),
            (1, 2, 1)
        );

        metrics.connection_unregistered();
        metrics.participant_unstaged();
        metrics.participant_unstaged();
        assert_eq!(metrics.connection_count(), 1);
        assert_eq!(metrics.staged_count(), 0);
    }

    #[test]
    fn test_panics_and_processed_messages() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Channel);
        metrics.record_message_processed();
        metrics.record_message_processed();
        assert_eq!(metrics.panic_count(), 1);
        assert_eq!(metrics.messages_processed(), 2);
    }
}
