//! Per-channel registries.
//!
//! [`ChannelRegistry`] is the single owned store for one channel: active
//! connections with their transports, producer and consumers, the producer
//! to user index, and the staged participants inside the grace window. It
//! is synchronous and owned by exactly one `ChannelActor`, so every method
//! runs under that actor's exclusive access.
//!
//! The registry never calls the media engine. Operations that evict handles
//! return them as [`ReleasedResources`] for the caller to close.
//!
//! Invariants kept by every method:
//! - presence is exactly the set of users with an active connection
//! - a user owns at most one producer in the channel, active or staged
//! - the producer index only names producers held by a connection or a
//!   staged snapshot
//! - no connection or snapshot holds a consumer of a producer that is gone

pub mod staged;

pub use staged::{ExpiryTimer, StagedParticipant};

use crate::errors::{ConsumeRejection, VcError};
use crate::media::network::NetworkFamily;
use crate::media::{MediaKind, ReleasedResources, RtpCapabilities};
use crate::signaling::protocol::ProducerRef;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Server-assigned connection identifier.
pub type ConnectionId = String;

/// Why a connection was staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageReason {
    /// The socket closed or errored.
    Close,
    /// The liveness monitor saw no heartbeat within the threshold.
    HeartbeatTimeout,
}

impl StageReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageReason::Close => "close",
            StageReason::HeartbeatTimeout => "heartbeat-timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerEntry {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerEntry {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Media owned by one connection, or by a staged snapshot of it.
#[derive(Debug, Clone, Default)]
pub struct ParticipantMedia {
    /// Transport id to creation sequence.
    transports: HashMap<String, u64>,
    producer: Option<ProducerEntry>,
    /// Keyed by the consumed producer id.
    consumers: HashMap<String, ConsumerEntry>,
    rtp_capabilities: Option<RtpCapabilities>,
}

impl ParticipantMedia {
    /// Transport ids in creation order.
    #[must_use]
    pub fn transport_ids(&self) -> Vec<String> {
        let mut ordered: Vec<(&String, &u64)> = self.transports.iter().collect();
        ordered.sort_by_key(|(_, seq)| **seq);
        ordered.into_iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn has_transport(&self, transport_id: &str) -> bool {
        self.transports.contains_key(transport_id)
    }

    #[must_use]
    pub fn oldest_transport(&self) -> Option<&str> {
        self.transports
            .iter()
            .min_by_key(|(_, seq)| **seq)
            .map(|(id, _)| id.as_str())
    }

    #[must_use]
    pub fn newest_transport(&self) -> Option<&str> {
        self.transports
            .iter()
            .max_by_key(|(_, seq)| **seq)
            .map(|(id, _)| id.as_str())
    }

    #[must_use]
    pub fn producer(&self) -> Option<&ProducerEntry> {
        self.producer.as_ref()
    }

    #[must_use]
    pub fn consumer_of(&self, producer_id: &str) -> Option<&ConsumerEntry> {
        self.consumers.get(producer_id)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.consumers.values()
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<&RtpCapabilities> {
        self.rtp_capabilities.as_ref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producer.is_none() && self.consumers.is_empty()
    }

    fn take_producer(&mut self) -> Option<ProducerEntry> {
        self.producer.take()
    }

    fn remove_consumer_of(&mut self, producer_id: &str) -> Option<ConsumerEntry> {
        self.consumers.remove(producer_id)
    }

    /// Every handle held, for a full teardown.
    fn into_released(self) -> ReleasedResources {
        let transports = self.transport_ids();
        ReleasedResources {
            transports,
            producers: self.producer.into_iter().map(|p| p.id).collect(),
            consumers: self.consumers.into_values().map(|c| c.id).collect(),
        }
    }

    /// Fold a second snapshot of the same user into this one.
    ///
    /// Transports are unioned, the newer producer wins and the first consumer
    /// per producer wins. Returns the displaced producer and consumers.
    fn absorb(&mut self, newer: ParticipantMedia) -> (Option<ProducerEntry>, ReleasedResources) {
        let mut displaced = ReleasedResources::default();
        let mut displaced_producer = None;

        for (id, seq) in newer.transports {
            self.transports.entry(id).or_insert(seq);
        }

        if let Some(producer) = newer.producer {
            displaced_producer = self.producer.replace(producer);
        }

        for (producer_id, consumer) in newer.consumers {
            if self.consumers.contains_key(&producer_id) {
                displaced.consumers.push(consumer.id);
            } else {
                self.consumers.insert(producer_id, consumer);
            }
        }

        if newer.rtp_capabilities.is_some() {
            self.rtp_capabilities = newer.rtp_capabilities;
        }

        (displaced_producer, displaced)
    }
}

/// One active WebSocket connection in the channel.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub user_id: String,
    pub family: NetworkFamily,
    pub connected_at: Instant,
    pub last_heartbeat_at: Option<Instant>,
    pub media: ParticipantMedia,
}

/// Outcome of registering a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Fresh,
    Restored(RestoreSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSummary {
    pub transport_ids: Vec<String>,
    pub producer_id: Option<String>,
    pub staged_for: Duration,
    pub reason: StageReason,
}

/// One consumer the caller should try to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeTarget {
    pub connection_id: ConnectionId,
    pub transport_id: String,
    pub producer_id: String,
    pub producer_user_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

/// Result of planning an explicit `consume` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumePlan {
    /// Consumers to create.
    pub targets: Vec<ConsumeTarget>,
    /// Consumers the connection already holds, with the producer's user.
    pub existing: Vec<(ConsumerEntry, String)>,
}

/// Result of installing a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerInstall {
    Inserted,
    /// The connection already consumes that producer; the new handle must be
    /// closed and this one returned to the client.
    Existing(ConsumerEntry),
}

/// Result of staging a connection.
#[derive(Debug)]
pub struct StageOutcome {
    pub user_id: String,
    /// An earlier snapshot of the same user existed and was merged.
    pub merged: bool,
    /// Handles displaced by the merge, to be closed.
    pub released: ReleasedResources,
    /// The user still has another active connection.
    pub still_present: bool,
}

/// Result of finalizing a staged participant.
#[derive(Debug)]
pub struct FinalizeOutcome {
    pub released: ReleasedResources,
    pub producer_ids: Vec<String>,
}

/// Result of removing a user outright.
#[derive(Debug, Default)]
pub struct RemovedUser {
    pub connection_ids: Vec<ConnectionId>,
    pub released: ReleasedResources,
    pub had_staged: bool,
}

/// Result of closing a transport.
#[derive(Debug)]
pub struct ClosedTransport {
    pub released: ReleasedResources,
    pub producer_evicted: Option<String>,
}

/// Registries for one channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    staged: HashMap<String, StagedParticipant>,
    producer_users: BTreeMap<String, String>,
    next_seq: u64,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Register a validated connection, restoring the user's staged media
    /// when a snapshot exists.
    ///
    /// Removing the staged record drops its expiry timer, which cancels the
    /// pending finalize.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        user_id: &str,
        family: NetworkFamily,
        now: Instant,
    ) -> Registration {
        let (media, registration) = match self.staged.remove(user_id) {
            Some(staged) => {
                let summary = RestoreSummary {
                    transport_ids: staged.media.transport_ids(),
                    producer_id: staged.media.producer().map(|p| p.id.clone()),
                    staged_for: now.saturating_duration_since(staged.staged_at),
                    reason: staged.reason,
                };
                (staged.into_media(), Registration::Restored(summary))
            }
            None => (ParticipantMedia::default(), Registration::Fresh),
        };

        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id: user_id.to_string(),
                family,
                connected_at: now,
                last_heartbeat_at: Some(now),
                media,
            },
        );

        registration
    }

    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<&ConnectionEntry> {
        self.connections.get(connection_id)
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.connections.keys()
    }

    /// Active connections of one user.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, entry)| entry.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    #[must_use]
    pub fn staged(&self, user_id: &str) -> Option<&StagedParticipant> {
        self.staged.get(user_id)
    }

    /// Users inside the grace window, sorted.
    #[must_use]
    pub fn staged_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.staged.keys().cloned().collect();
        users.sort();
        users
    }

    /// No connection and no staged participant.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.staged.is_empty()
    }

    /// Users with at least one active connection, sorted.
    #[must_use]
    pub fn presence(&self) -> Vec<String> {
        self.connections
            .values()
            .map(|entry| entry.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Producer ids known to the channel, active and staged.
    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        self.producer_users.keys().cloned().collect()
    }

    #[must_use]
    pub fn available_producers(&self) -> Vec<ProducerRef> {
        self.producer_users
            .iter()
            .map(|(producer_id, user_id)| ProducerRef {
                producer_id: producer_id.clone(),
                user_id: user_id.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn producer_user(&self, producer_id: &str) -> Option<&str> {
        self.producer_users.get(producer_id).map(String::as_str)
    }

    /// Record a heartbeat. Returns false for an unknown connection.
    pub fn touch_heartbeat(&mut self, connection_id: &str, now: Instant) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(entry) => {
                entry.last_heartbeat_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Connections whose last heartbeat is older than `threshold`.
    ///
    /// A connection with no recorded heartbeat is seeded from its connect
    /// time first.
    pub fn sweep(&mut self, now: Instant, threshold: Duration) -> Vec<ConnectionId> {
        let mut stale = Vec::new();
        for (id, entry) in &mut self.connections {
            let last = *entry.last_heartbeat_at.get_or_insert(entry.connected_at);
            if now.saturating_duration_since(last) > threshold {
                stale.push(id.clone());
            }
        }
        stale.sort();
        stale
    }

    fn active(&self, connection_id: &str) -> Result<&ConnectionEntry, VcError> {
        self.connections.get(connection_id).ok_or(VcError::Stale)
    }

    fn active_mut(&mut self, connection_id: &str) -> Result<&mut ConnectionEntry, VcError> {
        self.connections.get_mut(connection_id).ok_or(VcError::Stale)
    }

    // ------------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------------

    pub fn add_transport(&mut self, connection_id: &str, transport_id: &str) -> Result<(), VcError> {
        let seq = self.next_seq;
        let entry = self.active_mut(connection_id)?;
        entry.media.transports.insert(transport_id.to_string(), seq);
        self.next_seq += 1;
        Ok(())
    }

    /// Transport ids a `connect-transport` applies to.
    pub fn connect_targets(
        &self,
        connection_id: &str,
        transport_id: Option<&str>,
    ) -> Result<Vec<String>, VcError> {
        let media = &self.active(connection_id)?.media;
        match transport_id {
            Some(id) if media.has_transport(id) => Ok(vec![id.to_string()]),
            Some(_) => Err(VcError::TransportNotFound),
            None if media.transports.is_empty() => Err(VcError::TransportNotFound),
            None => Ok(media.transport_ids()),
        }
    }

    /// Transport a `produce` should use: the named one, else the oldest.
    pub fn transport_for_produce(
        &self,
        connection_id: &str,
        transport_id: Option<&str>,
    ) -> Result<String, VcError> {
        let media = &self.active(connection_id)?.media;
        match transport_id {
            Some(id) if media.has_transport(id) => Ok(id.to_string()),
            Some(_) => Err(VcError::TransportNotFound),
            None => media
                .oldest_transport()
                .map(str::to_string)
                .ok_or(VcError::TransportNotFound),
        }
    }

    /// Consumers a `pause`/`resume` applies to.
    pub fn flow_control_targets(
        &self,
        connection_id: &str,
        transport_id: &str,
        consumer_id: Option<&str>,
    ) -> Result<Vec<String>, VcError> {
        let media = &self.active(connection_id)?.media;
        if !media.has_transport(transport_id) {
            return Err(VcError::TransportNotFound);
        }

        let mut on_transport: Vec<String> = media
            .consumers()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        on_transport.sort();

        match consumer_id {
            Some(id) if on_transport.iter().any(|c| c == id) => Ok(vec![id.to_string()]),
            Some(_) => Err(VcError::ConsumerNotFound),
            None => Ok(on_transport),
        }
    }

    /// Close one transport and evict the producer and consumers riding it.
    pub fn close_transport(
        &mut self,
        connection_id: &str,
        transport_id: &str,
    ) -> Result<ClosedTransport, VcError> {
        let entry = self.active_mut(connection_id)?;
        if entry.media.transports.remove(transport_id).is_none() {
            return Err(VcError::TransportNotFound);
        }

        let mut released = ReleasedResources {
            transports: vec![transport_id.to_string()],
            ..ReleasedResources::default()
        };

        let riding: Vec<String> = entry
            .media
            .consumers()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.producer_id.clone())
            .collect();
        for producer_id in riding {
            if let Some(consumer) = entry.media.remove_consumer_of(&producer_id) {
                released.consumers.push(consumer.id);
            }
        }

        let producer_rides = entry
            .media
            .producer()
            .is_some_and(|p| p.transport_id == transport_id);
        let producer_evicted = if producer_rides {
            entry.media.take_producer().map(|p| p.id)
        } else {
            None
        };

        if let Some(producer_id) = &producer_evicted {
            self.evict_producer_index(producer_id, &mut released);
        }

        Ok(ClosedTransport {
            released,
            producer_evicted,
        })
    }

    // ------------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------------

    /// Evict every producer of the connection's user, wherever it lives.
    ///
    /// Covers the user's other active connections and their staged snapshot.
    /// Consumers of the evicted producers are evicted channel-wide.
    pub fn evict_user_producers(
        &mut self,
        connection_id: &str,
    ) -> Result<(ReleasedResources, Vec<String>), VcError> {
        let user_id = self.active(connection_id)?.user_id.clone();

        let mut evicted: Vec<String> = Vec::new();
        for entry in self.connections.values_mut() {
            if entry.user_id == user_id {
                if let Some(producer) = entry.media.take_producer() {
                    evicted.push(producer.id);
                }
            }
        }
        if let Some(staged) = self.staged.get_mut(&user_id) {
            if let Some(producer) = staged.media.take_producer() {
                evicted.push(producer.id);
            }
        }

        let mut released = ReleasedResources::default();
        for producer_id in &evicted {
            self.evict_producer_index(producer_id, &mut released);
        }
        Ok((released, evicted))
    }

    /// Install a freshly created producer.
    ///
    /// Re-runs the per-user eviction, since another producer of the same user
    /// may have been committed while this one was being created.
    pub fn set_producer(
        &mut self,
        connection_id: &str,
        producer: ProducerEntry,
    ) -> Result<(ReleasedResources, Vec<String>), VcError> {
        let entry = self.active(connection_id)?;
        if !entry.media.has_transport(&producer.transport_id) {
            return Err(VcError::TransportNotFound);
        }
        let user_id = entry.user_id.clone();

        let evicted = self.evict_user_producers(connection_id)?;

        self.producer_users.insert(producer.id.clone(), user_id);
        self.active_mut(connection_id)?.media.producer = Some(producer);
        Ok(evicted)
    }

    /// Drop a producer from the index and every consumer of it in the
    /// channel. The producer itself is queued for close.
    fn evict_producer_index(&mut self, producer_id: &str, released: &mut ReleasedResources) {
        self.producer_users.remove(producer_id);
        released.producers.push(producer_id.to_string());

        for entry in self.connections.values_mut() {
            if let Some(consumer) = entry.media.remove_consumer_of(producer_id) {
                released.consumers.push(consumer.id);
            }
        }
        for staged in self.staged.values_mut() {
            if let Some(consumer) = staged.media.remove_consumer_of(producer_id) {
                released.consumers.push(consumer.id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------------

    /// Record announced RTP capabilities.
    pub fn set_capabilities(
        &mut self,
        connection_id: &str,
        capabilities: RtpCapabilities,
    ) -> Result<(), VcError> {
        self.active_mut(connection_id)?.media.rtp_capabilities = Some(capabilities);
        Ok(())
    }

    /// Validate an explicit `consume` and list what to create.
    ///
    /// Preconditions are checked in order: transport, producer,
    /// capabilities. Each failure carries its own rejection.
    pub fn plan_consume(
        &self,
        connection_id: &str,
        transport_id: Option<&str>,
        producer_id: Option<&str>,
    ) -> Result<ConsumePlan, VcError> {
        let entry = self.active(connection_id)?;
        let media = &entry.media;

        let transport_id = match transport_id {
            Some(id) if media.has_transport(id) => id,
            Some(_) => return Err(ConsumeRejection::TransportNotFound.into()),
            None => media
                .newest_transport()
                .ok_or(ConsumeRejection::TransportNotFound)?,
        };

        let producers: Vec<(&String, &String)> = match producer_id {
            Some(id) => {
                let (producer_id, user_id) = self
                    .producer_users
                    .get_key_value(id)
                    .ok_or(ConsumeRejection::ProducerNotFound)?;
                vec![(producer_id, user_id)]
            }
            None => {
                let remote: Vec<(&String, &String)> = self
                    .producer_users
                    .iter()
                    .filter(|(_, user_id)| **user_id != entry.user_id)
                    .collect();
                if remote.is_empty() {
                    return Err(VcError::NoRemoteProducers);
                }
                remote
            }
        };

        let capabilities = media
            .rtp_capabilities()
            .ok_or(ConsumeRejection::CapabilitiesNotAnnounced)?;

        let mut plan = ConsumePlan {
            targets: Vec::new(),
            existing: Vec::new(),
        };
        for (producer_id, user_id) in producers {
            match media.consumer_of(producer_id) {
                Some(existing) => plan.existing.push((existing.clone(), user_id.clone())),
                None => plan.targets.push(ConsumeTarget {
                    connection_id: connection_id.to_string(),
                    transport_id: transport_id.to_string(),
                    producer_id: producer_id.clone(),
                    producer_user_id: user_id.clone(),
                    rtp_capabilities: capabilities.clone(),
                }),
            }
        }
        Ok(plan)
    }

    /// Other users' active connections that can receive a new producer.
    ///
    /// A connection qualifies once it has announced capabilities and holds a
    /// transport. Connections of the producing user are skipped.
    #[must_use]
    pub fn auto_consume_targets(&self, producer_id: &str) -> Vec<ConsumeTarget> {
        let Some(producer_user) = self.producer_users.get(producer_id) else {
            return Vec::new();
        };

        let mut targets: Vec<ConsumeTarget> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.user_id != *producer_user)
            .filter(|(_, entry)| entry.media.consumer_of(producer_id).is_none())
            .filter_map(|(id, entry)| {
                let capabilities = entry.media.rtp_capabilities()?;
                let transport_id = entry.media.newest_transport()?;
                Some(ConsumeTarget {
                    connection_id: id.clone(),
                    transport_id: transport_id.to_string(),
                    producer_id: producer_id.to_string(),
                    producer_user_id: producer_user.clone(),
                    rtp_capabilities: capabilities.clone(),
                })
            })
            .collect();
        targets.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        targets
    }

    /// Remote producers a connection does not consume yet, on its newest
    /// transport. Empty until it has both capabilities and a transport.
    #[must_use]
    pub fn catch_up_targets(&self, connection_id: &str) -> Vec<ConsumeTarget> {
        let Some(entry) = self.connections.get(connection_id) else {
            return Vec::new();
        };
        let (Some(capabilities), Some(transport_id)) = (
            entry.media.rtp_capabilities(),
            entry.media.newest_transport(),
        ) else {
            return Vec::new();
        };

        self.producer_users
            .iter()
            .filter(|(_, user_id)| **user_id != entry.user_id)
            .filter(|(producer_id, _)| entry.media.consumer_of(producer_id).is_none())
            .map(|(producer_id, user_id)| ConsumeTarget {
                connection_id: connection_id.to_string(),
                transport_id: transport_id.to_string(),
                producer_id: producer_id.clone(),
                producer_user_id: user_id.clone(),
                rtp_capabilities: capabilities.clone(),
            })
            .collect()
    }

    /// Install a freshly created consumer.
    ///
    /// # Errors
    ///
    /// - `Stale` if the connection is no longer active
    /// - producer or transport rejection if either vanished meanwhile
    pub fn add_consumer(
        &mut self,
        connection_id: &str,
        consumer: ConsumerEntry,
    ) -> Result<ConsumerInstall, VcError> {
        if !self.producer_users.contains_key(&consumer.producer_id) {
            let _ = self.active(connection_id)?;
            return Err(ConsumeRejection::ProducerNotFound.into());
        }

        let entry = self.active_mut(connection_id)?;
        if !entry.media.has_transport(&consumer.transport_id) {
            return Err(ConsumeRejection::TransportNotFound.into());
        }
        if let Some(existing) = entry.media.consumer_of(&consumer.producer_id) {
            return Ok(ConsumerInstall::Existing(existing.clone()));
        }

        entry
            .media
            .consumers
            .insert(consumer.producer_id.clone(), consumer);
        Ok(ConsumerInstall::Inserted)
    }

    // ------------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------------

    /// Move an active connection's media into a staged snapshot.
    ///
    /// Nothing is closed. When the user already has a snapshot (two sockets
    /// dropping in turn) the media is merged and the timer replaced. Returns
    /// `None` for an unknown connection.
    pub fn stage(
        &mut self,
        connection_id: &str,
        reason: StageReason,
        now: Instant,
        timer: ExpiryTimer,
    ) -> Option<StageOutcome> {
        let entry = self.connections.remove(connection_id)?;
        let user_id = entry.user_id;
        let still_present = self.connections.values().any(|c| c.user_id == user_id);

        let mut released = ReleasedResources::default();
        let merged = if let Some(existing) = self.staged.get_mut(&user_id) {
            let (displaced_producer, displaced) = existing.media.absorb(entry.media);
            released.merge(displaced);
            existing.refresh(connection_id.to_string(), reason, now, timer);
            if let Some(producer) = displaced_producer {
                self.evict_producer_index(&producer.id, &mut released);
            }
            true
        } else {
            self.staged.insert(
                user_id.clone(),
                StagedParticipant::new(
                    user_id.clone(),
                    connection_id.to_string(),
                    entry.media,
                    reason,
                    now,
                    timer,
                ),
            );
            false
        };

        Some(StageOutcome {
            user_id,
            merged,
            released,
            still_present,
        })
    }

    /// Tear down a staged participant whose grace window elapsed.
    ///
    /// A missing record or a generation mismatch (the record was restored or
    /// re-staged since the timer was armed) is a no-op.
    pub fn finalize(&mut self, user_id: &str, generation: u64) -> Option<FinalizeOutcome> {
        if self.staged.get(user_id)?.generation() != generation {
            return None;
        }
        let staged = self.staged.remove(user_id)?;
        Some(self.release_media(staged.into_media()))
    }

    /// Remove every trace of a user: active connections and staged record.
    pub fn remove_user(&mut self, user_id: &str) -> RemovedUser {
        let mut removed = RemovedUser::default();

        let mut connection_ids = self.connections_of(user_id);
        connection_ids.sort();
        for id in &connection_ids {
            if let Some(released) = self.remove_connection(id) {
                removed.released.merge(released);
            }
        }
        removed.connection_ids = connection_ids;

        if let Some(staged) = self.staged.remove(user_id) {
            removed.had_staged = true;
            let outcome = self.release_media(staged.into_media());
            removed.released.merge(outcome.released);
        }

        removed
    }

    /// Remove a connection without staging it, releasing its media.
    pub fn remove_connection(&mut self, connection_id: &str) -> Option<ReleasedResources> {
        let entry = self.connections.remove(connection_id)?;
        Some(self.release_media(entry.media).released)
    }

    /// Empty the registry, returning every handle. Staged timers are
    /// cancelled as their records drop.
    pub fn drain(&mut self) -> ReleasedResources {
        let mut released = ReleasedResources::default();
        for (_, entry) in self.connections.drain() {
            released.merge(entry.media.into_released());
        }
        for (_, staged) in self.staged.drain() {
            released.merge(staged.into_media().into_released());
        }
        self.producer_users.clear();
        released
    }

    fn release_media(&mut self, mut media: ParticipantMedia) -> FinalizeOutcome {
        let mut released = ReleasedResources::default();
        let mut producer_ids = Vec::new();

        if let Some(producer) = media.take_producer() {
            self.evict_producer_index(&producer.id, &mut released);
            producer_ids.push(producer.id);
        }
        released.merge(media.into_released());

        FinalizeOutcome {
            released,
            producer_ids,
        }
    }

    /// Check the structural invariants. Test builds only.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut held: HashMap<&str, &str> = HashMap::new();
        let mut users_with_producer: BTreeSet<&str> = BTreeSet::new();

        let media_sets: Vec<(&str, &ParticipantMedia)> = self
            .connections
            .values()
            .map(|c| (c.user_id.as_str(), &c.media))
            .chain(self.staged.values().map(|s| (s.user_id.as_str(), &s.media)))
            .collect();

        for &(user_id, media) in &media_sets {
            if let Some(producer) = media.producer() {
                assert!(
                    users_with_producer.insert(user_id),
                    "user {user_id} holds two producers"
                );
                held.insert(producer.id.as_str(), user_id);
            }
        }

        for (producer_id, user_id) in &self.producer_users {
            assert_eq!(
                held.get(producer_id.as_str()),
                Some(&user_id.as_str()),
                "index names unheld producer {producer_id}"
            );
        }
        assert_eq!(held.len(), self.producer_users.len());

        for (_, media) in media_sets {
            for consumer in media.consumers() {
                assert!(
                    self.producer_users.contains_key(&consumer.producer_id),
                    "consumer {} of missing producer",
                    consumer.id
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const GRACE: Duration = Duration::from_secs(60);

    fn caps() -> RtpCapabilities {
        RtpCapabilities::normalize(&json!({
            "codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}]
        }))
        .unwrap()
    }

    fn timer(parent: &CancellationToken, generation: u64) -> ExpiryTimer {
        ExpiryTimer::arm(parent, generation, GRACE, async {})
    }

    fn producer(id: &str, transport_id: &str) -> ProducerEntry {
        ProducerEntry {
            id: id.to_string(),
            transport_id: transport_id.to_string(),
            kind: MediaKind::Audio,
        }
    }

    fn consumer(id: &str, producer_id: &str, transport_id: &str) -> ConsumerEntry {
        ConsumerEntry {
            id: id.to_string(),
            producer_id: producer_id.to_string(),
            transport_id: transport_id.to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: json!({}),
        }
    }

    /// conn-1 (u1) producing p1 on t1, conn-2 (u2) with caps and t2.
    fn two_party(now: Instant) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-2".to_string(), "u2", NetworkFamily::Ipv6, now);
        registry.add_transport("conn-1", "t1").unwrap();
        registry.add_transport("conn-2", "t2").unwrap();
        registry.set_capabilities("conn-2", caps()).unwrap();
        registry.set_producer("conn-1", producer("p1", "t1")).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_fresh_register_and_presence() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();

        assert_eq!(
            registry.register("conn-1".to_string(), "u2", NetworkFamily::Ipv4, now),
            Registration::Fresh
        );
        registry.register("conn-2".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-3".to_string(), "u1", NetworkFamily::Ipv6, now);

        assert_eq!(registry.presence(), vec!["u1", "u2"]);
        assert_eq!(registry.connection_count(), 3);
        assert!(!registry.is_idle());
    }

    #[tokio::test]
    async fn test_transport_selection_order() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);

        assert!(matches!(
            registry.transport_for_produce("conn-1", None),
            Err(VcError::TransportNotFound)
        ));

        registry.add_transport("conn-1", "t-old").unwrap();
        registry.add_transport("conn-1", "t-new").unwrap();

        assert_eq!(registry.transport_for_produce("conn-1", None).unwrap(), "t-old");
        assert_eq!(
            registry.transport_for_produce("conn-1", Some("t-new")).unwrap(),
            "t-new"
        );
        assert!(matches!(
            registry.transport_for_produce("conn-1", Some("t-missing")),
            Err(VcError::TransportNotFound)
        ));
        assert_eq!(
            registry.connect_targets("conn-1", None).unwrap(),
            vec!["t-old", "t-new"]
        );
        assert!(matches!(
            registry.transport_for_produce("conn-9", None),
            Err(VcError::Stale)
        ));
    }

    #[tokio::test]
    async fn test_one_producer_per_user_across_connections() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-a".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-b".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-c".to_string(), "u2", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-a", "ta").unwrap();
        registry.add_transport("conn-b", "tb").unwrap();
        registry.add_transport("conn-c", "tc").unwrap();

        registry.set_producer("conn-a", producer("p-a", "ta")).unwrap();
        registry
            .add_consumer("conn-c", consumer("c-1", "p-a", "tc"))
            .unwrap();

        let (released, evicted) = registry.set_producer("conn-b", producer("p-b", "tb")).unwrap();

        assert_eq!(evicted, vec!["p-a"]);
        assert_eq!(released.producers, vec!["p-a"]);
        assert_eq!(released.consumers, vec!["c-1"], "consumers of evicted producer go too");
        assert_eq!(registry.producer_ids(), vec!["p-b"]);
        assert!(registry.connection("conn-a").unwrap().media.producer().is_none());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_set_producer_evicts_staged_snapshot_producer() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-a".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-b".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-a", "ta").unwrap();
        registry.add_transport("conn-b", "tb").unwrap();
        registry.set_producer("conn-a", producer("p-a", "ta")).unwrap();

        registry
            .stage("conn-a", StageReason::Close, now, timer(&parent, 1))
            .unwrap();
        assert_eq!(registry.producer_ids(), vec!["p-a"], "staged producer still listed");

        let (released, _) = registry.set_producer("conn-b", producer("p-b", "tb")).unwrap();
        assert_eq!(released.producers, vec!["p-a"]);
        assert!(registry.staged("u1").unwrap().media.producer().is_none());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_set_producer_on_closed_transport_fails() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);

        assert!(matches!(
            registry.set_producer("conn-1", producer("p1", "t-gone")),
            Err(VcError::TransportNotFound)
        ));
        assert!(registry.producer_ids().is_empty());
    }

    #[tokio::test]
    async fn test_plan_consume_precondition_order() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-2".to_string(), "u2", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-1", "t1").unwrap();
        registry.set_producer("conn-1", producer("p1", "t1")).unwrap();

        let rejection = |r: Result<ConsumePlan, VcError>| match r {
            Err(VcError::ConsumeRejected(rejection)) => rejection,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(
            rejection(registry.plan_consume("conn-2", None, Some("p1"))),
            ConsumeRejection::TransportNotFound
        );

        registry.add_transport("conn-2", "t2").unwrap();
        assert_eq!(
            rejection(registry.plan_consume("conn-2", Some("t2"), Some("nope"))),
            ConsumeRejection::ProducerNotFound
        );
        assert_eq!(
            rejection(registry.plan_consume("conn-2", Some("t2"), Some("p1"))),
            ConsumeRejection::CapabilitiesNotAnnounced
        );

        registry.set_capabilities("conn-2", caps()).unwrap();
        let plan = registry.plan_consume("conn-2", None, Some("p1")).unwrap();
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].transport_id, "t2");
        assert_eq!(plan.targets[0].producer_user_id, "u1");
    }

    #[tokio::test]
    async fn test_plan_consume_all_without_remote_producers() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-1", "t1").unwrap();
        registry.set_capabilities("conn-1", caps()).unwrap();
        registry.set_producer("conn-1", producer("p1", "t1")).unwrap();

        assert!(matches!(
            registry.plan_consume("conn-1", None, None),
            Err(VcError::NoRemoteProducers)
        ));
    }

    #[tokio::test]
    async fn test_existing_consumer_is_reused() {
        let now = Instant::now();
        let mut registry = two_party(now);

        assert_eq!(
            registry
                .add_consumer("conn-2", consumer("c1", "p1", "t2"))
                .unwrap(),
            ConsumerInstall::Inserted
        );
        match registry
            .add_consumer("conn-2", consumer("c1-dup", "p1", "t2"))
            .unwrap()
        {
            ConsumerInstall::Existing(existing) => assert_eq!(existing.id, "c1"),
            ConsumerInstall::Inserted => panic!("duplicate consumer inserted"),
        }

        let plan = registry.plan_consume("conn-2", None, Some("p1")).unwrap();
        assert!(plan.targets.is_empty());
        assert_eq!(plan.existing.len(), 1);
        assert_eq!(plan.existing[0].1, "u1");
    }

    #[tokio::test]
    async fn test_add_consumer_after_producer_gone() {
        let now = Instant::now();
        let mut registry = two_party(now);
        registry.close_transport("conn-1", "t1").unwrap();

        assert!(matches!(
            registry.add_consumer("conn-2", consumer("c1", "p1", "t2")),
            Err(VcError::ConsumeRejected(ConsumeRejection::ProducerNotFound))
        ));
    }

    #[tokio::test]
    async fn test_auto_consume_targets() {
        let now = Instant::now();
        let mut registry = two_party(now);
        registry.register("conn-3".to_string(), "u3", NetworkFamily::Ipv4, now);
        // u3 has caps but no transport; u1's second socket is the producer's user.
        registry.set_capabilities("conn-3", caps()).unwrap();
        registry.register("conn-4".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-4", "t4").unwrap();
        registry.set_capabilities("conn-4", caps()).unwrap();

        let targets = registry.auto_consume_targets("p1");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].connection_id, "conn-2");
        assert_eq!(targets[0].transport_id, "t2");

        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();
        assert!(registry.auto_consume_targets("p1").is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_targets_after_late_capabilities() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-2".to_string(), "u2", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-1", "t1").unwrap();
        registry.set_producer("conn-1", producer("p1", "t1")).unwrap();

        assert!(registry.catch_up_targets("conn-2").is_empty());
        registry.add_transport("conn-2", "t2a").unwrap();
        assert!(registry.catch_up_targets("conn-2").is_empty(), "no caps yet");

        registry.add_transport("conn-2", "t2b").unwrap();
        registry.set_capabilities("conn-2", caps()).unwrap();
        let targets = registry.catch_up_targets("conn-2");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].producer_id, "p1");
        assert_eq!(targets[0].transport_id, "t2b", "newest transport");
    }

    #[tokio::test]
    async fn test_flow_control_targets() {
        let now = Instant::now();
        let mut registry = two_party(now);
        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();

        assert_eq!(
            registry.flow_control_targets("conn-2", "t2", None).unwrap(),
            vec!["c1"]
        );
        assert_eq!(
            registry
                .flow_control_targets("conn-2", "t2", Some("c1"))
                .unwrap(),
            vec!["c1"]
        );
        assert!(matches!(
            registry.flow_control_targets("conn-2", "t2", Some("c9")),
            Err(VcError::ConsumerNotFound)
        ));
        assert!(matches!(
            registry.flow_control_targets("conn-2", "t9", None),
            Err(VcError::TransportNotFound)
        ));
    }

    #[tokio::test]
    async fn test_close_transport_evicts_riders() {
        let now = Instant::now();
        let mut registry = two_party(now);
        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();

        let closed = registry.close_transport("conn-1", "t1").unwrap();
        assert_eq!(closed.producer_evicted.as_deref(), Some("p1"));
        assert_eq!(closed.released.transports, vec!["t1"]);
        assert_eq!(closed.released.producers, vec!["p1"]);
        assert_eq!(closed.released.consumers, vec!["c1"]);
        assert!(registry.producer_ids().is_empty());
        registry.assert_consistent();

        assert!(matches!(
            registry.close_transport("conn-1", "t1"),
            Err(VcError::TransportNotFound)
        ));
    }

    #[tokio::test]
    async fn test_stage_then_restore_returns_same_handles() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);
        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();

        let outcome = registry
            .stage("conn-1", StageReason::Close, now, timer(&parent, 1))
            .unwrap();
        assert_eq!(outcome.user_id, "u1");
        assert!(!outcome.merged);
        assert!(outcome.released.is_empty(), "staging closes nothing");
        assert!(!outcome.still_present);

        assert_eq!(registry.presence(), vec!["u2"]);
        assert_eq!(registry.producer_ids(), vec!["p1"]);
        assert_eq!(registry.staged_count(), 1);

        let later = now + Duration::from_secs(5);
        match registry.register("conn-1b".to_string(), "u1", NetworkFamily::Ipv4, later) {
            Registration::Restored(summary) => {
                assert_eq!(summary.transport_ids, vec!["t1"]);
                assert_eq!(summary.producer_id.as_deref(), Some("p1"));
                assert_eq!(summary.staged_for, Duration::from_secs(5));
                assert_eq!(summary.reason, StageReason::Close);
            }
            Registration::Fresh => panic!("expected restore"),
        }

        assert_eq!(registry.staged_count(), 0);
        assert_eq!(registry.presence(), vec!["u1", "u2"]);
        assert_eq!(
            registry
                .connection("conn-2")
                .unwrap()
                .media
                .consumer_of("p1")
                .unwrap()
                .id,
            "c1"
        );
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_restore_cancels_timer() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);

        registry
            .stage("conn-1", StageReason::Close, now, timer(&parent, 1))
            .unwrap();

        registry.register("conn-1b".to_string(), "u1", NetworkFamily::Ipv4, now);
        // The staged record and its timer are gone.
        assert!(registry.staged("u1").is_none());
        assert!(registry.finalize("u1", 1).is_none());
    }

    #[tokio::test]
    async fn test_staged_snapshot_keeps_capabilities() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);

        registry
            .stage("conn-2", StageReason::HeartbeatTimeout, now, timer(&parent, 1))
            .unwrap();
        registry.register("conn-2b".to_string(), "u2", NetworkFamily::Ipv4, now);

        assert!(registry
            .connection("conn-2b")
            .unwrap()
            .media
            .rtp_capabilities()
            .is_some());
        assert_eq!(registry.auto_consume_targets("p1").len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_releases_everything_once() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);
        registry.add_transport("conn-1", "t1b").unwrap();
        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();

        let staged = registry
            .stage("conn-1", StageReason::Close, now, timer(&parent, 4))
            .unwrap();
        assert!(staged.released.is_empty());

        assert!(registry.finalize("u1", 3).is_none(), "stale generation is a no-op");

        let outcome = registry.finalize("u1", 4).unwrap();
        let mut transports = outcome.released.transports.clone();
        transports.sort();
        assert_eq!(transports, vec!["t1", "t1b"]);
        assert_eq!(outcome.released.producers, vec!["p1"]);
        assert_eq!(outcome.released.consumers, vec!["c1"], "remote consumer of p1");
        assert_eq!(outcome.producer_ids, vec!["p1"]);

        assert!(registry.producer_ids().is_empty());
        assert!(registry.staged("u1").is_none());
        assert!(registry.finalize("u1", 4).is_none(), "second finalize is a no-op");
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_restage_merges_and_refreshes() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-a".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-b".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-c".to_string(), "u2", NetworkFamily::Ipv4, now);
        registry.add_transport("conn-a", "ta").unwrap();
        registry.add_transport("conn-b", "tb").unwrap();
        registry.add_transport("conn-c", "tc").unwrap();
        registry.set_producer("conn-c", producer("p2", "tc")).unwrap();
        registry
            .add_consumer("conn-a", consumer("ca", "p2", "ta"))
            .unwrap();
        registry
            .add_consumer("conn-b", consumer("cb", "p2", "tb"))
            .unwrap();

        let first = registry
            .stage("conn-a", StageReason::Close, now, timer(&parent, 1))
            .unwrap();
        assert!(first.still_present);
        assert_eq!(registry.presence(), vec!["u1", "u2"]);

        let later = now + Duration::from_secs(10);
        let second = registry
            .stage("conn-b", StageReason::HeartbeatTimeout, later, timer(&parent, 2))
            .unwrap();
        assert!(second.merged);
        assert_eq!(second.released.consumers, vec!["cb"], "duplicate consumer closed");

        let staged = registry.staged("u1").unwrap();
        assert_eq!(staged.generation(), 2);
        assert_eq!(staged.staged_at, later);
        assert_eq!(staged.reason, StageReason::HeartbeatTimeout);
        assert_eq!(staged.media.transport_ids(), vec!["ta", "tb"]);
        assert_eq!(registry.presence(), vec!["u2"]);

        assert!(registry.finalize("u1", 1).is_none());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_sweep_seeds_and_detects() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        registry.register("conn-1".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry.register("conn-2".to_string(), "u2", NetworkFamily::Ipv4, now);
        registry.connections.get_mut("conn-2").unwrap().last_heartbeat_at = None;

        let threshold = Duration::from_secs(60);
        assert!(registry.sweep(now + Duration::from_secs(30), threshold).is_empty());
        assert_eq!(
            registry.connection("conn-2").unwrap().last_heartbeat_at,
            Some(now),
            "seeded from connect time"
        );

        assert!(registry.touch_heartbeat("conn-1", now + Duration::from_secs(50)));
        assert!(!registry.touch_heartbeat("conn-9", now));

        let stale = registry.sweep(now + Duration::from_secs(61), threshold);
        assert_eq!(stale, vec!["conn-2"]);
    }

    #[tokio::test]
    async fn test_remove_user_clears_active_and_staged() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);
        registry.register("conn-1b".to_string(), "u1", NetworkFamily::Ipv4, now);
        registry
            .stage("conn-1", StageReason::Close, now, timer(&parent, 1))
            .unwrap();

        let removed = registry.remove_user("u1");
        assert_eq!(removed.connection_ids, vec!["conn-1b"]);
        assert!(removed.had_staged);
        assert_eq!(removed.released.producers, vec!["p1"]);
        assert_eq!(registry.presence(), vec!["u2"]);
        assert!(registry.producer_ids().is_empty());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_remove_active_producer_releases_remote_consumers() {
        let now = Instant::now();
        let mut registry = two_party(now);
        registry
            .add_consumer("conn-2", consumer("c1", "p1", "t2"))
            .unwrap();

        assert!(registry.remove_connection("conn-9").is_none());

        let removed = registry.remove_user("u1");
        assert_eq!(removed.connection_ids, vec!["conn-1"]);
        assert!(!removed.had_staged);
        assert_eq!(removed.released.transports, vec!["t1"]);
        assert_eq!(removed.released.producers, vec!["p1"]);
        assert_eq!(removed.released.consumers, vec!["c1"]);

        assert!(!registry.contains("conn-1"));
        assert!(registry
            .connection("conn-2")
            .unwrap()
            .media
            .consumer_of("p1")
            .is_none());
        assert!(registry.remove_connection("conn-1").is_none());
        registry.assert_consistent();
    }

    #[tokio::test]
    async fn test_drain_returns_everything() {
        let parent = CancellationToken::new();
        let now = Instant::now();
        let mut registry = two_party(now);
        registry
            .stage("conn-1", StageReason::Close, now, timer(&parent, 1))
            .unwrap();

        let released = registry.drain();
        assert_eq!(released.transports.len(), 2);
        assert_eq!(released.producers, vec!["p1"]);
        assert!(registry.is_idle());
        assert!(registry.producer_ids().is_empty());
    }
}
