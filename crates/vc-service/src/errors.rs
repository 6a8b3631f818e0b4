//! Voice Controller error types.
//!
//! Every error maps to a stable wire code and a client-safe message that is
//! sent as an `error` frame. Internal details are logged server-side but not
//! exposed to clients.
//!
//! Error classes:
//! - Rejection (identity, backend validation): terminal, the connection closes
//! - Protocol (malformed frames, unknown types, bad payloads): recoverable
//! - Resource (missing transport/producer/consumer, capability mismatch): recoverable
//! - Engine (media engine call failed): recoverable, surfaced generically

use thiserror::Error;

/// Voice Controller error type.
#[derive(Debug, Error)]
pub enum VcError {
    /// `auth` or `channelId` query parameter absent.
    #[error("Missing auth or channelId in query params")]
    MissingIdentity,

    /// Backend returned a non-success status for the channel lookup.
    #[error("Channel validation failed with status {status}")]
    ChannelValidation { status: u16 },

    /// Backend reports the channel is not media capable.
    #[error("Channel is not a media channel")]
    NotMediaChannel,

    /// Backend unreachable or returned an undecodable body.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Frame body was not JSON.
    #[error("Malformed JSON in message")]
    MalformedJson,

    /// Frame was JSON but carried no string `type`.
    #[error("Invalid message format: missing type")]
    MissingType,

    /// Frame carried an unrecognized `type`.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Required payload fields missing or mistyped.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// `produce` asked for a media kind other than audio.
    #[error("Only audio producers are supported")]
    UnsupportedMediaKind,

    /// RTP capabilities could not be normalized.
    #[error("Invalid RTP capabilities: {0}")]
    InvalidRtpCapabilities(String),

    /// Referenced transport is not owned by the connection.
    #[error("Transport not found")]
    TransportNotFound,

    /// Referenced consumer is not owned by the connection.
    #[error("Consumer not found")]
    ConsumerNotFound,

    /// Consume-all request found nothing to consume.
    #[error("No remote producers available")]
    NoRemoteProducers,

    /// A consume precondition failed.
    #[error("Cannot consume this producer: {0}")]
    ConsumeRejected(ConsumeRejection),

    /// Media engine call failed.
    #[error("Media engine error during {action}: {detail}")]
    Engine { action: EngineAction, detail: String },

    /// The connection left the Active state while an operation was in flight.
    #[error("Connection is no longer active")]
    Stale,

    /// Service is shutting down.
    #[error("Service is draining")]
    Draining,

    /// Internal error (actor mailbox failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons a `consume` request is refused before reaching the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConsumeRejection {
    #[error("transport not found")]
    TransportNotFound,

    #[error("producer not found")]
    ProducerNotFound,

    #[error("rtp capabilities not announced")]
    CapabilitiesNotAnnounced,

    #[error("incompatible rtp capabilities")]
    IncompatibleCapabilities,
}

/// Media engine operation that failed, used for client messages and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    GetCapabilities,
    CreateTransport,
    ConnectTransport,
    Produce,
    CheckCapabilities,
    Consume,
    Pause,
    Resume,
    Close,
}

impl EngineAction {
    /// Returns the action as a bounded label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineAction::GetCapabilities => "get_capabilities",
            EngineAction::CreateTransport => "create_transport",
            EngineAction::ConnectTransport => "connect_transport",
            EngineAction::Produce => "produce",
            EngineAction::CheckCapabilities => "check_capabilities",
            EngineAction::Consume => "consume",
            EngineAction::Pause => "pause",
            EngineAction::Resume => "resume",
            EngineAction::Close => "close",
        }
    }

    const fn client_message(self) -> &'static str {
        match self {
            EngineAction::GetCapabilities => "Failed to get RTP capabilities",
            EngineAction::CreateTransport => "Failed to create transport",
            EngineAction::ConnectTransport => "Failed to connect transport",
            EngineAction::Produce => "Failed to create producer",
            EngineAction::CheckCapabilities | EngineAction::Consume => "Failed to create consumer",
            EngineAction::Pause => "Failed to pause consumer",
            EngineAction::Resume => "Failed to resume consumer",
            EngineAction::Close => "Failed to close transport",
        }
    }
}

impl std::fmt::Display for EngineAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VcError {
    /// Shorthand for an engine failure.
    pub fn engine(action: EngineAction, detail: impl Into<String>) -> Self {
        VcError::Engine {
            action,
            detail: detail.into(),
        }
    }

    /// Returns the stable wire code carried in `error` frames.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            VcError::MissingIdentity
            | VcError::ChannelValidation { .. }
            | VcError::NotMediaChannel => "unauthorized",
            VcError::BackendUnavailable(_) | VcError::Draining => "unavailable",
            VcError::MalformedJson
            | VcError::MissingType
            | VcError::UnknownMessageType(_)
            | VcError::InvalidPayload(_)
            | VcError::UnsupportedMediaKind
            | VcError::InvalidRtpCapabilities(_) => "invalid-request",
            VcError::TransportNotFound
            | VcError::ConsumeRejected(ConsumeRejection::TransportNotFound) => {
                "transport-not-found"
            }
            VcError::NoRemoteProducers
            | VcError::ConsumeRejected(ConsumeRejection::ProducerNotFound) => "producer-not-found",
            VcError::ConsumerNotFound => "consumer-not-found",
            VcError::ConsumeRejected(ConsumeRejection::CapabilitiesNotAnnounced) => {
                "capabilities-not-announced"
            }
            VcError::ConsumeRejected(ConsumeRejection::IncompatibleCapabilities) => {
                "incompatible-capabilities"
            }
            VcError::Engine { .. } => "engine-failure",
            VcError::Stale | VcError::Internal(_) => "internal",
        }
    }

    /// Returns the error type label for metrics.
    ///
    /// Bounded to a small set of classes to keep cardinality low.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            VcError::MissingIdentity
            | VcError::ChannelValidation { .. }
            | VcError::NotMediaChannel
            | VcError::BackendUnavailable(_)
            | VcError::Draining => "rejection",
            VcError::MalformedJson
            | VcError::MissingType
            | VcError::UnknownMessageType(_)
            | VcError::InvalidPayload(_)
            | VcError::UnsupportedMediaKind
            | VcError::InvalidRtpCapabilities(_) => "protocol",
            VcError::TransportNotFound
            | VcError::ConsumerNotFound
            | VcError::NoRemoteProducers
            | VcError::ConsumeRejected(_) => "resource",
            VcError::Engine { .. } => "engine",
            VcError::Stale | VcError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            VcError::ChannelValidation { .. } => "Channel validation failed".to_string(),
            VcError::BackendUnavailable(_) => "Backend validation error".to_string(),
            VcError::Engine { action, .. } => action.client_message().to_string(),
            VcError::Draining => "Server is shutting down, please reconnect".to_string(),
            VcError::Stale | VcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    /// HTTP status reported alongside a validation rejection.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            VcError::ChannelValidation { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether the connection must be closed after the error frame.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            VcError::MissingIdentity
                | VcError::ChannelValidation { .. }
                | VcError::NotMediaChannel
                | VcError::BackendUnavailable(_)
                | VcError::Draining
        )
    }
}

impl From<ConsumeRejection> for VcError {
    fn from(rejection: ConsumeRejection) -> Self {
        VcError::ConsumeRejected(rejection)
    }
}
