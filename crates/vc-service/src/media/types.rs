//! Wire types shared between the signaling protocol and the media engine.
//!
//! Engine-defined blobs (ICE/DTLS/SCTP/RTP parameters) stay opaque
//! `serde_json::Value`s. ICE candidates and RTP capabilities are typed
//! because the coordinator inspects them.

use super::network::NetworkFamily;
use crate::errors::VcError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Media kind of a producer, consumer or codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Engine-side listener a transport is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportListener {
    pub family: NetworkFamily,
    pub listen_ip: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// One ICE candidate as returned by the engine.
///
/// Unknown fields (`tcpType`, ...) are preserved through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u64,
    #[serde(alias = "ip")]
    pub address: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of a freshly created transport, sent to the client as
/// `transport-params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Producer created by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: Value,
}

/// Consumer created by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// One codec a client can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalized client RTP capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Normalize a client-supplied capability object.
    ///
    /// Accepts either the raw `{codecs, headerExtensions}` shape or one
    /// wrapped as `{rtpCapabilities: {...}}`. Anything without a non-empty
    /// codec list is rejected.
    pub fn normalize(value: &Value) -> Result<Self, VcError> {
        let inner = match value.get("rtpCapabilities") {
            Some(wrapped) if wrapped.is_object() => wrapped,
            _ => value,
        };

        if !inner.is_object() {
            return Err(VcError::InvalidRtpCapabilities(
                "capabilities must be an object".to_string(),
            ));
        }

        match inner.get("codecs") {
            Some(Value::Array(codecs)) if !codecs.is_empty() => {}
            Some(Value::Array(_)) => {
                return Err(VcError::InvalidRtpCapabilities(
                    "codecs must not be empty".to_string(),
                ))
            }
            _ => {
                return Err(VcError::InvalidRtpCapabilities(
                    "missing codecs".to_string(),
                ))
            }
        }

        serde_json::from_value(inner.clone())
            .map_err(|e| VcError::InvalidRtpCapabilities(e.to_string()))
    }

    /// Whether any codec of the given kind is present.
    #[must_use]
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }
}
