//! JSON frames exchanged over the signaling socket.
//!
//! Inbound frames carry a string `type` and, for most requests, a `data`
//! object. Outbound frames are serialized from [`ServerMessage`], whose
//! variants map one-to-one onto the wire `type` values.

use crate::errors::VcError;
use crate::media::{MediaKind, TransportParams};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Connected greeting text.
pub const CONNECTED_MESSAGE: &str = "socket connection successful";

/// Reason sent with a forced disconnect when the backend gives none.
pub const DEFAULT_FORCE_DISCONNECT_REASON: &str = "disconnected by server";

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    #[serde(default)]
    pub transport_id: Option<String>,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    #[serde(default)]
    pub transport_id: Option<String>,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default)]
    pub transport_id: Option<String>,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub rtp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowControlRequest {
    pub transport_id: String,
    #[serde(default)]
    pub consumer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTransportRequest {
    pub transport_id: String,
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping,
    Pong,
    ClientRtpCapabilities(Value),
    GetRtpCapabilities,
    CreateTransport,
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    Resume(FlowControlRequest),
    Pause(FlowControlRequest),
    CloseTransport(CloseTransportRequest),
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// - `MalformedJson` if the frame is not JSON
    /// - `MissingType` if it is not an object with a string `type`
    /// - `UnknownMessageType` for an unrecognized `type`
    /// - `InvalidPayload` / `UnsupportedMediaKind` for bad request fields
    pub fn parse(text: &str) -> Result<Self, VcError> {
        let value: Value = serde_json::from_str(text).map_err(|_| VcError::MalformedJson)?;
        let Value::Object(mut object) = value else {
            return Err(VcError::MissingType);
        };

        let message_type = match object.remove("type") {
            Some(Value::String(t)) => t,
            _ => return Err(VcError::MissingType),
        };

        match message_type.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "pong" => Ok(ClientMessage::Pong),
            "get-rtp-capabilities" => Ok(ClientMessage::GetRtpCapabilities),
            "create-transport" => Ok(ClientMessage::CreateTransport),
            "client-rtp-capabilities" => {
                // Capabilities may sit under `data` or directly on the frame.
                let payload = match object.remove("data") {
                    Some(data) if !data.is_null() => data,
                    _ => Value::Object(object),
                };
                Ok(ClientMessage::ClientRtpCapabilities(payload))
            }
            "connect-transport" => payload(&mut object).map(ClientMessage::ConnectTransport),
            "produce" => {
                let data = object.remove("data").unwrap_or(Value::Null);
                if data
                    .get("kind")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| kind != MediaKind::Audio.as_str())
                {
                    return Err(VcError::UnsupportedMediaKind);
                }
                decode(data).map(ClientMessage::Produce)
            }
            "consume" => payload(&mut object).map(ClientMessage::Consume),
            "resume" => payload(&mut object).map(ClientMessage::Resume),
            "pause" => payload(&mut object).map(ClientMessage::Pause),
            "close-transport" => payload(&mut object).map(ClientMessage::CloseTransport),
            other => Err(VcError::UnknownMessageType(other.to_string())),
        }
    }

    /// Bounded label for latency metrics.
    #[must_use]
    pub const fn type_label(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
            ClientMessage::ClientRtpCapabilities(_) => "client-rtp-capabilities",
            ClientMessage::GetRtpCapabilities => "get-rtp-capabilities",
            ClientMessage::CreateTransport => "create-transport",
            ClientMessage::ConnectTransport(_) => "connect-transport",
            ClientMessage::Produce(_) => "produce",
            ClientMessage::Consume(_) => "consume",
            ClientMessage::Resume(_) => "resume",
            ClientMessage::Pause(_) => "pause",
            ClientMessage::CloseTransport(_) => "close-transport",
        }
    }
}

fn payload<T: DeserializeOwned>(object: &mut Map<String, Value>) -> Result<T, VcError> {
    decode(object.remove("data").unwrap_or(Value::Null))
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, VcError> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| VcError::InvalidPayload(e.to_string()))
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    pub channel_id: String,
    pub user_id: String,
    pub message: String,
    pub restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportIdData {
    pub transport_id: String,
}

impl TransportIdData {
    #[must_use]
    pub fn new(transport_id: &str) -> Self {
        Self {
            transport_id: transport_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdData {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub user_id: String,
}

/// Every frame the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "error")]
    Error {
        data: String,
        code: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },

    #[serde(rename = "connected")]
    Connected { data: ConnectedData },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    #[serde(rename = "rtp-capabilities-ack")]
    RtpCapabilitiesAck,

    #[serde(rename = "rtp-capabilities")]
    RtpCapabilities { data: Value },

    #[serde(rename = "transport-params")]
    TransportParams { data: TransportParams },

    #[serde(rename = "transport-connected")]
    TransportConnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<TransportRef>,
    },

    #[serde(rename = "producer-id")]
    ProducerId { data: ProducerIdData },

    #[serde(rename = "currentlyInChannel", rename_all = "camelCase")]
    CurrentlyInChannel {
        in_room: Vec<String>,
        producers: Vec<String>,
    },

    #[serde(rename = "available-producers")]
    AvailableProducers { producers: Vec<ProducerRef> },

    #[serde(rename = "new-producer")]
    NewProducer { data: ProducerRef },

    #[serde(rename = "consumer-params")]
    ConsumerParams { data: ConsumerParams },

    #[serde(rename = "resumed")]
    Resumed { data: TransportIdData },

    #[serde(rename = "paused")]
    Paused { data: TransportIdData },

    #[serde(rename = "transport-closed")]
    TransportClosed { data: TransportIdData },

    #[serde(rename = "force_disconnect")]
    ForceDisconnect { reason: String },
}

impl ServerMessage {
    /// Error frame for a failed request.
    #[must_use]
    pub fn error(err: &VcError) -> Self {
        ServerMessage::Error {
            data: err.client_message(),
            code: err.error_code(),
            status: err.status(),
        }
    }

    #[must_use]
    pub fn pong_now() -> Self {
        ServerMessage::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Wire `type` value, used for logging.
    #[must_use]
    pub const fn type_label(&self) -> &'static str {
        match self {
            ServerMessage::Error { .. } => "error",
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::RtpCapabilitiesAck => "rtp-capabilities-ack",
            ServerMessage::RtpCapabilities { .. } => "rtp-capabilities",
            ServerMessage::TransportParams { .. } => "transport-params",
            ServerMessage::TransportConnected { .. } => "transport-connected",
            ServerMessage::ProducerId { .. } => "producer-id",
            ServerMessage::CurrentlyInChannel { .. } => "currentlyInChannel",
            ServerMessage::AvailableProducers { .. } => "available-producers",
            ServerMessage::NewProducer { .. } => "new-producer",
            ServerMessage::ConsumerParams { .. } => "consumer-params",
            ServerMessage::Resumed { .. } => "resumed",
            ServerMessage::Paused { .. } => "paused",
            ServerMessage::TransportClosed { .. } => "transport-closed",
            ServerMessage::ForceDisconnect { .. } => "force_disconnect",
        }
    }

    /// Serialize to a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":"An internal error occurred","code":"internal"}"#.to_string()
        })
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
    use crate::errors::ConsumeRejection;
    use serde_json::json;

    fn to_value(message: &ServerMessage) -> Value {
        serde_json::from_str(&message.to_json()).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(
            ClientMessage::parse("{not json"),
            Err(VcError::MalformedJson)
        ));
        assert!(matches!(
            ClientMessage::parse("[1,2,3]"),
            Err(VcError::MissingType)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"data":{}}"#),
            Err(VcError::MissingType)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":42}"#),
            Err(VcError::MissingType)
        ));
        match ClientMessage::parse(r#"{"type":"teleport"}"#) {
            Err(VcError::UnknownMessageType(t)) => assert_eq!(t, "teleport"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_simple_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"pong"}"#).unwrap(),
            ClientMessage::Pong
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"create-transport"}"#).unwrap(),
            ClientMessage::CreateTransport
        );
    }

    #[test]
    fn test_parse_capabilities_both_placements() {
        let under_data = ClientMessage::parse(
            r#"{"type":"client-rtp-capabilities","data":{"rtpCapabilities":{"codecs":[]}}}"#,
        )
        .unwrap();
        assert_eq!(
            under_data,
            ClientMessage::ClientRtpCapabilities(json!({"rtpCapabilities": {"codecs": []}}))
        );

        let inline =
            ClientMessage::parse(r#"{"type":"client-rtp-capabilities","rtpCapabilities":{"codecs":[]}}"#)
                .unwrap();
        assert_eq!(
            inline,
            ClientMessage::ClientRtpCapabilities(json!({"rtpCapabilities": {"codecs": []}}))
        );
    }

    #[test]
    fn test_parse_connect_transport_requires_dtls() {
        let parsed = ClientMessage::parse(
            r#"{"type":"connect-transport","data":{"transportId":"t1","dtlsParameters":{"role":"client"}}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::ConnectTransport(ConnectTransportRequest {
                transport_id: Some("t1".to_string()),
                dtls_parameters: json!({"role": "client"}),
            })
        );

        assert!(matches!(
            ClientMessage::parse(r#"{"type":"connect-transport","data":{}}"#),
            Err(VcError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_parse_produce_audio_only() {
        let parsed = ClientMessage::parse(
            r#"{"type":"produce","data":{"kind":"audio","rtpParameters":{"codecs":[]}}}"#,
        )
        .unwrap();
        match parsed {
            ClientMessage::Produce(request) => {
                assert_eq!(request.kind, MediaKind::Audio);
                assert_eq!(request.transport_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            ClientMessage::parse(r#"{"type":"produce","data":{"kind":"video","rtpParameters":{}}}"#),
            Err(VcError::UnsupportedMediaKind)
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"produce"}"#),
            Err(VcError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_parse_consume_all_optional() {
        let parsed = ClientMessage::parse(r#"{"type":"consume"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Consume(ConsumeRequest {
                transport_id: None,
                producer_id: None,
                rtp_capabilities: None,
            })
        );
    }

    #[test]
    fn test_parse_flow_control_requires_transport() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"pause","data":{}}"#),
            Err(VcError::InvalidPayload(_))
        ));
        let parsed =
            ClientMessage::parse(r#"{"type":"resume","data":{"transportId":"t1","consumerId":"c1"}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Resume(FlowControlRequest {
                transport_id: "t1".to_string(),
                consumer_id: Some("c1".to_string()),
            })
        );
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = to_value(&ServerMessage::error(&VcError::from(
            ConsumeRejection::ProducerNotFound,
        )));
        assert_eq!(
            frame,
            json!({
                "type": "error",
                "data": "Cannot consume this producer: producer not found",
                "code": "producer-not-found"
            })
        );

        let frame = to_value(&ServerMessage::error(&VcError::ChannelValidation {
            status: 403,
        }));
        assert_eq!(frame["status"], 403);
        assert_eq!(frame["data"], "Channel validation failed");
    }

    #[test]
    fn test_currently_in_channel_shape() {
        let frame = to_value(&ServerMessage::CurrentlyInChannel {
            in_room: vec!["u1".to_string()],
            producers: vec!["p1".to_string()],
        });
        assert_eq!(
            frame,
            json!({"type": "currentlyInChannel", "inRoom": ["u1"], "producers": ["p1"]})
        );
    }

    #[test]
    fn test_connected_shape() {
        let fresh = to_value(&ServerMessage::Connected {
            data: ConnectedData {
                channel_id: "c1".to_string(),
                user_id: "u1".to_string(),
                message: CONNECTED_MESSAGE.to_string(),
                restored: false,
                transport_ids: None,
                producer_id: None,
            },
        });
        assert_eq!(fresh["type"], "connected");
        assert_eq!(fresh["data"]["restored"], false);
        assert!(fresh["data"].get("transportIds").is_none());

        let restored = to_value(&ServerMessage::Connected {
            data: ConnectedData {
                channel_id: "c1".to_string(),
                user_id: "u1".to_string(),
                message: CONNECTED_MESSAGE.to_string(),
                restored: true,
                transport_ids: Some(vec!["t1".to_string()]),
                producer_id: Some("p1".to_string()),
            },
        });
        assert_eq!(restored["data"]["transportIds"], json!(["t1"]));
        assert_eq!(restored["data"]["producerId"], "p1");
    }

    #[test]
    fn test_transport_connected_optional_data() {
        assert_eq!(
            to_value(&ServerMessage::TransportConnected { data: None }),
            json!({"type": "transport-connected"})
        );
        assert_eq!(
            to_value(&ServerMessage::TransportConnected {
                data: Some(TransportRef {
                    id: "t1".to_string()
                })
            }),
            json!({"type": "transport-connected", "data": {"id": "t1"}})
        );
    }

    #[test]
    fn test_consumer_params_carry_user() {
        let frame = to_value(&ServerMessage::ConsumerParams {
            data: ConsumerParams {
                id: "c1".to_string(),
                producer_id: "p1".to_string(),
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                user_id: "u1".to_string(),
            },
        });
        assert_eq!(frame["data"]["producerId"], "p1");
        assert_eq!(frame["data"]["userId"], "u1");
        assert_eq!(frame["data"]["kind"], "audio");
    }

    #[test]
    fn test_force_disconnect_and_pong_shape() {
        assert_eq!(
            to_value(&ServerMessage::ForceDisconnect {
                reason: DEFAULT_FORCE_DISCONNECT_REASON.to_string()
            }),
            json!({"type": "force_disconnect", "reason": "disconnected by server"})
        );
        let pong = to_value(&ServerMessage::pong_now());
        assert!(pong["timestamp"].as_i64().unwrap() > 0);
    }
}
