//! HTTP client for the out-of-process SFU worker.
//!
//! Every engine operation is one JSON request against the worker's REST
//! surface. Non-2xx responses and transport errors become
//! [`VcError::Engine`] tagged with the failing action. A 404 on a close
//! means the resource is already gone and is treated as success.

use super::types::{
    ConsumerInfo, MediaKind, ProducerInfo, RtpCapabilities, TransportListener, TransportParams,
};
use super::MediaEngine;
use crate::errors::{EngineAction, VcError};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Request timeout for engine calls in seconds.
const ENGINE_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Connect timeout for engine calls in seconds.
const ENGINE_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportRequest<'a> {
    listener: &'a TransportListener,
    enable_udp: bool,
    enable_tcp: bool,
    prefer_udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ice_servers: Option<&'a [Value]>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceRequest<'a> {
    kind: MediaKind,
    rtp_parameters: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeRequest<'a> {
    producer_id: &'a str,
    rtp_capabilities: &'a RtpCapabilities,
    paused: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanConsumeResponse {
    can_consume: bool,
}

/// [`MediaEngine`] backed by the SFU worker's HTTP API.
#[derive(Clone)]
pub struct RemoteMediaEngine {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl RemoteMediaEngine {
    /// Create a new engine client.
    ///
    /// # Errors
    ///
    /// Returns `VcError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String, token: Option<SecretString>) -> Result<Self, VcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(ENGINE_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(ENGINE_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                error!(target: "vc.media.remote", error = %e, "Failed to build HTTP client");
                VcError::Internal(format!("failed to build engine client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, action: EngineAction) -> Result<Response, VcError> {
        self.authorize(builder).send().await.map_err(|e| {
            warn!(target: "vc.media.remote", action = %action, error = %e, "Engine request failed");
            VcError::engine(action, e.to_string())
        })
    }

    /// Decode a successful JSON body or map the status to an engine error.
    async fn parse<T: DeserializeOwned>(
        response: Response,
        action: EngineAction,
    ) -> Result<T, VcError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(response, action).await);
        }

        response.json().await.map_err(|e| {
            error!(target: "vc.media.remote", action = %action, error = %e, "Failed to parse engine response");
            VcError::engine(action, format!("invalid response body: {e}"))
        })
    }

    async fn expect_success(response: Response, action: EngineAction) -> Result<(), VcError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response, action).await)
        }
    }

    /// Closing an unknown resource is not a failure.
    async fn expect_closed(response: Response) -> Result<(), VcError> {
        if response.status() == StatusCode::NOT_FOUND {
            debug!(target: "vc.media.remote", "Engine resource already closed");
            return Ok(());
        }
        Self::expect_success(response, EngineAction::Close).await
    }

    async fn status_error(response: Response, action: EngineAction) -> VcError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            target: "vc.media.remote",
            action = %action,
            status = %status,
            body_len = body.len(),
            "Engine returned error status"
        );
        VcError::engine(action, format!("engine returned {status}"))
    }
}

#[async_trait::async_trait]
impl MediaEngine for RemoteMediaEngine {
    #[instrument(skip(self), name = "vc.media.rtp_capabilities")]
    async fn router_rtp_capabilities(&self) -> Result<Value, VcError> {
        let request = self.client.get(self.url("/router/rtp-capabilities"));
        let response = self.send(request, EngineAction::GetCapabilities).await?;
        Self::parse(response, EngineAction::GetCapabilities).await
    }

    #[instrument(skip(self, listener, ice_servers), name = "vc.media.create_transport", fields(family = %listener.family))]
    async fn create_transport(
        &self,
        listener: &TransportListener,
        ice_servers: &[Value],
    ) -> Result<TransportParams, VcError> {
        let body = CreateTransportRequest {
            listener,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            ice_servers: (!ice_servers.is_empty()).then_some(ice_servers),
        };

        let request = self.client.post(self.url("/transports")).json(&body);
        let response = self.send(request, EngineAction::CreateTransport).await?;
        Self::parse(response, EngineAction::CreateTransport).await
    }

    #[instrument(skip(self, dtls_parameters), name = "vc.media.connect_transport")]
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), VcError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/connect")))
            .json(&json!({ "dtlsParameters": dtls_parameters }));
        let response = self.send(request, EngineAction::ConnectTransport).await?;
        Self::expect_success(response, EngineAction::ConnectTransport).await
    }

    #[instrument(skip(self, kind, rtp_parameters), name = "vc.media.produce", fields(kind = kind.as_str()))]
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerInfo, VcError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/producers")))
            .json(&ProduceRequest {
                kind,
                rtp_parameters,
            });
        let response = self.send(request, EngineAction::Produce).await?;
        Self::parse(response, EngineAction::Produce).await
    }

    #[instrument(skip(self, rtp_capabilities), name = "vc.media.can_consume")]
    async fn can_consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, VcError> {
        let request = self
            .client
            .post(self.url("/router/can-consume"))
            .json(&json!({
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities,
            }));
        let response = self.send(request, EngineAction::CheckCapabilities).await?;
        let body: CanConsumeResponse = Self::parse(response, EngineAction::CheckCapabilities).await?;
        Ok(body.can_consume)
    }

    #[instrument(skip(self, rtp_capabilities), name = "vc.media.consume")]
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, VcError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/consumers")))
            .json(&ConsumeRequest {
                producer_id,
                rtp_capabilities,
                paused: false,
            });
        let response = self.send(request, EngineAction::Consume).await?;
        Self::parse(response, EngineAction::Consume).await
    }

    #[instrument(skip(self), name = "vc.media.pause_consumer")]
    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        let request = self
            .client
            .post(self.url(&format!("/consumers/{consumer_id}/pause")));
        let response = self.send(request, EngineAction::Pause).await?;
        Self::expect_success(response, EngineAction::Pause).await
    }

    #[instrument(skip(self), name = "vc.media.resume_consumer")]
    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        let request = self
            .client
            .post(self.url(&format!("/consumers/{consumer_id}/resume")));
        let response = self.send(request, EngineAction::Resume).await?;
        Self::expect_success(response, EngineAction::Resume).await
    }

    #[instrument(skip(self), name = "vc.media.close_transport")]
    async fn close_transport(&self, transport_id: &str) -> Result<(), VcError> {
        let request = self
            .client
            .delete(self.url(&format!("/transports/{transport_id}")));
        let response = self.send(request, EngineAction::Close).await?;
        Self::expect_closed(response).await
    }

    #[instrument(skip(self), name = "vc.media.close_producer")]
    async fn close_producer(&self, producer_id: &str) -> Result<(), VcError> {
        let request = self
            .client
            .delete(self.url(&format!("/producers/{producer_id}")));
        let response = self.send(request, EngineAction::Close).await?;
        Self::expect_closed(response).await
    }

    #[instrument(skip(self), name = "vc.media.close_consumer")]
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), VcError> {
        let request = self
            .client
            .delete(self.url(&format!("/consumers/{consumer_id}")));
        let response = self.send(request, EngineAction::Close).await?;
        Self::expect_closed(response).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::media::network::NetworkFamily;
    use std::net::{IpAddr, Ipv4Addr};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listener() -> TransportListener {
        TransportListener {
            family: NetworkFamily::Ipv4,
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: Some("203.0.113.7".parse().unwrap()),
            port: Some(40000),
        }
    }

    fn caps() -> RtpCapabilities {
        RtpCapabilities::normalize(&json!({
            "codecs": [{"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}]
        }))
        .unwrap()
    }

    fn engine(server: &MockServer) -> RemoteMediaEngine {
        RemoteMediaEngine::new(server.uri(), None).unwrap()
    }

    #[tokio::test]
    async fn test_router_rtp_capabilities() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/router/rtp-capabilities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"codecs": []})))
            .expect(1)
            .mount(&server)
            .await;

        let caps = engine(&server).router_rtp_capabilities().await.unwrap();
        assert_eq!(caps, json!({"codecs": []}));
    }

    #[tokio::test]
    async fn test_create_transport_sends_listener() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transports"))
            .and(body_partial_json(json!({
                "listener": {"family": "ipv4", "listenIp": "0.0.0.0", "announcedAddress": "203.0.113.7", "port": 40000},
                "enableUdp": true,
                "enableTcp": true,
                "preferUdp": true,
                "iceServers": [{"urls": "stun:stun.example.com"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "t1",
                "iceParameters": {"usernameFragment": "u", "password": "p"},
                "iceCandidates": [{
                    "foundation": "f", "priority": 1, "address": "203.0.113.7",
                    "protocol": "udp", "port": 40000, "type": "host"
                }],
                "dtlsParameters": {"role": "auto", "fingerprints": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let params = engine(&server)
            .create_transport(&listener(), &[json!({"urls": "stun:stun.example.com"})])
            .await
            .unwrap();

        assert_eq!(params.id, "t1");
        assert_eq!(params.ice_candidates.len(), 1);
        assert_eq!(params.ice_candidates[0].port, 40000);
        assert!(params.sctp_parameters.is_none());
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transports/t1/connect"))
            .and(header("authorization", "Bearer engine-token"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let engine =
            RemoteMediaEngine::new(server.uri(), Some(SecretString::from("engine-token".to_string()))).unwrap();
        engine
            .connect_transport("t1", &json!({"role": "client"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transports/t1/producers"))
            .and(body_partial_json(json!({"kind": "audio"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p1", "kind": "audio", "rtpParameters": {"mid": "0"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/router/can-consume"))
            .and(body_partial_json(json!({"producerId": "p1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"canConsume": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transports/t2/consumers"))
            .and(body_partial_json(json!({"producerId": "p1", "paused": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "c1", "producerId": "p1", "kind": "audio", "rtpParameters": {"mid": "1"}
            })))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let producer = engine
            .produce("t1", MediaKind::Audio, &json!({"codecs": []}))
            .await
            .unwrap();
        assert_eq!(producer.id, "p1");

        assert!(engine.can_consume("p1", &caps()).await.unwrap());

        let consumer = engine.consume("t2", "p1", &caps()).await.unwrap();
        assert_eq!(consumer.id, "c1");
        assert_eq!(consumer.producer_id, "p1");
        assert_eq!(consumer.kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_engine_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transports"))
            .respond_with(ResponseTemplate::new(500).set_body_string("worker died"))
            .mount(&server)
            .await;

        let result = engine(&server).create_transport(&listener(), &[]).await;
        match result {
            Err(VcError::Engine { action, .. }) => {
                assert_eq!(action, EngineAction::CreateTransport);
            }
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_not_found_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/transports/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/producers/p1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let engine = engine(&server);
        assert!(engine.close_transport("gone").await.is_ok());
        assert!(matches!(
            engine.close_producer("p1").await,
            Err(VcError::Engine {
                action: EngineAction::Close,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_engine() {
        let engine = RemoteMediaEngine::new("http://127.0.0.1:1".to_string(), None).unwrap();
        let result = engine.pause_consumer("c1").await;
        assert!(matches!(
            result,
            Err(VcError::Engine {
                action: EngineAction::Pause,
                ..
            })
        ));
    }
}
