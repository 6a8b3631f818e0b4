//! Backend channel validation client.
//!
//! Every socket is checked once, before it touches any registry:
//! `GET {backend}/channel/details?id={channelId}` with the user id in the
//! `Authorization` header. The same backend serves the ICE server list at
//! `GET {backend}/config`.

use crate::errors::VcError;
use crate::observability::metrics;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Default timeout for backend requests in seconds.
const BACKEND_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default connect timeout for backend requests in seconds.
const BACKEND_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Channel metadata returned by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDetails {
    /// Absent counts as not media capable.
    #[serde(default)]
    pub is_media: bool,

    /// Everything else the backend returned.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Decides whether a user may open a media session in a channel.
#[async_trait::async_trait]
pub trait ChannelValidator: Send + Sync {
    /// # Errors
    ///
    /// - `BackendUnavailable` if the backend is unreachable or answers garbage
    /// - `ChannelValidation` for a non-success status
    /// - `NotMediaChannel` if the channel is not media capable
    async fn validate(&self, user_id: &str, channel_id: &str) -> Result<ChannelDetails, VcError>;
}

/// HTTP client for the backend's channel and config endpoints.
#[derive(Clone)]
pub struct HttpChannelValidator {
    client: Client,
    base_url: String,
}

impl HttpChannelValidator {
    /// Create a new validator.
    ///
    /// # Errors
    ///
    /// Returns `VcError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String) -> Result<Self, VcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(BACKEND_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(BACKEND_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                error!(target: "vc.backend.validator", error = %e, "Failed to build HTTP client");
                VcError::Internal(format!("failed to build backend client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request_details(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> Result<ChannelDetails, VcError> {
        let url = format!("{}/channel/details", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("id", channel_id)])
            .header("Authorization", user_id)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "vc.backend.validator", error = %e, "Backend request failed");
                VcError::BackendUnavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            debug!(
                target: "vc.backend.validator",
                status = status.as_u16(),
                "Backend rejected channel lookup"
            );
            return Err(VcError::ChannelValidation {
                status: status.as_u16(),
            });
        }

        let details: ChannelDetails = response.json().await.map_err(|e| {
            warn!(target: "vc.backend.validator", error = %e, "Undecodable channel details");
            VcError::BackendUnavailable(format!("invalid channel details: {e}"))
        })?;

        if !details.is_media {
            return Err(VcError::NotMediaChannel);
        }
        Ok(details)
    }

    /// Fetch the ICE server list.
    ///
    /// Accepts `{"iceServers": [...]}` or a bare array. Any failure logs a
    /// warning and yields an empty list.
    #[instrument(skip(self))]
    pub async fn fetch_ice_servers(&self) -> Vec<Value> {
        let url = format!("{}/config", self.base_url);

        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => response,
            Ok(response) => {
                warn!(
                    target: "vc.backend.validator",
                    status = response.status().as_u16(),
                    "ICE config request rejected, continuing without ICE servers"
                );
                return Vec::new();
            }
            Err(e) => {
                warn!(
                    target: "vc.backend.validator",
                    error = %e,
                    "ICE config request failed, continuing without ICE servers"
                );
                return Vec::new();
            }
        };

        match response.json::<Value>().await {
            Ok(Value::Array(servers)) => servers,
            Ok(Value::Object(mut config)) => match config.remove("iceServers") {
                Some(Value::Array(servers)) => servers,
                _ => {
                    warn!(target: "vc.backend.validator", "ICE config has no iceServers list");
                    Vec::new()
                }
            },
            Ok(_) | Err(_) => {
                warn!(target: "vc.backend.validator", "Undecodable ICE config");
                Vec::new()
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelValidator for HttpChannelValidator {
    #[instrument(skip_all, fields(user_id = %user_id, channel_id = %channel_id))]
    async fn validate(&self, user_id: &str, channel_id: &str) -> Result<ChannelDetails, VcError> {
        let start = Instant::now();
        let result = self.request_details(user_id, channel_id).await;

        let outcome = match &result {
            Ok(_) => "accepted",
            Err(VcError::BackendUnavailable(_)) => "unavailable",
            Err(_) => "rejected",
        };
        metrics::record_validation(outcome, start.elapsed());

        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn validator_for(server: &MockServer) -> HttpChannelValidator {
        HttpChannelValidator::new(server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_validate_accepts_media_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channel/details"))
            .and(query_param("id", "chan-1"))
            .and(header("Authorization", "user-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"isMedia": true, "name": "lobby"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let details = validator_for(&server)
            .await
            .validate("user-1", "chan-1")
            .await
            .unwrap();

        assert!(details.is_media);
        assert_eq!(details.metadata.get("name"), Some(&json!("lobby")));
    }

    #[tokio::test]
    async fn test_validate_rejects_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channel/details"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        match validator_for(&server).await.validate("u", "c").await {
            Err(VcError::ChannelValidation { status }) => assert_eq!(status, 403),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_non_media_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channel/details"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"isMedia": false})))
            .mount(&server)
            .await;

        assert!(matches!(
            validator_for(&server).await.validate("u", "c").await,
            Err(VcError::NotMediaChannel)
        ));
    }

    #[tokio::test]
    async fn test_validate_missing_flag_is_not_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channel/details"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "text"})))
            .mount(&server)
            .await;

        assert!(matches!(
            validator_for(&server).await.validate("u", "c").await,
            Err(VcError::NotMediaChannel)
        ));
    }

    #[tokio::test]
    async fn test_validate_undecodable_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channel/details"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = validator_for(&server)
            .await
            .validate("u", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, VcError::BackendUnavailable(_)));
        assert_eq!(err.client_message(), "Backend validation error");
    }

    #[tokio::test]
    async fn test_validate_unreachable_backend() {
        // Nothing listens on port 9 of the loopback.
        let validator = HttpChannelValidator::new("http://127.0.0.1:9".to_string()).unwrap();
        assert!(matches!(
            validator.validate("u", "c").await,
            Err(VcError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_ice_servers_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "iceServers": [{"urls": "stun:stun.example.com:3478"}]
            })))
            .mount(&server)
            .await;

        let servers = validator_for(&server).await.fetch_ice_servers().await;
        assert_eq!(servers, vec![json!({"urls": "stun:stun.example.com:3478"})]);

        let bare = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"urls": "turn:t.example.com"}])),
            )
            .mount(&bare)
            .await;
        assert_eq!(validator_for(&bare).await.fetch_ice_servers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_ice_servers_failure_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/config"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(validator_for(&server).await.fetch_ice_servers().await.is_empty());
    }
}
