//! `/socket` endpoint.

use super::session::{run_session, Identity};
use super::SessionContext;
use crate::media::network::detect_family;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use std::net::SocketAddr;

/// Identity carried in the socket URL.
#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    pub auth: Option<String>,
    #[serde(rename = "channelId")]
    pub channel_id: Option<String>,
}

/// Upgrade the request and hand the socket to a session task.
///
/// Identity problems are reported over the socket after the upgrade, so
/// clients always see a JSON error frame rather than an HTTP status.
pub async fn socket_handler(
    ws: Option<WebSocketUpgrade>,
    State(ctx): State<SessionContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
) -> Response {
    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(serde_json::json!({
                "error": "Expected a WebSocket upgrade",
                "code": "UPGRADE_REQUIRED",
            })),
        )
            .into_response();
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let family = detect_family(&headers, peer);
    let identity = Identity::from_query(query.auth, query.channel_id);

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_session(ctx, identity, family, sink, stream).await;
    })
}
