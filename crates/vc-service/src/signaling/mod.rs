//! Client signaling over WebSocket.
//!
//! - [`handler`] - the `/socket` upgrade endpoint
//! - [`session`] - per-connection session task (validation, join, dispatch)
//! - [`protocol`] - inbound and outbound JSON frames

pub mod handler;
pub mod protocol;
pub mod session;

use crate::actors::{ActorMetrics, ChannelControllerHandle};
use crate::backend::ChannelValidator;
use crate::media::network::ListenerPlan;
use crate::media::MediaEngine;

use serde_json::Value;
use std::sync::Arc;

/// Everything a session task needs, shared by all connections.
#[derive(Clone)]
pub struct SessionContext {
    pub controller: ChannelControllerHandle,
    pub validator: Arc<dyn ChannelValidator>,
    pub engine: Arc<dyn MediaEngine>,
    pub listeners: Arc<ListenerPlan>,
    /// ICE servers forwarded on every `create-transport`.
    pub ice_servers: Arc<Vec<Value>>,
    pub metrics: Arc<ActorMetrics>,
}
