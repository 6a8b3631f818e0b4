//! Observability module for the Voice Controller.
//!
//! Identifiers (user, channel, connection) are logged as structured fields.
//! Message payloads, SDP and DTLS parameters are never logged. Metric labels
//! are bounded:
//! - `kind`: fresh, restore
//! - `reason`: close, heartbeat-timeout, force-disconnect
//! - `message_type`: bounded by the protocol's message types
//! - `error_type`: rejection, protocol, resource, engine, internal
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `vc_connections_active` | Gauge | none | Current Active connections |
//! | `vc_channels_active` | Gauge | none | Channels with a live actor |
//! | `vc_staged_participants` | Gauge | none | Participants inside the grace window |
//! | `vc_joins_total` | Counter | `kind` | Fresh joins and restores |
//! | `vc_staged_total` | Counter | `reason` | Staged disconnects |
//! | `vc_finalized_total` | Counter | none | Grace-window expiries and forced removals |
//! | `vc_message_latency_seconds` | Histogram | `message_type` | Signaling handler latency |
//! | `vc_reconnect_latency_seconds` | Histogram | none | Staged to restored delay |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
