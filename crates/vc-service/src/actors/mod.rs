//! Actor hierarchy of the coordinator.
//!
//! ```text
//! ChannelControllerActor (singleton per process)
//! └── supervises N ChannelActors
//!     └── ChannelActor (one per channel with activity)
//!         ├── owns the channel registry and staged participants
//!         └── holds N ConnectionActor handles
//!             └── ConnectionActor (one per WebSocket, outbound half)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per channel**: every registry mutation for a channel
//!   runs inside its `ChannelActor`, so no two operations interleave
//! - **No engine I/O inside actors**: session tasks call the media engine
//!   and commit results; evicted handles are closed in detached tasks
//! - **CancellationToken propagation**: parent actors pass child tokens for
//!   graceful shutdown
//! - **Mailbox monitoring**: depth thresholds (Channel: 100/500,
//!   Connection: 50/200)
//!
//! # Modules
//!
//! - [`controller`] - `ChannelControllerActor` singleton that supervises channels
//! - [`channel`] - `ChannelActor` per channel
//! - [`connection`] - `ConnectionActor` per WebSocket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod channel;
pub mod connection;
pub mod controller;
pub mod messages;
pub mod metrics;

pub use channel::{ChannelActor, ChannelActorHandle, ChannelContext};
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use controller::{ChannelControllerActor, ChannelControllerHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
