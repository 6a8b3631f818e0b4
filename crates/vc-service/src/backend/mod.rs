//! Backend collaborators: channel validation and the interop relay.

pub mod interop;
pub mod validator;

pub use interop::{run_interop_relay, InteropEvent, InteropPublisher, PresenceEvent};
pub use validator::{ChannelDetails, ChannelValidator, HttpChannelValidator};
