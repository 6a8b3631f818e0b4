//! Mock backend validator.
//!
//! Accepts every user by default. Individual users or channels can be
//! rejected with a specific error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Map;
use vc_service::backend::{ChannelDetails, ChannelValidator};
use vc_service::errors::VcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Backend answered with this HTTP status.
    Status(u16),
    NotMedia,
    Unavailable,
}

impl Rejection {
    fn to_error(self) -> VcError {
        match self {
            Rejection::Status(status) => VcError::ChannelValidation { status },
            Rejection::NotMedia => VcError::NotMediaChannel,
            Rejection::Unavailable => VcError::BackendUnavailable("connection refused".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockValidator {
    users: Arc<Mutex<HashMap<String, Rejection>>>,
    channels: Arc<Mutex<HashMap<String, Rejection>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reject_user(self, user_id: impl Into<String>, rejection: Rejection) -> Self {
        self.users.lock().unwrap().insert(user_id.into(), rejection);
        self
    }

    #[must_use]
    pub fn reject_channel(self, channel_id: impl Into<String>, rejection: Rejection) -> Self {
        self.channels
            .lock()
            .unwrap()
            .insert(channel_id.into(), rejection);
        self
    }

    /// Every `(user_id, channel_id)` validated so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ChannelValidator for MockValidator {
    async fn validate(&self, user_id: &str, channel_id: &str) -> Result<ChannelDetails, VcError> {
        self.calls
            .lock()
            .unwrap()
            .push((user_id.to_string(), channel_id.to_string()));

        if let Some(rejection) = self.users.lock().unwrap().get(user_id) {
            return Err(rejection.to_error());
        }
        if let Some(rejection) = self.channels.lock().unwrap().get(channel_id) {
            return Err(rejection.to_error());
        }

        Ok(ChannelDetails {
            is_media: true,
            metadata: Map::new(),
        })
    }
}
