//! JSON presence protocol spoken over the realtime channel.
//!
//! Wire format (one text frame per message):
//! ```text
//! { "type": "join",   "userId": "…", "email": "…" }
//! { "type": "leave",  "userId": "…" }
//! { "type": "typing", "userId": "…" }
//! { "type": "idle",   "userId": "…" }
//! ```
//!
//! Delivery is best-effort and unordered across peers; there are no sequence
//! numbers. Frames that fail to decode are dropped by the receiver.

use crate::error::PresenceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
    Typing,
    Idle,
}

/// One presence message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEnvelope {
    #[serde(rename = "type")]
    pub action: PresenceAction,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl PresenceEnvelope {
    pub fn join(user_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            action: PresenceAction::Join,
            user_id: user_id.into(),
            email,
        }
    }

    pub fn leave(user_id: impl Into<String>) -> Self {
        Self::bare(PresenceAction::Leave, user_id)
    }

    pub fn typing(user_id: impl Into<String>) -> Self {
        Self::bare(PresenceAction::Typing, user_id)
    }

    pub fn idle(user_id: impl Into<String>) -> Self {
        Self::bare(PresenceAction::Idle, user_id)
    }

    fn bare(action: PresenceAction, user_id: impl Into<String>) -> Self {
        Self {
            action,
            user_id: user_id.into(),
            email: None,
        }
    }

    pub fn encode(&self) -> Result<String, PresenceError> {
        serde_json::to_string(self).map_err(|e| PresenceError::Malformed(e.to_string()))
    }

    /// Parse a text frame. Messages without a sender are rejected.
    pub fn decode(text: &str) -> Result<Self, PresenceError> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|e| PresenceError::Malformed(e.to_string()))?;
        if envelope.user_id.trim().is_empty() {
            return Err(PresenceError::Malformed("empty userId".into()));
        }
        Ok(envelope)
    }
}
