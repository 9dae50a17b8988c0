//! Client-facing WebSocket frames.
//!
//! ```json
//! → {"type":"auth","token":"..."}
//! ← {"type":"auth_success"}  |  {"type":"auth_failure","error":"..."}
//! → {"content":"hi","sender_id":"<uuid>","group_id":"<uuid>"}
//! ← {"id":"...","content":"hi","group_id":"...","user":{"id":"...","username":"..."},"timestamp":"..."}
//! ```
//!
//! Server chat frames are [`crate::types::ChatMessage`] serialized as-is.

use serde::{Deserialize, Serialize};

use crate::types::{GroupId, UserId};

/// WebSocket close code sent when the auth handshake fails.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code sent when the first frame is not text.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// First frame a client must send.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
}

impl AuthFrame {
    /// Parse the first client frame. Anything that is not
    /// `{"type":"auth","token":...}` yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Self>(text)
            .ok()
            .filter(|f| f.kind == "auth")
    }
}

/// Server reply to the auth frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthReply {
    AuthSuccess,
    AuthFailure { error: String },
}

impl AuthReply {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::AuthFailure { error: error.into() }
    }

    pub fn to_json(&self) -> String {
        // Serializing a fieldless/one-string enum cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"auth_failure"}"#.to_string())
    }
}

/// A post-auth chat frame from a client. `sender_id` is the identity the
/// client claims; it must match the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientFrame {
    pub content: String,
    pub sender_id: UserId,
    pub group_id: GroupId,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
