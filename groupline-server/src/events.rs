//! Event bus envelope and channel naming.
//!
//! Every frame on the bus is one JSON envelope:
//!
//! ```json
//! {"type":"user_added","origin":"<instance uuid>","payload":{"user_id":"...","group_id":"..."}}
//! ```
//!
//! Chat messages travel on a per-group channel (`chat:group:{id}`) so the
//! broker's per-channel ordering gives in-order delivery within a group.
//! Membership and group lifecycle events share the single
//! [`LIFECYCLE_CHANNEL`]. Frames are decoded once into [`BusEvent`].

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, GroupId, InstanceId, UserId};

/// Channel carrying every membership/group lifecycle event.
pub const LIFECYCLE_CHANNEL: &str = "events:lifecycle";
/// Prefix of the per-group chat channels.
pub const CHAT_CHANNEL_PREFIX: &str = "chat:group:";
/// Pattern subscription covering every per-group chat channel.
pub const CHAT_CHANNEL_PATTERN: &str = "chat:group:*";

/// Chat channel for one group.
pub fn chat_channel(group: GroupId) -> String {
    format!("{CHAT_CHANNEL_PREFIX}{group}")
}

/// Events replayed on every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BusEvent {
    /// A persisted chat message for local delivery.
    ChatMessage(ChatMessage),

    /// A user became a member of a group.
    UserAdded { user_id: UserId, group_id: GroupId },

    /// A user stopped being a member of a group.
    UserRemoved { user_id: UserId, group_id: GroupId },

    /// A group was created with `admin_id` as its first member.
    GroupCreated {
        group_id: GroupId,
        name: String,
        admin_id: UserId,
    },

    /// A group was deleted; every instance drops it.
    GroupDeleted { group_id: GroupId },

    /// A group's display name changed.
    GroupUpdated { group_id: GroupId, name: String },
}

impl BusEvent {
    /// Channel this event is published on.
    pub fn channel(&self) -> String {
        match self {
            BusEvent::ChatMessage(msg) => chat_channel(msg.group_id),
            _ => LIFECYCLE_CHANNEL.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::ChatMessage(_) => "chat_message",
            BusEvent::UserAdded { .. } => "user_added",
            BusEvent::UserRemoved { .. } => "user_removed",
            BusEvent::GroupCreated { .. } => "group_created",
            BusEvent::GroupDeleted { .. } => "group_deleted",
            BusEvent::GroupUpdated { .. } => "group_updated",
        }
    }
}

/// A bus frame: the event plus the instance that published it.
///
/// `origin` is informational (logging); every instance, including the
/// origin, applies every event through the same listener path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: InstanceId,
    #[serde(flatten)]
    pub event: BusEvent,
}

impl Envelope {
    pub fn new(origin: InstanceId, event: BusEvent) -> Self {
        Self { origin, event }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A raw frame received from a bus subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    pub channel: String,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, MessageUser};

    #[test]
    fn envelope_is_flat_type_origin_payload() {
        let origin = InstanceId::new();
        let user = UserId::new();
        let group = GroupId::new();
        let env = Envelope::new(origin, BusEvent::UserAdded { user_id: user, group_id: group });

        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "user_added");
        assert_eq!(json["origin"], origin.to_string());
        assert_eq!(json["payload"]["user_id"], user.to_string());
        assert_eq!(json["payload"]["group_id"], group.to_string());

        let back = Envelope::decode(&json.to_string()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn chat_messages_route_to_their_group_channel() {
        let group = GroupId::new();
        let event = BusEvent::ChatMessage(ChatMessage {
            id: MessageId::new(),
            content: "hi".into(),
            group_id: group,
            user: MessageUser { id: UserId::new(), username: "u".into() },
            timestamp: chrono::Utc::now(),
        });
        assert_eq!(event.channel(), format!("chat:group:{group}"));
        assert_eq!(event.kind(), "chat_message");

        let deleted = BusEvent::GroupDeleted { group_id: group };
        assert_eq!(deleted.channel(), LIFECYCLE_CHANNEL);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let raw = format!(
            r#"{{"type":"user_banned","origin":"{}","payload":{{}}}}"#,
            InstanceId::new()
        );
        assert!(Envelope::decode(&raw).is_err());
    }
}
