//! Identifiers and domain records shared across the hub, store and persistence.
//!
//! Every identifier is a UUID newtype. User IDs are parsed once, at the auth
//! boundary; everything downstream works with [`UserId`] and never re-decodes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// A registered user.
    UserId
);
uuid_id!(
    /// A chat group.
    GroupId
);
uuid_id!(
    /// A persisted chat message. Generated as UUID v7 so IDs sort by creation time.
    MessageId
);
uuid_id!(
    /// One running server process. Recorded as the owner of its users' sockets.
    InstanceId
);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

/// A user as known to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// Group ID and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
}

/// A member as listed to other members of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: UserId,
    pub username: String,
    pub is_admin: bool,
}

/// A group with its full member list (used by the shared-store bootstrap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembers {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<UserId>,
}

/// Author of a chat message as shown to recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUser {
    pub id: UserId,
    pub username: String,
}

impl From<&User> for MessageUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

/// A persisted chat message. Immutable once created.
///
/// This is also the exact server→client WebSocket frame:
/// `{id, content, group_id, user: {id, username}, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    pub group_id: GroupId,
    pub user: MessageUser,
    pub timestamp: DateTime<Utc>,
}

/// A validated chat message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingChat {
    pub group_id: GroupId,
    pub author: MessageUser,
    pub content: String,
}
