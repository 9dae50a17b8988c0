//! Durable storage interface: users, groups, memberships and message history.
//!
//! Persistence is the source of truth at rest. The shared membership store
//! is a fast projection of it, seeded at startup and kept current by the
//! membership service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistError;
use crate::types::{ChatMessage, GroupId, GroupMember, GroupMembers, GroupSummary, MessageId, User, UserId};

/// Result of removing a member from a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The user was not a member; nothing changed.
    NotMember,
    /// The user was removed. If they were the last admin, `promoted` is the
    /// member who became admin in their place.
    Removed { promoted: Option<UserId> },
    /// The user was the last member and the group was deleted.
    GroupDeleted,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_user(&self, user: UserId) -> Result<Option<User>, PersistError>;

    async fn create_user(&self, username: &str) -> Result<User, PersistError>;

    async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, PersistError>;

    /// Store a chat message; assigns its ID and timestamp.
    async fn insert_message(
        &self,
        user: UserId,
        group: GroupId,
        content: &str,
    ) -> Result<(MessageId, DateTime<Utc>), PersistError>;

    /// Most recent `limit` messages in a group, oldest first.
    async fn recent_messages(
        &self,
        group: GroupId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PersistError>;

    async fn groups_for_user(&self, user: UserId) -> Result<Vec<GroupSummary>, PersistError>;

    /// Every group with its full member list.
    async fn all_memberships(&self) -> Result<Vec<GroupMembers>, PersistError>;

    /// Members of a group in join order.
    async fn group_members(&self, group: GroupId) -> Result<Vec<GroupMember>, PersistError>;

    async fn get_group(&self, group: GroupId) -> Result<Option<GroupSummary>, PersistError>;

    /// Create a group with `admin` as its first member and admin.
    async fn create_group(&self, name: &str, admin: UserId) -> Result<GroupSummary, PersistError>;

    /// Returns false if the user was already a member.
    async fn add_member(&self, group: GroupId, user: UserId) -> Result<bool, PersistError>;

    /// Remove a member, promoting the earliest remaining member if the last
    /// admin leaves and deleting the group if nobody remains.
    async fn remove_member(&self, group: GroupId, user: UserId)
    -> Result<RemovalOutcome, PersistError>;

    /// Returns false if the group did not exist.
    async fn delete_group(&self, group: GroupId) -> Result<bool, PersistError>;

    /// Returns false if the group did not exist.
    async fn rename_group(&self, group: GroupId, name: &str) -> Result<bool, PersistError>;

    async fn is_admin(&self, group: GroupId, user: UserId) -> Result<bool, PersistError>;

    async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, PersistError>;
}
