//! Shared membership store and event bus.
//!
//! The membership store is cross-instance truth for "who is in which group"
//! and "which instance holds this user's socket". The event bus fans chat
//! messages and lifecycle events out to every instance.
//!
//! Two implementations:
//! - [`RedisStore`]: production, many processes share one Redis.
//! - [`MemoryStore`]: one process (no `--redis-url`), and tests that run
//!   several hubs against the same in-process store.
//!
//! All mutations are single-key commands, atomic pipelines, or server-side
//! scripts. Nothing here reads a value, changes it client-side and writes it
//! back.

mod memory;
mod redis_store;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::events::{BusFrame, Envelope};
use crate::types::{GroupId, GroupMembers, InstanceId, UserId};

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

// ── Key layout ─────────────────────────────────────────────────────────

pub(crate) fn user_groups_key(user: UserId) -> String {
    format!("user:{user}:groups")
}

pub(crate) fn group_members_key(group: GroupId) -> String {
    format!("group:{group}:members")
}

pub(crate) fn group_info_key(group: GroupId) -> String {
    format!("group:{group}:info")
}

pub(crate) fn user_instance_key(user: UserId) -> String {
    format!("user:{user}:instance")
}

pub(crate) fn instance_users_key(instance: InstanceId) -> String {
    format!("instance:{instance}:users")
}

/// Cross-instance membership and connection-ownership records.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Every group the user is a member of.
    async fn user_groups(&self, user: UserId) -> Result<HashSet<GroupId>, StoreError>;

    async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError>;

    /// Display names for the given groups. Groups without an info record are
    /// absent from the result.
    async fn group_names(&self, groups: &[GroupId]) -> Result<HashMap<GroupId, String>, StoreError>;

    async fn group_name(&self, group: GroupId) -> Result<Option<String>, StoreError> {
        Ok(self.group_names(&[group]).await?.remove(&group))
    }

    /// Record membership on both the user's and the group's set.
    async fn add_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError>;

    async fn remove_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError>;

    async fn set_group_info(&self, group: GroupId, name: &str) -> Result<(), StoreError>;

    /// Drop the group from every member's set and delete its records.
    async fn delete_group(&self, group: GroupId) -> Result<(), StoreError>;

    /// Record `instance` as the owner of `user`'s live socket.
    async fn claim_owner(
        &self,
        user: UserId,
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Re-assert `instance` as owner of every user it holds a socket for,
    /// restoring records that lapsed. A record another instance has claimed
    /// since is left alone.
    async fn refresh_owners(
        &self,
        users: &[UserId],
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Clear ownership if `instance` still owns `user`. Returns whether the
    /// ownership record was removed.
    async fn release_owner(&self, user: UserId, instance: InstanceId) -> Result<bool, StoreError>;

    async fn owner_of(&self, user: UserId) -> Result<Option<InstanceId>, StoreError>;

    /// Add-only bulk write of groups and memberships (startup bootstrap).
    async fn seed(&self, groups: &[GroupMembers]) -> Result<(), StoreError>;
}

/// Pub/sub transport shared by every instance.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError>;

    /// Subscribe to the lifecycle channel and every per-group chat channel.
    /// The stream ends when the underlying subscription is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, BusFrame>, StoreError>;
}

/// Encode and publish an envelope on its event's channel.
pub async fn publish_envelope(bus: &dyn EventBus, envelope: &Envelope) -> Result<(), StoreError> {
    let payload = envelope.encode()?;
    bus.publish(&envelope.event.channel(), payload).await
}

/// Glob match supporting a single trailing `*`, the only pattern form the
/// bus subscribes with.
pub(crate) fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        assert!(channel_matches("chat:group:*", "chat:group:abc"));
        assert!(!channel_matches("chat:group:*", "events:lifecycle"));
        assert!(channel_matches("events:lifecycle", "events:lifecycle"));
        assert!(!channel_matches("events:lifecycle", "events:lifecycle2"));
    }

    #[test]
    fn key_layout() {
        let u = UserId::new();
        let g = GroupId::new();
        assert_eq!(user_groups_key(u), format!("user:{u}:groups"));
        assert_eq!(group_members_key(g), format!("group:{g}:members"));
        assert_eq!(group_info_key(g), format!("group:{g}:info"));
    }
}
