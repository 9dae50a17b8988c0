//! In-process membership store and event bus.
//!
//! Same semantics as the Redis store for a single process: one lock covers
//! every record, so each operation is atomic. Pub/sub is a broadcast channel
//! shared by every subscriber, which preserves publish order.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{EventBus, MembershipStore, channel_matches};
use crate::error::StoreError;
use crate::events::{BusFrame, CHAT_CHANNEL_PATTERN, LIFECYCLE_CHANNEL};
use crate::types::{GroupId, GroupMembers, InstanceId, UserId};

const BUS_CAPACITY: usize = 1024;

#[derive(Default)]
struct Records {
    user_groups: HashMap<UserId, HashSet<GroupId>>,
    group_members: HashMap<GroupId, HashSet<UserId>>,
    group_names: HashMap<GroupId, String>,
    /// user → (owning instance, expiry)
    owners: HashMap<UserId, (InstanceId, Instant)>,
    instance_users: HashMap<InstanceId, HashSet<UserId>>,
}

impl Records {
    fn add(&mut self, group: GroupId, user: UserId) {
        self.user_groups.entry(user).or_default().insert(group);
        self.group_members.entry(group).or_default().insert(user);
    }

    fn remove(&mut self, group: GroupId, user: UserId) {
        if let Some(groups) = self.user_groups.get_mut(&user) {
            groups.remove(&group);
            if groups.is_empty() {
                self.user_groups.remove(&user);
            }
        }
        if let Some(members) = self.group_members.get_mut(&group) {
            members.remove(&user);
            if members.is_empty() {
                self.group_members.remove(&group);
            }
        }
    }

    fn live_owner(&mut self, user: UserId) -> Option<InstanceId> {
        match self.owners.get(&user) {
            Some((instance, expires)) if *expires > Instant::now() => Some(*instance),
            Some(_) => {
                self.owners.remove(&user);
                None
            }
            None => None,
        }
    }
}

/// Membership store and event bus living in this process.
pub struct MemoryStore {
    records: Mutex<Records>,
    bus: broadcast::Sender<BusFrame>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            records: Mutex::new(Records::default()),
            bus,
        }
    }

    /// Members of a group (test and diagnostics helper).
    pub fn group_members(&self, group: GroupId) -> HashSet<UserId> {
        self.records
            .lock()
            .group_members
            .get(&group)
            .cloned()
            .unwrap_or_default()
    }

    /// Users recorded as owned by `instance`.
    pub fn instance_users(&self, instance: InstanceId) -> HashSet<UserId> {
        self.records
            .lock()
            .instance_users
            .get(&instance)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn user_groups(&self, user: UserId) -> Result<HashSet<GroupId>, StoreError> {
        Ok(self
            .records
            .lock()
            .user_groups
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .group_members
            .get(&group)
            .is_some_and(|m| m.contains(&user)))
    }

    async fn group_names(&self, groups: &[GroupId]) -> Result<HashMap<GroupId, String>, StoreError> {
        let records = self.records.lock();
        Ok(groups
            .iter()
            .filter_map(|g| records.group_names.get(g).map(|n| (*g, n.clone())))
            .collect())
    }

    async fn add_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        self.records.lock().add(group, user);
        Ok(())
    }

    async fn remove_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        self.records.lock().remove(group, user);
        Ok(())
    }

    async fn set_group_info(&self, group: GroupId, name: &str) -> Result<(), StoreError> {
        self.records.lock().group_names.insert(group, name.to_string());
        Ok(())
    }

    async fn delete_group(&self, group: GroupId) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let members = records.group_members.remove(&group).unwrap_or_default();
        for user in members {
            records.remove(group, user);
        }
        records.group_names.remove(&group);
        Ok(())
    }

    async fn claim_owner(
        &self,
        user: UserId,
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        records.owners.insert(user, (instance, Instant::now() + ttl));
        records.instance_users.entry(instance).or_default().insert(user);
        Ok(())
    }

    async fn refresh_owners(
        &self,
        users: &[UserId],
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let expires = Instant::now() + ttl;
        for user in users {
            match records.live_owner(*user) {
                Some(owner) if owner != instance => continue,
                _ => {
                    records.owners.insert(*user, (instance, expires));
                    records.instance_users.entry(instance).or_default().insert(*user);
                }
            }
        }
        Ok(())
    }

    async fn release_owner(&self, user: UserId, instance: InstanceId) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        if let Some(users) = records.instance_users.get_mut(&instance) {
            users.remove(&user);
        }
        let owned = records.owners.get(&user).is_some_and(|(i, _)| *i == instance);
        if owned {
            records.owners.remove(&user);
        }
        Ok(owned)
    }

    async fn owner_of(&self, user: UserId) -> Result<Option<InstanceId>, StoreError> {
        Ok(self.records.lock().live_owner(user))
    }

    async fn seed(&self, groups: &[GroupMembers]) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        for group in groups {
            records.group_names.insert(group.id, group.name.clone());
            for user in &group.members {
                records.add(group.id, *user);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        // No subscribers is not an error: Redis PUBLISH to nobody succeeds too.
        let _ = self.bus.send(BusFrame {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusFrame>, StoreError> {
        let rx = self.bus.subscribe();
        let frames = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if channel_matches(LIFECYCLE_CHANNEL, &frame.channel)
                            || channel_matches(CHAT_CHANNEL_PATTERN, &frame.channel)
                        {
                            return Some((frame, rx));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "In-process bus subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(frames.boxed())
    }
}
