//! Local registry: connected clients and the groups they belong to.
//!
//! Lock order is always `groups` map, then a group's `members`, then a
//! client's known-groups set. None of these locks is held across an await.
//! Group creation, member insertion and empty-group eviction all happen
//! under the `groups` write lock, so eviction cannot orphan a member that
//! is being added concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::client::Client;
use crate::types::{ChatMessage, GroupId, UserId};

/// Process-local projection of one group.
pub struct LocalGroup {
    pub id: GroupId,
    name: RwLock<String>,
    members: RwLock<HashMap<UserId, Arc<Client>>>,
}

impl LocalGroup {
    fn new(id: GroupId, name: String) -> Self {
        Self {
            id,
            name: RwLock::new(name),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.read().keys().copied().collect()
    }

    pub fn has_member(&self, user: UserId) -> bool {
        self.members.read().contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Enqueue `msg` on every local member. Returns how many accepted it.
    pub fn deliver(&self, msg: &ChatMessage) -> usize {
        let members = self.members.read();
        members
            .values()
            .filter(|client| client.try_deliver(msg.clone()))
            .count()
    }
}

#[derive(Default)]
pub struct Registry {
    /// Written only by the hub loop.
    clients: RwLock<HashMap<UserId, Arc<Client>>>,
    groups: RwLock<HashMap<GroupId, Arc<LocalGroup>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Clients ────────────────────────────────────────────────────────

    pub fn client(&self, user: UserId) -> Option<Arc<Client>> {
        self.clients.read().get(&user).cloned()
    }

    pub fn client_ids(&self) -> Vec<UserId> {
        self.clients.read().keys().copied().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Install `client`, returning whatever entry it replaced.
    pub(crate) fn insert_client(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        self.clients.write().insert(client.id(), client)
    }

    /// Remove the entry for `user` only if it is connection `conn_id`.
    pub(crate) fn remove_client(&self, user: UserId, conn_id: u64) -> Option<Arc<Client>> {
        let mut clients = self.clients.write();
        match clients.get(&user) {
            Some(current) if current.conn_id == conn_id => clients.remove(&user),
            _ => None,
        }
    }

    // ── Groups ─────────────────────────────────────────────────────────

    pub fn group(&self, group: GroupId) -> Option<Arc<LocalGroup>> {
        self.groups.read().get(&group).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Add `client` to `group`, creating the local group if needed.
    ///
    /// `name` is used when the group is created, or to fill in a name that
    /// was unknown. Closed clients are never added.
    pub(crate) fn join(&self, group: GroupId, name: Option<String>, client: &Arc<Client>) -> bool {
        let mut groups = self.groups.write();
        if client.is_closed() {
            return false;
        }
        let local = groups
            .entry(group)
            .or_insert_with(|| Arc::new(LocalGroup::new(group, name.clone().unwrap_or_default())));
        if let Some(name) = name {
            let mut current = local.name.write();
            if current.is_empty() {
                *current = name;
            }
        }
        local.members.write().insert(client.id(), Arc::clone(client));
        client.remember_group(group);
        true
    }

    /// Remove connection `conn_id` of `user` from `group`, evicting the group
    /// if it became empty. Returns true if the group was evicted.
    pub(crate) fn leave(&self, group: GroupId, user: UserId, conn_id: u64) -> bool {
        let mut groups = self.groups.write();
        let Some(local) = groups.get(&group).cloned() else {
            return false;
        };
        let removed = {
            let mut members = local.members.write();
            match members.get(&user) {
                Some(c) if c.conn_id == conn_id => members.remove(&user),
                _ => None,
            }
        };
        if let Some(client) = removed {
            client.forget_group(group);
        }
        if local.is_empty() {
            groups.remove(&group);
            tracing::debug!(%group, "Evicted empty local group");
            return true;
        }
        false
    }

    /// Remove `client` from every group it knows, evicting emptied groups.
    pub(crate) fn evict(&self, client: &Client) {
        let mut groups = self.groups.write();
        for group in client.known_groups() {
            let Some(local) = groups.get(&group).cloned() else {
                continue;
            };
            {
                let mut members = local.members.write();
                if members.get(&client.id()).is_some_and(|c| c.conn_id == client.conn_id) {
                    members.remove(&client.id());
                }
            }
            client.forget_group(group);
            if local.is_empty() {
                groups.remove(&group);
                tracing::debug!(%group, "Evicted empty local group");
            }
        }
    }

    /// Discard a local group and strip it from every member's known groups.
    pub(crate) fn remove_group(&self, group: GroupId) -> Option<Arc<LocalGroup>> {
        let local = self.groups.write().remove(&group)?;
        for client in local.members.read().values() {
            client.forget_group(group);
        }
        Some(local)
    }

    /// Update a cached display name. Returns false if the group is not local.
    pub(crate) fn rename(&self, group: GroupId, name: &str) -> bool {
        match self.group(group) {
            Some(local) => {
                *local.name.write() = name.to_string();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::User;

    fn client(user: UserId) -> Arc<Client> {
        Client::new(User { id: user, username: "u".into() }, 8).0
    }

    #[test]
    fn join_creates_group_and_tracks_known_groups() {
        let reg = Registry::new();
        let g = GroupId::new();
        let c = client(UserId::new());

        assert!(reg.join(g, Some("general".into()), &c));
        let local = reg.group(g).unwrap();
        assert_eq!(local.name(), "general");
        assert!(local.has_member(c.id()));
        assert!(c.knows_group(g));
    }

    #[test]
    fn last_leave_evicts_group() {
        let reg = Registry::new();
        let g = GroupId::new();
        let (a, b) = (client(UserId::new()), client(UserId::new()));
        reg.join(g, Some("g".into()), &a);
        reg.join(g, None, &b);

        assert!(!reg.leave(g, a.id(), a.conn_id));
        assert!(reg.group(g).is_some());
        assert!(reg.leave(g, b.id(), b.conn_id));
        assert!(reg.group(g).is_none());
        assert!(!a.knows_group(g));
    }

    #[test]
    fn leave_ignores_other_connection_of_same_user() {
        let reg = Registry::new();
        let g = GroupId::new();
        let user = UserId::new();
        let (old, new) = (client(user), client(user));
        reg.join(g, None, &new);

        reg.leave(g, user, old.conn_id);
        assert!(reg.group(g).unwrap().has_member(user));
    }

    #[test]
    fn closed_client_is_not_added() {
        let reg = Registry::new();
        let c = client(UserId::new());
        c.close();
        assert!(!reg.join(GroupId::new(), None, &c));
        assert_eq!(reg.group_count(), 0);
    }

    #[test]
    fn evict_removes_client_everywhere() {
        let reg = Registry::new();
        let (g1, g2) = (GroupId::new(), GroupId::new());
        let (a, b) = (client(UserId::new()), client(UserId::new()));
        reg.join(g1, None, &a);
        reg.join(g2, None, &a);
        reg.join(g2, None, &b);

        reg.evict(&a);
        assert!(reg.group(g1).is_none());
        assert_eq!(reg.group(g2).unwrap().member_ids(), vec![b.id()]);
        assert!(a.known_groups().is_empty());
    }

    #[test]
    fn remove_client_requires_matching_connection() {
        let reg = Registry::new();
        let user = UserId::new();
        let (old, new) = (client(user), client(user));
        reg.insert_client(old.clone());
        let replaced = reg.insert_client(new.clone()).unwrap();
        assert_eq!(replaced.conn_id, old.conn_id);

        assert!(reg.remove_client(user, old.conn_id).is_none());
        assert_eq!(reg.client(user).unwrap().conn_id, new.conn_id);
        assert!(reg.remove_client(user, new.conn_id).is_some());
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn remove_group_strips_known_groups() {
        let reg = Registry::new();
        let g = GroupId::new();
        let c = client(UserId::new());
        reg.join(g, None, &c);

        assert!(reg.remove_group(g).is_some());
        assert!(!c.knows_group(g));
        assert!(reg.remove_group(g).is_none());
    }
}
