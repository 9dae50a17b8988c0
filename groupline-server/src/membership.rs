//! Group and membership mutations.
//!
//! Every operation commits to persistence first, then writes the shared
//! membership store, then signals the hub. The hub signal is best effort:
//! if its channel is full the authoritative state is already written and
//! only the live notification is lost.

use std::sync::Arc;

use crate::error::ServiceError;
use crate::hub::Hub;
use crate::persistence::{Persistence, RemovalOutcome};
use crate::store::MembershipStore;
use crate::types::{ChatMessage, GroupId, GroupMember, GroupSummary, UserId};

const MAX_GROUP_NAME: usize = 100;
const MAX_HISTORY: usize = 200;

pub struct MembershipService {
    persistence: Arc<dyn Persistence>,
    store: Arc<dyn MembershipStore>,
    hub: Hub,
}

fn valid_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::BadRequest("group name must not be empty".into()));
    }
    if name.chars().count() > MAX_GROUP_NAME {
        return Err(ServiceError::BadRequest(format!(
            "group name longer than {MAX_GROUP_NAME} characters"
        )));
    }
    Ok(name.to_string())
}

impl MembershipService {
    pub fn new(persistence: Arc<dyn Persistence>, store: Arc<dyn MembershipStore>, hub: Hub) -> Self {
        Self { persistence, store, hub }
    }

    async fn require_group(&self, group: GroupId) -> Result<GroupSummary, ServiceError> {
        self.persistence
            .get_group(group)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("group {group} not found")))
    }

    async fn require_admin(&self, actor: UserId, group: GroupId) -> Result<GroupSummary, ServiceError> {
        let summary = self.require_group(group).await?;
        if !self.persistence.is_admin(group, actor).await? {
            return Err(ServiceError::Forbidden("only group admins can do that".into()));
        }
        Ok(summary)
    }

    pub async fn list_groups(&self, actor: UserId) -> Result<Vec<GroupSummary>, ServiceError> {
        Ok(self.persistence.groups_for_user(actor).await?)
    }

    /// Recent history for a member of the group, oldest first.
    pub async fn messages(
        &self,
        actor: UserId,
        group: GroupId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ServiceError> {
        self.require_group(group).await?;
        if !self.persistence.is_member(group, actor).await? {
            return Err(ServiceError::Forbidden("not a member of this group".into()));
        }
        Ok(self
            .persistence
            .recent_messages(group, limit.clamp(1, MAX_HISTORY))
            .await?)
    }

    /// Member list, visible to members only.
    pub async fn members(&self, actor: UserId, group: GroupId) -> Result<Vec<GroupMember>, ServiceError> {
        self.require_group(group).await?;
        if !self.persistence.is_member(group, actor).await? {
            return Err(ServiceError::Forbidden("not a member of this group".into()));
        }
        Ok(self.persistence.group_members(group).await?)
    }

    pub async fn create_group(&self, actor: UserId, name: &str) -> Result<GroupSummary, ServiceError> {
        let name = valid_name(name)?;
        let group = self.persistence.create_group(&name, actor).await?;
        self.store.set_group_info(group.id, &group.name).await?;
        self.store.add_membership(group.id, actor).await?;
        self.hub.initialize_group(group.id, group.name.clone(), actor);
        tracing::info!(group = %group.id, admin = %actor, "Group created");
        Ok(group)
    }

    /// Add users to a group. Returns the users that were newly added.
    pub async fn invite(
        &self,
        actor: UserId,
        group: GroupId,
        users: &[UserId],
    ) -> Result<Vec<UserId>, ServiceError> {
        self.require_admin(actor, group).await?;
        for user in users {
            if self.persistence.get_user(*user).await?.is_none() {
                return Err(ServiceError::BadRequest(format!("unknown user {user}")));
            }
        }

        let mut added = Vec::new();
        for user in users {
            if !self.persistence.add_member(group, *user).await? {
                continue;
            }
            self.store.add_membership(group, *user).await?;
            self.hub.add_user_to_group(*user, group);
            added.push(*user);
        }
        tracing::info!(%group, by = %actor, added = added.len(), "Members invited");
        Ok(added)
    }

    /// Remove another member. Admins leave through [`Self::leave`].
    pub async fn remove(&self, actor: UserId, group: GroupId, user: UserId) -> Result<(), ServiceError> {
        if actor == user {
            return Err(ServiceError::BadRequest("use leave to remove yourself".into()));
        }
        self.require_admin(actor, group).await?;
        match self.apply_removal(group, user).await? {
            RemovalOutcome::NotMember => Err(ServiceError::NotFound(format!(
                "user {user} is not a member of group {group}"
            ))),
            _ => {
                tracing::info!(%group, %user, by = %actor, "Member removed");
                Ok(())
            }
        }
    }

    pub async fn leave(&self, actor: UserId, group: GroupId) -> Result<RemovalOutcome, ServiceError> {
        self.require_group(group).await?;
        match self.apply_removal(group, actor).await? {
            RemovalOutcome::NotMember => Err(ServiceError::NotFound(format!(
                "not a member of group {group}"
            ))),
            outcome => {
                tracing::info!(%group, user = %actor, ?outcome, "Member left");
                Ok(outcome)
            }
        }
    }

    async fn apply_removal(&self, group: GroupId, user: UserId) -> Result<RemovalOutcome, ServiceError> {
        let outcome = self.persistence.remove_member(group, user).await?;
        match outcome {
            RemovalOutcome::NotMember => {}
            RemovalOutcome::Removed { promoted } => {
                self.store.remove_membership(group, user).await?;
                self.hub.remove_user_from_group(user, group);
                if let Some(admin) = promoted {
                    tracing::info!(%group, %admin, "Promoted new admin");
                }
            }
            RemovalOutcome::GroupDeleted => {
                self.store.delete_group(group).await?;
                self.hub.delete_group(group);
            }
        }
        Ok(outcome)
    }

    pub async fn rename(&self, actor: UserId, group: GroupId, name: &str) -> Result<GroupSummary, ServiceError> {
        self.require_admin(actor, group).await?;
        let name = valid_name(name)?;
        if !self.persistence.rename_group(group, &name).await? {
            return Err(ServiceError::NotFound(format!("group {group} not found")));
        }
        self.store.set_group_info(group, &name).await?;
        self.hub.update_group_info(group, name.clone());
        Ok(GroupSummary { id: group, name })
    }

    pub async fn delete(&self, actor: UserId, group: GroupId) -> Result<(), ServiceError> {
        self.require_admin(actor, group).await?;
        self.persistence.delete_group(group).await?;
        self.store.delete_group(group).await?;
        self.hub.delete_group(group);
        tracing::info!(%group, by = %actor, "Group deleted");
        Ok(())
    }
}
