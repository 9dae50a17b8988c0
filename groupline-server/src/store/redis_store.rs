//! Redis-backed membership store and event bus.
//!
//! Keys:
//! - `user:{u}:groups`      SET of group ids
//! - `group:{g}:members`    SET of user ids
//! - `group:{g}:info`       HASH, field `name`
//! - `user:{u}:instance`    STRING instance id, with TTL
//! - `instance:{i}:users`   SET of user ids, TTL refreshed alongside
//!
//! Chat messages publish on `chat:group:{g}`; lifecycle events on
//! `events:lifecycle`.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;

use super::{
    EventBus, MembershipStore, group_info_key, group_members_key, instance_users_key,
    user_groups_key, user_instance_key,
};
use crate::error::StoreError;
use crate::events::{BusFrame, CHAT_CHANNEL_PATTERN, LIFECYCLE_CHANNEL};
use crate::types::{GroupId, GroupMembers, InstanceId, UserId};

/// Delete `KEYS[1]` only if it still holds `ARGV[1]`; always drop `ARGV[2]`
/// from the instance set at `KEYS[2]`.
const RELEASE_OWNER_SCRIPT: &str = r#"
redis.call('SREM', KEYS[2], ARGV[2])
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Remove group `ARGV[1]` from every member's set, then drop the group's
/// member set (`KEYS[1]`) and info hash (`KEYS[2]`).
///
/// Member keys are built inside the script rather than passed in `KEYS`, so
/// this requires a single Redis node and will not run on Redis Cluster.
const DELETE_GROUP_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
for _, user in ipairs(members) do
    redis.call('SREM', 'user:' .. user .. ':groups', ARGV[1])
end
redis.call('DEL', KEYS[1], KEYS[2])
return #members
"#;

/// Re-assert ownership for each `KEYS[2..]` (user instance keys, users in
/// `ARGV[3..]`) that is missing or already held by `ARGV[1]`, with TTL
/// `ARGV[2]`. Keys owned by another instance are left alone. Returns how
/// many records were written.
const REFRESH_OWNERS_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[2])
local written = 0
for i = 2, #KEYS do
    local current = redis.call('GET', KEYS[i])
    if not current or current == ARGV[1] then
        redis.call('SET', KEYS[i], ARGV[1], 'EX', ttl)
        redis.call('SADD', KEYS[1], ARGV[i + 1])
        written = written + 1
    end
end
if written > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return written
"#;

const NAME_FIELD: &str = "name";

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    release_script: redis::Script,
    delete_script: redis::Script,
    refresh_script: redis::Script,
}

impl RedisStore {
    /// Open a client and verify the server answers.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!("Connected to Redis");
        Ok(Self {
            client,
            conn,
            release_script: redis::Script::new(RELEASE_OWNER_SCRIPT),
            delete_script: redis::Script::new(DELETE_GROUP_SCRIPT),
            refresh_script: redis::Script::new(REFRESH_OWNERS_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn parse_id<T: FromStr>(key: &str, raw: String) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Malformed { key: key.to_string(), value: raw })
}

#[async_trait]
impl MembershipStore for RedisStore {
    async fn user_groups(&self, user: UserId) -> Result<HashSet<GroupId>, StoreError> {
        let key = user_groups_key(user);
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&key)
            .query_async(&mut self.conn())
            .await?;
        raw.into_iter().map(|g| parse_id(&key, g)).collect()
    }

    async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
        let member: bool = redis::cmd("SISMEMBER")
            .arg(group_members_key(group))
            .arg(user.to_string())
            .query_async(&mut self.conn())
            .await?;
        Ok(member)
    }

    async fn group_names(&self, groups: &[GroupId]) -> Result<HashMap<GroupId, String>, StoreError> {
        if groups.is_empty() {
            return Ok(HashMap::new());
        }
        let mut pipe = redis::pipe();
        for group in groups {
            pipe.cmd("HGET").arg(group_info_key(*group)).arg(NAME_FIELD);
        }
        let names: Vec<Option<String>> = pipe.query_async(&mut self.conn()).await?;
        Ok(groups
            .iter()
            .zip(names)
            .filter_map(|(g, n)| n.map(|n| (*g, n)))
            .collect())
    }

    async fn add_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(user_groups_key(user))
            .arg(group.to_string())
            .ignore()
            .cmd("SADD")
            .arg(group_members_key(group))
            .arg(user.to_string())
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn remove_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(user_groups_key(user))
            .arg(group.to_string())
            .ignore()
            .cmd("SREM")
            .arg(group_members_key(group))
            .arg(user.to_string())
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_group_info(&self, group: GroupId, name: &str) -> Result<(), StoreError> {
        let _: () = redis::cmd("HSET")
            .arg(group_info_key(group))
            .arg(NAME_FIELD)
            .arg(name)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn delete_group(&self, group: GroupId) -> Result<(), StoreError> {
        let removed: i64 = self
            .delete_script
            .key(group_members_key(group))
            .key(group_info_key(group))
            .arg(group.to_string())
            .invoke_async(&mut self.conn())
            .await?;
        tracing::debug!(%group, removed, "Deleted group records");
        Ok(())
    }

    async fn claim_owner(
        &self,
        user: UserId,
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let secs = ttl.as_secs().max(1);
        let set_key = instance_users_key(instance);
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(user_instance_key(user))
            .arg(instance.to_string())
            .arg("EX")
            .arg(secs)
            .ignore()
            .cmd("SADD")
            .arg(&set_key)
            .arg(user.to_string())
            .ignore()
            .cmd("EXPIRE")
            .arg(&set_key)
            .arg(secs)
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn refresh_owners(
        &self,
        users: &[UserId],
        instance: InstanceId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if users.is_empty() {
            return Ok(());
        }
        let secs = ttl.as_secs().max(1);
        let mut invocation = self.refresh_script.prepare_invoke();
        invocation.key(instance_users_key(instance));
        for user in users {
            invocation.key(user_instance_key(*user));
        }
        invocation.arg(instance.to_string()).arg(secs);
        for user in users {
            invocation.arg(user.to_string());
        }
        let written: i64 = invocation.invoke_async(&mut self.conn()).await?;
        if (written as usize) < users.len() {
            tracing::debug!(
                skipped = users.len() - written as usize,
                "Some connected users are owned by another instance"
            );
        }
        Ok(())
    }

    async fn release_owner(&self, user: UserId, instance: InstanceId) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .release_script
            .key(user_instance_key(user))
            .key(instance_users_key(instance))
            .arg(instance.to_string())
            .arg(user.to_string())
            .invoke_async(&mut self.conn())
            .await?;
        Ok(deleted > 0)
    }

    async fn owner_of(&self, user: UserId) -> Result<Option<InstanceId>, StoreError> {
        let key = user_instance_key(user);
        let raw: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut self.conn())
            .await?;
        raw.map(|i| parse_id(&key, i)).transpose()
    }

    async fn seed(&self, groups: &[GroupMembers]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        for group in groups {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.cmd("HSET")
                .arg(group_info_key(group.id))
                .arg(NAME_FIELD)
                .arg(&group.name)
                .ignore();
            for user in &group.members {
                pipe.cmd("SADD")
                    .arg(user_groups_key(*user))
                    .arg(group.id.to_string())
                    .ignore();
                pipe.cmd("SADD")
                    .arg(group_members_key(group.id))
                    .arg(user.to_string())
                    .ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), StoreError> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(&payload)
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusFrame>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(LIFECYCLE_CHANNEL).await?;
        pubsub.psubscribe(CHAT_CHANNEL_PATTERN).await?;
        tracing::debug!(
            lifecycle = LIFECYCLE_CHANNEL,
            chat = CHAT_CHANNEL_PATTERN,
            "Subscribed to event bus"
        );

        let frames = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusFrame {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(channel = msg.get_channel_name(), "Bad pub/sub payload: {e}");
                    None
                }
            }
        });
        Ok(frames.boxed())
    }
}
