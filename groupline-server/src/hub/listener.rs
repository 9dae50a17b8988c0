//! Event bus listener.
//!
//! One task per process. Frames are dispatched strictly one at a time in the
//! order the subscription yields them, so every local enqueue for one chat
//! message finishes before the next frame is looked at.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::HubState;
use crate::events::{BusEvent, BusFrame, Envelope};
use crate::types::{ChatMessage, GroupId, UserId};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Apply frames from `frames` until `shutdown` fires. When the subscription
/// ends, resubscribe with jittered exponential backoff and carry on.
pub async fn run(state: Arc<HubState>, mut frames: BoxStream<'static, BusFrame>, shutdown: CancellationToken) {
    tracing::info!(instance = %state.instance, "Event bus listener started");
    let mut backoff = INITIAL_BACKOFF;
    loop {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                frame = frames.next() => match frame {
                    Some(frame) => dispatch(&state, frame).await,
                    None => {
                        tracing::warn!("Event bus subscription ended, resubscribing");
                        break;
                    }
                }
            }
        }

        frames = loop {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff + jitter) => {}
            }
            match state.bus.subscribe().await {
                Ok(frames) => {
                    tracing::info!(instance = %state.instance, "Event bus listener resubscribed");
                    backoff = INITIAL_BACKOFF;
                    break frames;
                }
                Err(e) => {
                    tracing::error!(retry_in = ?backoff, "Event bus subscribe failed: {e}");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        };
    }
}

/// Decode one frame and apply it to the local registry.
pub async fn dispatch(state: &HubState, frame: BusFrame) {
    let envelope = match Envelope::decode(&frame.payload) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(channel = %frame.channel, "Undecodable bus frame: {e}");
            return;
        }
    };
    tracing::debug!(
        channel = %frame.channel,
        event = envelope.event.kind(),
        origin = %envelope.origin,
        "Bus event"
    );

    match envelope.event {
        BusEvent::ChatMessage(msg) => deliver_chat(state, &msg),
        BusEvent::UserAdded { user_id, group_id } => user_added(state, user_id, group_id).await,
        BusEvent::UserRemoved { user_id, group_id } => user_removed(state, user_id, group_id),
        BusEvent::GroupCreated { group_id, name, admin_id } => {
            group_created(state, group_id, name, admin_id).await
        }
        BusEvent::GroupDeleted { group_id } => {
            if let Some(local) = state.registry.remove_group(group_id) {
                tracing::info!(group = %group_id, members = local.len(), "Dropped deleted group");
            }
        }
        BusEvent::GroupUpdated { group_id, name } => {
            state.registry.rename(group_id, &name);
        }
    }
}

fn deliver_chat(state: &HubState, msg: &ChatMessage) {
    let Some(local) = state.registry.group(msg.group_id) else {
        return;
    };
    let delivered = local.deliver(msg);
    tracing::debug!(group = %msg.group_id, message = %msg.id, delivered, "Delivered chat message");
}

async fn user_added(state: &HubState, user: UserId, group: GroupId) {
    let Some(client) = state.registry.client(user) else {
        return;
    };
    // A later removal may already have been applied to the store; only a
    // current member goes into the local group.
    match state.store.is_member(group, user).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(%user, %group, "Skipping stale user_added");
            return;
        }
        Err(e) => {
            tracing::warn!(%user, %group, "Membership check failed for user_added: {e}");
            return;
        }
    }
    let name = if state.registry.group(group).is_some() {
        None
    } else {
        match state.store.group_name(group).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(%group, "Failed to fetch group name: {e}");
                None
            }
        }
    };
    if state.registry.join(group, name, &client) {
        tracing::debug!(%user, %group, "Added local member");
    }
}

fn user_removed(state: &HubState, user: UserId, group: GroupId) {
    let Some(client) = state.registry.client(user) else {
        return;
    };
    if state.registry.leave(group, user, client.conn_id) {
        tracing::debug!(%group, "Local group emptied by removal");
    }
    client.forget_group(group);
}

async fn group_created(state: &HubState, group: GroupId, name: String, admin: UserId) {
    state.registry.rename(group, &name);
    let Some(client) = state.registry.client(admin) else {
        return;
    };
    match state.store.is_member(group, admin).await {
        Ok(true) => {
            state.registry.join(group, Some(name), &client);
        }
        Ok(false) => tracing::debug!(%group, %admin, "Skipping stale group_created"),
        Err(e) => tracing::warn!(%group, "Membership check failed for group_created: {e}"),
    }
}
