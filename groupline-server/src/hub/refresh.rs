//! Ownership TTL refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::HubState;

/// Renew the ownership record of every locally connected user on each tick.
/// A failed refresh is logged and retried on the next tick.
pub async fn run(state: Arc<HubState>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; registration just claimed ownership.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => refresh_once(&state).await,
        }
    }
}

pub async fn refresh_once(state: &HubState) {
    let users = state.registry.client_ids();
    if users.is_empty() {
        return;
    }
    match state
        .store
        .refresh_owners(&users, state.instance, state.ownership_ttl)
        .await
    {
        Ok(()) => tracing::debug!(users = users.len(), "Refreshed connection ownership"),
        Err(e) => tracing::warn!(users = users.len(), "Ownership refresh failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Client;
    use crate::store::{MembershipStore, MemoryStore};
    use crate::types::{InstanceId, User, UserId};

    fn connected(state: &HubState, name: &str) -> UserId {
        let (client, _rx) = Client::new(User { id: UserId::new(), username: name.into() }, 8);
        state.registry.insert_client(client.clone());
        client.id()
    }

    #[tokio::test]
    async fn refresh_restores_lapsed_ownership() {
        let store = Arc::new(MemoryStore::new());
        let state = HubState::in_memory(store.clone(), Duration::from_millis(50));
        let alice = connected(&state, "alice");

        store.claim_owner(alice, state.instance, state.ownership_ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.owner_of(alice).await.unwrap(), None);

        refresh_once(&state).await;
        assert_eq!(store.owner_of(alice).await.unwrap(), Some(state.instance));
        assert!(store.instance_users(state.instance).contains(&alice));
    }

    #[tokio::test]
    async fn refresh_claims_user_whose_register_claim_was_lost() {
        let store = Arc::new(MemoryStore::new());
        let state = HubState::in_memory(store.clone(), Duration::from_secs(60));
        let bob = connected(&state, "bob");

        refresh_once(&state).await;
        assert_eq!(store.owner_of(bob).await.unwrap(), Some(state.instance));
    }

    #[tokio::test]
    async fn refresh_keeps_newer_owner_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let state = HubState::in_memory(store.clone(), Duration::from_secs(60));
        let alice = connected(&state, "alice");
        let elsewhere = InstanceId::new();

        store.claim_owner(alice, elsewhere, state.ownership_ttl).await.unwrap();
        refresh_once(&state).await;
        assert_eq!(store.owner_of(alice).await.unwrap(), Some(elsewhere));
    }

    #[tokio::test]
    async fn periodic_refresh_outlives_the_ttl() {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(HubState::in_memory(store.clone(), Duration::from_millis(100)));
        let alice = connected(&state, "alice");
        store.claim_owner(alice, state.instance, state.ownership_ttl).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&state), Duration::from_millis(20), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.owner_of(alice).await.unwrap(), Some(state.instance));

        shutdown.cancel();
        task.await.unwrap();
    }
}
