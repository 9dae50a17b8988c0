//! The per-process connection hub.
//!
//! ```text
//!  connection tasks ──register/unregister/chat──▶ HubLoop ──publish──▶ event bus
//!  membership service ──add/remove/init/delete/update──▶ HubLoop
//!  event bus ──▶ listener ──▶ Registry (LocalGroups) ──try_send──▶ client queues
//! ```
//!
//! [`Hub`] is the cheap, cloneable handle. [`HubLoop`] owns the receiving
//! ends and is the only writer of the connected-clients map. The listener
//! (see [`listener`]) is the only path by which local group caches change in
//! response to membership events and by which chat messages reach sockets,
//! including events this instance published itself.

pub mod client;
pub mod listener;
pub mod refresh;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub use client::Client;
pub use registry::{LocalGroup, Registry};

use crate::events::{BusEvent, Envelope};
use crate::persistence::Persistence;
use crate::store::{EventBus, MembershipStore, publish_envelope};
use crate::types::{ChatMessage, GroupId, InstanceId, OutgoingChat, UserId};

/// Handles shared by the hub loop, the listener and the refresh timer.
pub struct HubState {
    pub instance: InstanceId,
    pub store: Arc<dyn MembershipStore>,
    pub bus: Arc<dyn EventBus>,
    pub persistence: Arc<dyn Persistence>,
    pub registry: Arc<Registry>,
    pub ownership_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MembershipChange {
    user: UserId,
    group: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupInit {
    group: GroupId,
    name: String,
    admin: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupRename {
    group: GroupId,
    name: String,
}

/// Cloneable handle into the hub loop.
///
/// `register`/`unregister` wait for channel capacity: they come from the
/// connection's own task and must not be lost. Everything else is a
/// non-blocking attempt that drops and logs when the channel is full.
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
    register_tx: mpsc::Sender<Arc<Client>>,
    unregister_tx: mpsc::Sender<Arc<Client>>,
    broadcast_tx: mpsc::Sender<OutgoingChat>,
    add_user_tx: mpsc::Sender<MembershipChange>,
    remove_user_tx: mpsc::Sender<MembershipChange>,
    init_group_tx: mpsc::Sender<GroupInit>,
    delete_group_tx: mpsc::Sender<GroupId>,
    update_group_tx: mpsc::Sender<GroupRename>,
}

/// Receiving side of the hub. Run it with [`HubLoop::run`].
pub struct HubLoop {
    state: Arc<HubState>,
    register_rx: mpsc::Receiver<Arc<Client>>,
    unregister_rx: mpsc::Receiver<Arc<Client>>,
    broadcast_rx: mpsc::Receiver<OutgoingChat>,
    add_user_rx: mpsc::Receiver<MembershipChange>,
    remove_user_rx: mpsc::Receiver<MembershipChange>,
    init_group_rx: mpsc::Receiver<GroupInit>,
    delete_group_rx: mpsc::Receiver<GroupId>,
    update_group_rx: mpsc::Receiver<GroupRename>,
}

fn try_enqueue<T>(tx: &mpsc::Sender<T>, item: T, what: &'static str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(request = what, "Hub channel full, dropping request");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(request = what, "Hub stopped, dropping request");
            false
        }
    }
}

impl Hub {
    /// Create the handle and its loop. Every request channel holds `capacity`.
    pub fn new(state: HubState, capacity: usize) -> (Hub, HubLoop) {
        let capacity = capacity.max(1);
        let state = Arc::new(state);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (add_user_tx, add_user_rx) = mpsc::channel(capacity);
        let (remove_user_tx, remove_user_rx) = mpsc::channel(capacity);
        let (init_group_tx, init_group_rx) = mpsc::channel(capacity);
        let (delete_group_tx, delete_group_rx) = mpsc::channel(capacity);
        let (update_group_tx, update_group_rx) = mpsc::channel(capacity);

        let hub = Hub {
            state: Arc::clone(&state),
            register_tx,
            unregister_tx,
            broadcast_tx,
            add_user_tx,
            remove_user_tx,
            init_group_tx,
            delete_group_tx,
            update_group_tx,
        };
        let hub_loop = HubLoop {
            state,
            register_rx,
            unregister_rx,
            broadcast_rx,
            add_user_rx,
            remove_user_rx,
            init_group_rx,
            delete_group_rx,
            update_group_rx,
        };
        (hub, hub_loop)
    }

    pub fn state(&self) -> &Arc<HubState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    pub fn instance_id(&self) -> InstanceId {
        self.state.instance
    }

    pub async fn register(&self, client: Arc<Client>) {
        if self.register_tx.send(client).await.is_err() {
            tracing::warn!("Hub stopped, register dropped");
        }
    }

    pub async fn unregister(&self, client: Arc<Client>) {
        if let Err(mpsc::error::SendError(client)) = self.unregister_tx.send(client).await {
            // Nobody will unregister it now; at least stop its loops.
            client.close();
        }
    }

    /// Hand a validated inbound chat message to the hub.
    pub fn broadcast(&self, chat: OutgoingChat) -> bool {
        try_enqueue(&self.broadcast_tx, chat, "broadcast")
    }

    pub fn add_user_to_group(&self, user: UserId, group: GroupId) -> bool {
        try_enqueue(&self.add_user_tx, MembershipChange { user, group }, "add_user")
    }

    pub fn remove_user_from_group(&self, user: UserId, group: GroupId) -> bool {
        try_enqueue(&self.remove_user_tx, MembershipChange { user, group }, "remove_user")
    }

    pub fn initialize_group(&self, group: GroupId, name: String, admin: UserId) -> bool {
        try_enqueue(&self.init_group_tx, GroupInit { group, name, admin }, "init_group")
    }

    pub fn delete_group(&self, group: GroupId) -> bool {
        try_enqueue(&self.delete_group_tx, group, "delete_group")
    }

    pub fn update_group_info(&self, group: GroupId, name: String) -> bool {
        try_enqueue(&self.update_group_tx, GroupRename { group, name }, "update_group")
    }
}

impl HubLoop {
    /// Serve requests until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(instance = %self.state.instance, "Hub loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(client) = self.register_rx.recv() => self.state.on_register(client).await,
                Some(client) = self.unregister_rx.recv() => self.state.on_unregister(client).await,
                Some(chat) = self.broadcast_rx.recv() => self.state.on_broadcast(chat).await,
                Some(m) = self.add_user_rx.recv() => {
                    self.state.publish(BusEvent::UserAdded { user_id: m.user, group_id: m.group }).await;
                }
                Some(m) = self.remove_user_rx.recv() => {
                    self.state.publish(BusEvent::UserRemoved { user_id: m.user, group_id: m.group }).await;
                }
                Some(init) = self.init_group_rx.recv() => {
                    self.state.publish(BusEvent::GroupCreated {
                        group_id: init.group,
                        name: init.name,
                        admin_id: init.admin,
                    })
                    .await;
                }
                Some(group) = self.delete_group_rx.recv() => {
                    self.state.publish(BusEvent::GroupDeleted { group_id: group }).await;
                }
                Some(rename) = self.update_group_rx.recv() => {
                    self.state.publish(BusEvent::GroupUpdated { group_id: rename.group, name: rename.name })
                        .await;
                }
                else => break,
            }
        }
        tracing::info!(instance = %self.state.instance, "Hub loop stopped");
    }
}

impl HubState {
    async fn on_register(&self, client: Arc<Client>) {
        let user = client.id();
        if client.is_closed() {
            tracing::debug!(%user, conn_id = client.conn_id, "Skipping register of closed connection");
            return;
        }

        if let Some(old) = self.registry.insert_client(Arc::clone(&client))
            && old.conn_id != client.conn_id
        {
            tracing::info!(
                %user,
                old_conn = old.conn_id,
                new_conn = client.conn_id,
                "Replacing existing connection"
            );
            old.close();
            self.registry.evict(&old);
        }

        let groups: Vec<GroupId> = match self.store.user_groups(user).await {
            Ok(groups) => groups.into_iter().collect(),
            Err(e) => {
                tracing::warn!(%user, "Failed to load memberships on register: {e}");
                Vec::new()
            }
        };
        let names = match self.store.group_names(&groups).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(%user, "Failed to load group names on register: {e}");
                Default::default()
            }
        };
        for group in &groups {
            self.registry.join(*group, names.get(group).cloned(), &client);
        }

        // A removal applied while memberships were loading found no local
        // member to drop. Re-read and leave anything no longer current.
        if !groups.is_empty() {
            match self.store.user_groups(user).await {
                Ok(current) => {
                    for group in groups.iter().filter(|g| !current.contains(*g)) {
                        tracing::debug!(%user, %group, "Dropping membership removed during register");
                        self.registry.leave(*group, user, client.conn_id);
                    }
                }
                Err(e) => tracing::warn!(%user, "Failed to re-check memberships on register: {e}"),
            }
        }

        if let Err(e) = self.store.claim_owner(user, self.instance, self.ownership_ttl).await {
            tracing::warn!(%user, "Failed to record connection owner: {e}");
        }
        tracing::info!(%user, conn_id = client.conn_id, groups = groups.len(), "Registered connection");
    }

    async fn on_unregister(&self, client: Arc<Client>) {
        let user = client.id();
        client.close();

        let Some(current) = self.registry.remove_client(user, client.conn_id) else {
            tracing::debug!(%user, conn_id = client.conn_id, "Unregister for absent connection");
            return;
        };
        self.registry.evict(&current);

        match self.store.release_owner(user, self.instance).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%user, "Ownership already moved or expired"),
            Err(e) => tracing::warn!(%user, "Failed to clear connection owner: {e}"),
        }
        tracing::info!(%user, conn_id = client.conn_id, "Unregistered connection");
    }

    async fn on_broadcast(&self, chat: OutgoingChat) {
        let (id, timestamp) = match self
            .persistence
            .insert_message(chat.author.id, chat.group_id, &chat.content)
            .await
        {
            Ok(assigned) => assigned,
            Err(e) => {
                tracing::warn!(
                    user = %chat.author.id,
                    group = %chat.group_id,
                    "Failed to persist message, dropping: {e}"
                );
                return;
            }
        };
        let msg = ChatMessage {
            id,
            content: chat.content,
            group_id: chat.group_id,
            user: chat.author,
            timestamp,
        };
        self.publish(BusEvent::ChatMessage(msg)).await;
    }

    async fn publish(&self, event: BusEvent) {
        let kind = event.kind();
        let envelope = Envelope::new(self.instance, event);
        if let Err(e) = publish_envelope(self.bus.as_ref(), &envelope).await {
            tracing::warn!(event = kind, "Failed to publish event: {e}");
        }
    }
}


#[cfg(test)]
impl HubState {
    /// Hub state over an in-process store and an in-memory database.
    pub(crate) fn in_memory(store: Arc<crate::store::MemoryStore>, ownership_ttl: Duration) -> Self {
        Self {
            instance: InstanceId::new(),
            store: store.clone(),
            bus: store,
            persistence: Arc::new(crate::db::SqlitePersistence::open_memory().unwrap()),
            registry: Arc::new(Registry::new()),
            ownership_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use futures::StreamExt;
    use futures::stream::BoxStream;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::{Instant, timeout};

    use super::*;
    use crate::error::StoreError;
    use crate::events::BusFrame;
    use crate::store::MemoryStore;
    use crate::types::{GroupMembers, MessageUser, User};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn wait_until(desc: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !check() {
            if Instant::now() > deadline {
                panic!("Timeout waiting for: {desc}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn publish(store: &MemoryStore, event: BusEvent) {
        publish_envelope(store, &Envelope::new(InstanceId::new(), event))
            .await
            .unwrap();
    }

    async fn next_event(frames: &mut BoxStream<'static, BusFrame>) -> BusEvent {
        let frame = timeout(TIMEOUT, frames.next()).await.unwrap().unwrap();
        Envelope::decode(&frame.payload).unwrap().event
    }

    /// Holds the first `user_groups` call after it has read, until released.
    struct PausedLoad {
        inner: Arc<MemoryStore>,
        gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    #[async_trait]
    impl MembershipStore for PausedLoad {
        async fn user_groups(&self, user: UserId) -> Result<HashSet<GroupId>, StoreError> {
            let groups = self.inner.user_groups(user).await?;
            let gate = self.gate.lock().take();
            if let Some((loaded, release)) = gate {
                let _ = loaded.send(());
                let _ = release.await;
            }
            Ok(groups)
        }

        async fn is_member(&self, group: GroupId, user: UserId) -> Result<bool, StoreError> {
            self.inner.is_member(group, user).await
        }

        async fn group_names(&self, groups: &[GroupId]) -> Result<HashMap<GroupId, String>, StoreError> {
            self.inner.group_names(groups).await
        }

        async fn add_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
            self.inner.add_membership(group, user).await
        }

        async fn remove_membership(&self, group: GroupId, user: UserId) -> Result<(), StoreError> {
            self.inner.remove_membership(group, user).await
        }

        async fn set_group_info(&self, group: GroupId, name: &str) -> Result<(), StoreError> {
            self.inner.set_group_info(group, name).await
        }

        async fn delete_group(&self, group: GroupId) -> Result<(), StoreError> {
            self.inner.delete_group(group).await
        }

        async fn claim_owner(&self, user: UserId, instance: InstanceId, ttl: Duration) -> Result<(), StoreError> {
            self.inner.claim_owner(user, instance, ttl).await
        }

        async fn refresh_owners(
            &self,
            users: &[UserId],
            instance: InstanceId,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.refresh_owners(users, instance, ttl).await
        }

        async fn release_owner(&self, user: UserId, instance: InstanceId) -> Result<bool, StoreError> {
            self.inner.release_owner(user, instance).await
        }

        async fn owner_of(&self, user: UserId) -> Result<Option<InstanceId>, StoreError> {
            self.inner.owner_of(user).await
        }

        async fn seed(&self, groups: &[GroupMembers]) -> Result<(), StoreError> {
            self.inner.seed(groups).await
        }
    }

    #[tokio::test]
    async fn removal_while_register_loads_groups_is_kept() {
        let store = Arc::new(MemoryStore::new());
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let paused = Arc::new(PausedLoad {
            inner: store.clone(),
            gate: Mutex::new(Some((loaded_tx, release_rx))),
        });
        let state = HubState {
            store: paused,
            ..HubState::in_memory(store.clone(), Duration::from_secs(60))
        };
        let (hub, hub_loop) = Hub::new(state, 16);
        let shutdown = CancellationToken::new();
        tokio::spawn(hub_loop.run(shutdown.clone()));
        let frames = store.subscribe().await.unwrap();
        tokio::spawn(listener::run(Arc::clone(hub.state()), frames, shutdown.clone()));

        let alice = User { id: UserId::new(), username: "alice".into() };
        let (removed, added) = (GroupId::new(), GroupId::new());
        store.set_group_info(removed, "old team").await.unwrap();
        store.add_membership(removed, alice.id).await.unwrap();

        let (client, _rx) = Client::new(alice.clone(), 8);
        hub.register(Arc::clone(&client)).await;
        timeout(TIMEOUT, loaded_rx).await.unwrap().unwrap();

        // Membership changes land after the hub read alice's groups.
        store.remove_membership(removed, alice.id).await.unwrap();
        publish(&store, BusEvent::UserRemoved { user_id: alice.id, group_id: removed }).await;
        store.add_membership(added, alice.id).await.unwrap();
        publish(&store, BusEvent::UserAdded { user_id: alice.id, group_id: added }).await;
        // Frames apply in order, so the removal has been handled too.
        let registry = hub.registry().clone();
        wait_until("user_added applied", || registry.group(added).is_some()).await;

        release_tx.send(()).unwrap();
        let (store_view, instance) = (store.clone(), hub.instance_id());
        wait_until("register finished", || store_view.instance_users(instance).contains(&alice.id)).await;

        assert!(hub.registry().group(removed).is_none());
        assert!(!client.knows_group(removed));
        assert!(client.knows_group(added));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn full_request_channel_drops_and_loop_keeps_serving() {
        let store = Arc::new(MemoryStore::new());
        let state = HubState::in_memory(store.clone(), Duration::from_secs(60));
        let author = state.persistence.create_user("alice").await.unwrap();
        let group = state.persistence.create_group("general", author.id).await.unwrap();
        let chat = |content: &str| OutgoingChat {
            group_id: group.id,
            author: MessageUser::from(&author),
            content: content.to_string(),
        };

        // Loop not running yet: one slot per channel.
        let (hub, hub_loop) = Hub::new(state, 1);
        assert!(hub.broadcast(chat("first")));
        assert!(!hub.broadcast(chat("dropped")));
        assert!(hub.add_user_to_group(author.id, group.id));
        assert!(!hub.add_user_to_group(author.id, group.id));

        let mut frames = store.subscribe().await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(hub_loop.run(shutdown.clone()));

        let first = next_event(&mut frames).await.kind();
        let second = next_event(&mut frames).await.kind();
        let mut kinds = vec![first, second];
        kinds.sort();
        assert_eq!(kinds, ["chat_message", "user_added"]);

        assert!(hub.broadcast(chat("after")));
        match next_event(&mut frames).await {
            BusEvent::ChatMessage(msg) => assert_eq!(msg.content, "after"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(hub.state().persistence.recent_messages(group.id, 10).await.unwrap().len(), 2);
        shutdown.cancel();
    }
}
