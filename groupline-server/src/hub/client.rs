//! A registered connection as seen by the hub.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::types::{ChatMessage, GroupId, User, UserId};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One authenticated socket.
///
/// The hub and the event bus listener hold `Arc<Client>`; the connection's
/// own tasks hold the outbound receiver and the lifetime token. `conn_id`
/// tells two sockets of the same user apart, so a stale unregister cannot
/// remove a newer connection.
pub struct Client {
    pub conn_id: u64,
    pub user: User,
    outbound: mpsc::Sender<ChatMessage>,
    /// Groups this connection believes it belongs to.
    groups: Mutex<HashSet<GroupId>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Client {
    /// Build a client and the receiving end of its outbound queue.
    pub fn new(user: User, capacity: usize) -> (Arc<Self>, mpsc::Receiver<ChatMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            user,
            outbound: tx,
            groups: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (client, rx)
    }

    pub fn id(&self) -> UserId {
        self.user.id
    }

    /// Non-blocking enqueue. A full or closed queue drops the message.
    pub fn try_deliver(&self, msg: ChatMessage) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(
                    user = %self.user.id,
                    conn_id = self.conn_id,
                    group = %msg.group_id,
                    message = %msg.id,
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(user = %self.user.id, conn_id = self.conn_id, "Outbound queue closed");
                false
            }
        }
    }

    pub fn known_groups(&self) -> HashSet<GroupId> {
        self.groups.lock().clone()
    }

    pub fn knows_group(&self, group: GroupId) -> bool {
        self.groups.lock().contains(&group)
    }

    pub(crate) fn remember_group(&self, group: GroupId) {
        self.groups.lock().insert(group);
    }

    pub(crate) fn forget_group(&self, group: GroupId) {
        self.groups.lock().remove(&group);
    }

    /// Lifetime token shared by the connection's read and write loops.
    pub fn lifetime(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the connection. Returns true only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn_id", &self.conn_id)
            .field("user", &self.user.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, MessageUser};

    fn user() -> User {
        User { id: UserId::new(), username: "alice".into() }
    }

    fn message(group: GroupId) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            content: "x".into(),
            group_id: group,
            user: MessageUser { id: UserId::new(), username: "bob".into() },
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn close_cancels_exactly_once() {
        let (client, _rx) = Client::new(user(), 4);
        let token = client.lifetime();
        assert!(client.close());
        assert!(!client.close());
        assert!(token.is_cancelled());
        assert!(client.is_closed());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (client, mut rx) = Client::new(user(), 1);
        let g = GroupId::new();
        assert!(client.try_deliver(message(g)));
        assert!(!client.try_deliver(message(g)));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connection_ids_are_unique() {
        let (a, _) = Client::new(user(), 1);
        let (b, _) = Client::new(user(), 1);
        assert_ne!(a.conn_id, b.conn_id);
    }
}
