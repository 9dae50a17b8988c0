//! One WebSocket connection: auth handshake, read loop, write loop.
//!
//! The read loop runs on the upgrade task; the write loop is spawned. Both
//! stop when the connection's lifetime scope is cancelled, and whichever
//! way the connection ends, it funnels into a single `Hub::unregister`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::hub::{Client, Hub};
use crate::persistence::Persistence;
use crate::protocol::{AuthFrame, AuthReply, CLOSE_POLICY_VIOLATION, CLOSE_UNSUPPORTED_DATA, ClientFrame};
use crate::store::MembershipStore;
use crate::types::{ChatMessage, MessageUser, OutgoingChat, User};

/// Timing and sizing for every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub outbound_queue: usize,
    pub auth_timeout: Duration,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            auth_timeout: config.auth_timeout(),
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
        }
    }
}

/// Why an inbound chat frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Malformed(String),
    SenderMismatch,
    NotMember,
    StoreUnavailable(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Malformed(e) => write!(f, "malformed frame: {e}"),
            Rejection::SenderMismatch => write!(f, "sender_id does not match authenticated user"),
            Rejection::NotMember => write!(f, "not a member of the target group"),
            Rejection::StoreUnavailable(e) => write!(f, "membership check failed: {e}"),
        }
    }
}

/// Check an inbound chat frame against the authenticated user and the
/// shared store's current membership. Membership is looked up on every
/// frame, never cached.
pub async fn validate_frame(
    store: &dyn MembershipStore,
    user: &User,
    text: &str,
) -> Result<OutgoingChat, Rejection> {
    let frame = ClientFrame::parse(text).map_err(|e| Rejection::Malformed(e.to_string()))?;
    if frame.sender_id != user.id {
        return Err(Rejection::SenderMismatch);
    }
    match store.is_member(frame.group_id, user.id).await {
        Ok(true) => Ok(OutgoingChat {
            group_id: frame.group_id,
            author: MessageUser::from(user),
            content: frame.content,
        }),
        Ok(false) => Err(Rejection::NotMember),
        Err(e) => Err(Rejection::StoreUnavailable(e.to_string())),
    }
}

/// Drive one upgraded socket to completion.
pub async fn handle_socket(
    mut socket: WebSocket,
    hub: Hub,
    auth: Arc<dyn Authenticator>,
    settings: ConnectionSettings,
) {
    let Some(user) = authenticate(&mut socket, auth.as_ref(), hub.state().persistence.as_ref(), &settings).await
    else {
        return;
    };

    let (client, outbound) = Client::new(user, settings.outbound_queue);
    let scope = client.lifetime().child_token();
    hub.register(Arc::clone(&client)).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, scope.clone(), settings));
    read_loop(stream, &hub, &client, &scope, &settings).await;

    scope.cancel();
    hub.unregister(Arc::clone(&client)).await;
    let _ = writer.await;
    tracing::debug!(user = %client.id(), conn_id = client.conn_id, "Connection closed");
}

// ── Auth handshake ─────────────────────────────────────────────────────

async fn authenticate(
    socket: &mut WebSocket,
    auth: &dyn Authenticator,
    persistence: &dyn Persistence,
    settings: &ConnectionSettings,
) -> Option<User> {
    let text = match timeout(settings.auth_timeout, socket.recv()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(_))) => {
            tracing::debug!("First frame was not text");
            close_with(socket, CLOSE_UNSUPPORTED_DATA, "expected text auth frame", settings).await;
            return None;
        }
        Err(_) => {
            reject(socket, "authentication timeout", settings).await;
            return None;
        }
    };

    let Some(frame) = AuthFrame::parse(text.as_str()) else {
        reject(socket, "expected auth frame", settings).await;
        return None;
    };
    let user_id = match auth.verify(&frame.token) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!("WebSocket auth failed: {e}");
            reject(socket, &e.to_string(), settings).await;
            return None;
        }
    };
    let user = match persistence.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            reject(socket, "unknown user", settings).await;
            return None;
        }
        Err(e) => {
            tracing::warn!(user = %user_id, "User lookup failed during auth: {e}");
            reject(socket, "internal error", settings).await;
            return None;
        }
    };

    let reply = WsMessage::Text(AuthReply::AuthSuccess.to_json().into());
    match timeout(settings.write_wait, socket.send(reply)).await {
        Ok(Ok(())) => {
            tracing::info!(user = %user.id, username = %user.username, "WebSocket authenticated");
            Some(user)
        }
        _ => None,
    }
}

async fn reject(socket: &mut WebSocket, error: &str, settings: &ConnectionSettings) {
    let reply = WsMessage::Text(AuthReply::failure(error).to_json().into());
    let _ = timeout(settings.write_wait, socket.send(reply)).await;
    close_with(socket, CLOSE_POLICY_VIOLATION, error, settings).await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str, settings: &ConnectionSettings) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = timeout(settings.write_wait, socket.send(WsMessage::Close(Some(frame)))).await;
}

// ── Read / write loops ─────────────────────────────────────────────────

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: &Hub,
    client: &Arc<Client>,
    scope: &CancellationToken,
    settings: &ConnectionSettings,
) {
    let store = Arc::clone(&hub.state().store);
    let mut deadline = Instant::now() + settings.pong_wait;
    loop {
        let frame = tokio::select! {
            _ = scope.cancelled() => break,
            frame = timeout_at(deadline, stream.next()) => frame,
        };
        let msg = match frame {
            Err(_) => {
                tracing::debug!(user = %client.id(), "Liveness deadline passed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(user = %client.id(), "WebSocket read error: {e}");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        deadline = Instant::now() + settings.pong_wait;

        match msg {
            WsMessage::Text(text) => match validate_frame(store.as_ref(), &client.user, text.as_str()).await {
                Ok(chat) => {
                    hub.broadcast(chat);
                }
                Err(reason) => {
                    tracing::warn!(user = %client.id(), conn_id = client.conn_id, "Dropping inbound frame: {reason}");
                }
            },
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {
                tracing::debug!(user = %client.id(), "Ignoring binary frame");
            }
            // Pong (and ping, answered by the transport) only refresh liveness.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<ChatMessage>,
    scope: CancellationToken,
    settings: ConnectionSettings,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    loop {
        let frame = tokio::select! {
            _ = scope.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(e) => {
                        tracing::warn!(message = %msg.id, "Failed to encode chat frame: {e}");
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Default::default()),
        };
        match timeout(settings.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("WebSocket write failed: {e}");
                break;
            }
            Err(_) => {
                tracing::debug!("WebSocket write deadline passed");
                break;
            }
        }
    }
    scope.cancel();
    let _ = timeout(settings.write_wait, sink.send(WsMessage::Close(None))).await;
}
