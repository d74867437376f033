use crate::realtime::events::OutboundEvent;
use crate::{ConnectionId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Outbound side of one live connection.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    id: ConnectionId,
    sender: UnboundedSender<OutboundEvent>,
}

impl ChannelHandle {
    pub fn new(sender: UnboundedSender<OutboundEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `event`. Returns `false` once the connection has gone away.
    pub fn send(&self, event: OutboundEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Whether the receiving side still exists.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Maps each connected user to their single channel handle.
///
/// Registering a user that already has a handle replaces it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<UserId, ChannelHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `user`, returning the handle it replaced.
    pub async fn register(&self, user: &UserId, handle: ChannelHandle) -> Option<ChannelHandle> {
        let connection_id = handle.id();
        let replaced = self.inner.write().await.insert(user.clone(), handle);

        tracing::debug!(
            user_id = %user,
            connection_id = ?connection_id,
            replaced = replaced.is_some(),
            "registered connection"
        );
        replaced
    }

    /// Removes whatever handle `user` has.
    pub async fn deregister(&self, user: &UserId) -> Option<ChannelHandle> {
        let removed = self.inner.write().await.remove(user);
        if removed.is_some() {
            tracing::debug!(user_id = %user, "deregistered connection");
        }
        removed
    }

    /// Removes `user`'s handle only if it belongs to `connection_id`.
    ///
    /// A connection that was already replaced cannot evict its replacement.
    pub async fn deregister_connection(&self, user: &UserId, connection_id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get(user) {
            Some(handle) if handle.id() == connection_id => {
                guard.remove(user);
                tracing::debug!(user_id = %user, connection_id = ?connection_id, "deregistered connection");
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user: &UserId) -> Option<ChannelHandle> {
        self.inner.read().await.get(user).cloned()
    }

    /// Whether `connection_id` is still the registered connection of `user`.
    pub async fn is_current(&self, user: &UserId, connection_id: ConnectionId) -> bool {
        self.inner
            .read()
            .await
            .get(user)
            .is_some_and(|handle| handle.id() == connection_id)
    }

    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.inner.read().await.contains_key(user)
    }

    /// Sends `event` to `user` if connected. Returns whether it was queued.
    ///
    /// Runs under the registry lock so a deregistered handle is never used.
    pub async fn send(&self, user: &UserId, event: OutboundEvent) -> bool {
        let guard = self.inner.read().await;
        guard.get(user).is_some_and(|handle| handle.send(event))
    }

    /// Sends `event` to every connected user except `user`. Returns the
    /// number of connections it was queued on.
    pub async fn broadcast_except(&self, user: &UserId, event: &OutboundEvent) -> usize {
        let guard = self.inner.read().await;
        guard
            .iter()
            .filter(|(other, _)| *other != user)
            .filter(|(_, handle)| handle.send(event.clone()))
            .count()
    }

    pub async fn connected_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.inner.read().await.keys().cloned().collect();
        users.sort();
        users
    }
}
