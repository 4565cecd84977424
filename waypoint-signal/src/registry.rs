//! Connection Registry: the single source of truth for who is online.
//!
//! Maps an identity to the live connection's outbound channel. The channel
//! feeds a per-connection writer task that owns the WebSocket sink, so a
//! failed channel send means the writer is gone and the transport is dead.
//!
//! Snapshots are copied under a short read lock; all sends happen outside
//! any registry lock so a slow peer can never stall another connection.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{to_text, ClientId, ProtocolError};

/// Outbound channel into a connection's writer task.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// Non-owning handle to one live connection.
///
/// Cloning is cheap; the connection task owns the transport itself.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: OutboundSender,
}

impl ConnectionHandle {
    pub fn new(tx: OutboundSender) -> Self {
        Self { tx }
    }

    /// Handle/receiver pair backed by a fresh channel. The receiver side is
    /// normally drained by a writer task; tests drain it directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Serialize `frame` and queue it for delivery.
    ///
    /// Never blocks: the channel is unbounded and the writer task applies
    /// the actual socket write timeout.
    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), ProtocolError> {
        let text = to_text(frame)?;
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue a raw WebSocket message (Pong replies, pre-encoded frames).
    pub fn send_raw(&self, msg: Message) -> Result<(), ProtocolError> {
        self.tx.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Whether the writer task is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The identity is already registered. Unreachable with v4 identities,
    /// but a collision must fail the registration, not corrupt the map.
    DuplicateIdentity(ClientId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIdentity(id) => write!(f, "Identity {id} is already registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Identity → live connection map.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Insert the pair. Fails if the identity is already present; the
    /// existing connection keeps its registration.
    pub async fn register(
        &self,
        id: ClientId,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RegistryError::DuplicateIdentity(id));
        }
        connections.insert(id, handle);
        Ok(())
    }

    /// O(1) lookup used by the router on every targeted message.
    pub async fn lookup(&self, id: ClientId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Remove the pair. Idempotent: returns `None` if the identity was not
    /// registered, which doubles as the exactly-once cleanup guard.
    pub async fn unregister(&self, id: ClientId) -> Option<ConnectionHandle> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            debug!("Unregistered connection {id}");
        }
        removed
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Snapshot of currently registered identities.
    pub async fn identities(&self) -> Vec<ClientId> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Snapshot of all identity/handle pairs for a broadcast. The lock is
    /// held only for the copy.
    pub async fn handles(&self) -> Vec<(ClientId, ConnectionHandle)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (handle, _rx) = ConnectionHandle::channel();

        registry.register(id, handle).await.unwrap();
        assert!(registry.contains(id).await);
        assert!(registry.lookup(id).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.unregister(id).await.is_some());
        assert!(registry.lookup(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (handle, _rx) = ConnectionHandle::channel();

        registry.register(id, handle).await.unwrap();
        assert!(registry.unregister(id).await.is_some());
        // Second removal is a no-op, not an error.
        assert!(registry.unregister(id).await.is_none());
        assert!(registry.unregister(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected_without_clobbering() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (first, mut first_rx) = ConnectionHandle::channel();
        let (second, _second_rx) = ConnectionHandle::channel();

        registry.register(id, first).await.unwrap();
        assert_eq!(
            registry.register(id, second).await,
            Err(RegistryError::DuplicateIdentity(id))
        );

        // The original registration still receives messages.
        let handle = registry.lookup(id).await.unwrap();
        handle.send(&ServerEvent::UserId { id }).unwrap();
        assert!(first_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_handle_send_fails_after_receiver_drop() {
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);

        assert!(!handle.is_open());
        let id = Uuid::new_v4();
        assert!(matches!(
            handle.send(&ServerEvent::UserId { id }),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_registrations_all_distinct() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = Uuid::new_v4();
                let (handle, _rx) = ConnectionHandle::channel();
                registry.register(id, handle).await.unwrap();
                id
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        assert_eq!(registry.len().await, 32);
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 32);
    }

    #[tokio::test]
    async fn test_handles_snapshot_matches_identities() {
        let registry = ConnectionRegistry::new();
        let mut expected = Vec::new();
        for _ in 0..5 {
            let id = Uuid::new_v4();
            let (handle, _rx) = ConnectionHandle::channel();
            registry.register(id, handle).await.unwrap();
            expected.push(id);
        }

        let identities = registry.identities().await;
        let handles = registry.handles().await;
        assert_eq!(identities.len(), 5);
        assert_eq!(handles.len(), 5);
        for id in expected {
            assert!(identities.contains(&id));
        }
    }
}
