//! Per-document fan-out of pre-encoded frames.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind lags and skips.
//!
//! Frames carry the id of the connection that caused them so a connection
//! can skip its own traffic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// One encoded server message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Connection that must not receive this frame; `None` reaches everyone.
    pub origin: Option<Uuid>,
    pub text: Arc<str>,
}

impl Frame {
    pub fn is_from(&self, conn_id: &Uuid) -> bool {
        self.origin.as_ref() == Some(conn_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Broadcast group of a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames are buffered per receiver before a slow
    /// receiver starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(&self, conn_id: Uuid) -> broadcast::Receiver<Frame> {
        self.peers.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.write().await.remove(conn_id)
    }

    /// Encode and send to every receiver. Returns the number of receivers.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let text = msg.encode()?;
        Ok(self.broadcast_raw(origin, text.into()))
    }

    /// Send an already encoded frame, such as a relayed client message.
    pub fn broadcast_raw(&self, origin: Option<Uuid>, text: Arc<str>) -> usize {
        let count = self.sender.send(Frame { origin, text }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to broadcast groups so rooms stay isolated.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, doc_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(doc_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Drop the room if nobody is subscribed.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        assert!(group.remove_peer(&conn).await);
        assert!(!group.remove_peer(&conn).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_tags_origin() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(alice).await;
        let mut rx_bob = group.add_peer(bob).await;

        let count = group
            .broadcast(Some(alice), &ServerMessage::language_change("rust"))
            .unwrap();
        // Every receiver gets the frame; filtering is the connection's job.
        assert_eq!(count, 2);

        let frame = rx_alice.recv().await.unwrap();
        assert!(frame.is_from(&alice));
        let frame = rx_bob.recv().await.unwrap();
        assert!(!frame.is_from(&bob));
        assert!(frame.text.contains("language-change"));
    }

    #[tokio::test]
    async fn test_broadcast_raw_keeps_text_verbatim() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(Uuid::new_v4()).await;

        let raw: Arc<str> = Arc::from(r#"{"type":"crdt-delete","payload":{}}"#);
        assert_eq!(group.broadcast_raw(None, raw.clone()), 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.text, raw);
        assert!(frame.origin.is_none());
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(Uuid::new_v4()).await;
        for i in 0..5 {
            group.broadcast_raw(None, Arc::from(i.to_string()));
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap().text, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(Uuid::new_v4()).await;
        for i in 0..5 {
            group.broadcast_raw(None, Arc::from(i.to_string()));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // Continues with the oldest retained frame.
        assert_eq!(&*rx.recv().await.unwrap().text, "3");
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(Uuid::new_v4()).await;

        group.broadcast(None, &ServerMessage::user_leave("x")).unwrap();
        group.broadcast(None, &ServerMessage::user_leave("y")).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);

        let room1 = manager.get_or_create("doc").await;
        let room2 = manager.get_or_create("doc").await;
        let _other = manager.get_or_create("other").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 2);
        let docs = manager.active_documents().await;
        assert!(docs.contains(&"doc".to_string()));
        assert!(docs.contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("doc").await;
        let conn = Uuid::new_v4();
        let _rx = room.add_peer(conn).await;

        assert!(!manager.remove_if_empty("doc").await);
        assert_eq!(manager.room_count().await, 1);

        room.remove_peer(&conn).await;
        assert!(manager.remove_if_empty("doc").await);
        assert!(manager.get("doc").await.is_none());
    }
}
