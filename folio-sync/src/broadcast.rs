//! Per-room fan-out of presence frames.
//!
//! Every connection in a room shares one tokio broadcast channel; a frame sent
//! by one connection reaches the N-1 others. Used by the relay server and by
//! the in-process realtime connector.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use crate::protocol::{PresenceAction, PresenceEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A text frame tagged with the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub from: u64,
    pub text: String,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: AtomicUsize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before a slow peer lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: AtomicUsize::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Send a frame to every connection in the room, the sender included;
    /// receivers skip their own frames. Returns the receiver count.
    pub fn broadcast(&self, from: u64, text: impl Into<String>) -> usize {
        let frame = Arc::new(Frame {
            from,
            text: text.into(),
        });
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// The participant a connection announced itself as.
///
/// When the connection drops without a `leave`, the room is sent one on its
/// behalf.
#[derive(Debug, Default)]
pub struct AnnouncedPeer(Option<String>);

impl AnnouncedPeer {
    /// Track joins and leaves in an outgoing frame; other frames are ignored.
    pub fn observe(&mut self, text: &str) {
        let Ok(envelope) = PresenceEnvelope::decode(text) else {
            return;
        };
        match envelope.action {
            PresenceAction::Join => self.0 = Some(envelope.user_id),
            PresenceAction::Leave => self.0 = None,
            PresenceAction::Typing | PresenceAction::Idle => {}
        }
    }

    /// Synthesized `leave` frame, if the peer joined and never left.
    pub fn farewell(&self) -> Option<String> {
        let user_id = self.0.as_ref()?;
        PresenceEnvelope::leave(user_id.as_str()).encode().ok()
    }
}

/// Maps room tokens to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
    next_connection: AtomicU64,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Id for a new connection, unique within this manager.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Join `token`, creating the room if needed.
    pub async fn join(&self, token: &str) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<Frame>>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone();
        room.peers.fetch_add(1, Ordering::SeqCst);
        let rx = room.subscribe();
        (room, rx)
    }

    /// Leave `token`; the room is removed once its last peer leaves.
    /// Returns `true` if the room was removed.
    pub async fn leave(&self, token: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(token) else {
            return false;
        };
        let remaining = room.peers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            rooms.remove(token);
            log::debug!("Room {token} is empty, removed");
            true
        } else {
            false
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn get(&self, token: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let group = BroadcastGroup::new(8);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        assert_eq!(group.broadcast(1, "hello"), 2);
        assert_eq!(rx1.recv().await.unwrap().text, "hello");
        assert_eq!(rx2.recv().await.unwrap().from, 1);
        assert_eq!(group.messages_sent(), 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = RoomManager::new(8);
        let (a, mut rx_a) = rooms.join("a").await;
        let (_b, mut rx_b) = rooms.join("b").await;

        a.broadcast(1, "only-a");
        assert_eq!(rx_a.recv().await.unwrap().text, "only-a");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(rooms.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_empty_room_removed() {
        let rooms = RoomManager::new(8);
        rooms.join("abc123").await;
        rooms.join("abc123").await;
        assert_eq!(rooms.get("abc123").await.unwrap().peer_count(), 2);

        assert!(!rooms.leave("abc123").await);
        assert!(rooms.leave("abc123").await);
        assert!(rooms.get("abc123").await.is_none());
        assert!(!rooms.leave("abc123").await);
    }

    #[test]
    fn test_announced_peer_farewell() {
        let mut peer = AnnouncedPeer::default();
        assert!(peer.farewell().is_none());

        peer.observe("garbage");
        peer.observe(r#"{"type":"typing","userId":"u1"}"#);
        assert!(peer.farewell().is_none());

        peer.observe(r#"{"type":"join","userId":"u1"}"#);
        assert_eq!(peer.farewell().as_deref(), Some(r#"{"type":"leave","userId":"u1"}"#));

        peer.observe(r#"{"type":"leave","userId":"u1"}"#);
        assert!(peer.farewell().is_none());
    }

    #[test]
    fn test_connection_ids_unique() {
        let rooms = RoomManager::new(1);
        assert_ne!(rooms.next_connection_id(), rooms.next_connection_id());
    }
}
