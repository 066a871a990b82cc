//! Duplex text channel used by presence.
//!
//! A [`RealtimeConnector`] turns a `<base>/collab/<token>` URL into a
//! [`ChannelLink`]: an outgoing sender and an incoming receiver of text
//! frames. Dropping the link closes the connection.
//!
//! ```text
//! PresenceChannel ──outgoing──▶ writer task ──▶ WebSocket / room group
//!                 ◀──incoming── reader task ◀──
//! ```

use crate::broadcast::{AnnouncedPeer, RoomManager};
use crate::error::PresenceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Path segment preceding the room token.
pub const COLLAB_PATH: &str = "/collab/";

/// Room token at the end of a `/collab/<token>` URL or path.
pub fn room_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once(COLLAB_PATH)?;
    let token = rest.split(['?', '#']).next()?.trim_end_matches('/');
    (!token.is_empty() && !token.contains('/')).then_some(token)
}

/// Full realtime URL for a room.
pub fn room_url(base: &str, token: &str) -> String {
    format!("{}{COLLAB_PATH}{token}", base.trim_end_matches('/'))
}

/// Both halves of an open realtime connection.
pub struct ChannelLink {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl ChannelLink {
    pub async fn send(&self, text: String) -> Result<(), PresenceError> {
        self.outgoing
            .send(text)
            .await
            .map_err(|_| PresenceError::Closed)
    }
}

/// Opens realtime connections.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<ChannelLink, PresenceError>;
}

// ─── WebSocket ──────────────────────────────────────────────────────

/// Connector over `tokio-tungstenite`.
///
/// The TCP connect and the upgrade handshake together must finish within
/// `connect_timeout`; a relay that accepts and then stalls counts as
/// unreachable.
pub struct WebSocketConnector {
    capacity: usize,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<ChannelLink, PresenceError> {
        let handshake = tokio_tungstenite::connect_async(url);
        let (ws_stream, _) = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(connected) => connected.map_err(|e| PresenceError::Connect(e.to_string()))?,
            Err(_) => {
                return Err(PresenceError::Connect(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        log::debug!("Realtime connection open: {url}");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.capacity);

        // Writer: forward outgoing frames, close when the link is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_sender.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader: forward text frames until the socket or the link closes
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("Realtime read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ─── In-process ─────────────────────────────────────────────────────

/// Connector that joins rooms of a shared in-process [`RoomManager`].
///
/// Instances sharing one connector see each other as they would through
/// the relay, without a network.
#[derive(Clone)]
pub struct MemoryConnector {
    rooms: Arc<RoomManager>,
    capacity: usize,
}

impl MemoryConnector {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

#[async_trait]
impl RealtimeConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<ChannelLink, PresenceError> {
        let token = room_from_path(url)
            .ok_or_else(|| PresenceError::Connect(format!("no room in {url}")))?
            .to_string();

        let conn = self.rooms.next_connection_id();
        let (room, mut frames) = self.rooms.join(&token).await;
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.capacity);
        let rooms = self.rooms.clone();

        tokio::spawn(async move {
            let mut announced = AnnouncedPeer::default();
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            announced.observe(&text);
                            room.broadcast(conn, text);
                        }
                        None => break,
                    },
                    incoming = frames.recv() => match incoming {
                        Ok(frame) if frame.from == conn => {}
                        Ok(frame) => {
                            if in_tx.send(frame.text.clone()).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Connection {conn} lagged by {skipped} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            if let Some(leave) = announced.farewell() {
                room.broadcast(conn, leave);
            }
            rooms.leave(&token).await;
        });

        Ok(ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
