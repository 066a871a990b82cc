//! WebSocket relay for presence rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                 ┌──▶ Client B
//!             ├── /collab/<token> ── BroadcastGroup ──┤
//! Client C ──┘                                 └──▶ Client D
//! ```
//!
//! The relay keeps no presence state of its own. Each text frame from a
//! connection is fanned out to the other connections of its room. When a
//! connection drops without saying `leave`, the relay sends one for it so
//! peers do not keep a stale record.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 11

use crate::broadcast::{AnnouncedPeer, RoomManager};
use crate::realtime::room_from_path;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it lags
    pub room_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            room_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_handshakes: u64,
}

/// A bound relay; call [`RelayServer::run`] to serve.
pub struct RelayServer {
    listener: TcpListener,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            listener,
            rooms: Arc::new(RoomManager::new(config.room_capacity)),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// `ws://` base URL clients should use.
    pub fn base_url(&self) -> std::io::Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!("Presence relay listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Run on a background task and return the base URL.
    pub fn spawn(self) -> std::io::Result<(String, tokio::task::JoinHandle<std::io::Result<()>>)> {
        let base = self.base_url()?;
        Ok((base, tokio::spawn(self.run())))
    }
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no room at {path}")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), tungstenite::Error> {
    let mut token: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        let path = request.uri().path();
        match room_from_path(path) {
            Some(room) => {
                token = Some(room.to_string());
                Ok(response)
            }
            None => Err(not_found(path)),
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            stats.write().await.rejected_handshakes += 1;
            return Err(e);
        }
    };
    let Some(token) = token else {
        return Ok(());
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn = rooms.next_connection_id();
    let (room, mut frames) = rooms.join(&token).await;
    log::info!("Connection {conn} from {addr} joined room {token}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut announced = AnnouncedPeer::default();
    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    announced.observe(&text);
                    room.broadcast(conn, text);
                    stats.write().await.total_messages += 1;
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            },

            frame = frames.recv() => match frame {
                // Don't echo back to sender
                Ok(frame) if frame.from == conn => {}
                Ok(frame) => {
                    if let Err(e) = ws_sender.send(Message::text(frame.text.clone())).await {
                        break Err(e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Connection {conn} lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    if let Some(leave) = announced.farewell() {
        room.broadcast(conn, leave);
    }
    rooms.leave(&token).await;
    stats.write().await.active_connections -= 1;
    log::info!("Connection {conn} left room {token}");

    result
}
