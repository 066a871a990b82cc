//! # folio-sync — Offline-first sync engine for Folio
//!
//! Keeps a local document editable at all times and mirrors it to a remote
//! backend when one is configured, reachable and signed in. Writes that
//! cannot be sent are kept in a durable queue and replayed in order.
//!
//! ## Architecture
//!
//! ```text
//!  edits ──▶ ┌────────────┐  push   ┌──────────────┐  HTTP   ┌─────────┐
//!            │ SyncEngine │───────▶ │  SyncClient  │───────▶ │ backend │
//!            │ (debounce) │         └──────┬───────┘         └─────────┘
//!            └─────┬──────┘                │ offline / failure
//!                  │                       ▼
//!   connectivity ──┤               ┌───────────────┐
//!   host wake ─────┤               │ DurableWrite- │ RocksDB
//!                  ▼               │ Queue         │ (or memory)
//!            ┌────────────┐        └───────────────┘
//!            │ SyncStatus │ local · synced · syncing · offline · error
//!            └────────────┘
//!
//!  ┌─────────────────┐  /collab/<token>  ┌──────────────┐
//!  │ PresenceChannel │ ◀───────────────▶ │ RelayServer  │ join · leave
//!  └─────────────────┘     WebSocket     └──────────────┘ typing · idle
//! ```
//!
//! ## Modules
//!
//! - [`queue`] — durable FIFO of unsent writes
//! - [`store`] — RocksDB and in-memory stores behind the queue and settings
//! - [`connectivity`] — online/offline signal
//! - [`status`] — the sync status state machine
//! - [`transport`] — HTTP backend client
//! - [`client`] — push, flush, magic-link sign-in and sign-out
//! - [`wake`] — background wake-up bridge to the host
//! - [`engine`] — the task tying the above together
//! - [`presence`] — who is in the room and who is typing
//! - [`protocol`] — presence wire format
//! - [`realtime`] / [`broadcast`] / [`relay`] — presence transport

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod realtime;
pub mod relay;
pub mod status;
pub mod store;
pub mod transport;
pub mod wake;

// Re-exports for convenience
pub use client::{FlushReport, Identity, IdentityKind, PushOutcome, SyncClient};
pub use config::{Settings, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{Error, PresenceError, Result, StoreError, TransportError, WakeError};
pub use presence::{
    LocalParticipant, PresenceChannel, PresenceMode, PresenceRecord, RoomState, RoomToken,
    PALETTE,
};
pub use protocol::{PresenceAction, PresenceEnvelope};
pub use queue::{DurableWriteQueue, QueuedWrite, WriteKind};
pub use realtime::{MemoryConnector, RealtimeConnector, WebSocketConnector};
pub use relay::{RelayConfig, RelayServer};
pub use status::{StatusEvent, SyncStatus, SyncStatusMachine};
pub use store::{DurableStore, MemoryStore, RocksStore, SettingsStore, Storage, StoreConfig};
pub use transport::{Backend, HttpTransport, PushRequest, RemoteTransport};
pub use wake::{BackgroundHost, BackgroundWakeBridge, HostMessage, WakeHub};

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
