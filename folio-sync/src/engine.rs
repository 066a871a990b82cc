//! The sync engine: one owner for the queue, the status and the session.
//!
//! ```text
//!  notify_edit ─┐
//!  flush_now   ─┤  EngineEvent   ┌──────────────────────────────┐
//!  shutdown    ─┼──────────────▶ │ engine task (tokio::select!) │──spawn──▶ push / flush
//!  connectivity ┤                │  debounce · retry · wake     │◀─────────  completion
//!  host wake   ─┘                └──────────────────────────────┘
//! ```
//!
//! All sync decisions are made on the engine task. Edits replace the pending
//! snapshot and restart the debounce; when the debounce elapses a single push
//! is spawned. While it runs, further edits wait in the debounce and are
//! looked at again when it completes. Presence runs beside the engine and
//! only shares the connectivity signal.

use crate::client::{FlushReport, Identity, PushOutcome, SyncClient};
use crate::config::{Settings, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::presence::{
    LocalParticipant, PresenceChannel, PresenceMode, PresenceRecord, RealtimeEndpoint, RoomState,
    RoomToken,
};
use crate::queue::DurableWriteQueue;
use crate::realtime::{RealtimeConnector, WebSocketConnector};
use crate::sleep_until_opt;
use crate::status::{StatusEvent, StatusHandle, SyncStatus, SyncStatusMachine};
use crate::store::{SettingsStore, Storage};
use crate::transport::{Backend, RemoteTransport};
use crate::wake::{BackgroundHost, BackgroundWakeBridge, HostMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Realtime base used with an injected connector when none is configured.
const LOCAL_REALTIME_BASE: &str = "memory://local";

/// How a spawned push or flush ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Push(PushOutcome),
    Flush(FlushReport),
    /// The task panicked or was cancelled
    Aborted(String),
}

/// Everything the engine task reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Edited(Vec<u8>),
    FlushRequested,
    ConnectivityChanged(bool),
    HostWake(HostMessage),
    DebounceElapsed,
    RetryTick,
    Completed(Completion),
    Shutdown,
}

// ─── Builder ────────────────────────────────────────────────────────

/// Collects the seams before starting an engine.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    storage: Option<Storage>,
    transport: Option<Arc<dyn RemoteTransport>>,
    connector: Option<Arc<dyn RealtimeConnector>>,
    host: Option<Arc<dyn BackgroundHost>>,
    connectivity: Option<ConnectivityMonitor>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            storage: None,
            transport: None,
            connector: None,
            host: None,
            connectivity: None,
        }
    }

    /// Use these stores instead of opening `config.storage_path`.
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use this transport as the real backend regardless of configuration.
    pub fn transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn RealtimeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn host(mut self, host: Arc<dyn BackgroundHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Open storage, pick the backend, spawn the engine task and rejoin a
    /// persisted room. Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<SyncEngine> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => Storage::open(self.config.store_config()),
        };
        let settings = Settings::load(storage.settings.as_ref()).unwrap_or_else(|e| {
            log::warn!("Could not load settings ({e}), using defaults");
            Settings::default()
        });
        let explicit_remote = self.config.remote_base_url.is_some();
        let config = self.config.with_settings(&settings);
        if explicit_remote {
            let saved = Settings::save_remote(
                storage.settings.as_ref(),
                config.remote_base_url.as_deref(),
                config.api_key.as_deref(),
            );
            if let Err(e) = saved {
                log::warn!("Could not persist remote endpoint: {e}");
            }
        }

        let backend = match self.transport {
            Some(transport) => Backend::Real(transport),
            None => Backend::from_config(&config)?,
        };
        let connectivity = self.connectivity.unwrap_or_default();

        let remote_enabled = backend.is_real()
            && settings
                .identity
                .as_ref()
                .is_some_and(Identity::is_authenticated);
        let status = StatusHandle::new(SyncStatusMachine::new(
            connectivity.is_online(),
            remote_enabled,
        ));
        let queue = Arc::new(DurableWriteQueue::new(storage.queue.clone()));
        let client = Arc::new(SyncClient::new(
            backend,
            queue,
            status,
            storage.settings.clone(),
            config.auth_timeout,
        ));

        let endpoint = match self.connector {
            Some(connector) => Some(RealtimeEndpoint {
                connector,
                base_url: config
                    .realtime_base()
                    .unwrap_or_else(|| LOCAL_REALTIME_BASE.to_string()),
            }),
            None => config.realtime_base().map(|base_url| RealtimeEndpoint {
                connector: Arc::new(WebSocketConnector::new(
                    config.channel_capacity,
                    config.connect_timeout,
                )),
                base_url,
            }),
        };
        let presence = PresenceChannel::new(endpoint, config.typing_idle, connectivity.subscribe());

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let task = EngineTask {
            client: client.clone(),
            events: events_rx,
            connectivity: connectivity.subscribe(),
            watch_connectivity: true,
            wake: self.host.map(BackgroundWakeBridge::new),
            debounce: config.debounce,
            retry_interval: config.retry_interval,
            pending: None,
            deadline: None,
            in_flight: None,
            flush_pending: false,
        };
        let handle = tokio::spawn(task.run());

        let engine = SyncEngine {
            client,
            connectivity,
            presence: Mutex::new(presence),
            settings: storage.settings,
            events: events_tx,
            task: handle,
        };

        log::info!(
            "Sync engine started: status {}, {} queued writes{}",
            engine.status(),
            engine.queue_len(),
            if engine.is_degraded() { " (not durable)" } else { "" }
        );

        if let Some(raw) = settings.room_token {
            match RoomToken::parse(&raw) {
                Ok(token) => {
                    engine.join_room(Some(token)).await?;
                }
                Err(e) => log::warn!("Ignoring persisted room: {e}"),
            }
        }

        Ok(engine)
    }
}

// ─── Engine handle ──────────────────────────────────────────────────

/// Handle to a running sync engine.
pub struct SyncEngine {
    client: Arc<SyncClient>,
    connectivity: ConnectivityMonitor,
    presence: Mutex<PresenceChannel>,
    settings: Arc<dyn SettingsStore>,
    events: mpsc::Sender<EngineEvent>,
    task: JoinHandle<()>,
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    async fn send(&self, event: EngineEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::Shutdown)
    }

    /// The document changed; `payload` is its latest serialized form.
    pub async fn notify_edit(&self, payload: Vec<u8>) -> Result<()> {
        self.send(EngineEvent::Edited(payload)).await
    }

    /// Replay the queue now (if online and signed in).
    pub async fn flush_now(&self) -> Result<()> {
        self.send(EngineEvent::FlushRequested).await
    }

    /// Sign in by magic link; see [`SyncClient::request_authentication`].
    ///
    /// An active room is rejoined under the new identity.
    pub async fn request_authentication(&self, email: &str) -> Result<Identity> {
        let identity = self.client.request_authentication(email).await?;
        if identity.is_authenticated() {
            self.send(EngineEvent::FlushRequested).await?;
        }
        self.rejoin_as(LocalParticipant::from_identity(&identity)).await;
        Ok(identity)
    }

    pub async fn sign_out(&self) {
        self.client.sign_out();
        self.rejoin_as(LocalParticipant::guest()).await;
    }

    async fn rejoin_as(&self, local: LocalParticipant) {
        let mut presence = self.presence.lock().await;
        if let Some(token) = presence.token().cloned() {
            presence.join_room(token, local).await;
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.client.status().current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.client.status().subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.client.identity()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.client.last_synced_at()
    }

    /// Number of queued writes; 0 if the store cannot be read.
    pub fn queue_len(&self) -> usize {
        self.client.queue().len().unwrap_or_else(|e| {
            log::warn!("Could not count queued writes: {e}");
            0
        })
    }

    pub fn queue(&self) -> &Arc<DurableWriteQueue> {
        self.client.queue()
    }

    /// Whether accepted writes may be lost on restart.
    pub fn is_degraded(&self) -> bool {
        self.client.queue().is_degraded()
    }

    /// Connectivity signal; hosts report transitions here.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Join `token`, or a fresh room when `None`. The token is persisted.
    pub async fn join_room(&self, token: Option<RoomToken>) -> Result<RoomToken> {
        let token = token.unwrap_or_else(RoomToken::generate);
        let local = match self.client.identity() {
            Some(identity) => LocalParticipant::from_identity(&identity),
            None => LocalParticipant::guest(),
        };

        let mode = self.presence.lock().await.join_room(token.clone(), local).await;
        if mode == PresenceMode::LocalOnly {
            log::debug!("Room {token} has no realtime channel");
        }
        Settings::save_room_token(self.settings.as_ref(), Some(token.as_str()))?;
        Ok(token)
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.presence.lock().await.leave_room().await;
        Settings::save_room_token(self.settings.as_ref(), None)?;
        Ok(())
    }

    pub async fn notify_typing(&self) -> Result<()> {
        self.presence.lock().await.notify_typing()?;
        Ok(())
    }

    pub async fn participants(&self) -> Vec<PresenceRecord> {
        self.presence.lock().await.participants()
    }

    pub async fn subscribe_participants(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.presence.lock().await.subscribe()
    }

    pub async fn room_state(&self) -> RoomState {
        self.presence.lock().await.state()
    }

    /// Stop the engine.
    ///
    /// Leaves the room (keeping it persisted for the next start), waits for
    /// an in-flight push, and queues a snapshot still waiting on the
    /// debounce.
    pub async fn shutdown(self) {
        self.presence.lock().await.leave_room().await;
        let _ = self.events.send(EngineEvent::Shutdown).await;
        if let Err(e) = self.task.await {
            log::error!("Engine task ended abnormally: {e}");
        }
        log::info!("Sync engine stopped");
    }
}

// ─── Engine task ────────────────────────────────────────────────────

struct EngineTask {
    client: Arc<SyncClient>,
    events: mpsc::Receiver<EngineEvent>,
    connectivity: watch::Receiver<bool>,
    watch_connectivity: bool,
    wake: Option<BackgroundWakeBridge>,
    debounce: Duration,
    retry_interval: Duration,
    /// Latest unsent snapshot
    pending: Option<Vec<u8>>,
    /// When the debounce elapses
    deadline: Option<Instant>,
    in_flight: Option<JoinHandle<Completion>>,
    /// A flush was asked for while something was in flight
    flush_pending: bool,
}

async fn next_wake(wake: &mut Option<BackgroundWakeBridge>) -> Option<HostMessage> {
    match wake {
        Some(bridge) => bridge.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_in_flight(task: &mut Option<JoinHandle<Completion>>) -> Completion {
    let Some(handle) = task else {
        return std::future::pending().await;
    };
    let completion = match handle.await {
        Ok(completion) => completion,
        Err(e) => Completion::Aborted(e.to_string()),
    };
    *task = None;
    completion
}

impl EngineTask {
    async fn run(mut self) {
        let mut retry = tokio::time::interval_at(
            Instant::now() + self.retry_interval,
            self.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Writes left over from a previous run
        self.dispatch(EngineEvent::FlushRequested);

        loop {
            let event = tokio::select! {
                event = self.events.recv() => event.unwrap_or(EngineEvent::Shutdown),

                changed = self.connectivity.changed(), if self.watch_connectivity => match changed {
                    Ok(()) => EngineEvent::ConnectivityChanged(*self.connectivity.borrow_and_update()),
                    Err(_) => {
                        self.watch_connectivity = false;
                        continue;
                    }
                },

                message = next_wake(&mut self.wake) => match message {
                    Some(message) => EngineEvent::HostWake(message),
                    None => {
                        self.wake = None;
                        continue;
                    }
                },

                _ = sleep_until_opt(self.deadline) => EngineEvent::DebounceElapsed,

                completion = join_in_flight(&mut self.in_flight) => EngineEvent::Completed(completion),

                _ = retry.tick() => EngineEvent::RetryTick,
            };

            if !self.dispatch(event) {
                break;
            }
        }

        self.finish().await;
    }

    /// Single dispatch point. Returns `false` on shutdown.
    fn dispatch(&mut self, event: EngineEvent) -> bool {
        log::trace!("Engine event: {event:?}");
        match event {
            EngineEvent::Edited(payload) => {
                self.pending = Some(payload);
                self.deadline = Some(Instant::now() + self.debounce);
            }
            EngineEvent::DebounceElapsed => {
                self.deadline = None;
                self.start_push();
            }
            EngineEvent::FlushRequested => self.request_flush(),
            EngineEvent::ConnectivityChanged(online) => {
                let event = if online {
                    StatusEvent::ConnectivityRegained
                } else {
                    StatusEvent::ConnectivityLost
                };
                if self.client.status().apply(event).flush_requested {
                    self.request_flush();
                }
            }
            EngineEvent::HostWake(HostMessage::FlushQueue) => {
                log::info!("Host requested a queue flush");
                self.request_flush();
            }
            EngineEvent::RetryTick => {
                if self.in_flight.is_none() && self.has_backlog() {
                    log::debug!("Retrying queued writes");
                    self.request_flush();
                }
            }
            EngineEvent::Completed(completion) => self.completed(completion),
            EngineEvent::Shutdown => return false,
        }
        true
    }

    /// Online, signed in, and something is queued.
    fn has_backlog(&self) -> bool {
        self.client.status().is_online()
            && self.client.remote_enabled()
            && matches!(self.client.queue().is_empty(), Ok(false))
    }

    fn start_push(&mut self) {
        // Re-evaluated when the running push completes
        if self.in_flight.is_some() {
            return;
        }
        let Some(payload) = self.pending.take() else {
            return;
        };

        // Older queued snapshots must reach the remote first
        if self.has_backlog() {
            if let Err(e) = self.client.queue().enqueue(payload) {
                log::error!("Could not queue snapshot behind backlog: {e}");
            }
            self.spawn_flush();
            return;
        }

        let client = self.client.clone();
        self.in_flight = Some(tokio::spawn(async move {
            Completion::Push(client.push_snapshot(payload).await)
        }));
    }

    fn request_flush(&mut self) {
        if self.in_flight.is_some() {
            self.flush_pending = true;
        } else {
            self.spawn_flush();
        }
    }

    fn spawn_flush(&mut self) {
        let client = self.client.clone();
        self.in_flight = Some(tokio::spawn(async move {
            Completion::Flush(client.flush_queue().await)
        }));
    }

    fn completed(&mut self, completion: Completion) {
        let offline = !self.client.status().is_online();
        match &completion {
            Completion::Push(PushOutcome::Queued { write_id }) => {
                log::debug!("Write {write_id} waits for connectivity");
                self.request_wake();
            }
            Completion::Push(PushOutcome::Failed { write_id: Some(write_id), .. }) if offline => {
                log::debug!("Write {write_id} failed as connectivity dropped");
                self.request_wake();
            }
            Completion::Push(outcome) => log::debug!("Push finished: {outcome:?}"),
            Completion::Flush(report) if report.sent > 0 || report.requeued > 0 => {
                log::debug!("Flush finished: {} sent, {} requeued", report.sent, report.requeued);
                if report.requeued > 0 && offline {
                    self.request_wake();
                }
            }
            Completion::Flush(_) => {}
            Completion::Aborted(reason) => log::error!("Sync task aborted: {reason}"),
        }

        if std::mem::take(&mut self.flush_pending) {
            self.request_flush();
        } else if self.pending.is_some() && self.deadline.is_none() {
            self.start_push();
        }
    }

    /// Ask the host to flush once connectivity is back.
    fn request_wake(&self) {
        if let Some(bridge) = &self.wake {
            bridge.request_wake();
        }
    }

    async fn finish(mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await {
                log::error!("In-flight sync task failed during shutdown: {e}");
            }
        }
        if let Some(payload) = self.pending.take() {
            if self.client.remote_enabled() {
                match self.client.queue().enqueue(payload) {
                    Ok(write) => {
                        log::info!("Queued unsent edit as write {} at shutdown", write.id);
                        if !self.client.status().is_online() {
                            self.request_wake();
                        }
                    }
                    Err(e) => log::error!("Could not queue unsent edit at shutdown: {e}"),
                }
            }
        }
    }
}
