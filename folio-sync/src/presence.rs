//! Presence: who is in the room and who is typing.
//!
//! ## Architecture
//!
//! ```text
//! notify_typing()
//!       │
//!       ▼
//! PresenceChannel ──RoomCommand──▶ room task (owns PresenceRoom)
//!                                      │  ▲
//!                          typing/idle │  │ join/leave/typing/idle
//!                                      ▼  │
//!                                  ChannelLink (WebSocket / in-process)
//!                                      │
//!                                      ▼
//!                          participants watch ──▶ UI
//! ```
//!
//! The room task is the only owner of [`PresenceRoom`]. It sends `typing`
//! once per burst and `idle` exactly once after the typing window passes
//! without another keystroke. Remote typing flags clear on the same window.
//! Without a realtime backend the local participant is still reported.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use crate::client::Identity;
use crate::error::PresenceError;
use crate::protocol::{PresenceAction, PresenceEnvelope};
use crate::realtime::{room_url, ChannelLink, RealtimeConnector};
use crate::sleep_until_opt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Participant colours, assigned by join order and cycled.
pub const PALETTE: [&str; 8] = [
    "#4f46e5", "#e11d48", "#059669", "#d97706", "#7c3aed", "#0891b2", "#db2777", "#65a30d",
];

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Opaque room identifier shared between collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomToken(String);

impl RoomToken {
    /// Fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept a token that is safe to put in a URL path segment.
    pub fn parse(raw: &str) -> Result<Self, PresenceError> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(PresenceError::InvalidToken(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    NotJoined,
    Joining,
    Joined,
}

/// How a joined room is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceMode {
    Connected,
    /// No realtime channel; only the local participant is shown
    LocalOnly,
}

/// One participant as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub participant_id: String,
    pub display_name: String,
    /// Index into [`PALETTE`]
    pub color_index: usize,
    pub last_seen_at: Instant,
    pub is_typing: bool,
    pub is_local: bool,
}

impl PresenceRecord {
    pub fn color(&self) -> &'static str {
        PALETTE[self.color_index % PALETTE.len()]
    }
}

/// The local participant of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParticipant {
    pub user_id: String,
    pub email: Option<String>,
}

impl LocalParticipant {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            email: Some(identity.email.clone()),
        }
    }

    /// Anonymous participant for a signed-out user.
    pub fn guest() -> Self {
        Self {
            user_id: format!("guest-{}", Uuid::new_v4().simple()),
            email: None,
        }
    }
}

fn display_name(user_id: &str, email: Option<&str>) -> String {
    match email.and_then(|e| e.split('@').next()).filter(|s| !s.is_empty()) {
        Some(name) => name.to_string(),
        None => {
            let short: String = user_id.chars().take(8).collect();
            format!("Guest {short}")
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room — pure state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemoteEntry {
    record: PresenceRecord,
    typing_until: Option<Instant>,
}

/// Result of handling one incoming message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    /// The participant list changed
    pub changed: bool,
    /// Message to send back (our own join, for late joiners)
    pub reply: Option<PresenceEnvelope>,
}

/// Presence state of one room.
pub struct PresenceRoom {
    local: PresenceRecord,
    local_email: Option<String>,
    /// Remote participants in join order
    remotes: Vec<RemoteEntry>,
    /// Participants seen so far, the local one included; drives colours
    joins_seen: usize,
    typing_window: Duration,
    /// When the local burst turns idle
    local_idle_at: Option<Instant>,
}

impl PresenceRoom {
    pub fn new(local: LocalParticipant, typing_window: Duration, now: Instant) -> Self {
        let record = PresenceRecord {
            display_name: display_name(&local.user_id, local.email.as_deref()),
            participant_id: local.user_id,
            color_index: 0,
            last_seen_at: now,
            is_typing: false,
            is_local: true,
        };
        Self {
            local: record,
            local_email: local.email,
            remotes: Vec::new(),
            joins_seen: 1,
            typing_window,
            local_idle_at: None,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local.participant_id
    }

    pub fn join_message(&self) -> PresenceEnvelope {
        PresenceEnvelope::join(self.local.participant_id.as_str(), self.local_email.clone())
    }

    pub fn leave_message(&self) -> PresenceEnvelope {
        PresenceEnvelope::leave(self.local.participant_id.as_str())
    }

    fn position(&self, participant_id: &str) -> Option<usize> {
        self.remotes
            .iter()
            .position(|e| e.record.participant_id == participant_id)
    }

    fn insert_remote(&mut self, participant_id: &str, email: Option<&str>, now: Instant) -> usize {
        let color_index = self.joins_seen % PALETTE.len();
        self.joins_seen += 1;
        self.remotes.push(RemoteEntry {
            record: PresenceRecord {
                participant_id: participant_id.to_string(),
                display_name: display_name(participant_id, email),
                color_index,
                last_seen_at: now,
                is_typing: false,
                is_local: false,
            },
            typing_until: None,
        });
        log::debug!("Participant {participant_id} joined (colour {color_index})");
        self.remotes.len() - 1
    }

    /// Apply an incoming message.
    pub fn handle_message(&mut self, msg: &PresenceEnvelope, now: Instant) -> RoomUpdate {
        // Ignore our own messages
        if msg.user_id == self.local.participant_id {
            return RoomUpdate::default();
        }

        let known = self.position(&msg.user_id);
        match msg.action {
            PresenceAction::Join => match known {
                Some(i) => {
                    let entry = &mut self.remotes[i].record;
                    entry.last_seen_at = now;
                    if msg.email.is_some() {
                        entry.display_name = display_name(&msg.user_id, msg.email.as_deref());
                    }
                    RoomUpdate { changed: true, reply: None }
                }
                None => {
                    self.insert_remote(&msg.user_id, msg.email.as_deref(), now);
                    RoomUpdate {
                        changed: true,
                        reply: Some(self.join_message()),
                    }
                }
            },

            PresenceAction::Leave => match known {
                Some(i) => {
                    self.remotes.remove(i);
                    log::debug!("Participant {} left", msg.user_id);
                    RoomUpdate { changed: true, reply: None }
                }
                None => RoomUpdate::default(),
            },

            PresenceAction::Typing | PresenceAction::Idle => {
                // A message from someone who joined before we connected
                let (i, reply) = match known {
                    Some(i) => (i, None),
                    None => (
                        self.insert_remote(&msg.user_id, None, now),
                        Some(self.join_message()),
                    ),
                };
                let typing = msg.action == PresenceAction::Typing;
                let window = self.typing_window;
                let entry = &mut self.remotes[i];
                entry.record.last_seen_at = now;
                entry.record.is_typing = typing;
                entry.typing_until = typing.then(|| now + window);
                RoomUpdate { changed: true, reply }
            }
        }
    }

    /// Local keystroke. Returns a `typing` message at the start of a burst.
    pub fn notify_typing(&mut self, now: Instant) -> Option<PresenceEnvelope> {
        self.local_idle_at = Some(now + self.typing_window);
        self.local.last_seen_at = now;
        if self.local.is_typing {
            return None;
        }
        self.local.is_typing = true;
        Some(PresenceEnvelope::typing(self.local.participant_id.as_str()))
    }

    /// End the local burst once its window has passed. Returns the `idle`
    /// message exactly once per burst.
    pub fn poll_idle(&mut self, now: Instant) -> Option<PresenceEnvelope> {
        match self.local_idle_at {
            Some(at) if self.local.is_typing && now >= at => {
                self.local.is_typing = false;
                self.local_idle_at = None;
                Some(PresenceEnvelope::idle(self.local.participant_id.as_str()))
            }
            _ => None,
        }
    }

    /// Clear remote typing flags whose window has passed.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for entry in &mut self.remotes {
            if entry.typing_until.is_some_and(|until| now >= until) {
                entry.typing_until = None;
                entry.record.is_typing = false;
                changed = true;
            }
        }
        changed
    }

    /// Earliest pending idle or typing expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.remotes
            .iter()
            .filter_map(|e| e.typing_until)
            .chain(self.local_idle_at)
            .min()
    }

    /// Forget every remote participant. Returns `true` if any were known.
    pub fn clear_remotes(&mut self) -> bool {
        let had = !self.remotes.is_empty();
        self.remotes.clear();
        had
    }

    /// Local participant first, then remotes in join order.
    pub fn participants(&self) -> Vec<PresenceRecord> {
        std::iter::once(self.local.clone())
            .chain(self.remotes.iter().map(|e| e.record.clone()))
            .collect()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence channel — async driver
// ───────────────────────────────────────────────────────────────────

enum RoomCommand {
    Typing,
    Leave(oneshot::Sender<()>),
}

struct ActiveRoom {
    token: RoomToken,
    commands: mpsc::Sender<RoomCommand>,
    task: JoinHandle<()>,
}

/// Where realtime connections go.
#[derive(Clone)]
pub struct RealtimeEndpoint {
    pub connector: Arc<dyn RealtimeConnector>,
    /// `ws://host` style base; `/collab/<token>` is appended
    pub base_url: String,
}

/// Presence for the active room, if any.
pub struct PresenceChannel {
    endpoint: Option<RealtimeEndpoint>,
    typing_window: Duration,
    online: watch::Receiver<bool>,
    participants: Arc<watch::Sender<Vec<PresenceRecord>>>,
    state: RoomState,
    active: Option<ActiveRoom>,
}

impl PresenceChannel {
    pub fn new(
        endpoint: Option<RealtimeEndpoint>,
        typing_window: Duration,
        online: watch::Receiver<bool>,
    ) -> Self {
        let (participants, _) = watch::channel(Vec::new());
        Self {
            endpoint,
            typing_window,
            online,
            participants: Arc::new(participants),
            state: RoomState::NotJoined,
            active: None,
        }
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn token(&self) -> Option<&RoomToken> {
        self.active.as_ref().map(|a| &a.token)
    }

    pub fn participants(&self) -> Vec<PresenceRecord> {
        self.participants.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.participants.subscribe()
    }

    /// Join `token` as `local`, leaving any current room first.
    ///
    /// A failed connection is not an error: the room runs local-only and
    /// reconnects when connectivity comes back.
    pub async fn join_room(&mut self, token: RoomToken, local: LocalParticipant) -> PresenceMode {
        self.leave_room().await;
        self.state = RoomState::Joining;

        let (commands, command_rx) = mpsc::channel(32);
        let mut task = RoomTask {
            room: PresenceRoom::new(local, self.typing_window, Instant::now()),
            link: None,
            connector: self.endpoint.as_ref().map(|e| e.connector.clone()),
            url: self
                .endpoint
                .as_ref()
                .map(|e| room_url(&e.base_url, token.as_str())),
            commands: command_rx,
            online: self.online.clone(),
            watch_online: true,
            participants: self.participants.clone(),
        };
        if *task.online.borrow_and_update() {
            task.connect().await;
        }
        let mode = if task.link.is_some() {
            PresenceMode::Connected
        } else {
            PresenceMode::LocalOnly
        };
        task.publish();
        let handle = tokio::spawn(task.run());

        log::info!("Joined room {token} ({mode:?})");
        self.active = Some(ActiveRoom {
            token,
            commands,
            task: handle,
        });
        self.state = RoomState::Joined;
        mode
    }

    /// Announce `leave` and tear down. No-op when not joined.
    pub async fn leave_room(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if active.commands.send(RoomCommand::Leave(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = active.task.await {
            log::warn!("Presence task for room {} ended abnormally: {e}", active.token);
        }

        self.participants.send_replace(Vec::new());
        self.state = RoomState::NotJoined;
        log::info!("Left room {}", active.token);
    }

    /// Local keystroke.
    pub fn notify_typing(&self) -> Result<(), PresenceError> {
        let active = self.active.as_ref().ok_or(PresenceError::NotJoined)?;
        match active.commands.try_send(RoomCommand::Typing) {
            // A burst already queued covers this keystroke
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PresenceError::Closed),
        }
    }
}

/// Owns the room state and the link for one joined room.
struct RoomTask {
    room: PresenceRoom,
    link: Option<ChannelLink>,
    connector: Option<Arc<dyn RealtimeConnector>>,
    url: Option<String>,
    commands: mpsc::Receiver<RoomCommand>,
    online: watch::Receiver<bool>,
    watch_online: bool,
    participants: Arc<watch::Sender<Vec<PresenceRecord>>>,
}

async fn next_frame(link: &mut Option<ChannelLink>) -> Option<String> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

impl RoomTask {
    async fn run(mut self) {
        loop {
            let deadline = self.room.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(RoomCommand::Typing) => {
                        if let Some(typing) = self.room.notify_typing(Instant::now()) {
                            self.send(&typing).await;
                        }
                        self.publish();
                    }
                    Some(RoomCommand::Leave(done)) => {
                        self.depart().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.depart().await;
                        return;
                    }
                },

                frame = next_frame(&mut self.link) => match frame {
                    Some(text) => self.handle_frame(&text).await,
                    None => {
                        log::warn!("Realtime channel closed by remote");
                        self.drop_link();
                    }
                },

                _ = sleep_until_opt(deadline) => {
                    let now = Instant::now();
                    if let Some(idle) = self.room.poll_idle(now) {
                        self.send(&idle).await;
                    }
                    self.room.expire_typing(now);
                    self.publish();
                },

                changed = self.online.changed(), if self.watch_online => match changed {
                    Ok(()) => {
                        let online = *self.online.borrow_and_update();
                        if online {
                            if self.link.is_none() {
                                self.connect().await;
                                self.publish();
                            }
                        } else {
                            self.drop_link();
                        }
                    }
                    Err(_) => self.watch_online = false,
                },
            }
        }
    }

    async fn connect(&mut self) {
        let (Some(connector), Some(url)) = (&self.connector, &self.url) else {
            return;
        };
        match connector.connect(url).await {
            Ok(link) => {
                self.link = Some(link);
                let join = self.room.join_message();
                self.send(&join).await;
            }
            Err(e) => log::warn!("Presence running local-only, could not connect to {url}: {e}"),
        }
    }

    async fn send(&mut self, envelope: &PresenceEnvelope) {
        let Some(link) = &self.link else {
            return;
        };
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Could not encode presence message: {e}");
                return;
            }
        };
        if link.send(text).await.is_err() {
            log::warn!("Realtime channel closed while sending");
            self.drop_link();
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let Ok(envelope) = PresenceEnvelope::decode(text) else {
            log::trace!("Dropping malformed presence frame");
            return;
        };
        let update = self.room.handle_message(&envelope, Instant::now());
        if let Some(reply) = update.reply {
            self.send(&reply).await;
        }
        if update.changed {
            self.publish();
        }
    }

    async fn depart(&mut self) {
        let leave = self.room.leave_message();
        self.send(&leave).await;
        self.link = None;
    }

    fn drop_link(&mut self) {
        self.link = None;
        if self.room.clear_remotes() {
            self.publish();
        }
    }

    fn publish(&self) {
        self.participants.send_replace(self.room.participants());
    }
}

// ===================================================================
// Tests
// ===================================================================
