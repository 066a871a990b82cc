//! The single observable sync status.
//!
//! ```text
//!            connectivity lost (from any state)
//!   ┌───────────────────────────────────────────────┐
//!   │                                               ▼
//! Local/Synced ──push started──▶ Syncing ──ok──▶ Synced     Offline
//!                                   │                          │
//!                                   └─failed──▶ Error          │ regained
//!                                                              ▼
//!                     Syncing (push still running) / Synced / Local, flush requested
//! ```
//!
//! Only [`SyncStatusMachine`] writes the status. Everything else feeds it
//! [`StatusEvent`]s through a [`StatusHandle`] and reads the published value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// User-visible sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Changes stay on this device (no remote sync configured)
    Local,
    Synced,
    Syncing,
    Offline,
    /// Last push failed while online; the write is queued
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    ConnectivityLost,
    ConnectivityRegained,
    PushStarted,
    PushSucceeded,
    PushFailed,
    /// Remote sync became available (real sign-in) or unavailable
    /// (demo session, sign-out).
    RemoteEnabled(bool),
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SyncStatus,
    pub to: SyncStatus,
    /// Connectivity came back with remote sync on: drain the queue
    pub flush_requested: bool,
}

impl Transition {
    /// Whether a new state was entered.
    pub fn entered(&self) -> bool {
        self.from != self.to
    }
}

pub struct SyncStatusMachine {
    current: SyncStatus,
    online: bool,
    remote_enabled: bool,
    /// Between `PushStarted` and its `PushSucceeded`/`PushFailed`
    pushing: bool,
    tx: watch::Sender<SyncStatus>,
}

impl SyncStatusMachine {
    pub fn new(online: bool, remote_enabled: bool) -> Self {
        let current = Self::resting(online, remote_enabled);
        let (tx, _rx) = watch::channel(current);
        Self {
            current,
            online,
            remote_enabled,
            pushing: false,
            tx,
        }
    }

    /// Where the machine settles when no push event says otherwise.
    fn settled(&self) -> SyncStatus {
        if self.pushing && self.online && self.remote_enabled {
            SyncStatus::Syncing
        } else {
            Self::resting(self.online, self.remote_enabled)
        }
    }

    fn resting(online: bool, remote_enabled: bool) -> SyncStatus {
        match (online, remote_enabled) {
            (false, _) => SyncStatus::Offline,
            (true, true) => SyncStatus::Synced,
            (true, false) => SyncStatus::Local,
        }
    }

    /// Apply one event and publish the resulting status.
    pub fn apply(&mut self, event: StatusEvent) -> Transition {
        let from = self.current;
        let mut flush_requested = false;

        let to = match event {
            StatusEvent::ConnectivityLost => {
                self.online = false;
                SyncStatus::Offline
            }
            StatusEvent::ConnectivityRegained => {
                self.online = true;
                flush_requested = self.remote_enabled;
                self.settled()
            }
            StatusEvent::PushStarted if self.remote_enabled => {
                self.pushing = true;
                if self.online {
                    SyncStatus::Syncing
                } else {
                    from
                }
            }
            StatusEvent::PushStarted => from,
            StatusEvent::PushSucceeded => {
                self.pushing = false;
                Self::resting(self.online, self.remote_enabled)
            }
            StatusEvent::PushFailed => {
                self.pushing = false;
                if self.online {
                    SyncStatus::Error
                } else {
                    SyncStatus::Offline
                }
            }
            StatusEvent::RemoteEnabled(enabled) => {
                self.remote_enabled = enabled;
                self.settled()
            }
        };

        self.current = to;
        self.tx.send_if_modified(|published| {
            if *published == to {
                false
            } else {
                *published = to;
                true
            }
        });

        let transition = Transition { from, to, flush_requested };
        if transition.entered() {
            log::debug!("Sync status {from} -> {to} ({event:?})");
        }
        transition
    }

    pub fn current(&self) -> SyncStatus {
        self.current
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote_enabled
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

/// Shared access to the one status machine.
#[derive(Clone)]
pub struct StatusHandle {
    machine: Arc<Mutex<SyncStatusMachine>>,
}

impl StatusHandle {
    pub fn new(machine: SyncStatusMachine) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncStatusMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn apply(&self, event: StatusEvent) -> Transition {
        self.lock().apply(event)
    }

    pub fn current(&self) -> SyncStatus {
        self.lock().current()
    }

    pub fn is_online(&self) -> bool {
        self.lock().is_online()
    }

    pub fn remote_enabled(&self) -> bool {
        self.lock().remote_enabled()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.lock().subscribe()
    }
}
