//! Bridge to the host's background-task facility.
//!
//! ```text
//! write queued while offline
//!       │
//!       ▼
//! BackgroundWakeBridge::request_wake()
//!       │  register("folio-sync:flush-queue")
//!       ▼
//! BackgroundHost ── later, connectivity back ── fire()
//!       │
//!       ▼  broadcast { "type": "flush-queue" }
//! every live instance ──▶ SyncClient::flush_queue()
//! ```
//!
//! Registrations are one-shot: firing a task consumes its registration.

use crate::error::WakeError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Name of the queue flush task registered with the host.
pub const FLUSH_TASK_NAME: &str = "folio-sync:flush-queue";

/// Message the host broadcasts to application instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    FlushQueue,
}

impl HostMessage {
    pub fn encode(&self) -> Result<String, WakeError> {
        serde_json::to_string(self).map_err(|e| WakeError::Malformed(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, WakeError> {
        serde_json::from_str(text).map_err(|e| WakeError::Malformed(e.to_string()))
    }
}

/// A host that can run a named task later and notify the application.
pub trait BackgroundHost: Send + Sync {
    /// Ask the host to run `task_name` when it sees fit.
    fn register(&self, task_name: &str) -> Result<(), WakeError>;

    /// Messages delivered to this application instance.
    fn subscribe(&self) -> broadcast::Receiver<HostMessage>;
}

/// In-process host: registered tasks are fired explicitly and fan out to
/// every subscribed instance.
pub struct WakeHub {
    sender: broadcast::Sender<HostMessage>,
    registered: Mutex<HashSet<String>>,
}

impl WakeHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            sender,
            registered: Mutex::new(HashSet::new()),
        })
    }

    pub fn is_registered(&self, task_name: &str) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task_name)
    }

    /// Run a registered task. Returns the number of instances notified,
    /// or 0 if the task was not registered.
    pub fn fire(&self, task_name: &str) -> usize {
        let was_registered = self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_name);
        if !was_registered {
            return 0;
        }
        if task_name != FLUSH_TASK_NAME {
            log::debug!("Background task {task_name} has no handler");
            return 0;
        }
        self.deliver(HostMessage::FlushQueue)
    }

    /// Broadcast a message to every subscribed instance.
    pub fn deliver(&self, message: HostMessage) -> usize {
        let delivered = self.sender.send(message).unwrap_or(0);
        log::debug!("Delivered {message:?} to {delivered} instances");
        delivered
    }

    /// Deliver a raw JSON message from an out-of-process host.
    pub fn deliver_raw(&self, frame: &str) -> Result<usize, WakeError> {
        Ok(self.deliver(HostMessage::decode(frame)?))
    }
}

impl BackgroundHost for WakeHub {
    fn register(&self, task_name: &str) -> Result<(), WakeError> {
        if task_name.trim().is_empty() {
            return Err(WakeError::Registration("empty task name".into()));
        }
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_name.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<HostMessage> {
        self.sender.subscribe()
    }
}

/// One application instance's view of the host.
pub struct BackgroundWakeBridge {
    host: Arc<dyn BackgroundHost>,
    inbox: broadcast::Receiver<HostMessage>,
}

impl BackgroundWakeBridge {
    pub fn new(host: Arc<dyn BackgroundHost>) -> Self {
        let inbox = host.subscribe();
        Self { host, inbox }
    }

    /// Register the flush task. Failure is logged; the periodic retry still
    /// drains the queue.
    pub fn request_wake(&self) -> bool {
        match self.host.register(FLUSH_TASK_NAME) {
            Ok(()) => {
                log::debug!("Registered background task {FLUSH_TASK_NAME}");
                true
            }
            Err(e) => {
                log::warn!("Could not register background flush: {e}");
                false
            }
        }
    }

    /// Next host message. `None` once the host is gone.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        match self.inbox.recv().await {
            Ok(message) => Some(message),
            // Every message asks for the same flush; missing some is harmless.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Wake bridge lagged by {skipped} host messages");
                Some(HostMessage::FlushQueue)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
