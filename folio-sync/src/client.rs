//! Snapshot delivery and session management.
//!
//! Provides:
//! - Immediate push when online, queueing when offline or on failure
//! - Ordered replay of the queue (`flush_queue`)
//! - Magic-link sign-in with a demo fallback when the endpoint is unreachable
//! - Sign-out
//!
//! At most one push (or flush) is in flight at any time; a second attempt
//! while one is running returns [`PushOutcome::Busy`] without side effects.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use crate::config::Settings;
use crate::error::{Error, Result, TransportError};
use crate::queue::{DurableWriteQueue, QueuedWrite};
use crate::status::{StatusEvent, StatusHandle};
use crate::store::SettingsStore;
use crate::transport::{Backend, PushRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

// ─── Identity ───────────────────────────────────────────────────────

/// How a session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// The magic-link endpoint accepted the request
    Authenticated,
    /// Local-only session; never pushes
    Demo,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Authenticated => "authenticated",
            IdentityKind::Demo => "demo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authenticated" => Some(IdentityKind::Authenticated),
            "demo" => Some(IdentityKind::Demo),
            _ => None,
        }
    }
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub kind: IdentityKind,
}

impl Identity {
    /// Authenticated identity; the user id is stable per email.
    pub fn authenticated(email: &str) -> Self {
        Self {
            user_id: Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{email}").as_bytes())
                .to_string(),
            email: email.to_string(),
            kind: IdentityKind::Authenticated,
        }
    }

    pub fn demo(email: &str) -> Self {
        Self {
            user_id: format!("demo-{}", Uuid::new_v4().simple()),
            email: email.to_string(),
            kind: IdentityKind::Demo,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.kind == IdentityKind::Authenticated
    }

    /// Local part of the email, used as a display name.
    pub fn display_name(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

/// Trim, lowercase and sanity-check an email address.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(Error::InvalidEmail(raw.to_string()))
    }
}

// ─── Outcomes ───────────────────────────────────────────────────────

/// What happened to one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote sync not configured; nothing to do
    Skipped,
    /// Another push is in flight
    Busy,
    Sent { at: DateTime<Utc> },
    /// Offline: queued without a network attempt
    Queued { write_id: u64 },
    /// The attempt failed; the payload was queued if `write_id` is set
    Failed {
        error: TransportError,
        write_id: Option<u64>,
    },
}

/// Result of replaying the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Flush did not run (offline, busy, or remote sync off)
    pub skipped: bool,
    pub sent: usize,
    /// Writes put back in the queue
    pub requeued: usize,
    pub error: Option<TransportError>,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the in-flight flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─── Client ─────────────────────────────────────────────────────────

/// Sends snapshots to the remote store and owns the session.
pub struct SyncClient {
    backend: Backend,
    queue: Arc<DurableWriteQueue>,
    status: StatusHandle,
    settings: Arc<dyn SettingsStore>,
    identity: RwLock<Option<Identity>>,
    last_synced_at: RwLock<Option<DateTime<Utc>>>,
    in_flight: AtomicBool,
    auth_timeout: Duration,
}

impl SyncClient {
    pub fn new(
        backend: Backend,
        queue: Arc<DurableWriteQueue>,
        status: StatusHandle,
        settings: Arc<dyn SettingsStore>,
        auth_timeout: Duration,
    ) -> Self {
        let persisted = Settings::load(settings.as_ref()).unwrap_or_else(|e| {
            log::warn!("Could not load persisted session ({e}), starting signed out");
            Settings::default()
        });

        Self {
            backend,
            queue,
            status,
            settings,
            identity: RwLock::new(persisted.identity),
            last_synced_at: RwLock::new(persisted.last_synced_at),
            in_flight: AtomicBool::new(false),
            auth_timeout,
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn queue(&self) -> &Arc<DurableWriteQueue> {
        &self.queue
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Real backend and an authenticated session.
    pub fn remote_enabled(&self) -> bool {
        self.backend.is_real()
            && self
                .identity()
                .is_some_and(|identity| identity.is_authenticated())
    }

    fn remote_identity(&self) -> Option<Identity> {
        if !self.backend.is_real() {
            return None;
        }
        self.identity().filter(Identity::is_authenticated)
    }

    fn set_identity(&self, identity: Option<Identity>) {
        if let Err(e) = Settings::save_identity(self.settings.as_ref(), identity.as_ref()) {
            log::warn!("Could not persist session identity: {e}");
        }
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    fn record_success(&self, at: DateTime<Utc>) {
        *self.last_synced_at.write().unwrap_or_else(|e| e.into_inner()) = Some(at);
        if let Err(e) = Settings::save_last_synced_at(self.settings.as_ref(), at) {
            log::warn!("Could not persist last sync time: {e}");
        }
    }

    async fn send(
        &self,
        identity: &Identity,
        payload: &[u8],
    ) -> std::result::Result<DateTime<Utc>, TransportError> {
        let transport = self.backend.transport().ok_or(TransportError::NotConfigured)?;
        let updated_at = Utc::now();
        let request = PushRequest::new(identity.user_id.as_str(), payload, updated_at);
        transport.push_project(&request).await?;
        Ok(updated_at)
    }

    fn log_push_failure(error: &TransportError) {
        match error {
            TransportError::Rejected { status } => {
                log::error!("Remote rejected snapshot (status {status}), queued for retry")
            }
            other => log::warn!("Snapshot push failed ({other}), queued for retry"),
        }
    }

    /// Queue a payload, logging rather than failing.
    fn enqueue(&self, payload: Vec<u8>) -> Option<u64> {
        match self.queue.enqueue(payload) {
            Ok(write) => Some(write.id),
            Err(e) => {
                log::error!("Could not queue snapshot: {e}");
                None
            }
        }
    }

    /// Deliver one snapshot, or queue it.
    pub async fn push_snapshot(&self, payload: Vec<u8>) -> PushOutcome {
        let Some(identity) = self.remote_identity() else {
            return PushOutcome::Skipped;
        };
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return PushOutcome::Busy;
        };

        if !self.status.is_online() {
            return match self.enqueue(payload) {
                Some(write_id) => {
                    log::info!("Offline, queued snapshot as write {write_id}");
                    PushOutcome::Queued { write_id }
                }
                None => PushOutcome::Failed {
                    error: TransportError::Unreachable("offline".into()),
                    write_id: None,
                },
            };
        }

        self.status.apply(StatusEvent::PushStarted);
        match self.send(&identity, &payload).await {
            Ok(at) => {
                self.record_success(at);
                self.status.apply(StatusEvent::PushSucceeded);
                PushOutcome::Sent { at }
            }
            Err(error) => {
                Self::log_push_failure(&error);
                let write_id = self.enqueue(payload);
                self.status.apply(StatusEvent::PushFailed);
                PushOutcome::Failed { error, write_id }
            }
        }
    }

    /// Replay queued writes in order.
    ///
    /// Stops at the first failure (or loss of connectivity) and puts the
    /// failed write and everything after it back in original order.
    pub async fn flush_queue(&self) -> FlushReport {
        let Some(identity) = self.remote_identity() else {
            return FlushReport::skipped();
        };
        if !self.status.is_online() {
            return FlushReport::skipped();
        }
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return FlushReport::skipped();
        };

        let writes = match self.queue.drain() {
            Ok(writes) => writes,
            Err(e) => {
                log::error!("Could not drain write queue: {e}");
                return FlushReport::default();
            }
        };
        if writes.is_empty() {
            return FlushReport::default();
        }

        let total = writes.len();
        self.status.apply(StatusEvent::PushStarted);

        let mut report = FlushReport::default();
        let mut pending = writes.into_iter();
        while let Some(write) = pending.next() {
            if !self.status.is_online() {
                report.requeued = self.requeue(write, pending);
                self.status.apply(StatusEvent::PushFailed);
                log::info!("Connectivity lost mid-flush, {} writes back in queue", report.requeued);
                return report;
            }

            match self.send(&identity, &write.payload).await {
                Ok(at) => {
                    report.sent += 1;
                    self.record_success(at);
                }
                Err(error) => {
                    Self::log_push_failure(&error);
                    report.requeued = self.requeue(write, pending);
                    report.error = Some(error);
                    self.status.apply(StatusEvent::PushFailed);
                    return report;
                }
            }
        }

        self.status.apply(StatusEvent::PushSucceeded);
        log::info!("Flushed {total} queued writes");
        report
    }

    fn requeue(&self, failed: QueuedWrite, rest: impl Iterator<Item = QueuedWrite>) -> usize {
        let remainder: Vec<QueuedWrite> = std::iter::once(failed).chain(rest).collect();
        let count = remainder.len();
        if let Err(e) = self.queue.requeue(remainder) {
            log::error!("Could not requeue {count} writes: {e}");
        }
        count
    }

    /// Start a session for `email`.
    ///
    /// Without a backend, or when the magic-link endpoint cannot be reached
    /// at all, a demo session starts and no error is returned. A slow or
    /// rejecting endpoint is an error and leaves the session unchanged.
    pub async fn request_authentication(&self, email: &str) -> Result<Identity> {
        let email = normalize_email(email)?;

        let identity = match self.backend.transport() {
            None => {
                log::info!("No remote backend, starting demo session for {email}");
                Identity::demo(&email)
            }
            Some(transport) => {
                let attempt =
                    tokio::time::timeout(self.auth_timeout, transport.request_magic_link(&email))
                        .await;
                match attempt {
                    Ok(Ok(())) => {
                        log::info!("Magic link requested for {email}");
                        Identity::authenticated(&email)
                    }
                    Ok(Err(TransportError::Unreachable(reason))) => {
                        log::warn!(
                            "Magic-link endpoint unreachable ({reason}), starting demo session for {email}"
                        );
                        Identity::demo(&email)
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(TransportError::Timeout.into()),
                }
            }
        };

        let remote = self.backend.is_real() && identity.is_authenticated();
        self.set_identity(Some(identity.clone()));
        self.status.apply(StatusEvent::RemoteEnabled(remote));
        Ok(identity)
    }

    /// End the session. Queued writes stay queued for the next sign-in.
    pub fn sign_out(&self) {
        if let Some(identity) = self.identity() {
            log::info!("Signing out {}", identity.email);
        }
        self.set_identity(None);
        self.status.apply(StatusEvent::RemoteEnabled(false));
    }
}
