//! Engine configuration and the persisted settings surface.
//!
//! [`SyncConfig`] is built by the host at startup. [`Settings`] is the small
//! key/value record the engine persists in the local store (remote endpoint,
//! session identity, last successful sync, active room) and overlays onto the
//! configuration on the next start.

use crate::client::{Identity, IdentityKind};
use crate::error::StoreError;
use crate::store::{SettingsStore, StoreConfig};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

/// Quiet period after the last edit before an automatic push.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
/// Inactivity window after which typing becomes idle.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory of the RocksDB store (`None` keeps everything in memory)
    pub storage_path: Option<PathBuf>,
    /// Remote HTTP base URL, e.g. `https://folio.example.com`
    pub remote_base_url: Option<String>,
    /// Bearer token sent with snapshot pushes
    pub api_key: Option<String>,
    /// Realtime base URL; derived from `remote_base_url` when unset
    pub realtime_base_url: Option<String>,
    /// Debounce window for automatic pushes (default: 5s)
    pub debounce: Duration,
    /// Typing idle window for presence (default: 3s)
    pub typing_idle: Duration,
    /// Upper bound on a magic-link request (default: 10s)
    pub auth_timeout: Duration,
    /// Upper bound on a snapshot push (default: 30s)
    pub push_timeout: Duration,
    /// Connect timeout for HTTP requests and realtime handshakes (default: 5s)
    pub connect_timeout: Duration,
    /// Interval of the background queue retry while online (default: 30s)
    pub retry_interval: Duration,
    /// Capacity of the engine event channel (default: 256)
    pub event_capacity: usize,
    /// Capacity of realtime frame channels (default: 64)
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_path: Some(PathBuf::from("folio_data")),
            remote_base_url: None,
            api_key: None,
            realtime_base_url: None,
            debounce: DEFAULT_DEBOUNCE,
            typing_idle: DEFAULT_TYPING_IDLE,
            auth_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(30),
            event_capacity: 256,
            channel_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Create config for testing (in-memory storage, no remote, short timeouts).
    pub fn for_testing() -> Self {
        Self {
            storage_path: None,
            auth_timeout: Duration::from_secs(2),
            push_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Set the remote endpoint.
    pub fn with_remote(mut self, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        self.remote_base_url = Some(base_url.into());
        self.api_key = api_key;
        self
    }

    /// Fill unset endpoint fields from persisted settings.
    ///
    /// Explicit configuration wins over persisted values.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if self.remote_base_url.is_none() {
            self.remote_base_url = settings.remote_base_url.clone();
        }
        if self.api_key.is_none() {
            self.api_key = settings.api_key.clone();
        }
        self
    }

    /// RocksDB options for the configured path, if any.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.storage_path.clone().map(StoreConfig::new)
    }

    /// Base URL of the realtime channel (`ws://` / `wss://`).
    pub fn realtime_base(&self) -> Option<String> {
        if let Some(base) = &self.realtime_base_url {
            return Some(base.trim_end_matches('/').to_string());
        }
        let base = self.remote_base_url.as_deref()?.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Some(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Some(format!("ws://{rest}"))
        } else {
            Some(base.to_string())
        }
    }
}

// ─── Persisted settings ─────────────────────────────────────────────

const KEY_REMOTE_BASE_URL: &str = "remote.base_url";
const KEY_API_KEY: &str = "remote.api_key";
const KEY_USER_ID: &str = "session.user_id";
const KEY_EMAIL: &str = "session.email";
const KEY_IDENTITY_KIND: &str = "session.kind";
const KEY_LAST_SYNCED_AT: &str = "sync.last_synced_at";
const KEY_ROOM_TOKEN: &str = "presence.room_token";

/// Settings persisted in the local store between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub remote_base_url: Option<String>,
    pub api_key: Option<String>,
    pub identity: Option<Identity>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub room_token: Option<String>,
}

impl Settings {
    /// Load every persisted setting.
    ///
    /// An identity is only restored when all of its fields are present.
    pub fn load(store: &dyn SettingsStore) -> Result<Self, StoreError> {
        let identity = match (
            store.get_setting(KEY_USER_ID)?,
            store.get_setting(KEY_EMAIL)?,
            store.get_setting(KEY_IDENTITY_KIND)?,
        ) {
            (Some(user_id), Some(email), Some(kind)) => {
                IdentityKind::parse(&kind).map(|kind| Identity { user_id, email, kind })
            }
            _ => None,
        };

        let last_synced_at = store
            .get_setting(KEY_LAST_SYNCED_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(Self {
            remote_base_url: store.get_setting(KEY_REMOTE_BASE_URL)?,
            api_key: store.get_setting(KEY_API_KEY)?,
            identity,
            last_synced_at,
            room_token: store.get_setting(KEY_ROOM_TOKEN)?,
        })
    }

    /// Persist the remote endpoint used on the next start.
    pub fn save_remote(
        store: &dyn SettingsStore,
        base_url: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<(), StoreError> {
        store.put_setting(KEY_REMOTE_BASE_URL, base_url)?;
        store.put_setting(KEY_API_KEY, api_key)
    }

    /// Persist (or clear) the session identity.
    pub fn save_identity(
        store: &dyn SettingsStore,
        identity: Option<&Identity>,
    ) -> Result<(), StoreError> {
        store.put_setting(KEY_USER_ID, identity.map(|i| i.user_id.as_str()))?;
        store.put_setting(KEY_EMAIL, identity.map(|i| i.email.as_str()))?;
        store.put_setting(KEY_IDENTITY_KIND, identity.map(|i| i.kind.as_str()))
    }

    pub fn save_last_synced_at(
        store: &dyn SettingsStore,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        store.put_setting(KEY_LAST_SYNCED_AT, Some(&at.to_rfc3339()))
    }

    pub fn save_room_token(store: &dyn SettingsStore, token: Option<&str>) -> Result<(), StoreError> {
        store.put_setting(KEY_ROOM_TOKEN, token)
    }
}
