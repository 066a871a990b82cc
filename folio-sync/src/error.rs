//! Error types for the sync engine.
//!
//! Each subsystem owns a narrow error enum; [`Error`] wraps them for the
//! public [`SyncEngine`](crate::engine::SyncEngine) surface. None of these are
//! fatal to the host application: callers degrade (queue, fall back to memory,
//! drop a frame) and keep running.

use thiserror::Error;

/// Result alias used across the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Local key-value store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    /// A column family was not created at open time
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    /// Record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Record on disk could not be decoded
    #[error("deserialization error: {0}")]
    Deserialization(String),
    /// LZ4 payload was corrupt
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Remote HTTP endpoint failures.
///
/// `Unreachable` means no connection could be made at all; every other
/// variant means the endpoint was reached but did not accept the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("remote endpoint timed out")]
    Timeout,
    #[error("remote endpoint rejected the request with status {status}")]
    Rejected { status: u16 },
    /// Connection was made but broke before a response arrived
    #[error("network error: {0}")]
    Network(String),
    #[error("request could not be encoded: {0}")]
    Encode(String),
    #[error("no remote backend configured")]
    NotConfigured,
}

impl TransportError {
    /// Whether the failure happened before any connection was made.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// Realtime presence channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("realtime connection failed: {0}")]
    Connect(String),
    #[error("realtime channel closed")]
    Closed,
    #[error("malformed presence message: {0}")]
    Malformed(String),
    #[error("not joined to a room")]
    NotJoined,
    #[error("invalid room token: {0:?}")]
    InvalidToken(String),
}

/// Host background-task facility failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WakeError {
    #[error("background task registration failed: {0}")]
    Registration(String),
    #[error("malformed host message: {0}")]
    Malformed(String),
}

/// Crate-level error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Wake(#[from] WakeError),
    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),
    #[error("sync engine has shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let e = TransportError::Rejected { status: 503 };
        assert_eq!(
            e.to_string(),
            "remote endpoint rejected the request with status 503"
        );
        assert!(!e.is_unreachable());
        assert!(TransportError::Unreachable("refused".into()).is_unreachable());
    }

    #[test]
    fn test_error_from_conversions() {
        let err: Error = StoreError::MissingColumnFamily("queue").into();
        assert_eq!(err.to_string(), "column family 'queue' not found");

        let err: Error = PresenceError::NotJoined.into();
        assert!(matches!(err, Error::Presence(PresenceError::NotJoined)));
    }
}
