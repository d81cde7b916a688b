//! Error taxonomy for the ingestion and alerting path.
//!
//! Every catch site maps to exactly one of these kinds. Only [`ConfigError`]
//! is fatal, and only at startup; everything else is logged and the
//! pipeline keeps going.

use std::path::PathBuf;
use std::time::Duration;

/// Record codec failures (CSV rows on the producer side, payloads on the consumer side).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Field count differs from the header.
    #[error("malformed row: expected {expected} fields, found {found}: {line:?}")]
    MalformedRow {
        expected: usize,
        found: usize,
        line: String,
    },

    #[error("malformed row: empty line")]
    EmptyRow,

    /// Inbound payload is not a key-value object.
    #[error("decode error: {reason}")]
    Decode { reason: String },
}

/// Broker connection failures. These drive the backoff state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker network error: {0}")]
    Network(String),

    /// The request channel to the network loop is gone (session closed).
    #[error("broker connection closed")]
    Closed,
}

/// A reading could not be handed to the broker. Non-fatal: the reading is dropped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to broker, dropping publish on '{topic}'")]
    NotConnected { topic: String },

    #[error("publish on '{topic}' timed out after {after:?}")]
    Timeout { topic: String, after: Duration },

    #[error("publish on '{topic}' failed: {reason}")]
    Client { topic: String, reason: String },

    #[error("failed to encode reading: {0}")]
    Encode(String),
}

/// Tail watcher failures for a single modification event.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Partial line, locked file, invalid UTF-8 mid-write. Self-heals on the next event.
    #[error("read race on {path}: {reason}")]
    ReadRace { path: PathBuf, reason: String },

    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Alert sink delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("alert file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("alert forward on '{topic}' failed: {reason}")]
    Forward { topic: String, reason: String },
}

/// Startup configuration failures. These abort the process before any loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config error: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
