//! Error types shared across the poll engine.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;

/// A transient network fault that survived every retry attempt, or a
/// request that could not be sent at all.
#[derive(Debug, thiserror::Error)]
#[error("request failed after {attempts} attempt(s): {source}")]
pub struct TransportError {
    pub attempts: u32,
    #[source]
    pub source: reqwest::Error,
}

/// Failures talking to the Discord REST API.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Discord rejected the credential ({status})")]
    Unauthorized { status: StatusCode },

    #[error("Discord rate limit persisted after {attempts} attempt(s), last retry-after {retry_after:?}")]
    RateLimited { attempts: u32, retry_after: Duration },

    #[error("Discord returned {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Unexpected response shape: {0}")]
    Malformed(String),
}

/// Durable write failures for channel logs, baselines and the channel config.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {path}: {reason}")]
    Serialize { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures answering an interactive `/lastmessage` query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("No monitored channel matches `{0}`")]
    UnknownTarget(String),

    #[error("Channel {0} has no messages yet")]
    EmptyChannel(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}
