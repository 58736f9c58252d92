use std::io;
use thiserror::Error;

/// Everything that can go wrong while supervising workers.
///
/// Only [`MuxError::Connect`] and [`MuxError::Channel`] end a run; the other
/// kinds are logged by the component that observes them and routing goes on.
#[derive(Error, Debug)]
pub enum MuxError {
    /// The outward channel could not be established.
    #[error("could not connect to `{endpoint}`: {reason}")]
    Connect { endpoint: String, reason: String },

    /// A worker executable could not be launched.
    #[error("could not spawn worker `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A worker closed its stdout or stderr.
    #[error("{stream} of worker `{name}` closed")]
    StreamClosed { name: String, stream: &'static str },

    /// A line or frame was not a JSON object.
    #[error("malformed message from {origin}: {reason}")]
    MalformedMessage { origin: String, reason: String },

    /// A message could not be queued for, or written to, a worker's stdin.
    #[error("could not deliver to worker `{name}`: {source}")]
    Delivery {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The outward channel failed after it was established.
    #[error("outward channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for MuxError {
    fn from(err: serde_json::Error) -> MuxError {
        MuxError::MalformedMessage {
            origin: "serializer".to_string(),
            reason: err.to_string(),
        }
    }
}
