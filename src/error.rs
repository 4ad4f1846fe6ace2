//! Error types shared across the server, sessions and client.

use crate::server::LifecycleState;
use std::io;

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wire data is not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Underlying I/O failure on an established connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Invalid server state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("server cannot be started from state {0:?}")]
    AlreadyStarted(LifecycleState),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for transport-level failures (including failed connects).
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Connection { .. })
    }
}
