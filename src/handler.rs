//! Pluggable message handling.
//!
//! A [`MessageHandler`] carries all domain logic. The server core only
//! reads envelopes, hands them to the handler and writes back whatever the
//! handler returns.

use crate::envelope::{MessageEnvelope, MessageKind};
use std::net::SocketAddr;

/// Failure while processing a single message.
///
/// Handler errors are isolated to the message that caused them; the session
/// keeps reading after logging one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("unsupported message kind '{0}'")]
    Unsupported(MessageKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

/// Outcome of one handler invocation: the responses to write, in order.
pub type HandlerResult = Result<Vec<MessageEnvelope>, HandlerError>;

/// Domain logic plugged into a [`ManagedServer`](crate::server::ManagedServer).
///
/// One handler instance is shared by every session. Anything that has to
/// be remembered between messages of one connection lives in
/// [`MessageHandler::Session`], which each session owns exclusively.
pub trait MessageHandler: Send + Sync + 'static {
    /// Per-connection state.
    type Session: Send + 'static;

    /// Create the state for a newly accepted connection.
    fn open_session(&self, peer: SocketAddr) -> Self::Session;

    /// Process one request.
    ///
    /// Returns zero or more responses; they are written to the connection
    /// in the order returned.
    fn process_message(
        &self,
        session: &mut Self::Session,
        envelope: &MessageEnvelope,
    ) -> HandlerResult;

    /// Called once when the session loop exits.
    fn close_session(&self, _session: Self::Session) {}
}
