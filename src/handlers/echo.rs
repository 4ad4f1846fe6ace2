//! Echo handler.
//!
//! Every request is written back unchanged, so a client observes its own
//! messages in the order the server processed them.

use std::net::SocketAddr;

use crate::envelope::MessageEnvelope;
use crate::handler::{HandlerResult, MessageHandler};

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    type Session = ();

    fn open_session(&self, _peer: SocketAddr) -> Self::Session {}

    fn process_message(&self, _session: &mut (), envelope: &MessageEnvelope) -> HandlerResult {
        Ok(vec![envelope.clone()])
    }
}
