//! Client side of the protocol.
//!
//! A `ClientSession` is one outbound connection. Calls are sequential from
//! the caller's point of view: `send` returns once the frame is written,
//! `receive` waits for the next complete message.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Config;
use crate::envelope::MessageEnvelope;
use crate::error::Result;
use crate::transport::{self, Connection};

#[derive(Debug)]
pub struct ClientSession {
    connection: Connection,
}

impl ClientSession {
    /// Connect using the timeout and frame limit from `config`.
    pub async fn connect(host: &str, port: u16, config: &Config) -> Result<Self> {
        Self::connect_with(host, port, config.connect_timeout, config.max_frame_len).await
    }

    pub async fn connect_with(
        host: &str,
        port: u16,
        timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Self> {
        let connection = transport::connect(host, port, timeout, max_frame_len).await?;
        debug!(peer = %connection.peer(), "Connected to server");
        Ok(Self { connection })
    }

    pub fn peer(&self) -> SocketAddr {
        self.connection.peer()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Serialize and write one envelope.
    ///
    /// Fails with `MalformedEnvelope` before writing anything if the payload
    /// is nested too deeply to encode.
    pub async fn send(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        self.connection.write_frame(&envelope.serialize()?).await?;
        trace!(peer = %self.connection.peer(), kind = %envelope.kind(), "Message sent");
        Ok(())
    }

    /// Wait for the next envelope.
    pub async fn receive(&mut self) -> Result<MessageEnvelope> {
        let frame = self.connection.read_frame().await?;
        let envelope = MessageEnvelope::parse_bytes(&frame)?;
        trace!(peer = %self.connection.peer(), kind = %envelope.kind(), "Message received");
        Ok(envelope)
    }

    /// Send a request and wait for the next message.
    pub async fn request(&mut self, envelope: &MessageEnvelope) -> Result<MessageEnvelope> {
        self.send(envelope).await?;
        self.receive().await
    }

    /// Release the connection. Closing twice is a no-op.
    ///
    /// `forced = false` flushes and shuts down cleanly; `forced = true`
    /// resets the connection immediately.
    pub async fn close(&mut self, forced: bool) -> Result<()> {
        if !self.connection.is_open() {
            return Ok(());
        }
        debug!(peer = %self.connection.peer(), forced, "Closing client session");
        self.connection.close(forced).await?;
        Ok(())
    }
}
