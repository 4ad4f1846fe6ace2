//! Per-connection read / dispatch / respond loop.
//!
//! A `ServerSession` owns one accepted connection for its whole life:
//!
//! 1. read one frame
//! 2. parse it into an envelope; a malformed frame ends the session
//! 3. hand it to the handler and write every returned response in order
//! 4. a handler error is logged and the loop goes back to 1
//!
//! A transport error ends the session. While the server is shutting down
//! such errors are expected and only logged at debug level.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::envelope::MessageEnvelope;
use crate::handler::MessageHandler;
use crate::registry::{CloseSignal, ConnectionId, ConnectionRegistry};
use crate::transport::Connection;

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection.
    Disconnected,
    /// The connection failed.
    TransportError,
    /// The peer sent a frame that is not a valid envelope.
    Malformed,
    /// The server asked the session to close.
    Shutdown,
}

/// Deregisters the connection however the session ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

pub struct ServerSession<H: MessageHandler> {
    connection: Connection,
    handler: Arc<H>,
    state: H::Session,
    close_signal: CloseSignal,
    shutting_down: Arc<AtomicBool>,
    registration: Registration,
}

impl<H: MessageHandler> ServerSession<H> {
    pub fn new(
        connection: Connection,
        handler: Arc<H>,
        registry: Arc<ConnectionRegistry>,
        id: ConnectionId,
        close_signal: CloseSignal,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let state = handler.open_session(connection.peer());
        Self {
            connection,
            handler,
            state,
            close_signal,
            shutting_down,
            registration: Registration { registry, id },
        }
    }

    /// Run until the connection ends, then close it.
    pub async fn run(mut self) -> SessionEnd {
        let peer = self.connection.peer();
        let id = self.registration.id;

        let (end, forced) = 'session: loop {
            let frame = tokio::select! {
                biased;

                signal = &mut self.close_signal => {
                    break 'session (SessionEnd::Shutdown, signal.unwrap_or(true));
                }
                frame = self.connection.read_frame() => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => break 'session self.transport_failure(&e),
            };

            let request = match MessageEnvelope::parse_bytes(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%peer, connection = %id, error = %e, "Malformed envelope, closing session");
                    break 'session (SessionEnd::Malformed, false);
                }
            };

            trace!(%peer, connection = %id, kind = %request.kind(), "Message received");

            let responses = match self.handler.process_message(&mut self.state, &request) {
                Ok(responses) => responses,
                Err(e) => {
                    warn!(%peer, connection = %id, kind = %request.kind(), error = %e, "Handler error");
                    continue;
                }
            };

            for response in responses {
                let frame = match response.serialize() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%peer, connection = %id, kind = %response.kind(), error = %e, "Unserializable response dropped");
                        continue;
                    }
                };
                let written = tokio::select! {
                    biased;

                    signal = &mut self.close_signal => {
                        break 'session (SessionEnd::Shutdown, signal.unwrap_or(true));
                    }
                    written = self.connection.write_frame(&frame) => written,
                };

                if let Err(e) = written {
                    break 'session self.transport_failure(&e);
                }
                trace!(%peer, connection = %id, kind = %response.kind(), "Response written");
            }
        };

        if let Err(e) = self.connection.close(forced).await {
            debug!(%peer, connection = %id, error = %e, "Error closing connection");
        }
        self.handler.close_session(self.state);

        debug!(%peer, connection = %id, ?end, "Session ended");
        end
    }

    /// Classify a read or write failure and pick how to close.
    fn transport_failure(&self, e: &io::Error) -> (SessionEnd, bool) {
        let peer = self.connection.peer();
        let id = self.registration.id;

        if self.shutting_down.load(Ordering::Acquire) {
            debug!(%peer, connection = %id, error = %e, "Transport error during shutdown");
            return (SessionEnd::Shutdown, true);
        }

        match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                trace!(%peer, connection = %id, "Connection closed by peer");
                (SessionEnd::Disconnected, false)
            }
            _ => {
                warn!(%peer, connection = %id, error = %e, "Transport error, closing session");
                (SessionEnd::TransportError, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{MessageKind, Payload, MAX_PAYLOAD_DEPTH};
    use crate::handler::{HandlerError, HandlerResult};
    use crate::handlers::EchoHandler;
    use crate::transport::{bind_listener, connect};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const MAX_FRAME: usize = 64 * 1024;

    /// Fails on `game_completed` requests, echoes everything else.
    struct PickyHandler;

    impl MessageHandler for PickyHandler {
        type Session = usize;

        fn open_session(&self, _peer: SocketAddr) -> usize {
            0
        }

        fn process_message(&self, seen: &mut usize, envelope: &MessageEnvelope) -> HandlerResult {
            *seen += 1;
            if envelope.kind() == MessageKind::GameCompleted {
                return Err(HandlerError::Failed(format!("rejected message {seen}")));
            }
            Ok(vec![envelope.clone()])
        }
    }

    /// Answers every request with an unencodable response, then an echo.
    struct TooDeepHandler;

    impl MessageHandler for TooDeepHandler {
        type Session = ();

        fn open_session(&self, _peer: SocketAddr) {}

        fn process_message(&self, _: &mut (), envelope: &MessageEnvelope) -> HandlerResult {
            let mut value = serde_json::Value::Null;
            for _ in 0..MAX_PAYLOAD_DEPTH {
                value = serde_json::json!({ "n": value });
            }
            let mut payload = Payload::new();
            payload.insert("n".to_string(), value);
            Ok(vec![
                MessageEnvelope::new(MessageKind::ClientStateInformation, Some(payload)),
                envelope.clone(),
            ])
        }
    }

    struct Harness {
        client: Connection,
        registry: Arc<ConnectionRegistry>,
        shutting_down: Arc<AtomicBool>,
        task: JoinHandle<SessionEnd>,
    }

    async fn spawn_session<H: MessageHandler>(handler: H) -> Harness {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = connect("127.0.0.1", port, Duration::from_secs(5), MAX_FRAME)
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let connection = Connection::new(stream, MAX_FRAME).unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (id, signal) = registry.add(connection.peer()).unwrap();

        let session = ServerSession::new(
            connection,
            Arc::new(handler),
            Arc::clone(&registry),
            id,
            signal,
            Arc::clone(&shutting_down),
        );
        let task = tokio::spawn(session.run());

        Harness {
            client,
            registry,
            shutting_down,
            task,
        }
    }

    async fn send(client: &mut Connection, envelope: &MessageEnvelope) {
        client
            .write_frame(&envelope.serialize().unwrap())
            .await
            .unwrap();
    }

    async fn recv(client: &mut Connection) -> MessageEnvelope {
        let frame = client.read_frame().await.unwrap();
        MessageEnvelope::parse_bytes(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_responses_in_order() {
        let mut h = spawn_session(EchoHandler).await;

        for kind in MessageKind::ALL {
            send(&mut h.client, &MessageEnvelope::empty(kind)).await;
        }
        for kind in MessageKind::ALL {
            assert_eq!(recv(&mut h.client).await.kind(), kind);
        }

        h.client.close(false).await.unwrap();
        assert_eq!(h.task.await.unwrap(), SessionEnd::Disconnected);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_session_alive() {
        let mut h = spawn_session(PickyHandler).await;

        send(&mut h.client, &MessageEnvelope::empty(MessageKind::GameCompleted)).await;
        send(&mut h.client, &MessageEnvelope::empty(MessageKind::GameStartRequest)).await;

        assert_eq!(
            recv(&mut h.client).await.kind(),
            MessageKind::GameStartRequest
        );
        assert_eq!(h.registry.len(), 1);

        h.client.close(false).await.unwrap();
        assert_eq!(h.task.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_unencodable_response_is_skipped() {
        let mut h = spawn_session(TooDeepHandler).await;

        for kind in [MessageKind::GameStartRequest, MessageKind::GameCompleted] {
            send(&mut h.client, &MessageEnvelope::empty(kind)).await;
            assert_eq!(recv(&mut h.client).await, MessageEnvelope::empty(kind));
        }
        assert_eq!(h.registry.len(), 1);

        h.client.close(false).await.unwrap();
        assert_eq!(h.task.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_session() {
        let mut h = spawn_session(EchoHandler).await;

        h.client
            .write_frame(r#"{"kind":"not_a_kind","payload":null}"#)
            .await
            .unwrap();

        assert_eq!(h.task.await.unwrap(), SessionEnd::Malformed);
        assert!(h.registry.is_empty());
        assert!(h.client.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_close_signal_ends_session() {
        let mut h = spawn_session(EchoHandler).await;

        h.shutting_down.store(true, Ordering::Release);
        for handle in h.registry.remove_all() {
            handle.close(true);
        }

        assert_eq!(h.task.await.unwrap(), SessionEnd::Shutdown);
        assert!(h.client.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_during_shutdown_is_suppressed() {
        let mut h = spawn_session(EchoHandler).await;

        h.shutting_down.store(true, Ordering::Release);
        h.client.close(true).await.unwrap();

        assert_eq!(h.task.await.unwrap(), SessionEnd::Shutdown);
    }
}
