//! Managed TCP server.
//!
//! Owns the listening socket, the connection registry and the lifecycle
//! state. Each accepted connection runs its own [`ServerSession`] task;
//! message semantics come from the [`MessageHandler`] supplied at
//! construction.
//!
//! ```text
//! Stopped --start()--> Starting --> Listening --stop()--> Stopping --> Stopped
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{LifecycleError, Result};
use crate::handler::MessageHandler;
use crate::registry::ConnectionRegistry;
use crate::session::{ServerSession, SessionEnd};
use crate::transport::{self, Connection};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long `stop()` waits for signalled sessions before aborting them.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// Running accept loop.
struct Listener {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<JoinSet<SessionEnd>>,
}

/// Everything the accept loop needs to admit a connection.
struct Acceptor<H: MessageHandler> {
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    shutting_down: Arc<AtomicBool>,
    max_frame_len: usize,
}

pub struct ManagedServer<H: MessageHandler> {
    config: Config,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    shutting_down: Arc<AtomicBool>,
    state: LifecycleState,
    listener: Option<Listener>,
}

impl<H: MessageHandler> ManagedServer<H> {
    pub fn new(config: Config, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            state: LifecycleState::Stopped,
            listener: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// Number of live sessions.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns as soon as the socket is listening, with the bound address.
    /// Fails with [`LifecycleError`] unless the server is stopped.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != LifecycleState::Stopped {
            return Err(LifecycleError::AlreadyStarted(self.state).into());
        }
        self.state = LifecycleState::Starting;

        let (listener, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.state = LifecycleState::Stopped;
                return Err(e.into());
            }
        };

        self.shutting_down.store(false, Ordering::Release);
        self.registry.reopen();

        let acceptor = Acceptor {
            handler: Arc::clone(&self.handler),
            registry: Arc::clone(&self.registry),
            shutting_down: Arc::clone(&self.shutting_down),
            max_frame_len: self.config.max_frame_len,
        };
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, acceptor, stop_rx));

        self.listener = Some(Listener {
            local_addr,
            stop,
            task,
        });
        self.state = LifecycleState::Listening;

        info!(address = %local_addr, "Server listening");
        Ok(local_addr)
    }

    /// Stop accepting and force-close every live connection.
    ///
    /// Each session closes its own socket and calls
    /// [`MessageHandler::close_session`]; `stop()` returns once every
    /// session task has finished. Sessions still running after
    /// `SESSION_CLOSE_GRACE` (e.g. stuck inside a handler call) are aborted.
    /// A no-op when already stopped.
    pub async fn stop(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        self.state = LifecycleState::Stopping;
        self.shutting_down.store(true, Ordering::Release);

        let mut sessions = None;
        if let Some(listener) = self.listener.take() {
            let _ = listener.stop.send(());
            match listener.task.await {
                Ok(running) => sessions = Some(running),
                Err(e) => warn!(error = %e, "Accept loop ended abnormally"),
            }
        }

        let connections = self.registry.remove_all();
        let count = connections.len();
        for handle in connections {
            debug!(peer = %handle.peer, connection = %handle.id, "Closing connection");
            handle.close(true);
        }

        if let Some(mut sessions) = sessions {
            join_sessions(&mut sessions).await;
        }

        self.state = LifecycleState::Stopped;
        info!(connections = count, "Server stopped");
    }

    async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let addr = transport::resolve(&self.config.host, self.config.port).await?;
        let backlog = i32::try_from(self.config.backlog).unwrap_or(i32::MAX);
        let listener = transport::bind_listener(addr, backlog)?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }
}

impl<H: MessageHandler> Drop for ManagedServer<H> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.shutting_down.store(true, Ordering::Release);
            // Dropping the accept loop's JoinSet aborts the sessions it owns.
            listener.task.abort();
            for handle in self.registry.remove_all() {
                handle.close(true);
            }
        }
    }
}

/// Wait for every session task, aborting the stragglers after the grace
/// period.
async fn join_sessions(sessions: &mut JoinSet<SessionEnd>) {
    let drained = tokio::time::timeout(SESSION_CLOSE_GRACE, async {
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Session task failed");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = sessions.len(), "Sessions still running after grace period, aborting");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

/// Accept until told to stop. Returns the session tasks that are still
/// running so the caller can wait for them.
async fn accept_loop<H: MessageHandler>(
    listener: TcpListener,
    acceptor: Acceptor<H>,
    mut stop: oneshot::Receiver<()>,
) -> JoinSet<SessionEnd> {
    let mut sessions = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            biased;

            _ = &mut stop => break,
            // Reap finished sessions so the set only holds live ones.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Some(session) = acceptor.admit(stream, peer).await {
                    sessions.spawn(session.run());
                }
            }
            Err(e) => {
                if acceptor.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!(sessions = sessions.len(), "Accept loop stopped");
    sessions
}

impl<H: MessageHandler> Acceptor<H> {
    /// Register an accepted connection and build its session.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Option<ServerSession<H>> {
        let mut connection = match Connection::new(stream, self.max_frame_len) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(%peer, error = %e, "Dropping connection");
                return None;
            }
        };

        let Some((id, close_signal)) = self.registry.add(peer) else {
            debug!(%peer, "Registry closed, rejecting connection");
            let _ = connection.close(true).await;
            return None;
        };

        debug!(%peer, connection = %id, "New connection");

        Some(ServerSession::new(
            connection,
            Arc::clone(&self.handler),
            Arc::clone(&self.registry),
            id,
            close_signal,
            Arc::clone(&self.shutting_down),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSession;
    use crate::envelope::{MessageEnvelope, MessageKind};
    use crate::error::Error;
    use crate::handler::HandlerResult;
    use crate::handlers::EchoHandler;
    use std::sync::atomic::AtomicUsize;

    /// Echoes requests and counts closed sessions.
    #[derive(Default)]
    struct CountingHandler {
        closed: Arc<AtomicUsize>,
    }

    impl MessageHandler for CountingHandler {
        type Session = ();

        fn open_session(&self, _peer: SocketAddr) {}

        fn process_message(&self, _: &mut (), envelope: &MessageEnvelope) -> HandlerResult {
            Ok(vec![envelope.clone()])
        }

        fn close_session(&self, _: ()) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = ManagedServer::new(test_config(), EchoHandler);
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_lifecycle_error() {
        let mut server = ManagedServer::new(test_config(), EchoHandler);
        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Listening);
        assert_eq!(server.local_addr(), Some(addr));

        match server.start().await {
            Err(Error::Lifecycle(LifecycleError::AlreadyStarted(LifecycleState::Listening))) => {}
            other => panic!("expected lifecycle error, got {other:?}"),
        }
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut server = ManagedServer::new(test_config(), EchoHandler);
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);

        server.start().await.unwrap();
        server.stop().await;
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut server = ManagedServer::new(test_config(), EchoHandler);
        server.start().await.unwrap();
        server.stop().await;

        server.start().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Listening);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let mut first = ManagedServer::new(test_config(), EchoHandler);
        let addr = first.start().await.unwrap();

        // Same port, already taken by a listening socket.
        let mut second = ManagedServer::new(
            Config {
                port: addr.port(),
                ..Config::default()
            },
            EchoHandler,
        );
        let err = second.start().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(second.state(), LifecycleState::Stopped);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_sessions_to_close() {
        let handler = CountingHandler::default();
        let closed = Arc::clone(&handler.closed);
        let mut server = ManagedServer::new(test_config(), handler);
        let addr = server.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = ClientSession::connect_with(
                "127.0.0.1",
                addr.port(),
                Duration::from_secs(5),
                1024,
            )
            .await
            .unwrap();
            let ping = MessageEnvelope::empty(MessageKind::GameStartRequest);
            assert_eq!(client.request(&ping).await.unwrap(), ping);
            clients.push(client);
        }
        assert_eq!(server.connection_count(), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        server.stop().await;

        // Every session has finished by the time stop() returns.
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert_eq!(server.connection_count(), 0);
        for mut client in clients {
            let read = tokio::time::timeout(Duration::from_secs(1), client.receive())
                .await
                .unwrap();
            assert!(read.is_err());
        }
    }
}
