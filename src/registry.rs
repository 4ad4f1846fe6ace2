//! Registry of live server connections.
//!
//! The accept loop adds an entry per accepted connection, each session
//! removes its own entry when it ends, and `stop` drains the whole registry
//! to close whatever is still open. All three go through one mutex.
//!
//! Entries do not hold the sockets themselves. A session owns its
//! connection; the registry holds the sending half of a close signal, so a
//! drained entry asks the session to close rather than closing underneath
//! it.

use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Identifies one registered connection.
///
/// Slab keys are reused, so the serial distinguishes a later connection
/// that landed in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    key: usize,
    serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)
    }
}

/// Receiving half of a close signal; `true` requests a forced close.
pub type CloseSignal = oneshot::Receiver<bool>;

/// A drained registry entry.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    closer: oneshot::Sender<bool>,
}

impl ConnectionHandle {
    /// Ask the owning session to close its connection.
    ///
    /// Has no effect if the session already ended.
    pub fn close(self, forced: bool) {
        let _ = self.closer.send(forced);
    }
}

#[derive(Debug)]
struct Entry {
    serial: u64,
    peer: SocketAddr,
    closer: oneshot::Sender<bool>,
}

#[derive(Debug)]
struct Inner {
    connections: Slab<Entry>,
    accepting: bool,
    next_serial: u64,
}

/// Mutex-guarded set of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: Slab::new(),
                accepting: true,
                next_serial: 0,
            }),
        }
    }

    /// Register a connection and return its close signal.
    ///
    /// Returns `None` once [`remove_all`](Self::remove_all) has closed the
    /// registry; the caller must then close the connection itself.
    pub fn add(&self, peer: SocketAddr) -> Option<(ConnectionId, CloseSignal)> {
        let mut inner = self.lock();
        if !inner.accepting {
            return None;
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;

        let (closer, signal) = oneshot::channel();
        let key = inner.connections.insert(Entry {
            serial,
            peer,
            closer,
        });

        Some((ConnectionId { key, serial }, signal))
    }

    /// Deregister a connection. Returns `false` if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        match inner.connections.get(id.key) {
            Some(entry) if entry.serial == id.serial => {
                inner.connections.remove(id.key);
                true
            }
            _ => false,
        }
    }

    /// Close the registry to new entries and take every current entry.
    pub fn remove_all(&self) -> Vec<ConnectionHandle> {
        let mut inner = self.lock();
        inner.accepting = false;
        std::mem::take(&mut inner.connections)
            .into_iter()
            .map(|(key, entry)| ConnectionHandle {
                id: ConnectionId {
                    key,
                    serial: entry.serial,
                },
                peer: entry.peer,
                closer: entry.closer,
            })
            .collect()
    }

    /// Accept new entries again after a [`remove_all`](Self::remove_all).
    pub fn reopen(&self) {
        self.lock().accepting = true;
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
