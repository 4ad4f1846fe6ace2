//! game-server-manager: a message-oriented session server
//!
//! Clients exchange JSON envelopes with a server over TCP, one envelope per
//! line. The server core is protocol-agnostic: it accepts connections, runs
//! one session task per connection and hands every decoded message to a
//! pluggable [`MessageHandler`].
//!
//! Components:
//! - `envelope`: message kinds and the wire envelope
//! - `registry`: bookkeeping of live connections
//! - `session`: per-connection read / dispatch / respond loop
//! - `server`: listener, lifecycle and shutdown
//! - `client`: outbound connect / send / receive / close
//! - `handlers`: bundled handlers (game, echo)

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use client::ClientSession;
pub use config::Config;
pub use envelope::{MessageEnvelope, MessageKind, Payload};
pub use error::{Error, LifecycleError, Result};
pub use handler::{HandlerError, HandlerResult, MessageHandler};
pub use server::{LifecycleState, ManagedServer};
