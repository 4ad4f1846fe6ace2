//! Bundled message handlers.
//!
//! - `game`: the game session handler (authentication, game start, client
//!   state reporting, completion)
//! - `echo`: answers every message with itself; for ordering and
//!   throughput checks

pub mod echo;
pub mod game;

pub use echo::EchoHandler;
pub use game::{GameHandler, GameSession};
