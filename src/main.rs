//! game-server-manager: serve game sessions over TCP
//!
//! Starts a managed server with the configured handler and runs until
//! Ctrl-C. Configuration comes from CLI arguments and an optional TOML
//! file.

use game_server_manager::config::{Config, HandlerType};
use game_server_manager::handlers::{EchoHandler, GameHandler};
use game_server_manager::{ManagedServer, MessageHandler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        handler = ?config.handler,
        max_frame_len = config.max_frame_len,
        "Starting game-server-manager"
    );

    match config.handler {
        HandlerType::Game => serve(config, GameHandler).await,
        HandlerType::Echo => serve(config, EchoHandler).await,
    }
}

/// Run a server until Ctrl-C, then stop it.
async fn serve<H: MessageHandler>(
    config: Config,
    handler: H,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = ManagedServer::new(config, handler);
    server.start().await?;

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    server.stop().await;
    Ok(())
}
