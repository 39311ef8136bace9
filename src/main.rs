//! Headball Game Server
//!
//! Authoritative match server binary: accepts WebSocket connections,
//! matches players, simulates rooms at 60 Hz, persists results.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use headball::network::server::{GameServer, ServerConfig};
use headball::persist::{MemoryDatabase, PersistConfig, SessionStore};
use headball::{TICK_RATE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("headball server v{}", VERSION);
    info!("tick rate: {} Hz", TICK_RATE);

    let config = ServerConfig::from_env();
    info!("binding {}", config.bind_addr);
    if !config.auth.is_configured() {
        info!("no auth keys configured, running in guest mode");
    }

    // The relational database lives behind the persistence adapter; with no
    // external backend configured, results stay in process memory.
    let store = SessionStore::spawn(MemoryDatabase::default(), PersistConfig::default());
    let server = GameServer::new(config, store.clone());

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown_server.shutdown();
        }
    });

    server.run().await.context("server terminated")?;

    // Best-effort flush of pending persistence work
    store.flush().await;
    info!("goodbye");
    Ok(())
}
