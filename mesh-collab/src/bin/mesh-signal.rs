//! Standalone signaling server.
//!
//! Usage: `mesh-signal [ADDR]`, or set `MESH_SIGNAL_ADDR`. Defaults to
//! `127.0.0.1:4444`. Log verbosity follows `RUST_LOG`.

use std::sync::Arc;

use mesh_collab::{ServerConfig, SignalingServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1).or_else(|| std::env::var("MESH_SIGNAL_ADDR").ok()) {
        config.bind_addr = addr;
    }

    log::info!("Starting signaling server on {}...", config.bind_addr);
    Arc::new(SignalingServer::new(config)).run().await
}
