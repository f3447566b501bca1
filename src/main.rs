//! Chat room server - Entry Point
//!
//! Loads the config, starts the Broadcaster actor and accepts
//! WebSocket (and optionally line-based TCP) connections.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_room::{Args, Broadcaster, Config, MemoryOfflineStore, RoomGateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_room=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_room=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args)?;

    // Create Broadcaster actor and start
    let offline = Box::new(MemoryOfflineStore::new(config.offline_num));
    let (broadcaster, handle) = Broadcaster::new(offline, config.message_queue);
    let room = tokio::spawn(broadcaster.run());

    let gateway = Arc::new(RoomGateway::new(&config, handle.clone()));

    // Start listeners
    let listener = TcpListener::bind(&config.listen).await?;
    info!("WebSocket chat room listening on {}", config.listen);

    if let Some(addr) = &config.tcp_listen {
        let tcp_listener = TcpListener::bind(addr).await?;
        info!("Line-based TCP chat room listening on {}", addr);
        tokio::spawn(accept_tcp(tcp_listener, Arc::clone(&gateway)));
    }

    tokio::select! {
        _ = accept_websocket(listener, Arc::clone(&gateway)) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        }
    }

    handle.shutdown().await;
    let _ = room.await;

    Ok(())
}

/// WebSocket accept loop
async fn accept_websocket(listener: TcpListener, gateway: Arc<RoomGateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let gateway = Arc::clone(&gateway);

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = gateway.serve_websocket(stream).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Line-based TCP accept loop
async fn accept_tcp(listener: TcpListener, gateway: Arc<RoomGateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New TCP connection from {}", addr);
                let gateway = Arc::clone(&gateway);

                tokio::spawn(async move {
                    if let Err(e) = gateway.serve_tcp(stream).await {
                        error!("TCP handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
            }
        }
    }
}
