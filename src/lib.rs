//! Single-room chat server library
//!
//! Clients connect over WebSocket (or plain line-based TCP), pick a
//! nickname, and chat with everyone else in the room.
//!
//! # Features
//! - Unique nicknames, checked and claimed atomically
//! - Fan-out of chat messages to everyone but the sender
//! - `@mention` extraction and banned-word masking
//! - HMAC session tokens to resume an identity after reconnecting
//! - Offline replay of recent messages and missed mentions
//! - Idle sessions are closed after a configurable timeout
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Broadcaster` is the single owner of the room registry
//! - Each connection runs a `ConnectionSession` with a reader loop and
//!   a writer task
//! - No locks needed - all registry access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//!
//! use tokio::net::TcpListener;
//! use chat_room::{Broadcaster, Config, MemoryOfflineStore, RoomGateway};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let offline = Box::new(MemoryOfflineStore::new(config.offline_num));
//!     let (broadcaster, handle) = Broadcaster::new(offline, config.message_queue);
//!     tokio::spawn(broadcaster.run());
//!
//!     let gateway = Arc::new(RoomGateway::new(&config, handle));
//!     let listener = TcpListener::bind(&config.listen).await.unwrap();
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let gateway = Arc::clone(&gateway);
//!         tokio::spawn(async move { gateway.serve_websocket(stream).await });
//!     }
//! }
//! ```

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod gateway;
pub mod message;
pub mod offline;
pub mod sensitive;
pub mod session;
pub mod token;
pub mod transport;
pub mod types;
pub mod user;

// Re-export main types for convenience
pub use broadcaster::{Broadcaster, BroadcasterHandle, Command};
pub use config::{Args, Config};
pub use error::{AppError, ConfigError, OfflineError, SendError};
pub use gateway::RoomGateway;
pub use message::{extract_mentions, ClientMessage, Message, MessageKind};
pub use offline::{MemoryOfflineStore, OfflineStore};
pub use sensitive::SensitiveFilter;
pub use session::ConnectionSession;
pub use token::TokenAuthority;
pub use transport::{Inbound, InboundHalf, OutboundHalf};
pub use types::{UserId, UserIdAllocator};
pub use user::{User, UserInfo};
