//! Error types for the chat room
//!
//! Defines application-level errors, queue send errors and
//! offline store errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// admission errors (send error message to client, then close).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - broadcaster is gone)
    #[error("Channel send error")]
    ChannelSend,

    /// Nickname length outside 2..=20 characters
    #[error("Invalid nickname: {0}")]
    InvalidNickname(String),

    /// Another registered user already holds this nickname
    #[error("Nickname already taken: {0}")]
    NicknameTaken(String),

    /// Connection opened without a nickname
    #[error("Nickname required")]
    NicknameRequired,

    /// No inbound message within the idle window
    #[error("Idle timeout")]
    IdleTimeout,

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppError {
    /// Whether this error rejects an admission rather than breaking the connection
    ///
    /// Rejections are reported to the client before the connection closes.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AppError::InvalidNickname(_) | AppError::NicknameTaken(_) | AppError::NicknameRequired
        )
    }
}

/// Outbound queue errors
///
/// Occurs when enqueueing onto a user's outbound queue fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the queue has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The queue is at capacity
    #[error("Queue full")]
    QueueFull,
}

/// Offline store failures
///
/// Never fatal: the broadcaster logs them and carries on.
#[derive(Debug, Error)]
pub enum OfflineError {
    /// Backend refused or failed the operation
    #[error("Offline store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for our schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its allowed range
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
