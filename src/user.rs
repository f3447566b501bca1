//! User struct definition
//!
//! Represents a user admitted to the room with their identity and
//! the sending half of their outbound queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::Message;
use crate::types::UserId;

/// Receiving half of a user's outbound queue, drained by the session writer
pub type Outbox = mpsc::Receiver<Arc<Message>>;

/// Room member
///
/// Moved into the broadcaster on registration. The broadcaster is then
/// the only writer of the outbound queue, and dropping the `User` is
/// what closes it.
#[derive(Debug)]
pub struct User {
    /// Unique identifier, kept across reconnects via the token
    pub id: UserId,
    /// Nickname, unique among registered users
    pub nickname: String,
    /// Session token handed to the client in the welcome message
    pub token: String,
    /// Time the user was admitted
    pub join_time: DateTime<Utc>,
    /// Remote address, for logging
    pub addr: String,
    /// Whether the user came back with a valid token
    pub resumed: bool,
    /// Server → Client message queue
    sender: mpsc::Sender<Arc<Message>>,
}

impl User {
    /// Create a user together with the receiving end of its outbound queue
    pub fn new(
        id: UserId,
        nickname: String,
        token: String,
        addr: String,
        resumed: bool,
        queue_len: usize,
    ) -> (Self, Outbox) {
        let (sender, outbox) = mpsc::channel(queue_len);
        let user = Self {
            id,
            nickname,
            token,
            join_time: Utc::now(),
            addr,
            resumed,
            sender,
        };
        (user, outbox)
    }

    /// Public view of this user
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            nickname: self.nickname.clone(),
            join_time: self.join_time,
        }
    }

    /// Enqueue a message without waiting
    ///
    /// Fails with `QueueFull` when the user is not keeping up.
    pub fn deliver(&self, msg: Arc<Message>) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// Point-in-time public view of a user
///
/// What the user list exposes: never the token or the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: UserId,
    pub nickname: String,
    pub join_time: DateTime<Utc>,
}

impl UserInfo {
    /// The sender used for messages produced by the room itself
    pub fn system() -> Self {
        Self {
            id: UserId::SYSTEM,
            nickname: String::new(),
            join_time: DateTime::<Utc>::default(),
        }
    }
}
