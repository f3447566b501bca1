//! Message protocol definitions
//!
//! Inbound messages use Serde's tagged enum; outbound messages are a
//! single struct whose `type` field tells clients how to render it.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::user::UserInfo;

/// `@` followed by 2 to 20 characters that are neither whitespace nor `@`
static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@[^\s@]{2,20}").expect("mention pattern is valid"));

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Send a chat message to the room
    Chat {
        content: String,
        /// Unix time in nanoseconds, as a decimal string
        #[serde(default)]
        send_time: Option<String>,
    },
    /// Ask for the current member list
    UserList,
}

/// Kind of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Chat message from a user
    Normal,
    /// Greeting sent only to the user who just joined
    Welcome,
    /// Someone joined
    UserEnter,
    /// Someone left
    UserLeave,
    /// Something the user sent was rejected
    Error,
    /// Reply to a `user_list` request
    UserList,
}

/// Server → Client message
///
/// Shared between recipients behind an `Arc` once published.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Sender, or the system sender for room notices
    pub user: UserInfo,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Content, already passed through the sensitive filter
    pub content: String,
    /// Time the room accepted the message
    pub msg_time: DateTime<Utc>,
    /// Client-claimed send time, for latency diagnostics only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_send_time: Option<DateTime<Utc>>,
    /// `@mention` tokens found in the content
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ats: Vec<String>,
    /// Member snapshot, attached to membership notices and list replies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<UserInfo>>,
    /// Session token, only ever set on the welcome message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Message {
    fn new(user: UserInfo, kind: MessageKind, content: String) -> Self {
        Self {
            user,
            kind,
            content,
            msg_time: Utc::now(),
            client_send_time: None,
            ats: Vec::new(),
            users: None,
            token: None,
        }
    }

    /// Chat message from `sender`
    ///
    /// `content` must already be filtered. Mentions are extracted here.
    pub fn normal(sender: UserInfo, content: String, send_time: Option<&str>) -> Self {
        let ats = extract_mentions(&content);
        Self {
            client_send_time: send_time.and_then(parse_send_time),
            ats,
            ..Self::new(sender, MessageKind::Normal, content)
        }
    }

    /// Greeting for a newly registered user, carrying their token
    pub fn welcome(user: UserInfo, token: String) -> Self {
        let content = format!("{}, welcome to the room!", user.nickname);
        Self {
            token: Some(token),
            ..Self::new(user, MessageKind::Welcome, content)
        }
    }

    /// Notice that `user` joined
    pub fn user_enter(user: UserInfo, users: Vec<UserInfo>) -> Self {
        let content = format!("{} has entered the room", user.nickname);
        Self {
            users: Some(users),
            ..Self::new(user, MessageKind::UserEnter, content)
        }
    }

    /// Notice that `user` left
    pub fn user_leave(user: UserInfo, users: Vec<UserInfo>) -> Self {
        let content = format!("{} has left the room", user.nickname);
        Self {
            users: Some(users),
            ..Self::new(user, MessageKind::UserLeave, content)
        }
    }

    /// Error notice from the system
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(UserInfo::system(), MessageKind::Error, content.into())
    }

    /// Member list reply from the system
    pub fn user_list(users: Vec<UserInfo>) -> Self {
        let content = format!("{} online", users.len());
        Self {
            users: Some(users),
            ..Self::new(UserInfo::system(), MessageKind::UserList, content)
        }
    }

    /// Render as a single line of plain text for line-based transports
    pub fn render_line(&self) -> String {
        match self.kind {
            MessageKind::Normal => format!("{}: {}", self.user.nickname, self.content),
            MessageKind::Welcome => match &self.token {
                Some(token) => format!("{} (token: {})", self.content, token),
                None => self.content.clone(),
            },
            MessageKind::UserEnter | MessageKind::UserLeave => format!("* {}", self.content),
            MessageKind::Error => format!("! {}", self.content),
            MessageKind::UserList => {
                let names: Vec<&str> = self
                    .users
                    .iter()
                    .flatten()
                    .map(|u| u.nickname.as_str())
                    .collect();
                format!("* online: {}", names.join(", "))
            }
        }
    }
}

/// Find every `@mention` token in `content`, left to right, without overlap
pub fn extract_mentions(content: &str) -> Vec<String> {
    MENTION
        .find_iter(content)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Parse a decimal Unix-nanosecond timestamp
fn parse_send_time(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .map(DateTime::<Utc>::from_timestamp_nanos)
}
