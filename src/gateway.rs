//! Room gateway
//!
//! Admits new connections: reads the nickname and optional token,
//! resolves the user's identity, registers the user with the
//! broadcaster and hands the connection to a `ConnectionSession`.
//!
//! The WebSocket listener also answers a plain `GET /user_list` with
//! the current members as JSON.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info};

use crate::broadcaster::BroadcasterHandle;
use crate::config::Config;
use crate::error::AppError;
use crate::message::Message;
use crate::sensitive::SensitiveFilter;
use crate::session::ConnectionSession;
use crate::token::TokenAuthority;
use crate::transport::{LineInbound, LineOutbound, OutboundHalf, WsInbound, WsOutbound};
use crate::types::UserIdAllocator;
use crate::user::User;

/// Allowed nickname length, in characters
const NICKNAME_LEN: std::ops::RangeInclusive<usize> = 2..=20;

/// Request line prefix of the member list endpoint
const USER_LIST_REQUEST: &[u8] = b"GET /user_list";

/// Accepts connections and wires them to the broadcaster
#[derive(Debug)]
pub struct RoomGateway {
    broadcaster: BroadcasterHandle,
    tokens: TokenAuthority,
    filter: Arc<SensitiveFilter>,
    ids: UserIdAllocator,
    outbound_queue: usize,
    idle_timeout: Duration,
}

impl RoomGateway {
    pub fn new(config: &Config, broadcaster: BroadcasterHandle) -> Self {
        Self {
            broadcaster,
            tokens: config.token_authority(),
            filter: Arc::new(config.sensitive_filter()),
            ids: UserIdAllocator::new(),
            outbound_queue: config.outbound_queue,
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Admit a user into the room
    ///
    /// A valid `token` resumes the identity it was issued for; anything
    /// else gets a fresh id and token. Registration checks the nickname
    /// atomically, so a collision surfaces as `NicknameTaken`.
    pub async fn admit(
        &self,
        nickname: &str,
        token: Option<&str>,
        addr: &str,
    ) -> Result<ConnectionSession, AppError> {
        validate_nickname(nickname)?;

        let resumed = token.and_then(|t| self.tokens.validate(t, nickname).map(|id| (id, t)));
        let (id, token, resumed) = match resumed {
            Some((id, token)) => {
                self.ids.observe(id);
                (id, token.to_string(), true)
            }
            None => {
                if token.is_some() {
                    debug!("Invalid token from {}, treating {} as new", addr, nickname);
                }
                let id = self.ids.next();
                (id, self.tokens.issue(id, nickname), false)
            }
        };

        let (user, outbox) = User::new(
            id,
            nickname.to_string(),
            token,
            addr.to_string(),
            resumed,
            self.outbound_queue,
        );
        let info = user.info();
        self.broadcaster.register_if_available(user).await?;

        Ok(ConnectionSession::new(
            info,
            outbox,
            self.broadcaster.clone(),
            Arc::clone(&self.filter),
            self.idle_timeout,
        ))
    }

    /// Serve one WebSocket connection
    ///
    /// The nickname and token come from the upgrade request's query
    /// string, e.g. `/ws?nickname=alice&token=...`.
    pub async fn serve_websocket(&self, stream: TcpStream) -> Result<(), AppError> {
        let peer_addr = peer_addr(&stream);
        if self.requests_user_list(&stream).await {
            return self.serve_user_list(stream, &peer_addr).await;
        }
        debug!("New WebSocket connection from {}", peer_addr);

        let mut query = None;
        let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        };

        // WebSocket handshake
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_query).await?;
        let (sink, stream) = ws_stream.split();
        let mut outbound = WsOutbound::new(sink);

        let params = parse_query(query.as_deref().unwrap_or_default());
        let nickname = params.get("nickname").map(String::as_str).unwrap_or_default();
        let token = params
            .get("token")
            .map(String::as_str)
            .filter(|t| !t.is_empty());

        match self.admit(nickname, token, &peer_addr).await {
            Ok(session) => session.run(WsInbound::new(stream), outbound).await,
            Err(e) if e.is_rejection() => reject(&mut outbound, e, &peer_addr).await,
            Err(e) => Err(e),
        }
    }

    /// Whether the pending request is `GET /user_list` rather than an upgrade
    ///
    /// Only peeks, so a WebSocket handshake still sees the whole request.
    async fn requests_user_list(&self, stream: &TcpStream) -> bool {
        let mut head = [0u8; USER_LIST_REQUEST.len() + 1];
        match timeout(self.idle_timeout, stream.peek(&mut head)).await {
            Ok(Ok(n)) if n == head.len() => {
                head.starts_with(USER_LIST_REQUEST)
                    && matches!(head[USER_LIST_REQUEST.len()], b' ' | b'?')
            }
            _ => false,
        }
    }

    /// Answer `GET /user_list` with a JSON array of members, ordered by id
    async fn serve_user_list(&self, stream: TcpStream, peer_addr: &str) -> Result<(), AppError> {
        let (read, mut write) = stream.into_split();

        // Skip the request head
        let mut lines = BufReader::new(read).lines();
        let head = async {
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        };
        match timeout(self.idle_timeout, head).await {
            Ok(result) => result?,
            Err(_) => return Err(AppError::IdleTimeout),
        }

        let users = self.broadcaster.snapshot_users().await?;
        let body = serde_json::to_vec(&users)?;
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        write.write_all(header.as_bytes()).await?;
        write.write_all(&body).await?;
        write.shutdown().await?;

        debug!("Served user list ({} users) to {}", users.len(), peer_addr);
        Ok(())
    }

    /// Serve one line-based TCP connection
    ///
    /// The first line is `nickname` or `nickname token`; every line
    /// after that is a chat message.
    pub async fn serve_tcp(&self, stream: TcpStream) -> Result<(), AppError> {
        let peer_addr = peer_addr(&stream);
        debug!("New TCP connection from {}", peer_addr);

        let (read, write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut outbound = LineOutbound::new(write);

        outbound.write_line("Enter your nickname:").await?;
        let first = match timeout(self.idle_timeout, lines.next_line()).await {
            Ok(line) => line?.unwrap_or_default(),
            Err(_) => return Err(AppError::IdleTimeout),
        };

        let mut parts = first.split_whitespace();
        let nickname = parts.next().unwrap_or_default();
        let token = parts.next();

        match self.admit(nickname, token, &peer_addr).await {
            Ok(session) => session.run(LineInbound::from_lines(lines), outbound).await,
            Err(e) if e.is_rejection() => reject(&mut outbound, e, &peer_addr).await,
            Err(e) => Err(e),
        }
    }
}

/// Check the nickname length
pub fn validate_nickname(nickname: &str) -> Result<(), AppError> {
    if nickname.is_empty() {
        return Err(AppError::NicknameRequired);
    }
    if !NICKNAME_LEN.contains(&nickname.chars().count()) {
        return Err(AppError::InvalidNickname(format!(
            "{nickname:?} must be {} to {} characters",
            NICKNAME_LEN.start(),
            NICKNAME_LEN.end()
        )));
    }
    Ok(())
}

/// Tell the client why it was turned away, then close
async fn reject<O: OutboundHalf>(outbound: &mut O, err: AppError, peer_addr: &str) -> Result<(), AppError> {
    info!("Rejected connection from {}: {}", peer_addr, err);
    outbound.send(&Message::error(err.to_string())).await?;
    outbound.close().await;
    Ok(())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn peer_addr(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
