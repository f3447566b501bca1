//! Broadcaster actor implementation
//!
//! The single owner of the room registry. Every membership change,
//! every fan-out and every read of the member list goes through its
//! control loop, so the registry needs no locks.
//!
//! Two channels feed the loop: a command channel for membership and
//! queries, and a bounded message buffer for chat traffic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{AppError, SendError};
use crate::message::Message;
use crate::offline::OfflineStore;
use crate::types::UserId;
use crate::user::{User, UserInfo};

/// Channel buffer size for broadcaster commands
const COMMAND_BUFFER_SIZE: usize = 256;

/// Commands sent from sessions and the gateway to the Broadcaster actor
#[derive(Debug)]
pub enum Command {
    /// Is this nickname free right now
    CheckNickname {
        nickname: String,
        reply: oneshot::Sender<bool>,
    },
    /// Insert without checking; a duplicate nickname is a bug
    Register {
        user: User,
        reply: oneshot::Sender<()>,
    },
    /// Insert only if the nickname is free
    RegisterIfAvailable {
        user: User,
        reply: oneshot::Sender<bool>,
    },
    /// Remove a registered user and close its queue
    Unregister {
        id: UserId,
        nickname: String,
        reply: oneshot::Sender<()>,
    },
    /// Deliver a message to one registered user only
    Notify {
        id: UserId,
        nickname: String,
        message: Message,
    },
    /// Send the member list to one registered user
    SendUserList { id: UserId, nickname: String },
    /// Copy of the member list
    Snapshot {
        reply: oneshot::Sender<Vec<UserInfo>>,
    },
    /// Drop every user and stop the loop
    Shutdown,
}

/// Cloneable client side of the Broadcaster
///
/// Every method is a request to the control loop; the ones that return
/// a value wait for the loop to service them.
#[derive(Debug, Clone)]
pub struct BroadcasterHandle {
    commands: mpsc::Sender<Command>,
    messages: mpsc::Sender<Message>,
}

impl BroadcasterHandle {
    /// True iff no registered user holds `nickname`
    ///
    /// The answer may be stale by the time it is used; prefer
    /// `register_if_available`.
    pub async fn check_nickname_available(&self, nickname: &str) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CheckNickname {
            nickname: nickname.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Register `user` without checking its nickname
    ///
    /// The caller must have made sure the nickname is free.
    pub async fn register(&self, user: User) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Register { user, reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Check the nickname and register in one step
    ///
    /// Fails with `NicknameTaken` if another user holds the nickname;
    /// the rejected user is dropped, closing its queue.
    pub async fn register_if_available(&self, user: User) -> Result<(), AppError> {
        let nickname = user.nickname.clone();
        let (reply, rx) = oneshot::channel();
        self.command(Command::RegisterIfAvailable { user, reply })
            .await?;
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AppError::NicknameTaken(nickname)),
            Err(_) => Err(AppError::ChannelSend),
        }
    }

    /// Remove a registered user, closing its outbound queue
    pub async fn unregister(&self, id: UserId, nickname: &str) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Unregister {
            id,
            nickname: nickname.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Hand a message to the room for fan-out
    ///
    /// Waits only while the pending-message buffer is full.
    pub async fn publish(&self, message: Message) -> Result<(), AppError> {
        if self.messages.capacity() == 0 {
            warn!(
                "Broadcast queue is full ({} pending)",
                self.queued_messages()
            );
        }
        self.messages
            .send(message)
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// Deliver `message` to a single registered user
    pub async fn notify(&self, id: UserId, nickname: &str, message: Message) -> Result<(), AppError> {
        self.command(Command::Notify {
            id,
            nickname: nickname.to_string(),
            message,
        })
        .await
    }

    /// Ask the loop to send the member list to a registered user
    pub async fn request_user_list(&self, id: UserId, nickname: &str) -> Result<(), AppError> {
        self.command(Command::SendUserList {
            id,
            nickname: nickname.to_string(),
        })
        .await
    }

    /// Point-in-time copy of all registered users, ordered by id
    pub async fn snapshot_users(&self) -> Result<Vec<UserInfo>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Stop the room: every queue is closed and the loop exits
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Messages waiting in the broadcast buffer
    pub fn queued_messages(&self) -> usize {
        self.messages.max_capacity() - self.messages.capacity()
    }

    async fn command(&self, cmd: Command) -> Result<(), AppError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelSend)
    }
}

/// The Broadcaster actor
///
/// Owns the registry (nickname → User) and the offline store. Runs
/// until shut down or until every handle is dropped.
pub struct Broadcaster {
    /// Registered users: nickname -> User
    users: HashMap<String, User>,
    /// Offline replay collaborator
    offline: Box<dyn OfflineStore>,
    /// Command receiver channel
    commands: mpsc::Receiver<Command>,
    /// Pending chat messages
    messages: mpsc::Receiver<Message>,
}

impl Broadcaster {
    /// Create the actor and its handle
    ///
    /// `message_queue` bounds the pending-message buffer.
    pub fn new(offline: Box<dyn OfflineStore>, message_queue: usize) -> (Self, BroadcasterHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (msg_tx, msg_rx) = mpsc::channel(message_queue);

        let broadcaster = Self {
            users: HashMap::new(),
            offline,
            commands: cmd_rx,
            messages: msg_rx,
        };
        let handle = BroadcasterHandle {
            commands: cmd_tx,
            messages: msg_tx,
        };
        (broadcaster, handle)
    }

    /// Run the control loop
    ///
    /// Services one request at a time until shutdown or until all
    /// handles are dropped.
    pub async fn run(mut self) {
        info!("Broadcaster started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(message) = self.messages.recv() => self.handle_publish(message),
            }
        }

        // Dropping the users closes every outbound queue
        let remaining = self.users.len();
        self.users.clear();
        info!("Broadcaster shutting down, {} users dropped", remaining);
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CheckNickname { nickname, reply } => {
                let _ = reply.send(!self.users.contains_key(&nickname));
            }
            Command::Register { user, reply } => {
                if let Some(existing) = self.users.get(&user.nickname) {
                    panic!(
                        "nickname {:?} registered twice (users {} and {})",
                        user.nickname, existing.id, user.id
                    );
                }
                self.handle_register(user);
                let _ = reply.send(());
            }
            Command::RegisterIfAvailable { user, reply } => {
                if self.users.contains_key(&user.nickname) {
                    debug!("Nickname {} already taken", user.nickname);
                    let _ = reply.send(false);
                } else {
                    self.handle_register(user);
                    let _ = reply.send(true);
                }
            }
            Command::Unregister {
                id,
                nickname,
                reply,
            } => {
                self.handle_unregister(id, &nickname);
                let _ = reply.send(());
            }
            Command::Notify {
                id,
                nickname,
                message,
            } => {
                self.deliver_to(id, &nickname, Arc::new(message));
            }
            Command::SendUserList { id, nickname } => {
                let list = Arc::new(Message::user_list(self.snapshot()));
                self.deliver_to(id, &nickname, list);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the loop itself
            Command::Shutdown => {}
        }
    }

    /// Insert a user whose nickname is known to be free
    ///
    /// The newcomer gets a welcome and the offline replay before any
    /// fan-out can reach it; everyone else gets an enter notice.
    fn handle_register(&mut self, user: User) {
        let info = user.info();
        info!(
            "User {} ({}) entered from {}{}",
            info.nickname,
            info.id,
            user.addr,
            if user.resumed { ", resumed" } else { "" }
        );

        let welcome = Message::welcome(info.clone(), user.token.clone());
        Self::deliver(&user, Arc::new(welcome));

        match self.offline.replay(&info, user.resumed) {
            Ok(replay) => {
                debug!("Replaying {} messages to {}", replay.len(), info.nickname);
                for message in replay {
                    Self::deliver(&user, message);
                }
            }
            Err(e) => warn!("Offline replay for {} failed: {}", info.nickname, e),
        }

        self.users.insert(info.nickname.clone(), user);

        let notice = Arc::new(Message::user_enter(info.clone(), self.snapshot()));
        self.fan_out(&notice, info.id);

        debug!("Total users: {}", self.users.len());
    }

    /// Remove a user and close its queue
    fn handle_unregister(&mut self, id: UserId, nickname: &str) {
        let user = match self.users.remove(nickname) {
            Some(user) if user.id == id => user,
            other => panic!(
                "unregister of {:?} ({}) which is not registered (found {:?})",
                nickname,
                id,
                other.map(|u| u.id)
            ),
        };

        let info = user.info();
        drop(user);
        info!("User {} ({}) left", info.nickname, info.id);

        let notice = Arc::new(Message::user_leave(info, self.snapshot()));
        self.fan_out(&notice, id);

        debug!("Total users: {}", self.users.len());
    }

    /// Stamp, fan out and store a chat message
    fn handle_publish(&mut self, mut message: Message) {
        message.msg_time = Utc::now();
        let message = Arc::new(message);
        self.fan_out(&message, message.user.id);

        if let Err(e) = self.offline.save(&message) {
            warn!("Offline save failed: {}", e);
        }
    }

    /// Deliver to every registered user except `except`
    fn fan_out(&self, message: &Arc<Message>, except: UserId) {
        for user in self.users.values() {
            if user.id == except {
                continue;
            }
            Self::deliver(user, Arc::clone(message));
        }
    }

    fn deliver_to(&self, id: UserId, nickname: &str, message: Arc<Message>) {
        match self.users.get(nickname) {
            Some(user) if user.id == id => Self::deliver(user, message),
            _ => debug!("Dropping direct message for departed user {}", nickname),
        }
    }

    /// Enqueue without blocking the loop; a full queue drops the message
    fn deliver(user: &User, message: Arc<Message>) {
        match user.deliver(message) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                warn!(
                    "Outbound queue of {} ({}) is full, message dropped",
                    user.nickname, user.id
                );
            }
            Err(SendError::ChannelClosed) => {
                debug!("Outbound queue of {} ({}) is closed", user.nickname, user.id);
            }
        }
    }

    fn snapshot(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self.users.values().map(User::info).collect();
        users.sort_by_key(|u| u.id);
        users
    }
}
