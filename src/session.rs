//! Connection session
//!
//! One registered user's live connection: a writer task draining the
//! user's outbound queue to the transport, and a reader loop feeding
//! inbound messages to the broadcaster.
//!
//! Whatever ends the session, the user is unregistered exactly once,
//! which closes the queue and lets the writer finish. That includes a
//! session dropped before it ever ran.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broadcaster::BroadcasterHandle;
use crate::error::AppError;
use crate::message::{ClientMessage, Message};
use crate::sensitive::SensitiveFilter;
use crate::transport::{Inbound, InboundHalf, OutboundHalf};
use crate::types::UserId;
use crate::user::{Outbox, UserInfo};

/// How long the writer may keep flushing after the queue closes
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered user bound to one transport connection
#[derive(Debug)]
pub struct ConnectionSession {
    user: UserInfo,
    outbox: Outbox,
    broadcaster: BroadcasterHandle,
    filter: Arc<SensitiveFilter>,
    idle_timeout: Duration,
    departure: Departure,
}

impl ConnectionSession {
    /// Bind an already registered user to its outbound queue
    ///
    /// From here on the session owns the registration: dropping it,
    /// run or not, unregisters the user.
    pub fn new(
        user: UserInfo,
        outbox: Outbox,
        broadcaster: BroadcasterHandle,
        filter: Arc<SensitiveFilter>,
        idle_timeout: Duration,
    ) -> Self {
        let departure = Departure::new(broadcaster.clone(), &user);
        Self {
            user,
            outbox,
            broadcaster,
            filter,
            idle_timeout,
            departure,
        }
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Run the session until the connection ends
    ///
    /// Returns `Ok` on a normal close or room shutdown, and the
    /// transport error (read or write side) or `IdleTimeout` otherwise.
    pub async fn run<I, O>(self, inbound: I, outbound: O) -> Result<(), AppError>
    where
        I: InboundHalf,
        O: OutboundHalf + 'static,
    {
        let Self {
            user,
            outbox,
            broadcaster,
            filter,
            idle_timeout,
            departure,
        } = self;

        // Spawn write task (outbound queue -> transport)
        let mut write_task = tokio::spawn(write_loop(outbox, outbound, user.id));

        let reader = read_loop(&user, inbound, &broadcaster, &filter, idle_timeout);

        // Wait for either side to finish
        let (result, writer_done) = tokio::select! {
            result = reader => (result, false),
            finished = &mut write_task => {
                debug!("Write task completed first for {}", user.id);
                let result = match finished {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Write task for {} failed: {}", user.id, e);
                        Ok(())
                    }
                };
                (result, true)
            }
        };

        departure.leave().await;

        // The queue is closed now; let the writer flush what is left
        if !writer_done {
            match timeout(WRITER_DRAIN_TIMEOUT, &mut write_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!("Write task for {} ended early: {}", user.id, e),
                Ok(Err(e)) => error!("Write task for {} failed: {}", user.id, e),
                Err(_) => {
                    warn!("Write task for {} did not drain in time", user.id);
                    write_task.abort();
                }
            }
        }

        match &result {
            Ok(()) => info!("User {} ({}) disconnected", user.nickname, user.id),
            Err(e) => info!("User {} ({}) dropped: {}", user.nickname, user.id, e),
        }
        result
    }
}

/// Read inbound units until the peer closes, errors or goes idle
async fn read_loop<I: InboundHalf>(
    user: &UserInfo,
    mut inbound: I,
    broadcaster: &BroadcasterHandle,
    filter: &SensitiveFilter,
    idle_timeout: Duration,
) -> Result<(), AppError> {
    loop {
        let unit = match timeout(idle_timeout, inbound.recv()).await {
            Ok(unit) => unit?,
            Err(_) => {
                debug!("User {} idle for {:?}", user.id, idle_timeout);
                return Err(AppError::IdleTimeout);
            }
        };

        match unit {
            Inbound::Message(ClientMessage::Chat { content, send_time }) => {
                let content = filter.filter(&content);
                let message = Message::normal(user.clone(), content, send_time.as_deref());
                broadcaster.publish(message).await?;
            }
            Inbound::Message(ClientMessage::UserList) => {
                broadcaster.request_user_list(user.id, &user.nickname).await?;
            }
            Inbound::Malformed(reason) => {
                warn!("Invalid message from {}: {}", user.id, reason);
                let notice = Message::error(format!("Invalid message format: {reason}"));
                broadcaster.notify(user.id, &user.nickname, notice).await?;
            }
            Inbound::Closed => {
                debug!("User {} closed the connection", user.id);
                return Ok(());
            }
        }
    }
}

/// Drain the outbound queue until the broadcaster closes it
///
/// A failed send ends the task with that error.
async fn write_loop<O: OutboundHalf>(
    mut outbox: Outbox,
    mut outbound: O,
    id: UserId,
) -> Result<(), AppError> {
    let mut result = Ok(());
    while let Some(message) = outbox.recv().await {
        if let Err(e) = outbound.send(&message).await {
            debug!("Send to {} failed, ending write task: {}", id, e);
            result = Err(e);
            break;
        }
    }

    outbound.close().await;
    debug!("Write task ended for {}", id);
    result
}

/// Guarantees the user is unregistered once the session ends
///
/// `leave` does it in line. If the session is dropped first, whether
/// or not it was ever run, `Drop` hands the unregister to a fresh task.
#[derive(Debug)]
struct Departure {
    broadcaster: Option<BroadcasterHandle>,
    id: UserId,
    nickname: String,
}

impl Departure {
    fn new(broadcaster: BroadcasterHandle, user: &UserInfo) -> Self {
        Self {
            broadcaster: Some(broadcaster),
            id: user.id,
            nickname: user.nickname.clone(),
        }
    }

    async fn leave(mut self) {
        if let Some(broadcaster) = self.broadcaster.take() {
            if let Err(e) = broadcaster.unregister(self.id, &self.nickname).await {
                // Room already shut down, nothing left to release
                debug!("Unregister of {} skipped: {}", self.id, e);
            }
        }
    }
}

impl Drop for Departure {
    fn drop(&mut self) {
        let Some(broadcaster) = self.broadcaster.take() else {
            return;
        };
        let id = self.id;
        let nickname = std::mem::take(&mut self.nickname);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = broadcaster.unregister(id, &nickname).await;
                });
            }
            Err(_) => error!("User {} abandoned outside a runtime", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::message::MessageKind;
    use crate::offline::MemoryOfflineStore;
    use crate::user::User;

    /// Inbound half fed from a channel; a dropped sender reads as a close
    struct ChannelInbound(mpsc::UnboundedReceiver<Result<Inbound, AppError>>);

    #[async_trait]
    impl InboundHalf for ChannelInbound {
        async fn recv(&mut self) -> Result<Inbound, AppError> {
            self.0.recv().await.unwrap_or(Ok(Inbound::Closed))
        }
    }

    /// Outbound half that records what it was asked to send
    struct ChannelOutbound(mpsc::UnboundedSender<Option<Message>>);

    #[async_trait]
    impl OutboundHalf for ChannelOutbound {
        async fn send(&mut self, message: &Message) -> Result<(), AppError> {
            self.0
                .send(Some(message.clone()))
                .map_err(|_| AppError::ChannelSend)
        }

        async fn close(&mut self) {
            let _ = self.0.send(None);
        }
    }

    struct Peer {
        input: mpsc::UnboundedSender<Result<Inbound, AppError>>,
        output: mpsc::UnboundedReceiver<Option<Message>>,
        task: tokio::task::JoinHandle<Result<(), AppError>>,
    }

    impl Peer {
        fn say(&self, content: &str) {
            self.input
                .send(Ok(Inbound::Message(ClientMessage::Chat {
                    content: content.to_string(),
                    send_time: None,
                })))
                .unwrap();
        }

        /// Next sent message of `kind`, skipping others
        async fn expect(&mut self, kind: MessageKind) -> Message {
            loop {
                let next = timeout(Duration::from_secs(1), self.output.recv())
                    .await
                    .expect("timed out")
                    .expect("output gone")
                    .expect("transport closed");
                if next.kind == kind {
                    return next;
                }
            }
        }

        /// Wait until the transport has been closed
        async fn expect_closed(&mut self) {
            loop {
                match timeout(Duration::from_secs(1), self.output.recv())
                    .await
                    .expect("timed out")
                {
                    Some(Some(_)) => continue,
                    Some(None) | None => return,
                }
            }
        }
    }

    /// Poll until `nickname` is free again
    async fn wait_until_free(room: &BroadcasterHandle, nickname: &str) -> bool {
        for _ in 0..50 {
            if room.check_nickname_available(nickname).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn room() -> BroadcasterHandle {
        let (broadcaster, handle) = Broadcaster::new(Box::new(MemoryOfflineStore::new(0)), 16);
        tokio::spawn(broadcaster.run());
        handle
    }

    async fn connect(room: &BroadcasterHandle, id: u64, nickname: &str, idle: Duration) -> Peer {
        let (user, outbox) = User::new(
            UserId(id),
            nickname.to_string(),
            String::new(),
            "test".to_string(),
            false,
            32,
        );
        let info = user.info();
        room.register_if_available(user).await.unwrap();

        let filter = Arc::new(SensitiveFilter::new(vec!["darn".to_string()], "**"));
        let session = ConnectionSession::new(info, outbox, room.clone(), filter, idle);

        let (input, inbound) = mpsc::unbounded_channel();
        let (outbound, output) = mpsc::unbounded_channel();
        let task = tokio::spawn(session.run(ChannelInbound(inbound), ChannelOutbound(outbound)));

        Peer {
            input,
            output,
            task,
        }
    }

    const IDLE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_chat_is_filtered_and_fanned_out() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", IDLE).await;
        let mut bob = connect(&room, 2, "bob", IDLE).await;
        alice.expect(MessageKind::Welcome).await;

        alice.say("darn it @bob");
        let got = bob.expect(MessageKind::Normal).await;
        assert_eq!(got.content, "** it @bob");
        assert_eq!(got.ats, vec!["@bob"]);
        assert_eq!(got.user.nickname, "alice");
    }

    #[tokio::test]
    async fn test_close_unregisters_and_ends_writer() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", IDLE).await;
        let mut bob = connect(&room, 2, "bob", IDLE).await;

        alice.input.send(Ok(Inbound::Closed)).unwrap();
        assert!((&mut alice.task).await.unwrap().is_ok());
        alice.expect_closed().await;

        let leave = bob.expect(MessageKind::UserLeave).await;
        assert_eq!(leave.user.nickname, "alice");

        let names: Vec<String> = room
            .snapshot_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.nickname)
            .collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[tokio::test]
    async fn test_transport_error_still_departs() {
        let room = room();
        let alice = connect(&room, 1, "alice", IDLE).await;

        alice
            .input
            .send(Err(AppError::Io(std::io::Error::other("reset"))))
            .unwrap();
        assert!(matches!(alice.task.await.unwrap(), Err(AppError::Io(_))));
        assert!(room.check_nickname_available("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_session() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", IDLE).await;
        let mut bob = connect(&room, 2, "bob", IDLE).await;

        alice
            .input
            .send(Ok(Inbound::Malformed("expected value".to_string())))
            .unwrap();
        let err = alice.expect(MessageKind::Error).await;
        assert!(err.content.contains("expected value"));

        alice.say("still here");
        assert_eq!(bob.expect(MessageKind::Normal).await.content, "still here");
    }

    #[tokio::test]
    async fn test_user_list_request() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", IDLE).await;
        let _bob = connect(&room, 2, "bob", IDLE).await;

        alice
            .input
            .send(Ok(Inbound::Message(ClientMessage::UserList)))
            .unwrap();
        let list = alice.expect(MessageKind::UserList).await;
        let names: Vec<&str> = list
            .users
            .iter()
            .flatten()
            .map(|u| u.nickname.as_str())
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", Duration::from_millis(50)).await;

        let result = timeout(Duration::from_secs(2), &mut alice.task)
            .await
            .expect("session did not time out")
            .unwrap();
        assert!(matches!(result, Err(AppError::IdleTimeout)));
        alice.expect_closed().await;
        assert!(room.snapshot_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_room_shutdown_ends_session() {
        let room = room();
        let mut alice = connect(&room, 1, "alice", IDLE).await;

        room.shutdown().await;

        let result = timeout(Duration::from_secs(2), &mut alice.task)
            .await
            .expect("session did not end")
            .unwrap();
        assert!(result.is_ok());
        alice.expect_closed().await;
    }

    #[tokio::test]
    async fn test_dropped_session_still_unregisters() {
        let room = room();
        let alice = connect(&room, 1, "alice", IDLE).await;

        alice.task.abort();
        let _ = alice.task.await;

        assert!(wait_until_free(&room, "alice").await);
    }

    #[tokio::test]
    async fn test_session_dropped_before_run_unregisters() {
        let room = room();
        let (user, outbox) = User::new(
            UserId(1),
            "alice".to_string(),
            String::new(),
            "test".to_string(),
            false,
            32,
        );
        let info = user.info();
        room.register_if_available(user).await.unwrap();

        let session = ConnectionSession::new(
            info,
            outbox,
            room.clone(),
            Arc::new(SensitiveFilter::default()),
            IDLE,
        );
        drop(session);

        assert!(wait_until_free(&room, "alice").await);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let room = room();
        let Peer {
            input: _input,
            output,
            task,
        } = connect(&room, 1, "alice", IDLE).await;

        // Transport refuses every write from now on
        drop(output);
        let _bob = connect(&room, 2, "bob", IDLE).await;

        let result = timeout(Duration::from_secs(2), task)
            .await
            .expect("session did not end")
            .unwrap();
        assert!(matches!(result, Err(AppError::ChannelSend)));
        assert!(room.check_nickname_available("alice").await.unwrap());
    }
}
