//! Offline message replay
//!
//! The broadcaster hands every published message to an `OfflineStore`
//! and asks it for a replay whenever a user registers. Both calls run
//! inside the control loop, so implementations must return promptly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::OfflineError;
use crate::message::{Message, MessageKind};
use crate::user::UserInfo;

/// Storage for messages a user may have missed
pub trait OfflineStore: Send {
    /// Remember a published message
    fn save(&mut self, msg: &Arc<Message>) -> Result<(), OfflineError>;

    /// Messages to deliver to `user` right after registration
    ///
    /// `resumed` is true when the user reconnected with a valid token.
    fn replay(&mut self, user: &UserInfo, resumed: bool) -> Result<Vec<Arc<Message>>, OfflineError>;
}

/// Bounded in-memory store
///
/// Keeps the last `capacity` chat messages for everyone, and the last
/// `capacity` messages mentioning each nickname. Mention history is
/// only replayed to returning users and is consumed by the replay.
#[derive(Debug)]
pub struct MemoryOfflineStore {
    capacity: usize,
    recent: VecDeque<Arc<Message>>,
    mentions: HashMap<String, VecDeque<Arc<Message>>>,
}

impl MemoryOfflineStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            mentions: HashMap::new(),
        }
    }

    fn push(ring: &mut VecDeque<Arc<Message>>, capacity: usize, msg: &Arc<Message>) {
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back(Arc::clone(msg));
    }
}

impl OfflineStore for MemoryOfflineStore {
    fn save(&mut self, msg: &Arc<Message>) -> Result<(), OfflineError> {
        if msg.kind != MessageKind::Normal || self.capacity == 0 {
            return Ok(());
        }

        Self::push(&mut self.recent, self.capacity, msg);

        for at in &msg.ats {
            let nickname = at.trim_start_matches('@');
            let ring = self.mentions.entry(nickname.to_string()).or_default();
            Self::push(ring, self.capacity, msg);
        }
        Ok(())
    }

    fn replay(&mut self, user: &UserInfo, resumed: bool) -> Result<Vec<Arc<Message>>, OfflineError> {
        let mut replay: Vec<Arc<Message>> = self.recent.iter().cloned().collect();

        if resumed {
            if let Some(mentioned) = self.mentions.remove(&user.nickname) {
                replay.extend(
                    mentioned
                        .into_iter()
                        .filter(|m| !self.recent.iter().any(|r| Arc::ptr_eq(r, m))),
                );
            }
        }
        Ok(replay)
    }
}
