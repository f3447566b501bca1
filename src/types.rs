//! Basic type definitions for the chat room
//!
//! Provides newtype wrappers for type safety:
//! - `UserId`: monotonic numeric user identifier
//! - `UserIdAllocator`: process-wide source of fresh ids

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique user identifier (newtype pattern)
///
/// Ids are allocated monotonically starting at 1. Id 0 is reserved
/// for the system sender and never handed to a real user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// Sender id used for messages produced by the room itself
    pub const SYSTEM: UserId = UserId(0);

    /// Whether this id belongs to the system sender
    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out fresh user ids
///
/// Shared between all accept tasks; every call to `next` yields a value
/// strictly greater than any previously returned one.
#[derive(Debug)]
pub struct UserIdAllocator {
    last: AtomicU64,
}

impl UserIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next id
    pub fn next(&self) -> UserId {
        UserId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Account for an id issued elsewhere, e.g. by a previous process
    ///
    /// Later calls to `next` will not hand it out again.
    pub fn observe(&self, id: UserId) {
        self.last.fetch_max(id.0, Ordering::Relaxed);
    }
}

impl Default for UserIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
