//! Core type definitions for Tally
//!
//! Counters are addressed by a `(UserId, CounterType)` pair. The cache key
//! layout derived from that pair is defined here so every component agrees
//! on it.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Identifier of a user owning counters
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct UserId(i64);

impl UserId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// Identifier of a durable message row
pub type MessageId = u64;

/// Kind of counter kept for a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    /// Unread messages addressed to the user
    UnreadMessages,
    /// Dialogs (distinct senders) with at least one unread message
    UnreadDialogs,
    /// Pending incoming friend requests
    FriendRequests,
    /// Generic notifications
    Notifications,
}

impl CounterType {
    /// Every counter type, in a stable order
    pub const ALL: [Self; 4] = [
        Self::UnreadMessages,
        Self::UnreadDialogs,
        Self::FriendRequests,
        Self::Notifications,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnreadMessages => "unread_messages",
            Self::UnreadDialogs => "unread_dialogs",
            Self::FriendRequests => "friend_requests",
            Self::Notifications => "notifications",
        }
    }
}

impl fmt::Display for CounterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidCounterType(s.to_string()))
    }
}

/// Address of a single counter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub user_id: UserId,
    pub counter_type: CounterType,
}

impl CounterKey {
    #[must_use]
    pub const fn new(user_id: UserId, counter_type: CounterType) -> Self {
        Self {
            user_id,
            counter_type,
        }
    }

    /// Cache key: `counter:{user_id}:{counter_type}`
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("counter:{}:{}", self.user_id, self.counter_type)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.counter_type)
    }
}

/// Snapshot of a cached counter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub user_id: UserId,
    pub counter_type: CounterType,
    /// Never negative
    pub count: i64,
    /// Unix seconds of the last write
    pub updated_at: i64,
    /// Optimistic-concurrency version, bumped on every write
    pub version: i64,
}

/// Current unix time in seconds
#[must_use]
pub fn unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds
#[must_use]
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current unix time in nanoseconds, saturating far in the future
#[must_use]
pub fn unix_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
