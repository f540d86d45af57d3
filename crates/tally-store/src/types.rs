//! Row types persisted in the durable store.

use serde::{Deserialize, Serialize};
use tally_common::{MessageId, UserId};

/// A direct message between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub text: String,
    pub is_read: bool,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds of the last read-state change
    pub updated_at: i64,
}

impl MessageRecord {
    /// Unread and addressed to `user`
    #[must_use]
    pub fn is_unread_for(&self, user: UserId) -> bool {
        !self.is_read && self.to_user_id == user
    }
}

/// Status of a friend request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A friend request from `friend_id` to `user_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestRecord {
    /// Recipient of the request
    pub user_id: UserId,
    /// Requester
    pub friend_id: UserId,
    pub status: FriendStatus,
    /// Unix milliseconds
    pub created_at: i64,
}
