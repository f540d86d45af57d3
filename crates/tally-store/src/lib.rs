//! Tally Store - durable source of truth for counters
//!
//! Counters in the cache are derived values. This crate holds the rows they
//! are derived from (messages and friend requests) and exposes the queries
//! reconciliation and the message sagas run against them through the
//! [`DurableStore`] trait. [`RedbStore`] is the redb-backed implementation.

pub mod store;
pub mod tables;
pub mod types;

use async_trait::async_trait;
use tally_common::{MessageId, Result, UserId};

pub use store::{RedbStore, StoreError, StoreResult};
pub use types::{FriendRequestRecord, FriendStatus, MessageRecord};

/// Relational query interface consumed by the counter core
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Unread messages addressed to `user`
    async fn count_unread_messages(&self, user: UserId) -> Result<i64>;

    /// Distinct senders with at least one unread message to `user`
    async fn count_distinct_unread_senders(&self, user: UserId) -> Result<i64>;

    /// Pending friend requests addressed to `user`
    async fn count_pending_friend_requests(&self, user: UserId) -> Result<i64>;

    /// Unread messages from `sender` to `user`
    async fn count_unread_from(&self, user: UserId, sender: UserId) -> Result<i64>;

    /// Persist a new unread message and return its id
    async fn create_message(&self, from: UserId, to: UserId, text: &str) -> Result<MessageId>;

    async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>>;

    /// Delete a message; deleting a missing id is not an error
    async fn delete_message(&self, id: MessageId) -> Result<()>;

    /// Mark every unread message from `sender` to `user` as read
    async fn mark_rows_read(&self, user: UserId, sender: UserId) -> Result<u64>;

    /// Flip read messages from `sender` to `user` whose read state changed at
    /// or after `updated_since_ms` back to unread
    async fn mark_rows_unread(
        &self,
        user: UserId,
        sender: UserId,
        updated_since_ms: i64,
    ) -> Result<u64>;

    /// Every user with at least one unread message
    async fn users_with_unread(&self) -> Result<Vec<UserId>>;

    /// Users with at least one unread message created at or after `created_since_ms`
    async fn users_with_unread_since(&self, created_since_ms: i64) -> Result<Vec<UserId>>;

    /// Record a pending friend request from `friend` to `user`
    async fn create_friend_request(&self, user: UserId, friend: UserId) -> Result<()>;

    async fn set_friend_request_status(
        &self,
        user: UserId,
        friend: UserId,
        status: FriendStatus,
    ) -> Result<()>;
}
