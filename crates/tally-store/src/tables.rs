//! Redb table definitions for the durable store.

use redb::TableDefinition;

// Messages
// Key: message id, Value: JSON(MessageRecord)
pub const MESSAGES: TableDefinition<u64, &str> = TableDefinition::new("messages");

// Social graph
// Key: "{user_id}\x00{friend_id}", Value: JSON(FriendRequestRecord)
pub const FRIEND_REQUESTS: TableDefinition<&str, &str> = TableDefinition::new("friend_requests");

// Id sequences
// Key: sequence name, Value: last id handed out
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub const MESSAGE_ID_SEQUENCE: &str = "message_id";
