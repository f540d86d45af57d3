//! Persistent row store backed by redb.
//!
//! Every write is its own write transaction. Rows are JSON-encoded; the
//! counting queries are full scans of the messages table, which is what the
//! background reconciliation tolerates at its cadence.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable};
use tally_common::{Error, MessageId, UserId, unix_millis};
use tracing::{debug, info};

use crate::DurableStore;
use crate::tables::{FRIEND_REQUESTS, MESSAGE_ID_SEQUENCE, MESSAGES, SEQUENCES};
use crate::types::{FriendRequestRecord, FriendStatus, MessageRecord};

/// Error type for durable store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("friend request {user}/{friend} not found")]
    FriendRequestNotFound { user: UserId, friend: UserId },
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::FriendRequestNotFound { .. } => Self::NotFound(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable store backed by redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::with_database(Database::create(path)?)?;
        info!("Durable store opened at {}", path.display());
        Ok(store)
    }

    /// Volatile store for tests and dry runs.
    pub fn in_memory() -> StoreResult<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> StoreResult<Self> {
        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(MESSAGES)?;
            let _t = write_txn.open_table(FRIEND_REQUESTS)?;
            let _t = write_txn.open_table(SEQUENCES)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    // ---- Messages ----

    /// Store a new unread message. Ids are never reused, even after the
    /// highest row is deleted.
    pub fn insert_message(&self, from: UserId, to: UserId, text: &str) -> StoreResult<MessageId> {
        let now = unix_millis();
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut sequences = write_txn.open_table(SEQUENCES)?;
            let mut table = write_txn.open_table(MESSAGES)?;
            let issued = sequences.get(MESSAGE_ID_SEQUENCE)?.map_or(0, |v| v.value());
            let highest = table.last()?.map_or(0, |(k, _)| k.value());
            let id = issued.max(highest) + 1;
            sequences.insert(MESSAGE_ID_SEQUENCE, id)?;
            let record = MessageRecord {
                id,
                from_user_id: from,
                to_user_id: to,
                text: text.to_string(),
                is_read: false,
                created_at: now,
                updated_at: now,
            };
            let json = serde_json::to_string(&record)?;
            table.insert(id, json.as_str())?;
            id
        };
        write_txn.commit()?;
        debug!("Stored message {} from {} to {}", id, from, to);
        Ok(id)
    }

    pub fn load_message(&self, id: MessageId) -> StoreResult<Option<MessageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn remove_message(&self, id: MessageId) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = write_txn.open_table(MESSAGES)?.remove(id)?.is_some();
        write_txn.commit()?;
        Ok(removed)
    }

    /// Visit every message row.
    fn scan_messages<F>(&self, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&MessageRecord),
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: MessageRecord = serde_json::from_str(value.value())?;
            visit(&record);
        }
        Ok(())
    }

    /// Rewrite every message matching `select` with `apply`, in one transaction.
    fn update_messages<P, A>(&self, select: P, apply: A) -> StoreResult<u64>
    where
        P: Fn(&MessageRecord) -> bool,
        A: Fn(&mut MessageRecord),
    {
        let write_txn = self.db.begin_write()?;
        let changed = {
            let mut table = write_txn.open_table(MESSAGES)?;
            let mut selected = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let record: MessageRecord = serde_json::from_str(value.value())?;
                if select(&record) {
                    selected.push(record);
                }
            }
            for record in &mut selected {
                apply(record);
                let json = serde_json::to_string(record)?;
                table.insert(record.id, json.as_str())?;
            }
            selected.len() as u64
        };
        write_txn.commit()?;
        Ok(changed)
    }

    pub fn unread_count(&self, user: UserId) -> StoreResult<i64> {
        let mut count = 0i64;
        self.scan_messages(|m| {
            if m.is_unread_for(user) {
                count += 1;
            }
        })?;
        Ok(count)
    }

    pub fn unread_sender_count(&self, user: UserId) -> StoreResult<i64> {
        let mut senders = BTreeSet::new();
        self.scan_messages(|m| {
            if m.is_unread_for(user) {
                senders.insert(m.from_user_id);
            }
        })?;
        Ok(senders.len() as i64)
    }

    pub fn unread_count_from(&self, user: UserId, sender: UserId) -> StoreResult<i64> {
        let mut count = 0i64;
        self.scan_messages(|m| {
            if m.is_unread_for(user) && m.from_user_id == sender {
                count += 1;
            }
        })?;
        Ok(count)
    }

    pub fn set_read(&self, user: UserId, sender: UserId) -> StoreResult<u64> {
        let now = unix_millis();
        self.update_messages(
            |m| m.is_unread_for(user) && m.from_user_id == sender,
            |m| {
                m.is_read = true;
                m.updated_at = now;
            },
        )
    }

    pub fn set_unread_since(
        &self,
        user: UserId,
        sender: UserId,
        updated_since_ms: i64,
    ) -> StoreResult<u64> {
        let now = unix_millis();
        self.update_messages(
            |m| {
                m.is_read
                    && m.to_user_id == user
                    && m.from_user_id == sender
                    && m.updated_at >= updated_since_ms
            },
            |m| {
                m.is_read = false;
                m.updated_at = now;
            },
        )
    }

    /// Recipients with unread rows, optionally restricted to rows created
    /// at or after `created_since_ms`.
    pub fn unread_recipients(&self, created_since_ms: Option<i64>) -> StoreResult<Vec<UserId>> {
        let mut users = BTreeSet::new();
        self.scan_messages(|m| {
            let recent = created_since_ms.is_none_or(|since| m.created_at >= since);
            if !m.is_read && recent {
                users.insert(m.to_user_id);
            }
        })?;
        Ok(users.into_iter().collect())
    }

    // ---- Friend requests ----

    pub fn put_friend_request(&self, record: &FriendRequestRecord) -> StoreResult<()> {
        let key = friend_db_key(record.user_id, record.friend_id);
        let json = serde_json::to_string(record)?;
        let write_txn = self.db.begin_write()?;
        write_txn
            .open_table(FRIEND_REQUESTS)?
            .insert(key.as_str(), json.as_str())?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_friend_request(
        &self,
        user: UserId,
        friend: UserId,
    ) -> StoreResult<Option<FriendRequestRecord>> {
        let key = friend_db_key(user, friend);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FRIEND_REQUESTS)?;
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn pending_request_count(&self, user: UserId) -> StoreResult<i64> {
        let prefix = format!("{user}\x00");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FRIEND_REQUESTS)?;

        let mut count = 0i64;
        for entry in table.range(prefix.as_str()..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            let record: FriendRequestRecord = serde_json::from_str(value.value())?;
            if record.status == FriendStatus::Pending {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl DurableStore for RedbStore {
    async fn count_unread_messages(&self, user: UserId) -> tally_common::Result<i64> {
        Ok(self.unread_count(user)?)
    }

    async fn count_distinct_unread_senders(&self, user: UserId) -> tally_common::Result<i64> {
        Ok(self.unread_sender_count(user)?)
    }

    async fn count_pending_friend_requests(&self, user: UserId) -> tally_common::Result<i64> {
        Ok(self.pending_request_count(user)?)
    }

    async fn count_unread_from(&self, user: UserId, sender: UserId) -> tally_common::Result<i64> {
        Ok(self.unread_count_from(user, sender)?)
    }

    async fn create_message(
        &self,
        from: UserId,
        to: UserId,
        text: &str,
    ) -> tally_common::Result<MessageId> {
        Ok(self.insert_message(from, to, text)?)
    }

    async fn get_message(&self, id: MessageId) -> tally_common::Result<Option<MessageRecord>> {
        Ok(self.load_message(id)?)
    }

    async fn delete_message(&self, id: MessageId) -> tally_common::Result<()> {
        if !self.remove_message(id)? {
            debug!("Message {} already absent", id);
        }
        Ok(())
    }

    async fn mark_rows_read(&self, user: UserId, sender: UserId) -> tally_common::Result<u64> {
        Ok(self.set_read(user, sender)?)
    }

    async fn mark_rows_unread(
        &self,
        user: UserId,
        sender: UserId,
        updated_since_ms: i64,
    ) -> tally_common::Result<u64> {
        Ok(self.set_unread_since(user, sender, updated_since_ms)?)
    }

    async fn users_with_unread(&self) -> tally_common::Result<Vec<UserId>> {
        Ok(self.unread_recipients(None)?)
    }

    async fn users_with_unread_since(
        &self,
        created_since_ms: i64,
    ) -> tally_common::Result<Vec<UserId>> {
        Ok(self.unread_recipients(Some(created_since_ms))?)
    }

    async fn create_friend_request(
        &self,
        user: UserId,
        friend: UserId,
    ) -> tally_common::Result<()> {
        let record = FriendRequestRecord {
            user_id: user,
            friend_id: friend,
            status: FriendStatus::Pending,
            created_at: unix_millis(),
        };
        Ok(self.put_friend_request(&record)?)
    }

    async fn set_friend_request_status(
        &self,
        user: UserId,
        friend: UserId,
        status: FriendStatus,
    ) -> tally_common::Result<()> {
        let mut record = self
            .load_friend_request(user, friend)?
            .ok_or(StoreError::FriendRequestNotFound { user, friend })?;
        record.status = status;
        Ok(self.put_friend_request(&record)?)
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn friend_db_key(user: UserId, friend: UserId) -> String {
    format!("{user}\x00{friend}")
}
