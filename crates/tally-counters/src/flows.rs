//! Message sagas
//!
//! Sending a message and marking a conversation as read each touch the cache
//! and the durable store. Both are run as sagas so a failure in one system
//! undoes what was already done in the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tally_common::{CounterType, Error, MessageId, Result, UserId, unix_millis};
use tally_store::DurableStore;
use tracing::{info, warn};

use crate::saga::{Saga, SagaContext, SagaOrchestrator, SagaStep};
use crate::store::{CounterCompensation, CounterStore};

pub const NEW_MESSAGE_SAGA: &str = "new_message";
pub const MARK_AS_READ_SAGA: &str = "mark_as_read";

pub const STEP_INCREMENT_UNREAD: &str = "increment_unread_counter";
pub const STEP_SAVE_MESSAGE: &str = "save_message";
pub const STEP_SEND_NOTIFICATION: &str = "send_notification";
pub const STEP_COUNT_UNREAD: &str = "count_unread_messages";
pub const STEP_MARK_READ: &str = "mark_messages_as_read";
pub const STEP_UPDATE_COUNTER: &str = "update_counter";

/// Event pushed to a user's devices
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NewMessage {
        from: UserId,
        to: UserId,
        message_id: MessageId,
    },
}

/// Push transport
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!("Notification: {:?}", notification);
        Ok(())
    }
}

/// Builds and runs the message sagas
#[derive(Clone)]
pub struct MessageSagas {
    store: Arc<CounterStore>,
    durable: Arc<dyn DurableStore>,
    notifier: Arc<dyn Notifier>,
    orchestrator: Arc<SagaOrchestrator>,
    read_undo_window: Duration,
}

impl MessageSagas {
    pub fn new(
        store: Arc<CounterStore>,
        durable: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
        orchestrator: Arc<SagaOrchestrator>,
        read_undo_window: Duration,
    ) -> Self {
        Self {
            store,
            durable,
            notifier,
            orchestrator,
            read_undo_window,
        }
    }

    /// Deliver a message: bump the recipient's unread counter, persist the
    /// row, notify. Returns the new message id.
    pub async fn new_message(&self, from: UserId, to: UserId, text: &str) -> Result<MessageId> {
        let saga = self.new_message_saga(from, to, text);
        self.orchestrator.run(&saga).await?;
        saga.context()
            .get::<MessageId>(STEP_SAVE_MESSAGE)?
            .ok_or_else(|| Error::internal("new_message saga finished without a message id"))
    }

    #[must_use]
    pub fn new_message_saga(&self, from: UserId, to: UserId, text: &str) -> Saga {
        let increment = {
            let store = Arc::clone(&self.store);
            let undo_store = Arc::clone(&self.store);
            SagaStep::new(STEP_INCREMENT_UNREAD, move |ctx: SagaContext| {
                let store = Arc::clone(&store);
                async move {
                    store.increment(to, CounterType::UnreadMessages, 1).await?;
                    ctx.put(
                        STEP_INCREMENT_UNREAD,
                        &CounterStore::compensation_for(to, CounterType::UnreadMessages, 1),
                    )
                }
            })
            .with_compensation(move |ctx: SagaContext| {
                let store = Arc::clone(&undo_store);
                async move { undo_counter(&store, &ctx, STEP_INCREMENT_UNREAD).await }
            })
        };

        let save = {
            let durable = Arc::clone(&self.durable);
            let undo_durable = Arc::clone(&self.durable);
            let text = text.to_string();
            SagaStep::new(STEP_SAVE_MESSAGE, move |ctx: SagaContext| {
                let durable = Arc::clone(&durable);
                let text = text.clone();
                async move {
                    let id = durable.create_message(from, to, &text).await?;
                    ctx.put(STEP_SAVE_MESSAGE, &id)
                }
            })
            .with_compensation(move |ctx: SagaContext| {
                let durable = Arc::clone(&undo_durable);
                async move {
                    if let Some(id) = ctx.get::<MessageId>(STEP_SAVE_MESSAGE)? {
                        durable.delete_message(id).await?;
                    }
                    Ok(())
                }
            })
        };

        let notify = {
            let notifier = Arc::clone(&self.notifier);
            SagaStep::new(STEP_SEND_NOTIFICATION, move |ctx: SagaContext| {
                let notifier = Arc::clone(&notifier);
                async move {
                    let message_id = ctx
                        .get::<MessageId>(STEP_SAVE_MESSAGE)
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    let notification = Notification::NewMessage {
                        from,
                        to,
                        message_id,
                    };
                    // Delivery is best effort
                    if let Err(e) = notifier.notify(&notification).await {
                        warn!("Failed to notify user {} of message {}: {}", to, message_id, e);
                    }
                    Ok(())
                }
            })
        };

        Saga::new(NEW_MESSAGE_SAGA)
            .add_step(increment)
            .add_step(save)
            .add_step(notify)
    }

    /// Mark everything `partner` sent to `user` as read and decrement the
    /// unread counter accordingly. Returns how many messages were marked.
    pub async fn mark_as_read(&self, user: UserId, partner: UserId) -> Result<i64> {
        let saga = self.mark_as_read_saga(user, partner);
        self.orchestrator.run(&saga).await?;
        Ok(saga.context().get::<i64>(STEP_COUNT_UNREAD)?.unwrap_or(0))
    }

    #[must_use]
    pub fn mark_as_read_saga(&self, user: UserId, partner: UserId) -> Saga {
        let count = {
            let durable = Arc::clone(&self.durable);
            SagaStep::new(STEP_COUNT_UNREAD, move |ctx: SagaContext| {
                let durable = Arc::clone(&durable);
                async move {
                    let unread = durable.count_unread_from(user, partner).await?;
                    ctx.put(STEP_COUNT_UNREAD, &unread)
                }
            })
        };

        let mark = {
            let durable = Arc::clone(&self.durable);
            let undo_durable = Arc::clone(&self.durable);
            let window = i64::try_from(self.read_undo_window.as_millis()).unwrap_or(i64::MAX);
            SagaStep::new(STEP_MARK_READ, move |_ctx: SagaContext| {
                let durable = Arc::clone(&durable);
                async move {
                    durable.mark_rows_read(user, partner).await?;
                    Ok(())
                }
            })
            .with_compensation(move |_ctx: SagaContext| {
                let durable = Arc::clone(&undo_durable);
                async move {
                    let since = unix_millis().saturating_sub(window);
                    let restored = durable.mark_rows_unread(user, partner, since).await?;
                    info!(
                        "Restored {} messages from {} to {} as unread",
                        restored, partner, user
                    );
                    Ok(())
                }
            })
        };

        let update = {
            let store = Arc::clone(&self.store);
            let undo_store = Arc::clone(&self.store);
            SagaStep::new(STEP_UPDATE_COUNTER, move |ctx: SagaContext| {
                let store = Arc::clone(&store);
                async move {
                    let unread = ctx.get::<i64>(STEP_COUNT_UNREAD)?.unwrap_or(0);
                    if unread > 0 {
                        store
                            .increment(user, CounterType::UnreadMessages, -unread)
                            .await?;
                        ctx.put(
                            STEP_UPDATE_COUNTER,
                            &CounterStore::compensation_for(
                                user,
                                CounterType::UnreadMessages,
                                -unread,
                            ),
                        )?;
                    }
                    Ok(())
                }
            })
            .with_compensation(move |ctx: SagaContext| {
                let store = Arc::clone(&undo_store);
                async move { undo_counter(&store, &ctx, STEP_UPDATE_COUNTER).await }
            })
        };

        Saga::new(MARK_AS_READ_SAGA)
            .add_step(count)
            .add_step(mark)
            .add_step(update)
    }
}

/// Apply the compensation a counter step left in the context, if any
async fn undo_counter(store: &CounterStore, ctx: &SagaContext, step: &str) -> Result<()> {
    if let Some(compensation) = ctx.get::<CounterCompensation>(step)? {
        store.apply_compensation(&compensation).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::metrics::CounterMetrics;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tally_common::config::CacheConfig;
    use tally_store::{FriendStatus, MessageRecord, RedbStore};

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);

    /// Notifier that records what it was asked to send, or fails
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::unavailable("push gateway down"));
            }
            self.sent.lock().push(notification.clone());
            Ok(())
        }
    }

    /// Durable store whose message writes can be made to fail
    struct FlakyStore {
        inner: RedbStore,
        fail_create: AtomicBool,
        fail_mark_read: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: RedbStore::in_memory().unwrap(),
                fail_create: AtomicBool::new(false),
                fail_mark_read: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn count_unread_messages(&self, user: UserId) -> Result<i64> {
            self.inner.count_unread_messages(user).await
        }
        async fn count_distinct_unread_senders(&self, user: UserId) -> Result<i64> {
            self.inner.count_distinct_unread_senders(user).await
        }
        async fn count_pending_friend_requests(&self, user: UserId) -> Result<i64> {
            self.inner.count_pending_friend_requests(user).await
        }
        async fn count_unread_from(&self, user: UserId, sender: UserId) -> Result<i64> {
            self.inner.count_unread_from(user, sender).await
        }
        async fn create_message(&self, from: UserId, to: UserId, text: &str) -> Result<MessageId> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::storage("insert rejected"));
            }
            self.inner.create_message(from, to, text).await
        }
        async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>> {
            self.inner.get_message(id).await
        }
        async fn delete_message(&self, id: MessageId) -> Result<()> {
            self.inner.delete_message(id).await
        }
        async fn mark_rows_read(&self, user: UserId, sender: UserId) -> Result<u64> {
            if self.fail_mark_read.load(Ordering::SeqCst) {
                return Err(Error::storage("update rejected"));
            }
            self.inner.mark_rows_read(user, sender).await
        }
        async fn mark_rows_unread(
            &self,
            user: UserId,
            sender: UserId,
            updated_since_ms: i64,
        ) -> Result<u64> {
            self.inner
                .mark_rows_unread(user, sender, updated_since_ms)
                .await
        }
        async fn users_with_unread(&self) -> Result<Vec<UserId>> {
            self.inner.users_with_unread().await
        }
        async fn users_with_unread_since(&self, created_since_ms: i64) -> Result<Vec<UserId>> {
            self.inner.users_with_unread_since(created_since_ms).await
        }
        async fn create_friend_request(&self, user: UserId, friend: UserId) -> Result<()> {
            self.inner.create_friend_request(user, friend).await
        }
        async fn set_friend_request_status(
            &self,
            user: UserId,
            friend: UserId,
            status: FriendStatus,
        ) -> Result<()> {
            self.inner
                .set_friend_request_status(user, friend, status)
                .await
        }
    }

    struct Fixture {
        sagas: MessageSagas,
        store: Arc<CounterStore>,
        durable: Arc<FlakyStore>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn fixture() -> Fixture {
        let metrics = Arc::new(CounterMetrics::new());
        let store = Arc::new(CounterStore::new(
            Arc::new(MemoryCache::new()),
            &CacheConfig::default(),
            metrics.clone(),
        ));
        store.prepare().await;
        let durable = Arc::new(FlakyStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let sagas = MessageSagas::new(
            store.clone(),
            durable.clone(),
            notifier.clone(),
            Arc::new(SagaOrchestrator::new(metrics)),
            Duration::from_secs(60),
        );
        Fixture {
            sagas,
            store,
            durable,
            notifier,
        }
    }

    #[tokio::test]
    async fn test_new_message_updates_both_stores() {
        let f = fixture().await;
        let id = f.sagas.new_message(BOB, ALICE, "hi").await.unwrap();

        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 1);
        let row = f.durable.get_message(id).await.unwrap().unwrap();
        assert_eq!(row.text, "hi");
        assert!(row.is_unread_for(ALICE));
        assert_eq!(
            *f.notifier.sent.lock(),
            vec![Notification::NewMessage {
                from: BOB,
                to: ALICE,
                message_id: id
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_counter() {
        let f = fixture().await;
        f.durable.fail_create.store(true, Ordering::SeqCst);

        let err = f.sagas.new_message(BOB, ALICE, "lost").await.unwrap_err();
        assert!(
            matches!(&err, Error::SagaStepFailure { step, .. } if step == STEP_SAVE_MESSAGE)
        );
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 0);
        assert_eq!(f.durable.count_unread_messages(ALICE).await.unwrap(), 0);
        assert!(f.notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_saga() {
        let f = fixture().await;
        f.notifier.fail.store(true, Ordering::SeqCst);

        let id = f.sagas.new_message(BOB, ALICE, "quiet").await.unwrap();
        assert!(f.durable.get_message(id).await.unwrap().is_some());
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 1);
    }

    #[tokio::test]
    async fn test_mark_as_read_decrements_by_marked_count() {
        let f = fixture().await;
        for text in ["a", "b", "c"] {
            f.sagas.new_message(BOB, ALICE, text).await.unwrap();
        }
        f.sagas
            .new_message(UserId::new(3), ALICE, "other")
            .await
            .unwrap();
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 4);

        let marked = f.sagas.mark_as_read(ALICE, BOB).await.unwrap();
        assert_eq!(marked, 3);
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 1);
        assert_eq!(f.durable.count_unread_from(ALICE, BOB).await.unwrap(), 0);

        // Nothing left to mark
        assert_eq!(f.sagas.mark_as_read(ALICE, BOB).await.unwrap(), 0);
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 1);
    }

    #[tokio::test]
    async fn test_failed_mark_leaves_counter_alone() {
        let f = fixture().await;
        f.sagas.new_message(BOB, ALICE, "a").await.unwrap();
        f.durable.fail_mark_read.store(true, Ordering::SeqCst);

        let err = f.sagas.mark_as_read(ALICE, BOB).await.unwrap_err();
        assert!(matches!(&err, Error::SagaStepFailure { step, .. } if step == STEP_MARK_READ));
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 1);
        assert_eq!(f.durable.count_unread_from(ALICE, BOB).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_saga_compensation_restores_rows() {
        let f = fixture().await;
        f.sagas.new_message(BOB, ALICE, "a").await.unwrap();
        f.sagas.new_message(BOB, ALICE, "b").await.unwrap();

        // A final step that fails after the counter was updated
        let saga = f
            .sagas
            .mark_as_read_saga(ALICE, BOB)
            .add_step(SagaStep::new("audit", |_ctx| async {
                Err(Error::internal("audit log offline"))
            }));
        assert!(saga.execute().await.is_err());

        let report = saga.report();
        assert_eq!(
            report.compensated,
            vec![STEP_UPDATE_COUNTER, STEP_MARK_READ]
        );
        assert_eq!(f.durable.count_unread_from(ALICE, BOB).await.unwrap(), 2);
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 2);
    }
}
