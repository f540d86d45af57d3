//! Reconciliation and consistency checking
//!
//! Cached counters drift: a crashed saga, a dropped batch item, an expired key.
//! The [`Reconciler`] recomputes a counter from the durable store and
//! overwrites the cache when they differ. Two background loops drive it: a
//! slow full pass over every user with unread messages, and a frequent
//! [`ConsistencyChecker`] that samples recently active users and only
//! reconciles when the drift is material.

use std::sync::Arc;
use std::time::Duration;

use tally_common::config::{ConsistencyConfig, ReconciliationConfig};
use tally_common::{CounterKey, CounterType, Error, Result, UserId, unix_millis};
use tally_store::DurableStore;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::CounterMetrics;
use crate::store::CounterStore;

/// Result of reconciling one counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub key: CounterKey,
    /// Cached value before reconciliation, 0 when absent or unreadable
    pub cached: i64,
    /// Authoritative value, now also in the cache
    pub actual: i64,
    /// The cached value could not be decoded and was overwritten
    pub unreadable: bool,
}

impl ReconcileOutcome {
    #[must_use]
    pub const fn corrected(&self) -> bool {
        self.unreadable || self.cached != self.actual
    }
}

/// Cached count of a counter for reconciliation.
///
/// `None` means the stored value is corrupt; backend failures propagate so a
/// cache outage is never mistaken for a counter at 0.
async fn cached_count(
    store: &CounterStore,
    user: UserId,
    counter_type: CounterType,
) -> Result<Option<i64>> {
    match store.get_with_version(user, counter_type).await {
        Ok(counter) => Ok(Some(counter.map_or(0, |c| c.count))),
        Err(Error::Serialization(e)) => {
            warn!("Unreadable counter {}/{}: {}", user, counter_type, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Summary of a full reconciliation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub corrected: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<CounterStore>,
    durable: Arc<dyn DurableStore>,
    metrics: Arc<CounterMetrics>,
}

impl Reconciler {
    pub fn new(
        store: Arc<CounterStore>,
        durable: Arc<dyn DurableStore>,
        metrics: Arc<CounterMetrics>,
    ) -> Self {
        Self {
            store,
            durable,
            metrics,
        }
    }

    /// Count a counter's value from the durable store
    pub async fn authoritative_count(
        &self,
        user: UserId,
        counter_type: CounterType,
    ) -> Result<i64> {
        match counter_type {
            CounterType::UnreadMessages => self.durable.count_unread_messages(user).await,
            CounterType::UnreadDialogs => self.durable.count_distinct_unread_senders(user).await,
            CounterType::FriendRequests => self.durable.count_pending_friend_requests(user).await,
            CounterType::Notifications => Err(Error::UnsupportedCounterType(counter_type)),
        }
    }

    /// Overwrite the cached counter with the authoritative value if they differ
    pub async fn reconcile(
        &self,
        user: UserId,
        counter_type: CounterType,
    ) -> Result<ReconcileOutcome> {
        let actual = self.authoritative_count(user, counter_type).await?;
        let cached = cached_count(&self.store, user, counter_type).await?;
        let outcome = ReconcileOutcome {
            key: CounterKey::new(user, counter_type),
            cached: cached.unwrap_or_default(),
            actual,
            unreadable: cached.is_none(),
        };

        if outcome.corrected() {
            warn!(
                "Counter mismatch for user {}, type {}: cached={}, actual={}. Reconciling...",
                user, counter_type, outcome.cached, actual
            );
            self.store.set_exact(user, counter_type, actual).await?;
            info!("Reconciled counter {}/{} to {}", user, counter_type, actual);
        }

        self.metrics.record_reconciliation(outcome.corrected());
        Ok(outcome)
    }

    /// Reconcile `unread_messages` of every user with unread rows
    pub async fn run_full_pass(&self, inter_user_delay: Duration) -> Result<PassReport> {
        let users = self.durable.users_with_unread().await?;
        info!("Full reconciliation started for {} users", users.len());

        let mut report = PassReport::default();
        for (i, user) in users.iter().enumerate() {
            if i > 0 && !inter_user_delay.is_zero() {
                tokio::time::sleep(inter_user_delay).await;
            }
            report.processed += 1;
            match self.reconcile(*user, CounterType::UnreadMessages).await {
                Ok(outcome) if outcome.corrected() => report.corrected += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to reconcile counters for user {}: {}", user, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Full reconciliation finished: processed={}, corrected={}, failed={}",
            report.processed, report.corrected, report.failed
        );
        Ok(report)
    }

    #[must_use]
    pub const fn counter_store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    #[must_use]
    pub fn durable_store(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }
}

/// Periodic full reconciliation; the first pass runs one interval after start
pub async fn reconciliation_loop(
    reconciler: Arc<Reconciler>,
    config: ReconciliationConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconciler.run_full_pass(config.inter_user_delay()).await {
                    error!("Full reconciliation failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reconciliation worker stopped");
}

/// Whether `cached` is further from `actual` than the tolerance allows.
///
/// The tolerance is `percent` of `actual`, but never less than `floor`.
#[must_use]
pub fn drift_exceeds_tolerance(cached: i64, actual: i64, percent: i64, floor: i64) -> bool {
    let threshold = (actual.saturating_mul(percent) / 100).max(floor);
    cached.abs_diff(actual) > threshold.unsigned_abs()
}

/// Summary of one consistency check
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub sampled: usize,
    pub drifted: usize,
    pub reconciled: usize,
    pub failed: usize,
}

/// Samples recently active users and reconciles material drift
pub struct ConsistencyChecker {
    reconciler: Arc<Reconciler>,
    config: ConsistencyConfig,
    metrics: Arc<CounterMetrics>,
}

impl ConsistencyChecker {
    pub fn new(
        reconciler: Arc<Reconciler>,
        config: ConsistencyConfig,
        metrics: Arc<CounterMetrics>,
    ) -> Self {
        Self {
            reconciler,
            config,
            metrics,
        }
    }

    /// Check one user's unread counter; `Some` when it had to be reconciled
    pub async fn check_user(&self, user: UserId) -> Result<Option<ReconcileOutcome>> {
        let actual = self
            .reconciler
            .authoritative_count(user, CounterType::UnreadMessages)
            .await?;
        let cached = cached_count(
            self.reconciler.counter_store(),
            user,
            CounterType::UnreadMessages,
        )
        .await?;

        let drifted = cached.is_none_or(|cached| {
            drift_exceeds_tolerance(
                cached,
                actual,
                self.config.tolerance_percent,
                self.config.tolerance_floor,
            )
        });
        self.metrics.record_consistency_check(drifted);
        if !drifted {
            return Ok(None);
        }

        warn!(
            "Significant counter drift for user {}: cached={:?}, actual={}",
            user, cached, actual
        );
        self.reconciler
            .reconcile(user, CounterType::UnreadMessages)
            .await
            .map(Some)
    }

    /// Check every user with unread messages created within the lookback window
    pub async fn check_once(&self) -> Result<CheckReport> {
        let lookback_ms = i64::try_from(self.config.lookback().as_millis()).unwrap_or(i64::MAX);
        let since = unix_millis().saturating_sub(lookback_ms);
        let users = self
            .reconciler
            .durable_store()
            .users_with_unread_since(since)
            .await?;

        let mut report = CheckReport::default();
        for user in users {
            report.sampled += 1;
            match self.check_user(user).await {
                Ok(Some(outcome)) => {
                    report.drifted += 1;
                    if outcome.corrected() {
                        report.reconciled += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Consistency check failed for user {}: {}", user, e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Consistency check: sampled={}, drifted={}, reconciled={}, failed={}",
            report.sampled, report.drifted, report.reconciled, report.failed
        );
        Ok(report)
    }

    /// Periodic checks until shutdown; the first check runs one interval after start
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Consistency check failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Consistency checker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, MemoryCache};
    use tally_common::config::CacheConfig;
    use tally_store::RedbStore;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);
    const CAROL: UserId = UserId::new(3);

    struct Fixture {
        reconciler: Arc<Reconciler>,
        cache: Arc<MemoryCache>,
        store: Arc<CounterStore>,
        durable: Arc<RedbStore>,
        metrics: Arc<CounterMetrics>,
    }

    async fn fixture() -> Fixture {
        let metrics = Arc::new(CounterMetrics::new());
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(CounterStore::new(
            cache.clone(),
            &CacheConfig::default(),
            metrics.clone(),
        ));
        store.prepare().await;
        let durable = Arc::new(RedbStore::in_memory().unwrap());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            durable.clone(),
            metrics.clone(),
        ));
        Fixture {
            reconciler,
            cache,
            store,
            durable,
            metrics,
        }
    }

    async fn send(durable: &RedbStore, from: UserId, to: UserId, n: usize) {
        for _ in 0..n {
            durable.create_message(from, to, "x").await.unwrap();
        }
    }

    #[test]
    fn test_drift_tolerance() {
        assert!(drift_exceeds_tolerance(88, 100, 10, 5));
        assert!(!drift_exceeds_tolerance(93, 100, 10, 5));
        assert!(!drift_exceeds_tolerance(110, 100, 10, 5));
        assert!(drift_exceeds_tolerance(111, 100, 10, 5));
        // Small counts use the floor
        assert!(!drift_exceeds_tolerance(0, 5, 10, 5));
        assert!(drift_exceeds_tolerance(0, 6, 10, 5));
        assert!(!drift_exceeds_tolerance(3, 0, 10, 5));
    }

    #[tokio::test]
    async fn test_reconcile_fixes_drift_and_is_idempotent() {
        let f = fixture().await;
        send(&f.durable, BOB, ALICE, 3).await;
        f.store
            .set_exact(ALICE, CounterType::UnreadMessages, 7)
            .await
            .unwrap();

        let first = f
            .reconciler
            .reconcile(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap();
        assert_eq!((first.cached, first.actual), (7, 3));
        assert!(first.corrected());
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 3);

        let version = f
            .store
            .get_with_version(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap()
            .unwrap()
            .version;
        let second = f
            .reconciler
            .reconcile(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap();
        assert!(!second.corrected());
        let after = f
            .store
            .get_with_version(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.version, version);
        assert_eq!(f.metrics.corrections(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_rewrites_corrupt_value_at_zero() {
        let f = fixture().await;
        f.cache
            .set(
                "counter:1:unread_messages",
                "{oops",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let outcome = f
            .reconciler
            .reconcile(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap();
        assert!(outcome.unreadable);
        assert!(outcome.corrected());
        let repaired = f
            .store
            .get_with_version(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(repaired.count, 0);
    }

    #[tokio::test]
    async fn test_reconcile_fails_while_cache_is_down() {
        let f = fixture().await;
        f.cache.set_available(false);
        assert!(matches!(
            f.reconciler
                .reconcile(ALICE, CounterType::UnreadMessages)
                .await,
            Err(Error::BackendUnavailable(_))
        ));
        assert_eq!(f.metrics.corrections(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_other_counter_types() {
        let f = fixture().await;
        send(&f.durable, BOB, ALICE, 2).await;
        send(&f.durable, CAROL, ALICE, 1).await;
        f.durable.create_friend_request(ALICE, BOB).await.unwrap();

        let dialogs = f
            .reconciler
            .reconcile(ALICE, CounterType::UnreadDialogs)
            .await
            .unwrap();
        assert_eq!(dialogs.actual, 2);
        let requests = f
            .reconciler
            .reconcile(ALICE, CounterType::FriendRequests)
            .await
            .unwrap();
        assert_eq!(requests.actual, 1);
    }

    #[tokio::test]
    async fn test_notifications_are_not_reconcilable() {
        let f = fixture().await;
        f.store
            .increment(ALICE, CounterType::Notifications, 4)
            .await
            .unwrap();

        let err = f
            .reconciler
            .reconcile(ALICE, CounterType::Notifications)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedCounterType(CounterType::Notifications)
        ));
        assert_eq!(f.store.get(ALICE, CounterType::Notifications).await, 4);
    }

    #[tokio::test]
    async fn test_full_pass_covers_users_with_unread() {
        let f = fixture().await;
        send(&f.durable, BOB, ALICE, 2).await;
        send(&f.durable, ALICE, CAROL, 1).await;
        f.store
            .set_exact(CAROL, CounterType::UnreadMessages, 1)
            .await
            .unwrap();

        let report = f.reconciler.run_full_pass(Duration::ZERO).await.unwrap();
        assert_eq!(
            report,
            PassReport {
                processed: 2,
                corrected: 1,
                failed: 0
            }
        );
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 2);
    }

    #[tokio::test]
    async fn test_checker_only_reconciles_material_drift() {
        let f = fixture().await;
        send(&f.durable, BOB, ALICE, 100).await;
        send(&f.durable, ALICE, BOB, 10).await;
        let checker = ConsistencyChecker::new(
            f.reconciler.clone(),
            ConsistencyConfig::default(),
            f.metrics.clone(),
        );

        f.store
            .set_exact(ALICE, CounterType::UnreadMessages, 93)
            .await
            .unwrap();
        f.store
            .set_exact(BOB, CounterType::UnreadMessages, 10)
            .await
            .unwrap();
        assert!(checker.check_user(ALICE).await.unwrap().is_none());
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 93);

        f.store
            .set_exact(ALICE, CounterType::UnreadMessages, 88)
            .await
            .unwrap();
        let report = checker.check_once().await.unwrap();
        assert_eq!(
            report,
            CheckReport {
                sampled: 2,
                drifted: 1,
                reconciled: 1,
                failed: 0
            }
        );
        assert_eq!(f.store.get(ALICE, CounterType::UnreadMessages).await, 100);
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let f = fixture().await;
        let checker = Arc::new(ConsistencyChecker::new(
            f.reconciler.clone(),
            ConsistencyConfig::default(),
            f.metrics.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let full = tokio::spawn(reconciliation_loop(
            f.reconciler.clone(),
            ReconciliationConfig::default(),
            rx.clone(),
        ));
        let check = tokio::spawn(checker.run(rx));

        tx.send(true).unwrap();
        full.await.unwrap();
        check.await.unwrap();
    }
}
