//! Atomic counter store
//!
//! All writes go through the cache's increment and batch scripts. When the
//! cache has lost its scripts (a restart, a failover) writes degrade to a
//! non-atomic read/compute/write using the same script body, and reads degrade
//! to a plain GET. Reads never fail: a counter that cannot be read is 0.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tally_common::config::CacheConfig;
use tally_common::{
    Counter, CounterKey, CounterType, Error, Result, UserId, unix_nanos, unix_seconds,
};
use tracing::{debug, warn};

use crate::cache::CacheBackend;
use crate::metrics::CounterMetrics;
use crate::script::{
    CounterRecord, IncrementOutcome, Script, ScriptCall, ScriptReply, apply_increment,
};

/// Inverse of an applied counter delta
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCompensation {
    pub key: CounterKey,
    pub delta: i64,
}

pub struct CounterStore {
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
    metrics: Arc<CounterMetrics>,
}

impl CounterStore {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        config: &CacheConfig,
        metrics: Arc<CounterMetrics>,
    ) -> Self {
        Self {
            cache,
            ttl: config.ttl(),
            metrics,
        }
    }

    /// Load the counter scripts into the cache.
    ///
    /// A failed load leaves the store usable in degraded mode.
    pub async fn prepare(&self) {
        for script in Script::ALL {
            if let Err(e) = self.cache.load_script(script).await {
                warn!(
                    "Failed to load cache script {}, counters run degraded: {}",
                    script.name(),
                    e
                );
            }
        }
    }

    /// Current count, 0 when absent or unreadable
    pub async fn get(&self, user: UserId, counter_type: CounterType) -> i64 {
        match self.get_with_version(user, counter_type).await {
            Ok(counter) => counter.map_or(0, |c| c.count),
            Err(e) => {
                warn!("Failed to read counter {}/{}: {}", user, counter_type, e);
                self.metrics.record_degraded_read();
                0
            }
        }
    }

    /// Full record including the version for optimistic updates
    pub async fn get_with_version(
        &self,
        user: UserId,
        counter_type: CounterType,
    ) -> Result<Option<Counter>> {
        let key = CounterKey::new(user, counter_type);
        let cache_key = key.cache_key();

        let record = match self
            .cache
            .eval(ScriptCall::Read {
                key: cache_key.clone(),
            })
            .await
        {
            Ok(ScriptReply::Record(record)) => record,
            Ok(other) => return Err(unexpected_reply(Script::Read, &other)),
            Err(e) => {
                debug!("Read script failed for {}, falling back to GET: {}", key, e);
                self.cache
                    .get(&cache_key)
                    .await?
                    .map(|raw| CounterRecord::decode(&raw))
                    .transpose()?
            }
        };

        Ok(record.map(|r| r.into_counter(key)))
    }

    /// Every counter type of a user in one round trip; unreadable types are 0
    pub async fn get_all_for_user(&self, user: UserId) -> BTreeMap<CounterType, i64> {
        let keys: Vec<String> = CounterType::ALL
            .iter()
            .map(|t| CounterKey::new(user, *t).cache_key())
            .collect();

        let replies = match self.cache.get_many(&keys).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Failed to read counters of user {}: {}", user, e);
                self.metrics.record_degraded_read();
                return CounterType::ALL.into_iter().map(|t| (t, 0)).collect();
            }
        };

        CounterType::ALL
            .into_iter()
            .zip(replies)
            .map(|(counter_type, reply)| {
                let record =
                    reply.and_then(|raw| raw.map(|r| CounterRecord::decode(&r)).transpose());
                let count = match record {
                    Ok(record) => record.map_or(0, |r| r.count),
                    Err(e) => {
                        warn!("Failed to read counter {}/{}: {}", user, counter_type, e);
                        self.metrics.record_degraded_read();
                        0
                    }
                };
                (counter_type, count)
            })
            .collect()
    }

    /// Apply `delta`, clamping at zero
    pub async fn increment(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> Result<Counter> {
        self.apply(CounterKey::new(user, counter_type), delta, None)
            .await
    }

    /// Apply `delta` only if the stored version still equals `expected_version`.
    ///
    /// An expected version of 0 skips the check.
    pub async fn increment_versioned(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
        expected_version: i64,
    ) -> Result<Counter> {
        self.apply(
            CounterKey::new(user, counter_type),
            delta,
            Some(expected_version).filter(|v| *v != 0),
        )
        .await
    }

    async fn apply(
        &self,
        key: CounterKey,
        delta: i64,
        expected_version: Option<i64>,
    ) -> Result<Counter> {
        let call = ScriptCall::Increment {
            key: key.cache_key(),
            delta,
            timestamp: unix_seconds(),
            expected_version,
            ttl: self.ttl,
        };

        let outcome = match self.cache.eval(call).await {
            Ok(ScriptReply::Applied(record)) => IncrementOutcome::Applied(record),
            Ok(ScriptReply::VersionMismatch { stored }) => {
                IncrementOutcome::VersionMismatch { stored }
            }
            Ok(other) => return Err(unexpected_reply(Script::Increment, &other)),
            Err(Error::ScriptUnavailable(reason)) => {
                warn!(
                    "Increment script unavailable ({}), applying {} to {} non-atomically",
                    reason, delta, key
                );
                self.metrics.record_script_fallback();
                self.apply_without_script(key, delta, expected_version)
                    .await?
            }
            Err(e) => return Err(e),
        };

        match outcome {
            IncrementOutcome::Applied(record) => {
                self.metrics.record_increment();
                Ok(record.into_counter(key))
            }
            IncrementOutcome::VersionMismatch { stored } => {
                self.metrics.record_version_mismatch();
                Err(Error::VersionMismatch {
                    key: key.cache_key(),
                    expected: expected_version.unwrap_or_default(),
                    actual: stored,
                })
            }
        }
    }

    async fn apply_without_script(
        &self,
        key: CounterKey,
        delta: i64,
        expected_version: Option<i64>,
    ) -> Result<IncrementOutcome> {
        let cache_key = key.cache_key();
        let current = self
            .cache
            .get(&cache_key)
            .await?
            .map(|raw| CounterRecord::decode(&raw))
            .transpose()?;

        let outcome = apply_increment(current, delta, unix_seconds(), expected_version);
        if let IncrementOutcome::Applied(record) = outcome {
            self.cache
                .set(&cache_key, &record.encode()?, self.ttl)
                .await?;
        }
        Ok(outcome)
    }

    /// Overwrite the counter with an absolute value.
    ///
    /// Reserved for reconciliation and resets. The new version is the current
    /// time in nanoseconds.
    pub async fn set_exact(
        &self,
        user: UserId,
        counter_type: CounterType,
        value: i64,
    ) -> Result<Counter> {
        let key = CounterKey::new(user, counter_type);
        let record = CounterRecord {
            count: value.max(0),
            updated_at: unix_seconds(),
            version: unix_nanos(),
        };
        self.cache
            .set(&key.cache_key(), &record.encode()?, self.ttl)
            .await?;
        Ok(record.into_counter(key))
    }

    pub async fn reset(&self, user: UserId, counter_type: CounterType) -> Result<Counter> {
        self.set_exact(user, counter_type, 0).await
    }

    /// Apply many deltas in one atomic script call.
    ///
    /// Returns the new counts in input order. No version checks.
    pub async fn batch_increment(&self, entries: &[(CounterKey, i64)]) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let call = ScriptCall::BatchIncrement {
            timestamp: unix_seconds(),
            entries: entries
                .iter()
                .map(|(key, delta)| (key.cache_key(), *delta))
                .collect(),
            ttl: self.ttl,
        };

        match self.cache.eval(call).await? {
            ScriptReply::Counts(counts) if counts.len() == entries.len() => Ok(counts),
            other => Err(unexpected_reply(Script::BatchIncrement, &other)),
        }
    }

    /// The compensation undoing a `delta` applied to a counter
    #[must_use]
    pub const fn compensation_for(
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> CounterCompensation {
        CounterCompensation {
            key: CounterKey::new(user, counter_type),
            delta: -delta,
        }
    }

    pub async fn apply_compensation(&self, compensation: &CounterCompensation) -> Result<Counter> {
        self.apply(compensation.key, compensation.delta, None).await
    }
}

fn unexpected_reply(script: Script, reply: &ScriptReply) -> Error {
    Error::internal(format!(
        "unexpected reply from {} script: {:?}",
        script.name(),
        reply
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use rand::seq::SliceRandom;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);

    async fn store_with_cache() -> (Arc<CounterStore>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(CounterStore::new(
            cache.clone(),
            &CacheConfig::default(),
            Arc::new(CounterMetrics::new()),
        ));
        store.prepare().await;
        (store, cache)
    }

    #[tokio::test]
    async fn test_absent_counter_reads_zero() {
        let (store, _) = store_with_cache().await;
        assert_eq!(store.get(ALICE, CounterType::UnreadMessages).await, 0);
        assert!(store
            .get_with_version(ALICE, CounterType::UnreadMessages)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_increment_and_clamp() {
        let (store, cache) = store_with_cache().await;
        let counter = store
            .increment(ALICE, CounterType::UnreadMessages, 3)
            .await
            .unwrap();
        assert_eq!(counter.count, 3);
        assert_eq!(counter.version, 1);

        let counter = store
            .increment(ALICE, CounterType::UnreadMessages, -10)
            .await
            .unwrap();
        assert_eq!(counter.count, 0);
        assert_eq!(counter.version, 2);

        // TTL refreshed on every write
        let ttl = cache.ttl("counter:1:unread_messages").unwrap();
        assert!(ttl > Duration::from_secs(86_000));
    }

    #[tokio::test]
    async fn test_shuffled_deltas_clamp_like_a_running_sum() {
        let (store, _) = store_with_cache().await;
        let mut deltas: Vec<i64> = vec![5, -3, 7, -20, 4, 1, -2, 9, -1, 3];
        deltas.shuffle(&mut rand::thread_rng());

        let mut expected = 0i64;
        for delta in &deltas {
            expected = (expected + delta).max(0);
            store
                .increment(BOB, CounterType::Notifications, *delta)
                .await
                .unwrap();
        }
        assert_eq!(store.get(BOB, CounterType::Notifications).await, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_sum() {
        let (store, _) = store_with_cache().await;
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment(ALICE, CounterType::FriendRequests, 2)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let counter = store
            .get_with_version(ALICE, CounterType::FriendRequests)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count, 100);
        assert_eq!(counter.version, 50);
    }

    #[tokio::test]
    async fn test_stale_version_changes_nothing() {
        let (store, _) = store_with_cache().await;
        store
            .increment(ALICE, CounterType::Notifications, 4)
            .await
            .unwrap();
        let seen = store
            .get_with_version(ALICE, CounterType::Notifications)
            .await
            .unwrap()
            .unwrap();

        // Someone else writes in between
        store
            .increment(ALICE, CounterType::Notifications, 1)
            .await
            .unwrap();

        let err = store
            .increment_versioned(ALICE, CounterType::Notifications, 10, seen.version)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionMismatch { expected: 1, actual: 2, .. }
        ));

        let after = store
            .get_with_version(ALICE, CounterType::Notifications)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.count, 5);
        assert_eq!(after.version, 2);

        let ok = store
            .increment_versioned(ALICE, CounterType::Notifications, 10, after.version)
            .await
            .unwrap();
        assert_eq!(ok.count, 15);

        // Version 0 means unconditional
        let unconditional = store
            .increment_versioned(ALICE, CounterType::Notifications, 1, 0)
            .await
            .unwrap();
        assert_eq!(unconditional.count, 16);
        assert_eq!(unconditional.version, 4);
    }

    #[tokio::test]
    async fn test_set_exact_and_reset() {
        let (store, _) = store_with_cache().await;
        store
            .increment(ALICE, CounterType::UnreadDialogs, 2)
            .await
            .unwrap();
        let set = store
            .set_exact(ALICE, CounterType::UnreadDialogs, 42)
            .await
            .unwrap();
        assert_eq!(set.count, 42);
        assert!(set.version > 2);
        assert_eq!(store.get(ALICE, CounterType::UnreadDialogs).await, 42);

        assert_eq!(
            store
                .set_exact(ALICE, CounterType::UnreadDialogs, -3)
                .await
                .unwrap()
                .count,
            0
        );

        store
            .increment(ALICE, CounterType::UnreadDialogs, 1)
            .await
            .unwrap();
        store.reset(ALICE, CounterType::UnreadDialogs).await.unwrap();
        assert_eq!(store.get(ALICE, CounterType::UnreadDialogs).await, 0);
    }

    #[tokio::test]
    async fn test_get_all_for_user() {
        let (store, cache) = store_with_cache().await;
        store
            .increment(ALICE, CounterType::UnreadMessages, 3)
            .await
            .unwrap();
        store
            .increment(ALICE, CounterType::FriendRequests, 1)
            .await
            .unwrap();
        cache
            .set("counter:1:notifications", "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        let all = store.get_all_for_user(ALICE).await;
        assert_eq!(all.len(), 4);
        assert_eq!(all[&CounterType::UnreadMessages], 3);
        assert_eq!(all[&CounterType::UnreadDialogs], 0);
        assert_eq!(all[&CounterType::FriendRequests], 1);
        assert_eq!(all[&CounterType::Notifications], 0);
    }

    #[tokio::test]
    async fn test_batch_increment_returns_counts_in_order() {
        let (store, _) = store_with_cache().await;
        let a = CounterKey::new(ALICE, CounterType::UnreadMessages);
        let b = CounterKey::new(BOB, CounterType::UnreadMessages);

        assert!(store.batch_increment(&[]).await.unwrap().is_empty());

        let counts = store
            .batch_increment(&[(a, 2), (b, 1), (a, -1)])
            .await
            .unwrap();
        assert_eq!(counts, vec![2, 1, 1]);
        assert_eq!(store.get(ALICE, CounterType::UnreadMessages).await, 1);
    }

    #[tokio::test]
    async fn test_compensation_undoes_delta() {
        let (store, _) = store_with_cache().await;
        store
            .increment(BOB, CounterType::UnreadMessages, 5)
            .await
            .unwrap();
        let compensation = CounterStore::compensation_for(BOB, CounterType::UnreadMessages, 2);
        assert_eq!(compensation.delta, -2);

        store
            .increment(BOB, CounterType::UnreadMessages, 2)
            .await
            .unwrap();
        store.apply_compensation(&compensation).await.unwrap();
        assert_eq!(store.get(BOB, CounterType::UnreadMessages).await, 5);
    }

    #[tokio::test]
    async fn test_degraded_writes_without_scripts() {
        let (store, cache) = store_with_cache().await;
        store
            .increment(ALICE, CounterType::UnreadMessages, 2)
            .await
            .unwrap();

        cache.flush_scripts();
        let counter = store
            .increment(ALICE, CounterType::UnreadMessages, 3)
            .await
            .unwrap();
        assert_eq!(counter.count, 5);
        assert_eq!(counter.version, 2);
        assert_eq!(store.get(ALICE, CounterType::UnreadMessages).await, 5);
        assert_eq!(store.metrics.script_fallbacks(), 1);

        // The version check still holds on the fallback path
        assert!(matches!(
            store
                .increment_versioned(ALICE, CounterType::UnreadMessages, 1, 1)
                .await,
            Err(Error::VersionMismatch { .. })
        ));

        // Batches need the script
        let key = CounterKey::new(ALICE, CounterType::UnreadMessages);
        assert!(matches!(
            store.batch_increment(&[(key, 1)]).await,
            Err(Error::ScriptUnavailable(_))
        ));

        store.prepare().await;
        assert_eq!(
            store.batch_increment(&[(key, 1)]).await.unwrap(),
            vec![6]
        );
    }

    #[tokio::test]
    async fn test_unavailable_backend_reads_zero_and_writes_fail() {
        let (store, cache) = store_with_cache().await;
        store
            .increment(ALICE, CounterType::UnreadMessages, 2)
            .await
            .unwrap();

        cache.set_available(false);
        assert_eq!(store.get(ALICE, CounterType::UnreadMessages).await, 0);
        assert!(store
            .get_all_for_user(ALICE)
            .await
            .values()
            .all(|count| *count == 0));
        assert!(matches!(
            store.increment(ALICE, CounterType::UnreadMessages, 1).await,
            Err(Error::BackendUnavailable(_))
        ));
        assert!(store.reset(ALICE, CounterType::UnreadMessages).await.is_err());

        cache.set_available(true);
        assert_eq!(store.get(ALICE, CounterType::UnreadMessages).await, 2);
    }
}
