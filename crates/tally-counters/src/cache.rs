//! Key-value cache seam
//!
//! [`CacheBackend`] is what the counter store needs from a scripted cache:
//! plain reads and writes with a TTL, a pipelined multi-get and evaluation of
//! the loaded [`Script`]s. [`crate::RedisCache`] is the shared production
//! backend; [`MemoryCache`] hosts the scripts in process for tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tally_common::{Error, Result};
use tracing::debug;

use crate::script::{
    CounterRecord, IncrementOutcome, Script, ScriptCall, ScriptReply, apply_increment,
};

/// Sweep expired keys once every this many writes
const PURGE_EVERY_WRITES: u64 = 1024;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Make `script` available to [`CacheBackend::eval`]
    async fn load_script(&self, script: Script) -> Result<()>;

    /// Run a loaded script atomically.
    ///
    /// Fails with [`Error::ScriptUnavailable`] when the script is not loaded.
    async fn eval(&self, call: ScriptCall) -> Result<ScriptReply>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read many keys in one round trip; each key has its own result
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Result<Option<String>>>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process scripted cache.
///
/// Every script runs under the single write lock, which gives the same
/// one-at-a-time execution a scripted cache server provides. Keys expire
/// lazily on access and in periodic sweeps.
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    scripts: RwLock<HashSet<Script>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            scripts: RwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate the cache going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Forget every loaded script, as a cache restart would
    pub fn flush_scripts(&self) {
        self.scripts.write().clear();
    }

    /// Remaining time to live of a key, `None` when absent or expired
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }

    /// Drop expired keys; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Purged {} expired cache keys", removed);
        }
        removed
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable("cache connection refused"))
        }
    }

    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }
}

fn live_record(
    entries: &HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Result<Option<CounterRecord>> {
    entries
        .get(key)
        .filter(|e| e.is_live(now))
        .map(|e| CounterRecord::decode(&e.value))
        .transpose()
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn load_script(&self, script: Script) -> Result<()> {
        self.check_available()?;
        self.scripts.write().insert(script);
        debug!("Loaded cache script {}", script.name());
        Ok(())
    }

    async fn eval(&self, call: ScriptCall) -> Result<ScriptReply> {
        self.check_available()?;
        let script = call.script();
        if !self.scripts.read().contains(&script) {
            return Err(Error::ScriptUnavailable(script.name().to_string()));
        }

        let now = Instant::now();
        let reply = {
            let mut entries = self.entries.write();
            match call {
                ScriptCall::Read { key } => {
                    return Ok(ScriptReply::Record(live_record(&entries, &key, now)?));
                }
                ScriptCall::Increment {
                    key,
                    delta,
                    timestamp,
                    expected_version,
                    ttl,
                } => {
                    let current = live_record(&entries, &key, now)?;
                    match apply_increment(current, delta, timestamp, expected_version) {
                        IncrementOutcome::Applied(record) => {
                            let value = record.encode()?;
                            entries.insert(
                                key,
                                Entry {
                                    value,
                                    expires_at: now + ttl,
                                },
                            );
                            ScriptReply::Applied(record)
                        }
                        IncrementOutcome::VersionMismatch { stored } => {
                            return Ok(ScriptReply::VersionMismatch { stored });
                        }
                    }
                }
                ScriptCall::BatchIncrement {
                    timestamp,
                    entries: items,
                    ttl,
                } => {
                    // Stage every write first so a bad stored value aborts
                    // the whole batch without partial effects
                    let mut staged: HashMap<String, CounterRecord> = HashMap::new();
                    let mut counts = Vec::with_capacity(items.len());
                    for (key, delta) in items {
                        let current = match staged.get(&key) {
                            Some(record) => Some(*record),
                            None => live_record(&entries, &key, now)?,
                        };
                        if let IncrementOutcome::Applied(record) =
                            apply_increment(current, delta, timestamp, None)
                        {
                            counts.push(record.count);
                            staged.insert(key, record);
                        }
                    }
                    for (key, record) in staged {
                        let value = record.encode()?;
                        entries.insert(
                            key,
                            Entry {
                                value,
                                expires_at: now + ttl,
                            },
                        );
                    }
                    ScriptReply::Counts(counts)
                }
            }
        };

        self.note_write();
        Ok(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Result<Option<String>>>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .map(|key| {
                Ok(entries
                    .get(key)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value.clone()))
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.note_write();
        Ok(())
    }
}
