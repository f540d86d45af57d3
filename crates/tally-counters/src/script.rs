//! Atomic counter scripts
//!
//! The cache executes three named scripts. Each one runs atomically on the
//! cache side, so a read-modify-write of a counter never interleaves with
//! another writer. The bodies are pure functions over [`CounterRecord`] so the
//! cache host and the non-atomic fallback path compute exactly the same thing.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_common::{Counter, CounterKey, Error, Result};

/// JSON value stored under a counter's cache key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub version: i64,
}

impl CounterRecord {
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    #[must_use]
    pub const fn into_counter(self, key: CounterKey) -> Counter {
        Counter {
            user_id: key.user_id,
            counter_type: key.counter_type,
            count: self.count,
            updated_at: self.updated_at,
            version: self.version,
        }
    }
}

/// Names of the scripts a cache must have loaded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Script {
    Increment,
    Read,
    BatchIncrement,
}

impl Script {
    pub const ALL: [Self; 3] = [Self::Increment, Self::Read, Self::BatchIncrement];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Increment => "increment",
            Self::Read => "read",
            Self::BatchIncrement => "batch_increment",
        }
    }
}

/// A script invocation with its keys and arguments
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptCall {
    Increment {
        key: String,
        delta: i64,
        /// Unix seconds stamped into `updated_at`
        timestamp: i64,
        expected_version: Option<i64>,
        ttl: Duration,
    },
    Read {
        key: String,
    },
    BatchIncrement {
        timestamp: i64,
        entries: Vec<(String, i64)>,
        ttl: Duration,
    },
}

impl ScriptCall {
    #[must_use]
    pub const fn script(&self) -> Script {
        match self {
            Self::Increment { .. } => Script::Increment,
            Self::Read { .. } => Script::Read,
            Self::BatchIncrement { .. } => Script::BatchIncrement,
        }
    }
}

/// What a script returned
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptReply {
    /// The increment was applied; carries the stored record
    Applied(CounterRecord),
    /// The expected version did not match; nothing was written
    VersionMismatch { stored: i64 },
    /// Result of the read script
    Record(Option<CounterRecord>),
    /// New counts of a batch, in input order
    Counts(Vec<i64>),
}

/// Outcome of the increment body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncrementOutcome {
    Applied(CounterRecord),
    VersionMismatch { stored: i64 },
}

/// Body of the increment script.
///
/// The count is clamped at zero and the version always moves forward by one.
/// A version check only happens when `expected_version` is given.
#[must_use]
pub fn apply_increment(
    current: Option<CounterRecord>,
    delta: i64,
    timestamp: i64,
    expected_version: Option<i64>,
) -> IncrementOutcome {
    let current = current.unwrap_or_default();
    if let Some(expected) = expected_version
        && expected != current.version
    {
        return IncrementOutcome::VersionMismatch {
            stored: current.version,
        };
    }

    IncrementOutcome::Applied(CounterRecord {
        count: current.count.saturating_add(delta).max(0),
        updated_at: timestamp,
        version: current.version.saturating_add(1),
    })
}
