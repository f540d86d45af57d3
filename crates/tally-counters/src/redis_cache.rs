//! Redis-backed scripted cache
//!
//! [`RedisCache`] loads the counter scripts with `SCRIPT LOAD` and runs them
//! with `EVALSHA`, so every process pointed at the same server shares one set
//! of counters. A `NOSCRIPT` reply surfaces as [`Error::ScriptUnavailable`]
//! and the counter store drops to its non-atomic path.
//!
//! Lua numbers are doubles, so the scripts never do arithmetic on versions as
//! numbers: versions are read out of the stored JSON as digit strings and
//! incremented as decimals. Counts and timestamps stay well inside the exact
//! integer range of a double.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tally_common::{Error, Result};
use tracing::{debug, info};

use crate::cache::CacheBackend;
use crate::script::{CounterRecord, Script, ScriptCall, ScriptReply};

/// Error code the scripts raise for a stored value that is not a counter record
const CORRUPT_CODE: &str = "CORRUPT";

const PRELUDE: &str = r#"
local function load_record(key)
  local raw = redis.call('GET', key)
  if not raw then
    return { count = 0, version = '0' }
  end
  local ok, decoded = pcall(cjson.decode, raw)
  if not ok or type(decoded) ~= 'table' then
    return nil
  end
  return {
    count = tonumber(string.match(raw, '"count"%s*:%s*(%-?%d+)')) or 0,
    version = string.match(raw, '"version"%s*:%s*(%-?%d+)') or '0',
  }
end

local function next_version(v)
  if string.sub(v, 1, 1) == '-' then
    return string.format('%d', tonumber(v) + 1)
  end
  local digits = {}
  for i = 1, #v do
    digits[i] = string.byte(v, i) - 48
  end
  local i = #digits
  while i > 0 do
    if digits[i] < 9 then
      digits[i] = digits[i] + 1
      break
    end
    digits[i] = 0
    i = i - 1
  end
  local out = {}
  if i == 0 then
    out[1] = '1'
  end
  for j = 1, #digits do
    out[#out + 1] = string.char(digits[j] + 48)
  end
  return table.concat(out)
end

local function encode_record(count, updated_at, version)
  return string.format('{"count":%d,"updated_at":%d,"version":%s}', count, updated_at, version)
end
"#;

// KEYS[1] counter; ARGV delta, timestamp, expected version ('' = none), ttl
const INCREMENT_BODY: &str = r#"
local current = load_record(KEYS[1])
if not current then
  return redis.error_reply('CORRUPT ' .. KEYS[1])
end
local expected = ARGV[3]
if expected ~= '' and expected ~= current.version then
  return { 'mismatch', current.version }
end
local count = math.max(0, current.count + tonumber(ARGV[1]))
local value = encode_record(count, tonumber(ARGV[2]), next_version(current.version))
redis.call('SET', KEYS[1], value, 'EX', ARGV[4])
return { 'applied', value }
"#;

// KEYS[1] counter
const READ_BODY: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return false
end
return raw
";

// KEYS counters; ARGV timestamp, ttl, then one delta per key
const BATCH_BODY: &str = r"
local staged = {}
local order = {}
local counts = {}
for i, key in ipairs(KEYS) do
  local current = staged[key]
  if not current then
    current = load_record(key)
    if not current then
      return redis.error_reply('CORRUPT ' .. key)
    end
    order[#order + 1] = key
  end
  local count = math.max(0, current.count + tonumber(ARGV[i + 2]))
  staged[key] = { count = count, version = next_version(current.version) }
  counts[i] = count
end
for _, key in ipairs(order) do
  local record = staged[key]
  local value = encode_record(record.count, tonumber(ARGV[1]), record.version)
  redis.call('SET', key, value, 'EX', ARGV[2])
end
return counts
";

/// Full Lua source of a counter script
#[must_use]
pub fn script_source(script: Script) -> String {
    let body = match script {
        Script::Increment => INCREMENT_BODY,
        Script::Read => READ_BODY,
        Script::BatchIncrement => BATCH_BODY,
    };
    format!("{PRELUDE}{body}")
}

/// Counter cache on a Redis server
pub struct RedisCache {
    conn: ConnectionManager,
    shas: RwLock<HashMap<Script, String>>,
}

impl RedisCache {
    /// Connect to the server at `url` (`redis://host:port/db`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid cache url {url}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::unavailable(format!("cache at {url}: {e}")))?;
        info!("Connected to cache at {}", url);
        Ok(Self {
            conn,
            shas: RwLock::new(HashMap::new()),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd, script: Option<Script>) -> Result<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| map_error(&e, script))
    }
}

fn map_error(err: &RedisError, script: Option<Script>) -> Error {
    if err.kind() == ErrorKind::NoScriptError {
        let name = script.map_or("unknown", |s| s.name());
        return Error::ScriptUnavailable(name.to_string());
    }
    if err.code() == Some(CORRUPT_CODE) {
        return Error::Serialization(err.to_string());
    }
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return Error::unavailable(err.to_string());
    }
    Error::storage(err.to_string())
}

/// `EX` takes whole seconds and rejects 0
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn parse_increment_reply(reply: &[String]) -> Result<ScriptReply> {
    match reply {
        [tag, value] if tag == "applied" => Ok(ScriptReply::Applied(CounterRecord::decode(value)?)),
        [tag, version] if tag == "mismatch" => version
            .parse()
            .map(|stored| ScriptReply::VersionMismatch { stored })
            .map_err(|e| Error::Serialization(format!("stored version {version}: {e}"))),
        other => Err(Error::internal(format!(
            "unexpected reply from increment script: {other:?}"
        ))),
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn load_script(&self, script: Script) -> Result<()> {
        let sha: String = self
            .query(
                redis::cmd("SCRIPT").arg("LOAD").arg(script_source(script)),
                Some(script),
            )
            .await?;
        debug!("Loaded cache script {} as {}", script.name(), sha);
        self.shas.write().insert(script, sha);
        Ok(())
    }

    async fn eval(&self, call: ScriptCall) -> Result<ScriptReply> {
        let script = call.script();
        let sha = self
            .shas
            .read()
            .get(&script)
            .cloned()
            .ok_or_else(|| Error::ScriptUnavailable(script.name().to_string()))?;

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&sha);
        match call {
            ScriptCall::Read { key } => {
                cmd.arg(1).arg(key);
                let raw: Option<String> = self.query(&cmd, Some(script)).await?;
                let record = raw.map(|r| CounterRecord::decode(&r)).transpose()?;
                Ok(ScriptReply::Record(record))
            }
            ScriptCall::Increment {
                key,
                delta,
                timestamp,
                expected_version,
                ttl,
            } => {
                cmd.arg(1)
                    .arg(key)
                    .arg(delta)
                    .arg(timestamp)
                    .arg(expected_version.map(|v| v.to_string()).unwrap_or_default())
                    .arg(ttl_secs(ttl));
                let reply: Vec<String> = self.query(&cmd, Some(script)).await?;
                parse_increment_reply(&reply)
            }
            ScriptCall::BatchIncrement {
                timestamp,
                entries,
                ttl,
            } => {
                cmd.arg(entries.len());
                for (key, _) in &entries {
                    cmd.arg(key);
                }
                cmd.arg(timestamp).arg(ttl_secs(ttl));
                for (_, delta) in &entries {
                    cmd.arg(*delta);
                }
                let counts: Vec<i64> = self.query(&cmd, Some(script)).await?;
                Ok(ScriptReply::Counts(counts))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key), None).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Result<Option<String>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = self.query(redis::cmd("MGET").arg(keys), None).await?;
        Ok(values.into_iter().map(Ok).collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs(ttl));
        self.query(&cmd, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMetrics;
    use crate::store::CounterStore;
    use std::sync::Arc;
    use tally_common::config::CacheConfig;
    use tally_common::{CounterType, UserId};

    #[test]
    fn test_noscript_maps_to_script_unavailable() {
        let err = RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT"));
        assert!(matches!(
            map_error(&err, Some(Script::BatchIncrement)),
            Error::ScriptUnavailable(name) if name == "batch_increment"
        ));
    }

    #[test]
    fn test_connection_errors_map_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = RedisError::from(io);
        assert!(matches!(
            map_error(&err, None),
            Error::BackendUnavailable(_)
        ));

        let err = RedisError::from((ErrorKind::TypeError, "wrong type"));
        assert!(matches!(map_error(&err, None), Error::Storage(_)));
    }

    #[test]
    fn test_increment_replies() {
        let applied = vec![
            "applied".to_string(),
            r#"{"count":3,"updated_at":10,"version":1700000000000000001}"#.to_string(),
        ];
        assert_eq!(
            parse_increment_reply(&applied).unwrap(),
            ScriptReply::Applied(CounterRecord {
                count: 3,
                updated_at: 10,
                version: 1_700_000_000_000_000_001,
            })
        );

        let mismatch = vec!["mismatch".to_string(), "7".to_string()];
        assert_eq!(
            parse_increment_reply(&mismatch).unwrap(),
            ScriptReply::VersionMismatch { stored: 7 }
        );

        assert!(parse_increment_reply(&["what".to_string()]).is_err());
    }

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86_400)), 86_400);
    }

    #[test]
    fn test_sources_share_the_prelude() {
        for script in Script::ALL {
            let source = script_source(script);
            assert!(source.contains("local function load_record"));
        }
        assert!(script_source(Script::Increment).contains("'mismatch'"));
        assert!(script_source(Script::BatchIncrement).contains("ipairs(KEYS)"));
    }

    async fn store_on(url: &str) -> CounterStore {
        let cache = Arc::new(RedisCache::connect(url).await.unwrap());
        let store = CounterStore::new(
            cache,
            &CacheConfig::default(),
            Arc::new(CounterMetrics::new()),
        );
        store.prepare().await;
        store
    }

    #[tokio::test]
    #[ignore = "needs a redis server at TALLY_TEST_REDIS_URL"]
    async fn test_two_connections_share_counters() {
        let url = std::env::var("TALLY_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let a = store_on(&url).await;
        let b = store_on(&url).await;
        let user = UserId::new(i64::from(std::process::id()));

        a.reset(user, CounterType::UnreadMessages).await.unwrap();
        a.increment(user, CounterType::UnreadMessages, 2).await.unwrap();
        assert_eq!(b.get(user, CounterType::UnreadMessages).await, 2);

        // Nanosecond versions from set_exact survive the script exactly
        let exact = b.set_exact(user, CounterType::UnreadMessages, 5).await.unwrap();
        let next = a
            .increment_versioned(user, CounterType::UnreadMessages, -1, exact.version)
            .await
            .unwrap();
        assert_eq!(next.count, 4);
        assert_eq!(next.version, exact.version + 1);

        assert!(matches!(
            b.increment_versioned(user, CounterType::UnreadMessages, 1, exact.version)
                .await,
            Err(Error::VersionMismatch { .. })
        ));

        let key = tally_common::CounterKey::new(user, CounterType::UnreadMessages);
        assert_eq!(b.batch_increment(&[(key, 1), (key, -10)]).await.unwrap(), vec![5, 0]);
        assert_eq!(a.get(user, CounterType::UnreadMessages).await, 0);
    }
}
