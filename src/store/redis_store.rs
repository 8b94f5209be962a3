use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult, Script};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::store::{
    CriticalSection, LockMode, RetryPolicy, SequenceRecord, SequenceStore, StoreOptions,
};

const SCHEMA_VERSION: &str = "1";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Redis hash integers are signed 64-bit.
const MAX_STORED_VALUE: u64 = i64::MAX as u64;

// KEYS[1] record hash; ARGV: key, period, updated_at, max.
// Values stay decimal strings: Lua numbers are doubles and lose precision
// above 2^53, so comparisons are done on the digits and HINCRBY does the
// arithmetic server side.
const INCREMENT_SCRIPT: &str = r#"
local function at_least(a, b)
  if #a ~= #b then return #a > #b end
  return a >= b
end
local period = ARGV[2]
local stored = redis.call('HGET', KEYS[1], 'last_reset_period')
local current = redis.call('HGET', KEYS[1], 'last_value')
if stored == period and current then
  if at_least(current, ARGV[4]) then
    return redis.error_reply('LIMIT ' .. current)
  end
  if at_least(current, '9223372036854775807') then
    return redis.error_reply('EXHAUSTED ' .. current)
  end
  redis.call('HINCRBY', KEYS[1], 'last_value', 1)
  redis.call('HSET', KEYS[1], 'key', ARGV[1], 'updated_at', ARGV[3])
else
  redis.call('HSET', KEYS[1], 'key', ARGV[1], 'last_value', '1',
    'last_reset_period', period, 'updated_at', ARGV[3])
end
return redis.call('HGET', KEYS[1], 'last_value')
"#;

/// Redis-backed store.
///
/// Increments run as a Lua script, which Redis executes atomically, so the
/// read, the rollover decision and the write cannot interleave with any other
/// client. Creation is part of the same script, so two first increments can
/// never both return 1.
///
/// Every command is bounded by the lock timeout. A command that times out
/// may still have been applied, so it is reported as
/// [`StorageError::CommandTimeout`] and never retried.
pub struct RedisSequenceStore {
    connection: MultiplexedConnection,
    prefix: String,
    increment_script: Script,
    section: CriticalSection,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RedisSequenceStore {
    pub async fn connect(
        redis_url: &str,
        options: &StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let client = &Client::open(redis_url)?;
        let timeout = options.retry.lock_timeout();
        let connection = options
            .retry
            .run("connect", redis_url, move || async move {
                tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
                    .await
                    .map_err(|_| StorageError::ConnectTimeout(timeout))?
                    .map_err(StorageError::from)
            })
            .await?;

        let store = RedisSequenceStore {
            connection,
            prefix: options.redis_prefix.clone(),
            increment_script: Script::new(INCREMENT_SCRIPT),
            section: CriticalSection::new(options.lock_mode),
            retry: options.retry.clone(),
            clock,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn lock_mode(&self) -> LockMode {
        self.section.mode()
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:seq:{}", self.prefix, key)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let schema_key = format!("{}:schema", self.prefix);
        let timeout = self.retry.lock_timeout();
        let _: bool = bounded(timeout, conn.set_nx(&schema_key, SCHEMA_VERSION)).await?;
        let found: String = bounded(timeout, conn.get(&schema_key)).await?;
        if found != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION.to_string(),
            });
        }
        Ok(())
    }

    async fn increment_once(&self, key: &str, max: u64) -> Result<u64, StorageError> {
        let _guard = self.section.enter(self.retry.lock_timeout()).await?;
        let mut conn = self.connection.clone();
        let now = self.clock.now();

        let mut invocation = self.increment_script.key(self.record_key(key));
        invocation
            .arg(key)
            .arg(self.clock.current_period())
            .arg(now.format(TIMESTAMP_FORMAT).to_string())
            .arg(max);
        let value: u64 = bounded(self.retry.lock_timeout(), invocation.invoke_async(&mut conn))
            .await
            .map_err(|e| script_error(key, max, e))?;

        tracing::debug!(key, value, "sequence incremented");
        Ok(value)
    }

    async fn reset_once(&self, key: &str, value: u64) -> Result<(), StorageError> {
        if value > MAX_STORED_VALUE {
            return Err(StorageError::OutOfRange {
                key: key.to_string(),
                value,
                max: MAX_STORED_VALUE,
            });
        }
        let _guard = self.section.enter(self.retry.lock_timeout()).await?;
        let mut conn = self.connection.clone();
        let now = self.clock.now();

        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.record_key(key))
            .arg("key")
            .arg(key)
            .arg("last_value")
            .arg(value)
            .arg("last_reset_period")
            .arg(self.clock.current_period())
            .arg("updated_at")
            .arg(now.format(TIMESTAMP_FORMAT).to_string());
        bounded(
            self.retry.lock_timeout(),
            cmd.query_async::<_, ()>(&mut conn),
        )
        .await?;

        tracing::debug!(key, value, "sequence reset");
        Ok(())
    }
}

/// Runs one Redis command under `timeout`.
async fn bounded<T, F>(timeout: Duration, command: F) -> Result<T, StorageError>
where
    F: Future<Output = RedisResult<T>>,
{
    tokio::time::timeout(timeout, command)
        .await
        .map_err(|_| StorageError::CommandTimeout(timeout))?
        .map_err(StorageError::from)
}

/// Translates the increment script's error replies.
fn script_error(key: &str, max: u64, err: StorageError) -> StorageError {
    let StorageError::Redis(redis_err) = err else {
        return err;
    };
    match redis_err.code() {
        Some("LIMIT") => StorageError::LimitExceeded {
            key: key.to_string(),
            next: current_from(&redis_err).saturating_add(1),
            max,
        },
        Some("EXHAUSTED") => StorageError::Exhausted(key.to_string()),
        _ => StorageError::Redis(redis_err),
    }
}

fn current_from(err: &RedisError) -> u64 {
    err.detail()
        .and_then(|d| d.trim().parse().ok())
        .unwrap_or(MAX_STORED_VALUE)
}

fn parse_record(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<SequenceRecord, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };

    Ok(SequenceRecord {
        key: key.to_string(),
        last_value: field("last_value")?
            .parse()
            .map_err(|e| corrupt(format!("last_value: {e}")))?,
        last_reset_period: field("last_reset_period")?
            .parse()
            .map_err(|e| corrupt(format!("last_reset_period: {e}")))?,
        updated_at: NaiveDateTime::parse_from_str(field("updated_at")?, TIMESTAMP_FORMAT)
            .map_err(|e| corrupt(format!("updated_at: {e}")))?,
    })
}

#[async_trait]
impl SequenceStore for RedisSequenceStore {
    async fn get_last(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = bounded(
            self.retry.lock_timeout(),
            conn.hget(self.record_key(key), "last_value"),
        )
        .await?;
        Ok(value.unwrap_or(0))
    }

    async fn get_record(&self, key: &str) -> Result<Option<SequenceRecord>, StorageError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> =
            bounded(self.retry.lock_timeout(), conn.hgetall(self.record_key(key))).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(key, &fields).map(Some)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn increment_bounded(&self, key: &str, max: u64) -> Result<u64, StorageError> {
        self.retry
            .run("increment", key, || self.increment_once(key, max))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reset(&self, key: &str, value: u64) -> Result<(), StorageError> {
        self.retry
            .run("reset", key, || self.reset_once(key, value))
            .await
    }
}
