//! Persistent per-key counters with yearly rollover.
//!
//! Every backend implements [`SequenceStore`]; callers hold an
//! `Arc<dyn SequenceStore>` and never depend on a concrete variant.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::StorageError;

mod critical;
mod memory;
mod redis_store;
mod retry;
mod sled_store;

pub use self::critical::{CriticalSection, LockMode, SectionGuard};
pub use self::memory::MemorySequenceStore;
pub use self::redis_store::RedisSequenceStore;
pub use self::retry::RetryPolicy;
pub use self::sled_store::SledSequenceStore;

#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Current `last_value` for `key`, or 0 if the key was never incremented.
    async fn get_last(&self, key: &str) -> Result<u64, StorageError>;

    /// Full persisted record for `key`, if one exists.
    async fn get_record(&self, key: &str) -> Result<Option<SequenceRecord>, StorageError>;

    /// Atomically advances the counter for `key` and returns the new value.
    ///
    /// The first increment in a new period (calendar year) returns 1 and
    /// discards the previous value.
    async fn increment(&self, key: &str) -> Result<u64, StorageError> {
        self.increment_bounded(key, u64::MAX).await
    }

    /// Like [`increment`](Self::increment), but fails with
    /// [`StorageError::LimitExceeded`] without writing anything when the new
    /// value would be greater than `max`.
    async fn increment_bounded(&self, key: &str, max: u64) -> Result<u64, StorageError>;

    /// Sets `last_value` to `value` and marks the record as reset in the
    /// current period, creating it if needed.
    async fn reset(&self, key: &str, value: u64) -> Result<(), StorageError>;
}

/// One counter as persisted by the durable backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub key: String,
    pub last_value: u64,
    pub last_reset_period: i32,
    pub updated_at: NaiveDateTime,
}

impl SequenceRecord {
    /// Applies the rollover policy to `previous` and returns the successor.
    ///
    /// Fails instead of producing a value above `max`.
    pub fn advance(
        previous: Option<&SequenceRecord>,
        key: &str,
        period: i32,
        now: NaiveDateTime,
        max: u64,
    ) -> Result<SequenceRecord, StorageError> {
        let last_value = match previous {
            Some(record) if record.last_reset_period == period => record
                .last_value
                .checked_add(1)
                .ok_or_else(|| StorageError::Exhausted(key.to_string()))?,
            _ => 1,
        };
        if last_value > max {
            return Err(StorageError::LimitExceeded {
                key: key.to_string(),
                next: last_value,
                max,
            });
        }
        Ok(SequenceRecord {
            key: key.to_string(),
            last_value,
            last_reset_period: period,
            updated_at: now,
        })
    }

    pub fn reset(key: &str, value: u64, period: i32, now: NaiveDateTime) -> SequenceRecord {
        SequenceRecord {
            key: key.to_string(),
            last_value: value,
            last_reset_period: period,
            updated_at: now,
        }
    }
}

/// Which backend to open, parsed from a descriptor string.
///
/// - `memory`
/// - `sled:<path>` (or `sled://<path>`)
/// - `redis://…` / `rediss://…`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreDescriptor {
    Memory,
    Sled(PathBuf),
    Redis(String),
}

impl FromStr for StoreDescriptor {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            return Ok(StoreDescriptor::Memory);
        }
        if s.starts_with("redis://") || s.starts_with("rediss://") {
            return Ok(StoreDescriptor::Redis(s.to_string()));
        }
        if let Some(path) = s.strip_prefix("sled:") {
            let path = path.strip_prefix("//").unwrap_or(path);
            if path.is_empty() {
                return Err(StorageError::InvalidDescriptor(
                    "sled descriptor needs a path".to_string(),
                ));
            }
            return Ok(StoreDescriptor::Sled(PathBuf::from(path)));
        }
        Err(StorageError::InvalidDescriptor(s.to_string()))
    }
}

impl fmt::Display for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreDescriptor::Memory => f.write_str("memory"),
            StoreDescriptor::Sled(path) => write!(f, "sled:{}", path.display()),
            StoreDescriptor::Redis(url) => f.write_str(url),
        }
    }
}

/// Construction-time knobs shared by the durable backends.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub lock_mode: LockMode,
    pub retry: RetryPolicy,
    pub redis_prefix: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            lock_mode: LockMode::Native,
            retry: RetryPolicy::default(),
            redis_prefix: "numgen".to_string(),
        }
    }
}

/// Opens the backend named by `descriptor`, creating its schema if absent.
pub async fn open(
    descriptor: &StoreDescriptor,
    options: &StoreOptions,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SequenceStore>, StorageError> {
    tracing::info!(store = %descriptor, lock_mode = %options.lock_mode, "opening sequence store");
    let store: Arc<dyn SequenceStore> = match descriptor {
        StoreDescriptor::Memory => Arc::new(MemorySequenceStore::with_clock(clock)),
        StoreDescriptor::Sled(path) => Arc::new(SledSequenceStore::open(path, options, clock)?),
        StoreDescriptor::Redis(url) => {
            Arc::new(RedisSequenceStore::connect(url, options, clock).await?)
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon(year: i32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn advance_creates_first_record_at_one() {
        let record = SequenceRecord::advance(None, "inv", 2025, noon(2025), u64::MAX).unwrap();
        assert_eq!(record.last_value, 1);
        assert_eq!(record.last_reset_period, 2025);
        assert_eq!(record.key, "inv");
    }

    #[test]
    fn advance_increments_within_period() {
        let prev = SequenceRecord::reset("inv", 41, 2025, noon(2025));
        let next = SequenceRecord::advance(Some(&prev), "inv", 2025, noon(2025), u64::MAX).unwrap();
        assert_eq!(next.last_value, 42);
    }

    #[test]
    fn advance_rolls_over_in_new_period() {
        let prev = SequenceRecord::reset("inv", 9_000, 2024, noon(2024));
        let next = SequenceRecord::advance(Some(&prev), "inv", 2025, noon(2025), u64::MAX).unwrap();
        assert_eq!(next.last_value, 1);
        assert_eq!(next.last_reset_period, 2025);
    }

    #[test]
    fn advance_refuses_to_wrap() {
        let prev = SequenceRecord::reset("inv", u64::MAX, 2025, noon(2025));
        let err = SequenceRecord::advance(Some(&prev), "inv", 2025, noon(2025), u64::MAX).unwrap_err();
        assert!(matches!(err, StorageError::Exhausted(ref k) if k == "inv"));
    }

    #[test]
    fn advance_respects_limit() {
        let prev = SequenceRecord::reset("inv", 99, 2025, noon(2025));
        let err = SequenceRecord::advance(Some(&prev), "inv", 2025, noon(2025), 99).unwrap_err();
        assert!(matches!(
            err,
            StorageError::LimitExceeded { next: 100, max: 99, .. }
        ));

        // a new period restarts at 1, which is always within the limit
        let next = SequenceRecord::advance(Some(&prev), "inv", 2026, noon(2025), 99).unwrap();
        assert_eq!(next.last_value, 1);
    }

    #[test]
    fn descriptor_parsing() {
        assert_eq!(
            "memory".parse::<StoreDescriptor>().unwrap(),
            StoreDescriptor::Memory
        );
        assert_eq!(
            "sled:/var/lib/numgen".parse::<StoreDescriptor>().unwrap(),
            StoreDescriptor::Sled(PathBuf::from("/var/lib/numgen"))
        );
        assert_eq!(
            "sled://data/numgen.db".parse::<StoreDescriptor>().unwrap(),
            StoreDescriptor::Sled(PathBuf::from("data/numgen.db"))
        );
        assert_eq!(
            "redis://127.0.0.1:6379/0".parse::<StoreDescriptor>().unwrap(),
            StoreDescriptor::Redis("redis://127.0.0.1:6379/0".to_string())
        );
        assert!("sled:".parse::<StoreDescriptor>().is_err());
        assert!("postgres://localhost/db".parse::<StoreDescriptor>().is_err());
    }

    #[tokio::test]
    async fn open_memory_descriptor() {
        let store = open(
            &StoreDescriptor::Memory,
            &StoreOptions::default(),
            Arc::new(crate::clock::SystemClock),
        )
        .await
        .unwrap();
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }
}
