use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sled::{Db, IVec, Tree};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::store::{
    CriticalSection, LockMode, RetryPolicy, SequenceRecord, SequenceStore, StoreOptions,
};

const RECORDS_TREE: &str = "sequence_records";
const META_TREE: &str = "numgen_meta";
const SCHEMA_KEY: &str = "schema_version";
const SCHEMA_VERSION: &str = "1";
const OPEN_MIN_RETRIES: usize = 8;

/// Embedded-file store backed by a sled database.
///
/// In [`LockMode::Native`] each increment is a compare-and-swap against the
/// record it read; a lost race surfaces as a conflict and is retried. sled
/// holds an exclusive lock on its directory, so one process owns the file.
/// Every write is flushed before the call returns.
pub struct SledSequenceStore {
    db: Db,
    records: Tree,
    section: CriticalSection,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SledSequenceStore {
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: &StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        // A just-dropped handle on the same directory can keep its file lock
        // until sled's flusher thread exits.
        let open_retry = RetryPolicy {
            max_retries: options.retry.max_retries.max(OPEN_MIN_RETRIES),
            ..options.retry.clone()
        };
        let db = open_retry.run_blocking("open", &path.display().to_string(), || {
            sled::open(path).map_err(StorageError::from)
        })?;
        ensure_schema(&db)?;
        let records = db.open_tree(RECORDS_TREE)?;

        Ok(SledSequenceStore {
            db,
            records,
            section: CriticalSection::new(options.lock_mode),
            retry: options.retry.clone(),
            clock,
        })
    }

    pub fn lock_mode(&self) -> LockMode {
        self.section.mode()
    }

    fn decode(&self, key: &str, bytes: &IVec) -> Result<SequenceRecord, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn increment_once(&self, key: &str, max: u64) -> Result<u64, StorageError> {
        let _guard = self.section.enter(self.retry.lock_timeout()).await?;

        let current = self.records.get(key)?;
        let previous = current
            .as_ref()
            .map(|bytes| self.decode(key, bytes))
            .transpose()?;
        let next = SequenceRecord::advance(
            previous.as_ref(),
            key,
            self.clock.current_period(),
            self.clock.now(),
            max,
        )?;
        let encoded = serde_json::to_vec(&next)?;

        if self
            .records
            .compare_and_swap(key, current, Some(encoded))?
            .is_err()
        {
            return Err(StorageError::Conflict(key.to_string()));
        }
        // flush_async stalls when several writers await it at once
        self.records.flush()?;

        tracing::debug!(key, value = next.last_value, "sequence incremented");
        Ok(next.last_value)
    }

    async fn reset_once(&self, key: &str, value: u64) -> Result<(), StorageError> {
        let _guard = self.section.enter(self.retry.lock_timeout()).await?;

        let record =
            SequenceRecord::reset(key, value, self.clock.current_period(), self.clock.now());
        self.records.insert(key, serde_json::to_vec(&record)?)?;
        self.records.flush()?;

        tracing::debug!(key, value, "sequence reset");
        Ok(())
    }
}

fn ensure_schema(db: &Db) -> Result<(), StorageError> {
    let meta = db.open_tree(META_TREE)?;
    let outcome = meta.compare_and_swap(
        SCHEMA_KEY,
        None::<&[u8]>,
        Some(SCHEMA_VERSION.as_bytes()),
    )?;
    if let Err(existing) = outcome {
        let found = existing
            .current
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default();
        if found != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION.to_string(),
            });
        }
    }
    db.flush()?;
    Ok(())
}

impl Drop for SledSequenceStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::warn!(error = %e, "failed to flush sled store on drop");
        }
    }
}

#[async_trait]
impl SequenceStore for SledSequenceStore {
    async fn get_last(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.get_record(key).await?.map_or(0, |r| r.last_value))
    }

    async fn get_record(&self, key: &str) -> Result<Option<SequenceRecord>, StorageError> {
        self.records
            .get(key)?
            .map(|bytes| self.decode(key, &bytes))
            .transpose()
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
