use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::{LockResultExt, StorageError};
use crate::store::{SequenceRecord, SequenceStore};

/// Process-local store. One mutex guards the read-modify-write of every key.
pub struct MemorySequenceStore {
    records: Mutex<HashMap<String, SequenceRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemorySequenceStore {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemorySequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    async fn get_last(&self, key: &str) -> Result<u64, StorageError> {
        let records = self.records.lock().map_lock_err()?;
        Ok(records.get(key).map_or(0, |r| r.last_value))
    }

    async fn get_record(&self, key: &str) -> Result<Option<SequenceRecord>, StorageError> {
        let records = self.records.lock().map_lock_err()?;
        Ok(records.get(key).cloned())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn increment_bounded(&self, key: &str, max: u64) -> Result<u64, StorageError> {
        let mut records = self.records.lock().map_lock_err()?;
        let next = SequenceRecord::advance(
            records.get(key),
            key,
            self.clock.current_period(),
            self.clock.now(),
            max,
        )?;
        let value = next.last_value;
        records.insert(key.to_string(), next);
        tracing::debug!(key, value, "sequence incremented");
        Ok(value)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reset(&self, key: &str, value: u64) -> Result<(), StorageError> {
        let mut records = self.records.lock().map_lock_err()?;
        let record =
            SequenceRecord::reset(key, value, self.clock.current_period(), self.clock.now());
        records.insert(key.to_string(), record);
        tracing::debug!(key, value, "sequence reset");
        Ok(())
    }
}
