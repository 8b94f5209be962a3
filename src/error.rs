use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Every failure `NumberGenerator` can surface.
#[derive(Error, Debug)]
pub enum NumberError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("no template registered for key {0:?}")]
    TemplateNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl NumberError {
    /// Short, stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NumberError::Template(_) => "template",
            NumberError::TemplateNotFound(_) => "template_not_found",
            NumberError::Storage(_) => "storage",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder {{{token}}}; valid placeholders are {valid}")]
    UnknownPlaceholder { token: String, valid: &'static str },

    #[error("unclosed '{{' at byte {position} in template {pattern:?}")]
    UnclosedDelimiter { pattern: String, position: usize },

    #[error("unmatched '}}' at byte {position} in template {pattern:?}")]
    UnmatchedDelimiter { pattern: String, position: usize },

    #[error("pad width must be greater than zero")]
    ZeroPadWidth,

    #[error("pad width {width} exceeds the maximum of {max}")]
    PadWidthTooLarge { width: usize, max: usize },

    #[error("number {value} does not fit in {width} characters")]
    NumberOverflow { value: u64, width: usize },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out after {0:?} waiting for the store lock")]
    LockTimeout(Duration),

    #[error("timed out after {0:?} connecting to the store")]
    ConnectTimeout(Duration),

    #[error("store command timed out after {0:?}; outcome unknown")]
    CommandTimeout(Duration),

    #[error("concurrent update conflict on key {0:?}")]
    Conflict(String),

    #[error("schema mismatch: store has version {found:?}, expected {expected:?}")]
    SchemaMismatch { found: String, expected: String },

    #[error("corrupt record for key {key:?}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("counter for key {0:?} is exhausted")]
    Exhausted(String),

    #[error("next value {next} for key {key:?} exceeds the limit {max}")]
    LimitExceeded { key: String, next: u64, max: u64 },

    #[error("value {value} for key {key:?} is out of range (max {max})")]
    OutOfRange { key: String, value: u64, max: u64 },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("invalid store descriptor: {0}")]
    InvalidDescriptor(String),
}

impl StorageError {
    /// Whether the failed operation left no trace and may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::LockTimeout(_)
            | StorageError::ConnectTimeout(_)
            | StorageError::Conflict(_) => true,
            // another handle (or its background flusher) still holds the directory lock
            StorageError::Sled(sled::Error::Io(e)) => {
                e.kind() == std::io::ErrorKind::WouldBlock
            }
            StorageError::Redis(e) => {
                e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            _ => false,
        }
    }
}

/// Extension trait for converting lock errors to StorageError.
pub trait LockResultExt<T> {
    fn map_lock_err(self) -> Result<T, StorageError>;
}

impl<'a, T> LockResultExt<MutexGuard<'a, T>>
    for Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>
{
    #[inline]
    fn map_lock_err(self) -> Result<MutexGuard<'a, T>, StorageError> {
        self.map_err(|e| StorageError::LockPoisoned(e.to_string()))
    }
}
