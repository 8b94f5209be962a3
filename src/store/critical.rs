use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::StorageError;

/// How a durable store serializes writers to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Rely on the backend's own atomic primitive (compare-and-swap, server
    /// side script). Safe across processes sharing the backend.
    #[default]
    Native,
    /// Serialize every write through one mutex in this process.
    ///
    /// Only protects against writers inside the current process. Other
    /// processes pointing at the same file or server are not excluded.
    Process,
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(LockMode::Native),
            "process" => Ok(LockMode::Process),
            other => Err(format!("unknown lock mode {other:?}, expected native or process")),
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Native => f.write_str("native"),
            LockMode::Process => f.write_str("process"),
        }
    }
}

/// Scope of exactly one increment or reset.
#[derive(Debug)]
pub enum CriticalSection {
    Native,
    Process(Mutex<()>),
}

/// Held for the duration of one store operation; releases on drop.
#[derive(Debug)]
pub struct SectionGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl CriticalSection {
    pub fn new(mode: LockMode) -> Self {
        match mode {
            LockMode::Native => CriticalSection::Native,
            LockMode::Process => CriticalSection::Process(Mutex::new(())),
        }
    }

    pub fn mode(&self) -> LockMode {
        match self {
            CriticalSection::Native => LockMode::Native,
            CriticalSection::Process(_) => LockMode::Process,
        }
    }

    /// Enters the section, waiting at most `timeout` for the process mutex.
    pub async fn enter(&self, timeout: Duration) -> Result<SectionGuard<'_>, StorageError> {
        match self {
            CriticalSection::Native => Ok(SectionGuard { _guard: None }),
            CriticalSection::Process(mutex) => {
                let guard = tokio::time::timeout(timeout, mutex.lock())
                    .await
                    .map_err(|_| StorageError::LockTimeout(timeout))?;
                Ok(SectionGuard {
                    _guard: Some(guard),
                })
            }
        }
    }
}
