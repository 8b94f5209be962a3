use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use crate::generator::{NumberGenerator, PadDefaults};
use crate::padding::{OverflowPolicy, PadSide};
use crate::registry::{RegistryError, TemplateRegistry};
use crate::store::{self, LockMode, RetryPolicy, StoreDescriptor, StoreOptions};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// Everything needed to build a [`NumberGenerator`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreDescriptor,
    pub templates_file: Option<PathBuf>,
    pub defaults: PadDefaults,
    pub overflow: OverflowPolicy,
    pub store_options: StoreOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store: StoreDescriptor::Memory,
            templates_file: None,
            defaults: PadDefaults::default(),
            overflow: OverflowPolicy::default(),
            store_options: StoreOptions::default(),
        }
    }
}

impl Settings {
    /// Loads `.env` from the working directory, if present, then reads the
    /// environment. Variables already set take precedence over the file.
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Self::from_env()
    }

    /// Like [`load`](Self::load) with an explicit env file, which must exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::from_path(path.as_ref())?;
        Self::from_env()
    }

    /// Reads settings from `NUMGEN_*` environment variables.
    ///
    /// Unparseable numbers fall back to defaults; an unparseable store
    /// descriptor, pad side, pad char, overflow policy or lock mode is an
    /// error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Settings::default();

        let store = match var("NUMGEN_STORE") {
            Some(s) => s.parse()?,
            None => default.store,
        };
        let pad_char = match var("NUMGEN_DEFAULT_PAD_CHAR") {
            Some(s) => single_char(&s).ok_or(ConfigError::InvalidValue {
                name: "NUMGEN_DEFAULT_PAD_CHAR",
                reason: format!("expected exactly one character, got {s:?}"),
            })?,
            None => default.defaults.fill,
        };
        let pad_side: PadSide = parse_or("NUMGEN_DEFAULT_PAD_SIDE", default.defaults.side)?;
        let width = var("NUMGEN_DEFAULT_PAD")
            .and_then(|v| v.parse().ok())
            .filter(|w: &usize| *w > 0)
            .unwrap_or(default.defaults.width);

        Ok(Settings {
            store,
            templates_file: var("NUMGEN_TEMPLATES_FILE").map(PathBuf::from),
            defaults: PadDefaults {
                width,
                fill: pad_char,
                side: pad_side,
            },
            overflow: parse_or("NUMGEN_OVERFLOW", default.overflow)?,
            store_options: StoreOptions {
                lock_mode: parse_or::<LockMode>("NUMGEN_LOCK_MODE", LockMode::Native)?,
                retry: RetryPolicy::from_env(),
                redis_prefix: var("NUMGEN_REDIS_PREFIX")
                    .unwrap_or(default.store_options.redis_prefix),
            },
        })
    }

    pub fn registry(&self) -> Result<TemplateRegistry, ConfigError> {
        match &self.templates_file {
            Some(path) => Ok(TemplateRegistry::load(path)?),
            None => Ok(TemplateRegistry::empty()),
        }
    }

    /// Opens the store and loads the registry.
    pub async fn into_generator(self) -> Result<NumberGenerator, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = self.registry()?;
        let store = store::open(&self.store, &self.store_options, clock.clone()).await?;

        Ok(NumberGenerator::new(store)
            .with_registry(registry)
            .with_defaults(self.defaults)
            .with_overflow(self.overflow)
            .with_clock(clock))
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    match var(name) {
        Some(v) => v
            .parse()
            .map_err(|reason| ConfigError::InvalidValue { name, reason }),
        None => Ok(default),
    }
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-wide.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "NUMGEN_STORE",
        "NUMGEN_TEMPLATES_FILE",
        "NUMGEN_DEFAULT_PAD",
        "NUMGEN_DEFAULT_PAD_CHAR",
        "NUMGEN_DEFAULT_PAD_SIDE",
        "NUMGEN_OVERFLOW",
        "NUMGEN_LOCK_MODE",
        "NUMGEN_REDIS_PREFIX",
    ];

    fn clear() {
        for name in VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.store, StoreDescriptor::Memory);
        assert_eq!(settings.defaults, PadDefaults::default());
        assert_eq!(settings.overflow, OverflowPolicy::Truncate);
        assert_eq!(settings.store_options.lock_mode, LockMode::Native);
        assert_eq!(settings.store_options.redis_prefix, "numgen");
        assert!(settings.templates_file.is_none());
    }

    #[test]
    fn test_from_env_with_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        std::env::set_var("NUMGEN_STORE", "sled:/tmp/numgen");
        std::env::set_var("NUMGEN_DEFAULT_PAD", "6");
        std::env::set_var("NUMGEN_DEFAULT_PAD_CHAR", "*");
        std::env::set_var("NUMGEN_DEFAULT_PAD_SIDE", "right");
        std::env::set_var("NUMGEN_OVERFLOW", "reject");
        std::env::set_var("NUMGEN_LOCK_MODE", "process");

        let settings = Settings::from_env().unwrap();
        assert_eq!(
            settings.store,
            StoreDescriptor::Sled(PathBuf::from("/tmp/numgen"))
        );
        assert_eq!(
            settings.defaults,
            PadDefaults {
                width: 6,
                fill: '*',
                side: PadSide::Right
            }
        );
        assert_eq!(settings.overflow, OverflowPolicy::Reject);
        assert_eq!(settings.store_options.lock_mode, LockMode::Process);

        clear();
    }

    #[test]
    fn test_from_env_ignores_invalid_numbers() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        std::env::set_var("NUMGEN_DEFAULT_PAD", "zero");

        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.defaults.width, 4);

        std::env::set_var("NUMGEN_DEFAULT_PAD", "0");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.defaults.width, 4);

        clear();
    }

    #[test]
    fn test_from_env_rejects_bad_enums() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        std::env::set_var("NUMGEN_DEFAULT_PAD_CHAR", "00");
        assert!(matches!(
            Settings::from_env(),
            Err(ConfigError::InvalidValue {
                name: "NUMGEN_DEFAULT_PAD_CHAR",
                ..
            })
        ));
        clear();

        std::env::set_var("NUMGEN_STORE", "mysql://localhost");
        assert!(matches!(
            Settings::from_env(),
            Err(ConfigError::Storage(StorageError::InvalidDescriptor(_)))
        ));
        clear();
    }

    #[test]
    fn test_load_from_env_file() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear();
        std::env::set_var("NUMGEN_DEFAULT_PAD_CHAR", "#");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"NUMGEN_DEFAULT_PAD=7\nNUMGEN_DEFAULT_PAD_CHAR=*\nNUMGEN_OVERFLOW=reject\n",
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.defaults.width, 7);
        // the process environment wins over the file
        assert_eq!(settings.defaults.fill, '#');
        assert_eq!(settings.overflow, OverflowPolicy::Reject);

        clear();
    }

    #[test]
    fn test_load_from_missing_env_file() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(matches!(
            Settings::load_from("/definitely/not/here.env"),
            Err(ConfigError::EnvFile(_))
        ));
    }

    #[tokio::test]
    async fn test_into_generator_with_memory_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"invoice": {"template": "INV-{number}", "pad": 3}}"#,
        )
        .unwrap();

        let settings = Settings {
            templates_file: Some(file.path().to_path_buf()),
            ..Settings::default()
        };
        let generator = settings.into_generator().await.unwrap();
        let number = generator
            .generate("invoice", crate::generator::GenerateOptions::new())
            .await
            .unwrap();
        assert_eq!(number, "INV-001");
    }
}
