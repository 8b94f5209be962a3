//! Formatted sequential numbers (`INV-2025-00042`) backed by durable,
//! race-free per-key counters that restart every calendar year.
//!
//! ```no_run
//! use std::sync::Arc;
//! use numgen::{GenerateOptions, MemorySequenceStore, NumberGenerator, TemplateRegistry};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = TemplateRegistry::from_json(
//!     r#"{"invoice": {"template": "INV-{Y}-{number}", "pad": 5}}"#,
//! )?;
//! let generator = NumberGenerator::new(Arc::new(MemorySequenceStore::new()))
//!     .with_registry(registry);
//!
//! let code = generator.generate("invoice", GenerateOptions::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod padding;
pub mod registry;
pub mod store;
pub mod template;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Settings};
pub use error::{NumberError, StorageError, TemplateError};
pub use generator::{GenerateOptions, NumberGenerator, PadDefaults, ResolvedTemplate};
pub use padding::{check_pad_width, pad, OverflowPolicy, PadSide, PadSpec, MAX_PAD_WIDTH};
pub use registry::{RegistryError, TemplateRegistry, TemplateSpec};
pub use store::{
    LockMode, MemorySequenceStore, RedisSequenceStore, RetryPolicy, SequenceRecord,
    SequenceStore, SledSequenceStore, StoreDescriptor, StoreOptions,
};
pub use template::{render, Placeholder, Template};
