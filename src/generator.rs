use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::clock::{Clock, SystemClock};
use crate::error::{NumberError, StorageError, TemplateError};
use crate::padding::{OverflowPolicy, PadSide, PadSpec};
use crate::registry::TemplateRegistry;
use crate::store::SequenceStore;
use crate::template::Template;

/// Generator-wide padding used when neither the call nor the registry
/// supplies a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadDefaults {
    pub width: usize,
    pub fill: char,
    pub side: PadSide,
}

impl Default for PadDefaults {
    fn default() -> Self {
        PadDefaults {
            width: 4,
            fill: '0',
            side: PadSide::Left,
        }
    }
}

/// Per-call overrides for [`NumberGenerator::generate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateOptions {
    pub template: Option<String>,
    pub pad: Option<usize>,
    pub pad_char: Option<char>,
    pub pad_side: Option<PadSide>,
    pub timestamp: Option<NaiveDateTime>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn pad(mut self, pad: usize) -> Self {
        self.pad = Some(pad);
        self
    }

    pub fn pad_char(mut self, pad_char: char) -> Self {
        self.pad_char = Some(pad_char);
        self
    }

    pub fn pad_side(mut self, pad_side: PadSide) -> Self {
        self.pad_side = Some(pad_side);
        self
    }

    pub fn timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Template and padding after resolution, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    pub template: Template,
    pub pad: PadSpec,
}

/// Combines a [`SequenceStore`] with template rendering.
pub struct NumberGenerator {
    store: Arc<dyn SequenceStore>,
    registry: TemplateRegistry,
    defaults: PadDefaults,
    overflow: OverflowPolicy,
    clock: Arc<dyn Clock>,
}

impl NumberGenerator {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        NumberGenerator {
            store,
            registry: TemplateRegistry::empty(),
            defaults: PadDefaults::default(),
            overflow: OverflowPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_registry(mut self, registry: TemplateRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_defaults(mut self, defaults: PadDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Clock used for the default render timestamp. Stores keep their own
    /// clock for rollover periods.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn SequenceStore> {
        &self.store
    }

    /// Works out which template and padding `generate` would use for `key`.
    ///
    /// An explicit template bypasses the registry entirely; otherwise the
    /// registered entry supplies each field the call leaves unset.
    pub fn resolve(
        &self,
        key: &str,
        options: &GenerateOptions,
    ) -> Result<ResolvedTemplate, NumberError> {
        let (pattern, registered) = match &options.template {
            Some(pattern) => (pattern.as_str(), None),
            None => {
                let spec = self
                    .registry
                    .get(key)
                    .ok_or_else(|| NumberError::TemplateNotFound(key.to_string()))?;
                (spec.template.as_str(), Some(spec))
            }
        };

        let pad = PadSpec {
            width: options
                .pad
                .or(registered.and_then(|s| s.pad))
                .unwrap_or(self.defaults.width),
            fill: options
                .pad_char
                .or(registered.and_then(|s| s.pad_char))
                .unwrap_or(self.defaults.fill),
            side: options
                .pad_side
                .or(registered.and_then(|s| s.pad_side))
                .unwrap_or(self.defaults.side),
            overflow: self.overflow,
        };
        pad.validate()?;

        Ok(ResolvedTemplate {
            template: Template::parse(pattern)?,
            pad,
        })
    }

    /// Produces the next formatted number for `key`.
    ///
    /// Resolution and template validation happen before the counter moves, so
    /// a bad template or unknown key leaves the store untouched. Under
    /// [`OverflowPolicy::Reject`] the digit bound is checked inside the
    /// store's atomic increment, so an overflowing number is never persisted.
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn generate(
        &self,
        key: &str,
        options: GenerateOptions,
    ) -> Result<String, NumberError> {
        let resolved = self.resolve(key, &options)?;
        let timestamp = options.timestamp.unwrap_or_else(|| self.clock.now());

        let width = resolved.pad.width;
        let value = self
            .store
            .increment_bounded(key, resolved.pad.max_value())
            .await
            .map_err(|e| match e {
                StorageError::LimitExceeded { next, .. } => {
                    NumberError::Template(TemplateError::NumberOverflow { value: next, width })
                }
                other => NumberError::Storage(other),
            })?;
        let number = resolved
            .template
            .render(value, timestamp, &resolved.pad)
            .map_err(|e: TemplateError| {
                tracing::warn!(key, value, error = %e, "counter advanced but render failed");
                e
            })?;

        tracing::debug!(key, value, %number, "number generated");
        Ok(number)
    }

    pub async fn reset(&self, key: &str, value: u64) -> Result<(), NumberError> {
        self.store.reset(key, value).await?;
        tracing::info!(key, value, "sequence reset");
        Ok(())
    }

    pub async fn get_last(&self, key: &str) -> Result<u64, NumberError> {
        Ok(self.store.get_last(key).await?)
    }
}
