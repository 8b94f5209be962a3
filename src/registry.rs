use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TemplateError;
use crate::padding::{check_pad_width, PadSide};
use crate::template::Template;

/// A registered template. Omitted padding fields fall back to the
/// generator defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_char: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_side: Option<PadSide>,
}

impl TemplateSpec {
    pub fn new(template: impl Into<String>) -> Self {
        TemplateSpec {
            template: template.into(),
            pad: None,
            pad_char: None,
            pad_side: None,
        }
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
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read template registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse template registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid template for key {key:?}: {source}")]
    InvalidTemplate {
        key: String,
        #[source]
        source: TemplateError,
    },
}

/// Read-only mapping from sequence key to its template.
///
/// Every entry is validated on construction, so a bad pattern is caught at
/// load time instead of on the first `generate`.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    entries: HashMap<String, TemplateSpec>,
}

impl TemplateRegistry {
    pub fn new(entries: HashMap<String, TemplateSpec>) -> Result<Self, RegistryError> {
        for (key, spec) in &entries {
            let invalid = |source| RegistryError::InvalidTemplate {
                key: key.clone(),
                source,
            };
            Template::parse(&spec.template).map_err(invalid)?;
            if let Some(width) = spec.pad {
                check_pad_width(width).map_err(invalid)?;
            }
        }
        Ok(TemplateRegistry { entries })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a JSON object of `key -> TemplateSpec`.
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let entries: HashMap<String, TemplateSpec> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), templates = registry.len(), "loaded template registry");
        Ok(registry)
    }

    pub fn get(&self, key: &str) -> Option<&TemplateSpec> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl TryFrom<HashMap<String, TemplateSpec>> for TemplateRegistry {
    type Error = RegistryError;

    fn try_from(entries: HashMap<String, TemplateSpec>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}
