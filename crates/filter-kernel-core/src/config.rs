//! Engine configuration loaded from YAML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::reducer::DEFAULT_SAMPLE_CAP;
use crate::vocabulary::{CanonicalVocabulary, VocabularyConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum records returned per turn
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
    /// Upper bound on one catalog fetch
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Catalog view or table queried by the compiled plan
    #[serde(default = "default_catalog_view")]
    pub catalog_view: String,
    /// Replaces the built-in vocabulary when present
    #[serde(default)]
    pub vocabulary: Option<VocabularyConfig>,
}

fn default_sample_cap() -> usize {
    DEFAULT_SAMPLE_CAP
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_catalog_view() -> String {
    "flowers".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_cap: default_sample_cap(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            catalog_view: default_catalog_view(),
            vocabulary: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`KernelError::Config`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, KernelError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            KernelError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when the YAML is invalid or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, KernelError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| KernelError::Config(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] on a zero cap, zero timeout, or empty view name.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.sample_cap == 0 {
            return Err(KernelError::Config("sample_cap must be at least 1".to_string()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(KernelError::Config("fetch_timeout_ms must be positive".to_string()));
        }
        if self.catalog_view.trim().is_empty() {
            return Err(KernelError::Config("catalog_view cannot be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// The configured vocabulary, or the built-in one.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] when the vocabulary tables are inconsistent.
    pub fn build_vocabulary(&self) -> Result<CanonicalVocabulary, KernelError> {
        match &self.vocabulary {
            Some(tables) => CanonicalVocabulary::from_config(tables),
            None => CanonicalVocabulary::builtin(),
        }
    }
}
