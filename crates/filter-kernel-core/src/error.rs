use serde::{Deserialize, Serialize};

use crate::memory::{Delta, DeltaAction, FilterCategory};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("constraint resolution error: {message}")]
    ConstraintResolution { message: String, unresolved: Vec<Delta> },
    #[error("catalog fetch error: {source}")]
    CatalogFetch {
        #[source]
        source: CatalogError,
        retryable: bool,
    },
}

impl KernelError {
    /// Whether re-invoking the same turn with the same deltas may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CatalogFetch { retryable: true, .. })
    }
}

impl From<CatalogError> for KernelError {
    fn from(source: CatalogError) -> Self {
        let retryable = source.is_retryable();
        Self::CatalogFetch { source, retryable }
    }
}

/// Failure reported by a [`crate::CatalogSource`] implementation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog query timed out after {elapsed_ms} ms")]
    TimedOut { elapsed_ms: u64 },
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("catalog backend error: {0}")]
    Backend(String),
}

impl CatalogError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Unavailable(_))
    }
}

/// Recoverable condition surfaced alongside a successful turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnWarning {
    UnresolvedVocabulary { category: FilterCategory, raw_value: String },
    UnsupportedAction { action: DeltaAction, category: Option<FilterCategory> },
    InvalidValue { category: FilterCategory, raw_value: Option<String>, reason: String },
    MalformedRecord { key: Option<String>, reason: String },
}

impl TurnWarning {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnresolvedVocabulary { .. } => "unresolved_vocabulary",
            Self::UnsupportedAction { .. } => "unsupported_action",
            Self::InvalidValue { .. } => "invalid_value",
            Self::MalformedRecord { .. } => "malformed_record",
        }
    }
}
