//! Error types for the selection engine and its persistence layer.
//!
//! Errors are split in two layers:
//! - [`StoreError`]: what a [`Store`](crate::Store) implementation reports.
//! - [`EngineError`]: what callers of [`Engine`](crate::Engine) see, tagged with an
//!   [`ErrorKind`] so transports can map them without matching every variant.
//!
//! A failed impression write is deliberately absent here: it is reported through
//! [`WriteStatus::Degraded`](crate::WriteStatus) on an otherwise successful selection.

use thiserror::Error;

/// Errors reported by a persistence backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend is unreachable or its handle is unusable (e.g. a poisoned lock).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Backend rejected or failed a statement.
    #[error("store db error: {0}")]
    Db(String),
    /// Stored data could not be decoded.
    #[error("store invalid data: {0}")]
    Invalid(String),
    /// A shard locator outside the backend's configured range.
    #[error("unknown shard {shard} (store has {shard_count} shards)")]
    UnknownShard { shard: u32, shard_count: u32 },
}

/// Coarse error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Missing or malformed request input; rejected before any storage access.
    Input,
    /// Nothing resolves for the lookup key. Not retryable.
    NotFound,
    /// Experiment/variant creation failed; no decision could be made.
    Provisioning,
    /// Any other persistence failure.
    Storage,
    /// Engine configuration is invalid.
    Config,
}

/// Errors returned by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("no such {entity}: {key}")]
    NotFound { entity: &'static str, key: String },

    /// The experiment exists but has no variants to choose from.
    #[error("experiment {experiment} has no variants")]
    NoVariants { experiment: String },

    #[error("provisioning {experiment} failed: {source}")]
    Provisioning {
        experiment: String,
        #[source]
        source: StoreError,
    },

    #[error("provisioning {experiment} exceeded its deadline during {stage}")]
    DeadlineExceeded {
        experiment: String,
        stage: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::Input,
            Self::NotFound { .. } | Self::NoVariants { .. } => ErrorKind::NotFound,
            Self::Provisioning { .. } | Self::DeadlineExceeded { .. } => ErrorKind::Provisioning,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}
