//! Error types for tether operations

use thiserror::Error;

/// Configuration errors.
///
/// These are fatal and raised at `enable` or key-derivation time. They are
/// never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No key source configured for {kind}")]
    MissingKeySource { kind: String },

    #[error("Cache key for {kind} resolved to an empty path")]
    UnresolvedKey { kind: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Key-value store errors.
///
/// Surfaced to the caller of `cache`/`restore`/`evict`. This layer never
/// retries them; retry policy belongs to the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Delete failed for {key}: {reason}")]
    DeleteFailed { key: String, reason: String },

    #[error("Invalid payload under {key}: {reason}")]
    InvalidPayload { key: String, reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },

    #[error("Write for {key} was dropped before it completed")]
    Superseded { key: String },
}

impl StoreError {
    /// The cache key the error refers to, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::ReadFailed { key, .. }
            | Self::WriteFailed { key, .. }
            | Self::DeleteFailed { key, .. }
            | Self::InvalidPayload { key, .. }
            | Self::Serialization { key, .. }
            | Self::Superseded { key } => Some(key),
            Self::Backend { .. } => None,
        }
    }
}

/// Group rehydration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RehydrationError {
    #[error(
        "Partial rehydration: {restored} restored, {} missing, {} failed",
        .missing.len(),
        .failed.len()
    )]
    Partial {
        restored: usize,
        missing: Vec<String>,
        failed: Vec<String>,
    },
}

/// Master error type for all tether errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TetherError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rehydration error: {0}")]
    Rehydration(#[from] RehydrationError),
}

/// Result type alias for tether operations.
pub type TetherResult<T> = Result<T, TetherError>;

// =============================================================================
// TESTS
// =============================================================================
