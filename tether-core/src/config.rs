//! Configuration types

use crate::{ConfigError, TetherError, TetherResult};
use serde::{Deserialize, Serialize};

/// Prefix used when neither the entity nor the process configures one.
pub const FALLBACK_PREFIX: &str = "tether-cache-";

/// How a group's members are rebuilt from a stored index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RehydrationStrategy {
    /// One batched read across every key, one record per payload.
    #[default]
    Batched,
    /// One placeholder record per key, each restored on its own.
    /// `None` runs every restore at once.
    PerKey { max_concurrency: Option<usize> },
}

/// Per-entity cache options supplied at `enable` time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Key prefix override for this entity.
    pub prefix: Option<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Process-wide cache configuration.
///
/// Passed to the cache layer at construction. Per-entity [`CacheOptions`]
/// are layered on top when an entity enables caching.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default key prefix. Falls back to [`FALLBACK_PREFIX`] when unset.
    pub default_prefix: Option<String>,
    /// Strategy used to rebuild group members.
    pub rehydration: RehydrationStrategy,
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process-wide default prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.default_prefix = Some(prefix.into());
        self
    }

    /// Set the rehydration strategy.
    pub fn with_rehydration(mut self, strategy: RehydrationStrategy) -> Self {
        self.rehydration = strategy;
        self
    }

    /// Resolve the key prefix for an entity.
    ///
    /// Priority: entity options, then this config, then [`FALLBACK_PREFIX`].
    /// Empty strings count as unset.
    pub fn resolve_prefix<'a>(&'a self, options: &'a CacheOptions) -> &'a str {
        options
            .prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .or_else(|| self.default_prefix.as_deref().filter(|p| !p.is_empty()))
            .unwrap_or(FALLBACK_PREFIX)
    }

    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// default_prefix = "myapp-"
    ///
    /// [rehydration]
    /// strategy = "per_key"
    /// max_concurrency = 8
    /// ```
    pub fn from_toml_str(source: &str) -> TetherResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| {
            TetherError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TETHER_CACHE_PREFIX`: default key prefix
    /// - `TETHER_REHYDRATION_CONCURRENCY`: switch to per-key rehydration
    ///   with this many concurrent restores
    pub fn from_env() -> TetherResult<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("TETHER_CACHE_PREFIX") {
            config.default_prefix = Some(prefix);
        }

        if let Ok(raw) = std::env::var("TETHER_REHYDRATION_CONCURRENCY") {
            let limit = raw.parse::<usize>().map_err(|e| {
                TetherError::Config(ConfigError::InvalidValue {
                    field: "TETHER_REHYDRATION_CONCURRENCY".to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })?;
            config.rehydration = RehydrationStrategy::PerKey {
                max_concurrency: Some(limit),
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - a bounded per-key rehydration allows at least one restore at a time
    pub fn validate(&self) -> TetherResult<()> {
        if let RehydrationStrategy::PerKey {
            max_concurrency: Some(0),
        } = self.rehydration
        {
            return Err(TetherError::Config(ConfigError::InvalidValue {
                field: "rehydration.max_concurrency".to_string(),
                value: "0".to_string(),
                reason: "max_concurrency must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
