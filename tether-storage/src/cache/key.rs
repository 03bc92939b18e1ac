//! Cache key derivation.
//!
//! A key is `prefix + path`. It is derived from kind, identifier and
//! options on every read and write, never memoized, so a record that gains
//! an identifier after a save starts addressing its persisted slot.

use std::fmt;

use tether_core::{CacheConfig, Cacheable, ConfigError, KeyContext};

/// A fully derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a key that was already derived, e.g. an entry of a stored
    /// group index.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Derive the cache key for an entity.
///
/// A pinned key wins over derivation. Otherwise the path comes from the
/// entity's key source and the prefix from its options, then `config`,
/// then the fallback prefix.
///
/// # Errors
///
/// - [`ConfigError::MissingKeySource`] when the entity has no key source
/// - [`ConfigError::UnresolvedKey`] when the source yields no path, e.g. a
///   resource key for a record without an identifier
pub fn derive_key<E>(entity: &E, config: &CacheConfig) -> Result<CacheKey, ConfigError>
where
    E: Cacheable + ?Sized,
{
    if let Some(pinned) = entity.pinned_key() {
        return Ok(CacheKey(pinned));
    }

    let source = entity
        .key_source()
        .ok_or_else(|| ConfigError::MissingKeySource {
            kind: entity.kind().to_string(),
        })?;

    let id = entity.identity();
    let ctx = KeyContext {
        kind: entity.kind(),
        role: entity.role(),
        id: id.as_deref(),
    };
    let path = source
        .resolve(&ctx)
        .ok_or_else(|| ConfigError::UnresolvedKey {
            kind: entity.kind().to_string(),
        })?;

    let options = entity.cache_state().options();
    let prefix = config.resolve_prefix(&options);
    Ok(CacheKey(format!("{prefix}{path}")))
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;
    use tether_core::{Attributes, KeySource, RecordFactory, RecordTemplate};

    fn id_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_-]{1,24}"
    }

    fn prefix_strategy() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[a-z]{1,8}-")
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: two independently built records with the same kind,
        /// identifier and options derive the same key.
        #[test]
        fn prop_key_is_pure_function_of_kind_id_options(
            id in id_strategy(),
            prefix in prefix_strategy(),
        ) {
            let template = RecordTemplate::new("todo").with_key_source(KeySource::resource("todos"));
            let mut config = CacheConfig::new();
            if let Some(prefix) = prefix {
                config = config.with_prefix(prefix);
            }

            let mut attributes = Attributes::new();
            attributes.insert("id".to_string(), Value::String(id.clone()));
            let a = template.create(attributes.clone());
            attributes.insert("title".to_string(), Value::String("other".to_string()));
            let b = template.create(attributes);

            let key_a = derive_key(&*a, &config).expect("key should derive");
            let key_b = derive_key(&*b, &config).expect("key should derive");
            prop_assert_eq!(&key_a, &key_b);
            let suffix = format!("todos/{id}");
            prop_assert!(key_a.as_str().ends_with(&suffix));
        }

        /// Property: distinct identifiers never collide.
        #[test]
        fn prop_distinct_ids_distinct_keys(a in id_strategy(), b in id_strategy()) {
            prop_assume!(a != b);
            let template = RecordTemplate::new("todo").with_key_source(KeySource::resource("todos"));
            let config = CacheConfig::default();

            let mut attrs_a = Attributes::new();
            attrs_a.insert("id".to_string(), Value::String(a));
            let mut attrs_b = Attributes::new();
            attrs_b.insert("id".to_string(), Value::String(b));

            let key_a = derive_key(&*template.create(attrs_a), &config).expect("key");
            let key_b = derive_key(&*template.create(attrs_b), &config).expect("key");
            prop_assert_ne!(key_a, key_b);
        }
    }
}
