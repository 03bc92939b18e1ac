//! Typed facade over a [`KeyValueStore`].

use std::sync::Arc;

use serde_json::Value;
use tether_core::{Attributes, StoreError};

use super::key::CacheKey;
use crate::store::{KeyValueStore, StoreResult};

/// Maps raw JSON to record attributes and group indexes, and attaches the
/// cache key to every store error.
pub struct StoreBinding<S> {
    store: Arc<S>,
}

impl<S> StoreBinding<S>
where
    S: KeyValueStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shared_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Read a record payload.
    pub async fn read_attributes(&self, key: &CacheKey) -> StoreResult<Option<Attributes>> {
        tracing::debug!(key = %key, "Reading cached record");
        let value = self
            .store
            .get(key.as_str())
            .await
            .map_err(|e| attach_key(e, key.as_str(), Op::Read))?;
        value
            .map(|value| payload_to_attributes(key.as_str(), value))
            .transpose()
    }

    /// Read a group index. Entries are returned as stored; validating them
    /// is up to the caller.
    pub async fn read_index(&self, key: &CacheKey) -> StoreResult<Option<Vec<Value>>> {
        tracing::debug!(key = %key, "Reading cached group index");
        let value = self
            .store
            .get(key.as_str())
            .await
            .map_err(|e| attach_key(e, key.as_str(), Op::Read))?;
        match value {
            None => Ok(None),
            Some(Value::Array(entries)) => Ok(Some(entries)),
            Some(other) => Err(StoreError::InvalidPayload {
                key: key.to_string(),
                reason: format!("expected an array of keys, found {}", json_type(&other)),
            }),
        }
    }

    /// Batched read of raw payloads, aligned with `keys`.
    pub async fn read_many(&self, keys: &[String]) -> StoreResult<Vec<Option<Value>>> {
        tracing::debug!(count = keys.len(), "Reading cached records in batch");
        let first = keys.first().map(String::as_str).unwrap_or_default();
        let values = self
            .store
            .get_many(keys)
            .await
            .map_err(|e| attach_key(e, first, Op::Read))?;
        if values.len() != keys.len() {
            return Err(StoreError::ReadFailed {
                key: first.to_string(),
                reason: format!(
                    "batched read returned {} values for {} keys",
                    values.len(),
                    keys.len()
                ),
            });
        }
        Ok(values)
    }

    /// Write a record payload.
    pub async fn write_attributes(&self, key: &CacheKey, attributes: Attributes) -> StoreResult<()> {
        tracing::debug!(key = %key, attributes = attributes.len(), "Writing cached record");
        self.store
            .set(key.as_str(), Value::Object(attributes))
            .await
            .map_err(|e| attach_key(e, key.as_str(), Op::Write))
    }

    /// Write a group index.
    pub async fn write_index(&self, key: &CacheKey, members: Vec<String>) -> StoreResult<()> {
        tracing::debug!(key = %key, members = members.len(), "Writing cached group index");
        let value = Value::Array(members.into_iter().map(Value::String).collect());
        self.store
            .set(key.as_str(), value)
            .await
            .map_err(|e| attach_key(e, key.as_str(), Op::Write))
    }

    /// Remove a payload.
    pub async fn remove(&self, key: &CacheKey) -> StoreResult<()> {
        tracing::debug!(key = %key, "Removing cached entry");
        self.store
            .delete(key.as_str())
            .await
            .map_err(|e| attach_key(e, key.as_str(), Op::Delete))
    }
}

/// Interpret a stored record payload.
///
/// Anything but a JSON object is [`StoreError::InvalidPayload`].
pub fn payload_to_attributes(key: &str, value: Value) -> StoreResult<Attributes> {
    match value {
        Value::Object(attributes) => Ok(attributes),
        other => Err(StoreError::InvalidPayload {
            key: key.to_string(),
            reason: format!("expected an object, found {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Clone, Copy)]
enum Op {
    Read,
    Write,
    Delete,
}

fn attach_key(error: StoreError, key: &str, op: Op) -> StoreError {
    match error {
        StoreError::Backend { reason } => match op {
            Op::Read => StoreError::ReadFailed {
                key: key.to_string(),
                reason,
            },
            Op::Write => StoreError::WriteFailed {
                key: key.to_string(),
                reason,
            },
            Op::Delete => StoreError::DeleteFailed {
                key: key.to_string(),
                reason,
            },
        },
        keyed => keyed,
    }
}
