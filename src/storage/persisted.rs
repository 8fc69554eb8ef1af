use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::kv::KeyValueStore;

/// Typed, failure-tolerant view over a [`KeyValueStore`].
///
/// Reads fall back to `T::default()` when a key is absent, unreadable, or holds
/// a value that does not parse. Write and remove failures are logged and reported
/// as `false`/`None`. Nothing here returns an error to the caller.
#[derive(Clone)]
pub struct PersistedStore {
    inner: Arc<dyn KeyValueStore>,
}

impl PersistedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// Read and decode `key`, substituting the default on absence or corruption.
    pub async fn read<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let Some(raw) = self.read_raw(key).await else {
            return T::default();
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Corrupt persisted value, using default");
                T::default()
            }
        }
    }

    pub async fn read_raw(&self, key: &str) -> Option<String> {
        match self.inner.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read persisted value");
                None
            }
        }
    }

    /// Encode and store `value`. Returns the stored JSON on success.
    pub async fn write<T>(&self, key: &str, value: &T) -> Option<String>
    where
        T: Serialize + ?Sized,
    {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode value for storage");
                return None;
            }
        };
        match self.inner.set(key, &raw).await {
            Ok(()) => Some(raw),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to persist value");
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) -> bool {
        match self.inner.remove(key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to remove persisted value");
                false
            }
        }
    }
}
