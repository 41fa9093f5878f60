//! Latest-value store keyed by `(site, device)`.
//!
//! [`LatestValueCache`] keeps exactly one sample per [`DeviceKey`] and no
//! history. It decouples a high-rate sensor feed from readers that only want
//! current state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::DeviceKey;

/// Most-recent-sample store.
///
/// # Concurrency
///
/// - Many readers may hold the lock at once; a writer excludes everyone.
/// - The lock only ever guards map access. Values are stored behind an
///   [`Arc`] so [`get`](Self::get) hands out a cheap clone and nothing is
///   copied, serialized or awaited while the lock is held.
#[derive(Debug)]
pub struct LatestValueCache<V> {
    entries: RwLock<HashMap<DeviceKey, Arc<V>>>,
}

impl<V> LatestValueCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stores `value` as the current sample for `key`.
    ///
    /// Last write wins: there is no timestamp comparison against the
    /// previous entry, so an out-of-order sample replaces a newer one.
    pub async fn set(&self, key: DeviceKey, value: V) {
        let value = Arc::new(value);
        self.entries.write().await.insert(key, value);
    }

    /// Returns the current sample for `key`, or `None` when nothing has been
    /// stored for it yet.
    pub async fn get(&self, key: &DeviceKey) -> Option<Arc<V>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Returns the number of keys with a sample.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if no sample has been stored yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<V> Default for LatestValueCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
