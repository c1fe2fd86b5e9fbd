//! Process-wide cache of loaded heavyweight resources.
//!
//! Entries are keyed by `(model_id, task, path)` and live across jobs;
//! eviction is explicit — callers declare which node ids are stale and
//! [`ModelManager::clear_unused`] drops the entries those nodes owned
//! exclusively. There is no LRU or reference counting.
//!
//! The manager is an injectable service (`Arc<ModelManager>` passed into
//! [`ProcessingContext`](crate::context::ProcessingContext) construction),
//! never a process global, so tests can supply an isolated instance.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use loomflow::model_manager::ModelManager;
//!
//! let models = ModelManager::new();
//! let handle: Arc<dyn std::any::Any + Send + Sync> = Arc::new(vec![1u8, 2, 3]);
//! models.set("node_a", "m", "embedding", handle.clone(), None);
//!
//! let hit = models.get("m", "embedding", None).unwrap();
//! assert!(Arc::ptr_eq(&hit, &handle));
//!
//! models.clear_unused(&["node_a"]);
//! assert!(models.get("m", "embedding", None).is_none());
//! ```

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// Opaque handle to a loaded resource.
pub type ModelHandle = Arc<dyn Any + Send + Sync>;

/// Cache key: model identity plus the task it was loaded for and an
/// optional on-disk path variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_id: String,
    pub task: String,
    pub path: Option<String>,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, task: impl Into<String>, path: Option<&str>) -> Self {
        Self {
            model_id: model_id.into(),
            task: task.into(),
            path: path.map(str::to_string),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<ModelKey, ModelHandle>,
    owners: FxHashMap<String, FxHashSet<ModelKey>>,
}

/// Process-wide model cache. Cheap to clone behind an `Arc`; the interior
/// map has atomic get/set, which is the only locking the contract asks for.
#[derive(Default)]
pub struct ModelManager {
    inner: Mutex<Inner>,
}

impl ModelManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a loaded handle. Two lookups with an identical key return
    /// the identical handle until the entry is evicted.
    #[must_use]
    pub fn get(&self, model_id: &str, task: &str, path: Option<&str>) -> Option<ModelHandle> {
        let key = ModelKey::new(model_id, task, path);
        self.inner.lock().entries.get(&key).cloned()
    }

    /// Insert a handle and record `node_id` as an owner of the entry.
    pub fn set(
        &self,
        node_id: &str,
        model_id: &str,
        task: &str,
        handle: ModelHandle,
        path: Option<&str>,
    ) {
        let key = ModelKey::new(model_id, task, path);
        let mut inner = self.inner.lock();
        inner.entries.insert(key.clone(), handle);
        inner
            .owners
            .entry(node_id.to_string())
            .or_default()
            .insert(key);
    }

    /// Evict entries owned exclusively by the given node ids.
    ///
    /// An entry survives if any node outside `node_ids` also owns it.
    /// Returns the number of evicted entries.
    pub fn clear_unused(&self, node_ids: &[&str]) -> usize {
        let mut inner = self.inner.lock();

        let mut candidates: FxHashSet<ModelKey> = FxHashSet::default();
        for node_id in node_ids {
            if let Some(keys) = inner.owners.get(*node_id) {
                candidates.extend(keys.iter().cloned());
            }
        }

        let stale: FxHashSet<&str> = node_ids.iter().copied().collect();
        let mut evicted = 0;
        for key in candidates {
            let still_owned = inner
                .owners
                .iter()
                .any(|(owner, keys)| !stale.contains(owner.as_str()) && keys.contains(&key));
            if !still_owned && inner.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        for node_id in node_ids {
            inner.owners.remove(*node_id);
        }
        evicted
    }

    /// Drop every entry and owner record.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.owners.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tag: u8) -> ModelHandle {
        Arc::new(tag)
    }

    #[test]
    fn identical_key_returns_identical_handle() {
        let models = ModelManager::new();
        let h = handle(1);
        models.set("n1", "m", "t", h.clone(), None);
        // Unrelated set for a different key must not disturb the entry.
        models.set("n2", "other", "t", handle(2), None);

        let first = models.get("m", "t", None).unwrap();
        let second = models.get("m", "t", None).unwrap();
        assert!(Arc::ptr_eq(&first, &h));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn path_distinguishes_entries() {
        let models = ModelManager::new();
        models.set("n1", "m", "t", handle(1), None);
        models.set("n1", "m", "t", handle(2), Some("/weights/q4.bin"));
        assert_eq!(models.len(), 2);
        assert!(models.get("m", "t", Some("/weights/q4.bin")).is_some());
    }

    #[test]
    fn clear_unused_respects_shared_ownership() {
        let models = ModelManager::new();
        models.set("n1", "shared", "t", handle(1), None);
        models.set("n2", "shared", "t", handle(1), None);
        models.set("n1", "solo", "t", handle(2), None);

        // n1's exclusive entry goes; the shared one stays for n2.
        assert_eq!(models.clear_unused(&["n1"]), 1);
        assert!(models.get("solo", "t", None).is_none());
        assert!(models.get("shared", "t", None).is_some());

        assert_eq!(models.clear_unused(&["n2"]), 1);
        assert!(models.is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let models = ModelManager::new();
        models.set("n1", "a", "t", handle(1), None);
        models.set("n2", "b", "t", handle(2), None);
        models.clear();
        assert!(models.is_empty());
        // Owner records are gone too: clearing again evicts nothing.
        assert_eq!(models.clear_unused(&["n1", "n2"]), 0);
    }
}
