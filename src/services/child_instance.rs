//! Fan-out admission state.
//!
//! One [`ConcurrentChildInstance`] exists per concurrency-limited fan-out
//! parent. Its cursor is the index of the next child to admit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// Admission state of one fan-out parent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrentChildInstance {
    /// Index of the next child to admit; only moves forward
    pub cursor: usize,

    /// Every child planned for the fan-out, in admission order
    pub children_node_execution_ids: Vec<String>,
}

impl ConcurrentChildInstance {
    pub fn new(cursor: usize, children_node_execution_ids: Vec<String>) -> Self {
        Self {
            cursor,
            children_node_execution_ids,
        }
    }

    /// Returns the child the cursor points at, if any remain.
    pub fn next_pending(&self) -> Option<&str> {
        self.children_node_execution_ids
            .get(self.cursor)
            .map(String::as_str)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.children_node_execution_ids.len()
    }
}

/// Storage of fan-out admission state, keyed by parent node execution id.
pub trait ConcurrentChildInstanceService: Send + Sync {
    fn save(&self, parent_id: &str, instance: ConcurrentChildInstance) -> Result<()>;

    fn get(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>>;

    /// Atomically advances the cursor by one.
    ///
    /// Returns the record as it was before the increment, so its
    /// `next_pending()` is the child claimed by the caller. The cursor is
    /// never moved past the end of the list. Returns `None` when no record
    /// exists for the parent.
    fn increment_cursor(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>>;

    /// Discards the record.
    fn remove(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>>;
}

/// Fan-out state kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryChildInstanceStore {
    instances: Mutex<HashMap<String, ConcurrentChildInstance>>,
}

impl InMemoryChildInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn instances(&self) -> Result<MutexGuard<'_, HashMap<String, ConcurrentChildInstance>>> {
        self.instances
            .lock()
            .map_err(|_| OrchestrationError::store("child instance store lock poisoned"))
    }
}

impl ConcurrentChildInstanceService for InMemoryChildInstanceStore {
    fn save(&self, parent_id: &str, instance: ConcurrentChildInstance) -> Result<()> {
        self.instances()?.insert(parent_id.to_string(), instance);
        Ok(())
    }

    fn get(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>> {
        Ok(self.instances()?.get(parent_id).cloned())
    }

    fn increment_cursor(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>> {
        let mut instances = self.instances()?;
        let Some(instance) = instances.get_mut(parent_id) else {
            return Ok(None);
        };

        let before = instance.clone();
        if !instance.is_exhausted() {
            instance.cursor += 1;
        }
        Ok(Some(before))
    }

    fn remove(&self, parent_id: &str) -> Result<Option<ConcurrentChildInstance>> {
        Ok(self.instances()?.remove(parent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_next_pending() {
        let instance = ConcurrentChildInstance::new(1, ids(&["a", "b", "c"]));
        assert_eq!(instance.next_pending(), Some("b"));
        assert!(!instance.is_exhausted());

        let done = ConcurrentChildInstance::new(3, ids(&["a", "b", "c"]));
        assert_eq!(done.next_pending(), None);
        assert!(done.is_exhausted());
    }

    #[test]
    fn test_increment_returns_previous_and_advances() {
        let store = InMemoryChildInstanceStore::new();
        store
            .save("p", ConcurrentChildInstance::new(2, ids(&["a", "b", "c"])))
            .unwrap();

        let claimed = store.increment_cursor("p").unwrap().unwrap();
        assert_eq!(claimed.next_pending(), Some("c"));
        assert_eq!(store.get("p").unwrap().unwrap().cursor, 3);
    }

    #[test]
    fn test_increment_never_passes_end() {
        let store = InMemoryChildInstanceStore::new();
        store
            .save("p", ConcurrentChildInstance::new(1, ids(&["a"])))
            .unwrap();

        for _ in 0..3 {
            let claimed = store.increment_cursor("p").unwrap().unwrap();
            assert!(claimed.is_exhausted());
        }
        assert_eq!(store.get("p").unwrap().unwrap().cursor, 1);
    }

    #[test]
    fn test_increment_missing_instance() {
        let store = InMemoryChildInstanceStore::new();
        assert!(store.increment_cursor("ghost").unwrap().is_none());
    }

    #[test]
    fn test_each_child_claimed_once() {
        let store = InMemoryChildInstanceStore::new();
        store
            .save("p", ConcurrentChildInstance::new(0, ids(&["a", "b", "c"])))
            .unwrap();

        let mut claimed = Vec::new();
        for _ in 0..5 {
            let before = store.increment_cursor("p").unwrap().unwrap();
            if let Some(id) = before.next_pending() {
                claimed.push(id.to_string());
            }
        }
        assert_eq!(claimed, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_remove() {
        let store = InMemoryChildInstanceStore::new();
        store.save("p", ConcurrentChildInstance::new(0, vec![])).unwrap();
        assert!(store.remove("p").unwrap().is_some());
        assert!(store.get("p").unwrap().is_none());
    }
}
