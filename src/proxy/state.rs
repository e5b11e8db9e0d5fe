//! Keyed store of middleware state that outlives a single snapshot.
//!
//! Keys are `owner|middleware|params`. A snapshot records the keys it used;
//! after it is installed every other key is pruned, so state survives a
//! reload exactly when the declaring middleware did.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct StateArena {
    entries: DashMap<String, Entry>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// The state stored under `key`, created with `init` if absent or of
    /// another type.
    pub fn get_or_insert<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.entries.get(key) {
            if let Ok(state) = existing.value().clone().downcast::<T>() {
                return state;
            }
        }
        let state = Arc::new(init());
        self.entries.insert(key.to_string(), state.clone() as Entry);
        state
    }

    /// Drop every key not in `keep`.
    pub fn retain_keys(&self, keep: &HashSet<String>) {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep.contains(key));
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            tracing::debug!(pruned, kept = self.entries.len(), "Pruned middleware state");
        }
    }

    /// Every entry holding a `T`, ordered by key.
    pub fn entries_of<T: Any + Send + Sync>(&self) -> Vec<(String, Arc<T>)> {
        let mut found: Vec<(String, Arc<T>)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .clone()
                    .downcast::<T>()
                    .ok()
                    .map(|state| (entry.key().clone(), state))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_state_reused_by_key() {
        let arena = StateArena::new();
        let a = arena.get_or_insert("r1|bbr|{}", || AtomicU32::new(0));
        a.fetch_add(3, Ordering::Relaxed);

        let again = arena.get_or_insert("r1|bbr|{}", || AtomicU32::new(100));
        assert_eq!(again.load(Ordering::Relaxed), 3);

        // Same key, other type: replaced.
        let text = arena.get_or_insert("r1|bbr|{}", || String::from("x"));
        assert_eq!(text.as_str(), "x");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_retain_and_list() {
        let arena = StateArena::new();
        arena.get_or_insert("b", || 2u32);
        arena.get_or_insert("a", || 1u32);
        arena.get_or_insert("c", || String::new());

        let numbers = arena.entries_of::<u32>();
        assert_eq!(
            numbers.iter().map(|(k, v)| (k.as_str(), **v)).collect::<Vec<_>>(),
            vec![("a", 1), ("b", 2)]
        );

        arena.retain_keys(&HashSet::from(["a".to_string()]));
        assert_eq!(arena.len(), 1);
        assert!(arena.entries_of::<String>().is_empty());
    }
}
