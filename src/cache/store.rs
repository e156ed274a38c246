//! Region storage.
//!
//! A [`RegionStore`] is the key → value map behind one region. It is backed by
//! a sharded `DashMap`, so operations on unrelated keys do not serialize on a
//! region-wide lock, and every single-key operation is atomic.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::keys::CacheKey;

/// Outcome of a [`RegionStore::compute`] step.
#[derive(Debug)]
pub enum Transition<V> {
    /// Leave the slot as it is.
    Keep,
    /// Store a new value (inserting or replacing).
    Put(V),
    /// Remove the slot.
    Remove,
}

#[derive(Debug)]
pub struct RegionStore<V> {
    name: Arc<str>,
    entries: DashMap<CacheKey, V>,
}

impl<V: Clone> RegionStore<V> {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries.get(key).map(|slot| slot.value().clone())
    }

    /// Insert or replace, returning the previous value.
    pub fn put(&self, key: CacheKey, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Remove the slot only if `predicate` holds for its current value.
    pub fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value)
    }

    /// Atomic read-modify-write of one key.
    ///
    /// `step` sees the current value (if any) while the key's shard is
    /// write-locked and decides what the slot becomes. It must not call back
    /// into this store.
    pub fn compute<R>(
        &self,
        key: CacheKey,
        step: impl FnOnce(Option<&V>) -> (Transition<V>, R),
    ) -> R {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let (transition, result) = step(Some(occupied.get()));
                match transition {
                    Transition::Keep => {}
                    Transition::Put(value) => {
                        occupied.insert(value);
                    }
                    Transition::Remove => {
                        occupied.remove();
                    }
                }
                result
            }
            Entry::Vacant(vacant) => {
                let (transition, result) = step(None);
                if let Transition::Put(value) = transition {
                    vacant.insert(value);
                }
                result
            }
        }
    }

    /// Remove every entry, returning how many were dropped.
    pub fn evict_all(&self) -> usize {
        let mut evicted = 0;
        self.entries.retain(|_, _| {
            evicted += 1;
            false
        });
        evicted
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys currently stored. Introspection only.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Cloned copy of every slot. Introspection only.
    pub fn snapshot(&self) -> Vec<(CacheKey, V)> {
        self.entries
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().clone()))
            .collect()
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
    use crate::cache::keys::entity_key;

    fn store() -> RegionStore<u64> {
        RegionStore::new(Arc::from("Post"))
    }

    #[test]
    fn put_get_remove() {
        let store = store();
        let key = entity_key("Post", 1);

        assert!(store.get(&key).is_none());
        assert!(store.put(key.clone(), 10).is_none());
        assert_eq!(store.get(&key), Some(10));
        assert_eq!(store.put(key.clone(), 11), Some(10));
        assert_eq!(store.remove(&key), Some(11));
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_if_respects_predicate() {
        let store = store();
        let key = entity_key("Post", 1);
        store.put(key.clone(), 5);

        assert!(store.remove_if(&key, |value| *value > 5).is_none());
        assert!(store.contains_key(&key));
        assert_eq!(store.remove_if(&key, |value| *value == 5), Some(5));
        assert!(!store.contains_key(&key));
    }

    #[test]
    fn compute_transitions() {
        let store = store();
        let key = entity_key("Post", 1);

        let seen = store.compute(key.clone(), |current| (Transition::Put(1), current.copied()));
        assert_eq!(seen, None);
        let seen = store.compute(key.clone(), |current| (Transition::Keep, current.copied()));
        assert_eq!(seen, Some(1));
        assert_eq!(store.get(&key), Some(1));
        store.compute(key.clone(), |_| (Transition::<u64>::Remove, ()));
        assert!(store.get(&key).is_none());

        // Remove on a vacant slot is a no-op.
        store.compute(key.clone(), |_| (Transition::<u64>::Remove, ()));
        assert!(store.is_empty());
    }

    #[test]
    fn evict_all_reports_count_and_keys_enumerate() {
        let store = store();
        for id in 0..5 {
            store.put(entity_key("Post", id), id as u64);
        }
        let mut keys = store.keys();
        keys.sort_by_key(|key| key.to_string());
        assert_eq!(keys.len(), 5);
        assert_eq!(store.snapshot().len(), 5);

        assert_eq!(store.evict_all(), 5);
        assert!(store.is_empty());
        assert_eq!(store.evict_all(), 0);
    }

    #[test]
    fn compute_is_atomic_per_key() {
        let store = store();
        let key = entity_key("Post", 1);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        store.compute(key.clone(), |current| {
                            (Transition::Put(current.copied().unwrap_or(0) + 1), ())
                        });
                    }
                });
            }
        });

        assert_eq!(store.get(&key), Some(8000));
    }
}
