use std::sync::Arc;

use dashmap::DashMap;

use crate::error::RateLimitError;
use crate::error::Result;
use crate::key_state::KeyState;

/// Concurrent map from key to its token state
///
/// The map's shard locks only guard structure. Token arithmetic is
/// serialized by each `KeyState`'s own lock.
#[derive(Debug, Default)]
pub struct Store {
    map: DashMap<String, Arc<KeyState>>,
}

impl Store {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { map: DashMap::with_capacity(capacity) }
    }

    /// Look up a key without creating it
    pub fn get(&self, key: &str) -> Result<Arc<KeyState>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value())).ok_or(RateLimitError::NoSuchKey)
    }

    /// Insert or overwrite the state for `key`, returning the previous one
    pub fn put(&self, key: impl Into<String>, state: Arc<KeyState>) -> Option<Arc<KeyState>> {
        self.map.insert(key.into(), state)
    }

    /// Remove the state for `key`
    pub fn delete(&self, key: &str) -> Option<Arc<KeyState>> {
        self.map.remove(key).map(|(_, state)| state)
    }

    /// Return the state for `key`, creating it with `make` if absent
    ///
    /// Check and insert happen under the same shard lock, so concurrent
    /// first access for one key always observes a single instance.
    pub fn get_or_insert_with<F>(&self, key: &str, make: F) -> Arc<KeyState>
    where
        F: FnOnce() -> KeyState,
    {
        // Read-locked fast path, avoids allocating the key
        if let Some(entry) = self.map.get(key) {
            return Arc::clone(entry.value());
        }

        let entry = self.map.entry(key.to_owned()).or_insert_with(|| Arc::new(make()));
        Arc::clone(entry.value())
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str, &KeyState) -> bool,
    {
        self.map.retain(|key, state| keep(key.as_str(), state));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn test_get_missing() {
        let store = Store::new();
        assert!(matches!(store.get("nope"), Err(RateLimitError::NoSuchKey)));
    }

    #[test]
    fn test_put_get_delete() {
        let store = Store::with_capacity(20);
        let state = Arc::new(KeyState::new(5, 0));

        assert!(store.put("a", Arc::clone(&state)).is_none());
        assert!(Arc::ptr_eq(&store.get("a").unwrap(), &state));
        assert_eq!(store.len(), 1);

        let replacement = Arc::new(KeyState::new(5, 0));
        let previous = store.put("a", Arc::clone(&replacement)).unwrap();
        assert!(Arc::ptr_eq(&previous, &state));
        assert!(Arc::ptr_eq(&store.get("a").unwrap(), &replacement));

        assert!(store.delete("a").is_some());
        assert!(store.delete("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_or_insert_reuses_existing() {
        let store = Store::new();
        let first = store.get_or_insert_with("a", || KeyState::new(5, 0));
        let second = store.get_or_insert_with("a", || panic!("must not create twice"));

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_retain() {
        let store = Store::new();
        for key in ["keep", "drop"] {
            store.get_or_insert_with(key, || KeyState::new(5, 0));
        }

        store.retain(|key, _| key == "keep");

        assert!(store.get("keep").is_ok());
        assert!(store.get("drop").is_err());
    }

    #[test]
    fn test_concurrent_first_access_single_instance() {
        let store = Arc::new(Store::new());
        let barrier = Arc::new(Barrier::new(16));
        let mut handles = vec![];

        for _ in 0..16 {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                store.get_or_insert_with("shared", || KeyState::new(5, 0))
            }));
        }

        let states: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(store.len(), 1);
        let stored = store.get("shared").unwrap();
        assert!(states.iter().all(|state| Arc::ptr_eq(state, &stored)));
    }
}
