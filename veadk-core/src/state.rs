//! Ephemeral, invocation-scoped state.
//!
//! The host creates one [`TempState`] per invocation and hands the same store to
//! every callback context of that invocation. Values are typed: anything
//! `Send + Sync + 'static` can be stored and is read back as an `Arc<T>`.

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct TempState {
    entries: DashMap<String, Entry>,
}

impl TempState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning true if an earlier entry was replaced.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) -> bool {
        self.insert_arc(key, Arc::new(value))
    }

    pub fn insert_arc<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) -> bool {
        self.entries.insert(key.into(), value).is_some()
    }

    /// Returns the entry under `key` if it exists and holds a `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        // Clone out of the shard guard before downcasting.
        let entry = self.entries.get(key).map(|entry| entry.value().clone())?;
        entry.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TempState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempState").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_insert_and_get_typed() {
        let state = TempState::new();
        assert!(!state.insert("count", 3_u64));
        assert_eq!(state.get::<u64>("count").as_deref(), Some(&3));
        assert!(state.get::<String>("count").is_none());
        assert!(state.get::<u64>("missing").is_none());
    }

    #[test]
    fn test_insert_replaces() {
        let state = TempState::new();
        state.insert("k", "a".to_string());
        assert!(state.insert("k", "b".to_string()));
        assert_eq!(state.get::<String>("k").unwrap().as_str(), "b");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_shared_mutation_through_arc() {
        let state = TempState::new();
        state.insert("acc", Mutex::new(Vec::<u32>::new()));
        state.get::<Mutex<Vec<u32>>>("acc").unwrap().lock().unwrap().push(7);
        assert_eq!(*state.get::<Mutex<Vec<u32>>>("acc").unwrap().lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_remove() {
        let state = TempState::new();
        state.insert("k", 1_i32);
        assert!(state.contains_key("k"));
        assert!(state.remove("k"));
        assert!(!state.remove("k"));
        assert!(state.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let state = Arc::new(TempState::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    state.insert(format!("key-{i}"), i);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.len(), 8);
    }

    #[test]
    fn test_reads_while_writing() {
        let state = Arc::new(TempState::new());
        state.insert("invocation", 0_u64);

        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for i in 0..500_u64 {
                    state.insert(format!("llm-{i}"), i);
                    state.remove(&format!("llm-{}", i.saturating_sub(1)));
                }
            })
        };
        for _ in 0..500 {
            assert_eq!(state.get::<u64>("invocation").as_deref(), Some(&0));
        }
        writer.join().unwrap();

        assert_eq!(state.len(), 2);
        assert!(state.contains_key("llm-499"));
    }
}
