//! Per-task mutable store, reader environment, and writer log.
//!
//! The store is the only user-visible mutable state. The scheduler swaps
//! whole `Store` values when context-switching tasks, so everything a task
//! can observe travels together.

use indexmap::IndexMap;

use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Store {
    pub state: IndexMap<String, Value>,
    pub env: IndexMap<String, Value>,
    pub log: Vec<Value>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub fn with_seed(env: IndexMap<String, Value>, state: IndexMap<String, Value>) -> Self {
        Store {
            state,
            env,
            log: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn put(&mut self, key: String, value: Value) {
        self.state.insert(key, value);
    }

    pub fn ask(&self, key: &str) -> Option<&Value> {
        self.env.get(key)
    }

    pub fn tell(&mut self, message: Value) {
        self.log.push(message);
    }

    pub fn logs(&self) -> &[Value] {
        &self.log
    }

    /// Snapshot the environment before applying a `Local` overlay.
    ///
    /// Restore removes keys the overlay introduced, not just rebound ones,
    /// so the post-restore environment equals the snapshot exactly.
    pub fn env_snapshot(&self) -> IndexMap<String, Value> {
        self.env.clone()
    }

    pub fn apply_env_overlay(&mut self, overrides: &[(String, Value)]) {
        for (key, value) in overrides {
            self.env.insert(key.clone(), value.clone());
        }
    }

    pub fn restore_env(&mut self, snapshot: IndexMap<String, Value>) {
        self.env = snapshot;
    }

    /// Swap in a fresh log buffer for a `Listen` scope; returns the old one.
    pub fn swap_log(&mut self, replacement: Vec<Value>) -> Vec<Value> {
        std::mem::replace(&mut self.log, replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_state_operations() {
        let mut store = Store::new();
        store.put("key".to_string(), Value::Int(42));
        assert_eq!(store.get("key").and_then(Value::as_int), Some(42));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_store_tell_appends() {
        let mut store = Store::new();
        store.tell(Value::from("one"));
        store.tell(Value::from("two"));
        assert_eq!(store.logs().len(), 2);
    }

    #[test]
    fn test_env_overlay_restore_removes_new_keys() {
        let mut store = Store::new();
        store.env.insert("k".to_string(), Value::from("outer"));

        let snapshot = store.env_snapshot();
        store.apply_env_overlay(&[
            ("k".to_string(), Value::from("inner")),
            ("fresh".to_string(), Value::Int(1)),
        ]);
        assert_eq!(store.ask("k").and_then(Value::as_str), Some("inner"));
        assert!(store.ask("fresh").is_some());

        store.restore_env(snapshot);
        assert_eq!(store.ask("k").and_then(Value::as_str), Some("outer"));
        assert!(store.ask("fresh").is_none());
    }

    #[test]
    fn test_swap_log_round_trip() {
        let mut store = Store::new();
        store.tell(Value::Int(1));
        let old = store.swap_log(Vec::new());
        assert_eq!(old.len(), 1);
        store.tell(Value::Int(2));
        let inner = store.swap_log(old);
        assert_eq!(inner, vec![Value::Int(2)]);
        assert_eq!(store.logs(), &[Value::Int(1)]);
    }
}
