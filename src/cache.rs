//! Cache effect contract and the in-memory backend.
//!
//! The VM only fixes the effect shapes and the backend trait; persistence is
//! a backend concern. The one durability property handlers rely on is
//! read-your-writes within a single handler chain, which any synchronous
//! backend satisfies.

use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::value::Value;

pub trait CacheBackend: fmt::Debug + Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: String, value: Value);
    fn delete(&self, key: &str) -> bool;
    fn exists(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
    fn items(&self) -> Vec<(String, Value)>;
    fn clear(&self);
}

#[derive(Debug, Clone)]
pub enum CacheEffect {
    Get { key: String },
    Put { key: String, value: Value },
    Delete { key: String },
    Exists { key: String },
}

impl CacheEffect {
    pub fn repr(&self) -> String {
        match self {
            CacheEffect::Get { key } => format!("CacheGet({key:?})"),
            CacheEffect::Put { key, .. } => format!("CachePut({key:?})"),
            CacheEffect::Delete { key } => format!("CacheDelete({key:?})"),
            CacheEffect::Exists { key } => format!("CacheExists({key:?})"),
        }
    }
}

/// Process-local backend backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<IndexMap<String, Value>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn CacheBackend> {
        Arc::new(Self::new())
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("cache lock poisoned").get(key).cloned()
    }

    fn put(&self, key: String, value: Value) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(key, value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .shift_remove(key)
            .is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.lock().expect("cache lock poisoned").contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn items(&self) -> Vec<(String, Value)> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }
}

/// Handler state: which backend answers the cache effects.
#[derive(Debug, Clone)]
pub struct CacheHandler {
    backend: Arc<dyn CacheBackend>,
}

impl CacheHandler {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        CacheHandler { backend }
    }

    pub fn in_memory() -> Self {
        CacheHandler::new(MemoryCacheBackend::shared())
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Answer one cache effect. Missing keys read as Unit.
    pub fn answer(&self, effect: &CacheEffect) -> Value {
        match effect {
            CacheEffect::Get { key } => self.backend.get(key).unwrap_or(Value::Unit),
            CacheEffect::Put { key, value } => {
                self.backend.put(key.clone(), value.clone());
                Value::Unit
            }
            CacheEffect::Delete { key } => Value::Bool(self.backend.delete(key)),
            CacheEffect::Exists { key } => Value::Bool(self.backend.exists(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_read_your_writes() {
        let backend = MemoryCacheBackend::new();
        backend.put("k".to_string(), Value::Int(1));
        assert_eq!(backend.get("k"), Some(Value::Int(1)));
        assert!(backend.exists("k"));
        assert!(backend.delete("k"));
        assert!(!backend.exists("k"));
        assert!(!backend.delete("k"));
    }

    #[test]
    fn test_memory_backend_keys_and_items_keep_order() {
        let backend = MemoryCacheBackend::new();
        backend.put("a".to_string(), Value::Int(1));
        backend.put("b".to_string(), Value::Int(2));
        assert_eq!(backend.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(backend.items().len(), 2);
        backend.clear();
        assert!(backend.keys().is_empty());
    }

    #[test]
    fn test_cache_handler_answers() {
        let handler = CacheHandler::in_memory();
        assert_eq!(
            handler.answer(&CacheEffect::Put {
                key: "k".to_string(),
                value: Value::Int(7)
            }),
            Value::Unit
        );
        assert_eq!(
            handler.answer(&CacheEffect::Get {
                key: "k".to_string()
            }),
            Value::Int(7)
        );
        assert_eq!(
            handler.answer(&CacheEffect::Exists {
                key: "missing".to_string()
            }),
            Value::Bool(false)
        );
        assert_eq!(
            handler.answer(&CacheEffect::Get {
                key: "missing".to_string()
            }),
            Value::Unit
        );
    }
}
