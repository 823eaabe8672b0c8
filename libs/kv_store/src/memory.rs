//! In-process KV backend. TTLs are enforced lazily on access and during
//! pattern scans; glob patterns go through the shared translation in
//! `utils::glob` so both backends match the same key sets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use utils::glob::glob_to_regex;

enum Value {
    Str(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.expired(now)) {
            entries.remove(key);
            return None;
        }
        match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn set_raw(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn find_keys(&self, pattern: &str) -> Vec<String> {
        let regex = glob_to_regex(pattern);
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
        entries
            .keys()
            .filter(|k| regex.is_match(k))
            .cloned()
            .collect()
    }

    pub fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let regex = glob_to_regex(pattern);
        let mut entries = self.entries.lock();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|key, entry| !entry.expired(now) && !regex.is_match(key));
        (before - entries.len()) as u64
    }

    pub fn list_push(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        if let Value::List(list) = &mut entry.value {
            list.push_back(value.to_string());
        } else {
            entry.value = Value::List(VecDeque::from([value.to_string()]));
        }
    }

    pub fn list_pop(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if let Value::List(list) = &mut entry.value {
            list.pop_front()
        } else {
            None
        }
    }

    pub fn list_remove(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if let Value::List(list) = &mut entry.value {
            let before = list.len();
            list.retain(|v| v != value);
            return list.len() != before;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = MemoryKv::new();
        kv.set_raw("a", "1", None);
        assert_eq!(kv.get_raw("a"), Some("1".to_string()));
        kv.delete("a");
        assert_eq!(kv.get_raw("a"), None);
    }

    #[tokio::test]
    async fn ttl_expires() {
        let kv = MemoryKv::new();
        kv.set_raw("t", "v", Some(Duration::from_millis(20)));
        assert_eq!(kv.get_raw("t"), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get_raw("t"), None);
    }

    #[test]
    fn pattern_delete_is_scoped() {
        let kv = MemoryKv::new();
        kv.set_raw("cloud:list:u1:root", "a", None);
        kv.set_raw("cloud:list:u1:docs", "b", None);
        kv.set_raw("cloud:list:u2:root", "c", None);
        let deleted = kv.delete_by_pattern("cloud:list:u1:*");
        assert_eq!(deleted, 2);
        assert_eq!(kv.get_raw("cloud:list:u2:root"), Some("c".to_string()));
    }

    #[test]
    fn list_semantics() {
        let kv = MemoryKv::new();
        kv.list_push("q", "a");
        kv.list_push("q", "b");
        kv.list_push("q", "c");
        assert!(kv.list_remove("q", "b"));
        assert_eq!(kv.list_pop("q"), Some("a".to_string()));
        assert_eq!(kv.list_pop("q"), Some("c".to_string()));
        assert_eq!(kv.list_pop("q"), None);
    }
}
