// src/store/memory.rs
//
// In-memory index store with the same TTL semantics as the Redis adapter:
// expiry is tracked per key and applied lazily on access. Backs the test
// suite and lets the sidecar run without a live Redis during development.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{IndexStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value:      Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut map = self.inner.lock().expect("memory store poisoned");
        map.retain(|_, entry| entry.live());
        f(&mut map)
    }

    /// Remaining TTL of a key, if it has one. Test-surface only.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.with_map(|map| {
            map.get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        })
    }

    /// All live keys under a prefix. Test-surface only.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.with_map(|map| {
            let mut keys: Vec<String> =
                map.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            keys.sort();
            keys
        })
    }

    fn scalar(map: &HashMap<String, Entry>, key: &str) -> Option<String> {
        map.get(key).and_then(|e| match &e.value {
            Value::Scalar(s) => Some(s.clone()),
            Value::Set(_) => None,
        })
    }

    fn set_entry<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut HashSet<String> {
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value:      Value::Set(HashSet::new()),
            expires_at: None,
        });
        if !matches!(entry.value, Value::Set(_)) {
            entry.value = Value::Set(HashSet::new());
        }
        match &mut entry.value {
            Value::Set(set) => set,
            Value::Scalar(_) => unreachable!(),
        }
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_map(|map| Self::scalar(map, key)))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.with_map(|map| Self::scalar(map, key).and_then(|s| s.parse().ok())))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_map(|map| {
            map.insert(
                key.to_string(),
                Entry { value: Value::Scalar(value.to_string()), expires_at: None },
            );
        });
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_map(|map| {
            map.insert(
                key.to_string(),
                Entry {
                    value:      Value::Scalar(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.with_map(|map| {
            if map.contains_key(key) {
                return false;
            }
            map.insert(
                key.to_string(),
                Entry {
                    value:      Value::Scalar(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.with_map(|map| {
            let current = Self::scalar(map, key)
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let next = current + delta;
            let expires_at = map.get(key).and_then(|e| e.expires_at);
            map.insert(
                key.to_string(),
                Entry { value: Value::Scalar(next.to_string()), expires_at },
            );
            next
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_map(|map| {
            if let Some(entry) = map.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_map(|map| {
            Self::set_entry(map, key).insert(member.to_string());
        });
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_map(|map| {
            if let Some(entry) = map.get_mut(key) {
                if let Value::Set(set) = &mut entry.value {
                    set.remove(member);
                }
            }
        });
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.with_map(|map| {
            map.get(key)
                .map(|e| matches!(&e.value, Value::Set(set) if set.contains(member)))
                .unwrap_or(false)
        }))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.with_map(|map| match map.get(key) {
            Some(Entry { value: Value::Set(set), .. }) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                members
            }
            _ => Vec::new(),
        }))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, StoreError> {
        Ok(self.with_map(|map| keys.iter().map(|k| map.contains_key(k)).collect()))
    }

    async fn smembers_many(&self, keys: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.with_map(|map| {
            keys.iter()
                .map(|k| match map.get(k) {
                    Some(Entry { value: Value::Set(set), .. }) => {
                        let mut members: Vec<String> = set.iter().cloned().collect();
                        members.sort();
                        members
                    }
                    _ => Vec::new(),
                })
                .collect()
        }))
    }

    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<(), StoreError> {
        self.with_map(|map| {
            let at = Instant::now() + ttl;
            for key in keys {
                if let Some(entry) = map.get_mut(key) {
                    entry.expires_at = Some(at);
                }
            }
        });
        Ok(())
    }

    async fn sadd_many(
        &self,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.with_map(|map| {
            let at = ttl.map(|t| Instant::now() + t);
            for (key, member) in entries {
                Self::set_entry(map, key).insert(member.clone());
                if let Some(at) = at {
                    if let Some(entry) = map.get_mut(key) {
                        entry.expires_at = Some(at);
                    }
                }
            }
        });
        Ok(())
    }

    async fn set_flags(&self, keys: &[String]) -> Result<(), StoreError> {
        self.with_map(|map| {
            for key in keys {
                map.insert(
                    key.clone(),
                    Entry { value: Value::Scalar("1".to_string()), expires_at: None },
                );
            }
        });
        Ok(())
    }

    async fn del_many(&self, keys: &[String]) -> Result<(), StoreError> {
        self.with_map(|map| {
            for key in keys {
                map.remove(key);
            }
        });
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        Ok(self.with_map(|map| {
            let before = map.len();
            map.retain(|k, _| !k.starts_with(prefix));
            (before - map.len()) as u64
        }))
    }
}
