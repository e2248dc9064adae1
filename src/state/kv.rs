//! TTL key-value cache used for digest cooldowns, fingerprints, Copilot
//! dedupe claims and cap counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct KvStore {
    slots: DashMap<String, Slot>,
}

impl KvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(slot) = self.slots.get(key) {
            if slot.is_live(now) {
                return Some(slot.value.clone());
            }
        }
        self.slots.remove_if(key, |_, slot| !slot.is_live(now));
        None
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        self.slots.insert(key.to_string(), Slot::new(value.into(), ttl));
    }

    /// Set only if absent (or expired). Returns true when this call wrote the key.
    pub fn set_nx(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_live(now) {
                    false
                } else {
                    e.insert(Slot::new(value.into(), ttl));
                    true
                }
            }
            Entry::Vacant(v) => {
                v.insert(Slot::new(value.into(), ttl));
                true
            }
        }
    }

    /// Increment a counter. The TTL is applied only when the counter is created.
    pub fn incr(&self, key: &str, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if !e.get().is_live(now) {
                    e.insert(Slot::new("1".to_string(), ttl));
                    return 1;
                }
                let next = e.get().value.parse::<i64>().unwrap_or(0) + 1;
                e.get_mut().value = next.to_string();
                next
            }
            Entry::Vacant(v) => {
                v.insert(Slot::new("1".to_string(), ttl));
                1
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Drop expired slots. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_only_writes_once_while_live() {
        let kv = KvStore::new();
        assert!(kv.set_nx("k", "a", Some(Duration::from_secs(60))));
        assert!(!kv.set_nx("k", "b", Some(Duration::from_secs(60))));
        assert_eq!(kv.get("k").as_deref(), Some("a"));
    }

    #[test]
    fn expired_entries_are_invisible_and_reclaimable() {
        let kv = KvStore::new();
        kv.set("k", "a", Some(Duration::ZERO));
        assert!(kv.get("k").is_none());
        assert!(kv.set_nx("k", "b", None));
        assert_eq!(kv.get("k").as_deref(), Some("b"));
    }

    #[test]
    fn incr_counts_from_one() {
        let kv = KvStore::new();
        assert_eq!(kv.get_i64("c"), 0);
        assert_eq!(kv.incr("c", Some(Duration::from_secs(60))), 1);
        assert_eq!(kv.incr("c", Some(Duration::from_secs(60))), 2);
        assert_eq!(kv.get_i64("c"), 2);
    }

    #[test]
    fn purge_drops_only_expired() {
        let kv = KvStore::new();
        kv.set("dead", "x", Some(Duration::ZERO));
        kv.set("alive", "y", None);
        assert_eq!(kv.purge_expired(), 1);
        assert_eq!(kv.len(), 1);
    }
}
