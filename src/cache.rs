//! Cache Layer
//!
//! A generic bounded LRU with lazy per-entry TTL expiry, and the three
//! concrete caches it backs: the per-backend view cache, the global
//! message store, and the attachment payload cache (spec.md §4.7).

use crate::account::Viewer;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A bounded, least-recently-used cache where entries also expire
/// after a fixed time-to-live.
///
/// Capacity is enforced on insert: once full, the least-recently-used
/// entry is evicted to make room (spec.md §4.7, "bounded LRU"). TTL is
/// checked lazily on read/eviction-scan, there is no background sweep.
pub struct TtlLru<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
    /// Most-recently-used at the back.
    order: Vec<K>,
}

impl<K, V> TtlLru<K, V>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            ttl,
            entries: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    /// Look up a live (non-expired) entry, promoting it to
    /// most-recently-used. Returns `None` and evicts the entry if it has
    /// expired.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl);
        if expired {
            self.remove(key);
            return None;
        }
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get(key).map(|e| &e.value)
    }

    /// Insert or replace `key`, evicting the least-recently-used entry
    /// first if the cache is at capacity.
    pub fn set(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
        } else {
            if self.entries.len() >= self.capacity {
                self.evict_lru();
            }
            self.order.push(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key).map(|e| e.value)
    }

    fn evict_lru(&mut self) {
        if !self.order.is_empty() {
            let victim = self.order.remove(0);
            self.entries.remove(&victim);
        }
    }

    /// Drop every entry. Used when an IDLE notification invalidates a
    /// backend's view wholesale (spec.md §4.6).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Drop every entry for which `keep` returns `false`. Used to
    /// invalidate just the entries belonging to one backend (spec.md
    /// §4.7) rather than the whole cache.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let doomed: Vec<K> = self
            .entries
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }
}

/// A view cache key: one recipient address's recent-window result, as
/// seen by one `Viewer` (spec.md §4.7 — the view cache is keyed by
/// `(address, viewerVisibility)` since an anonymous and an authenticated
/// viewer of the same address see different filtered views).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub scope: String,
    pub viewer: Viewer,
}

impl ViewKey {
    #[must_use]
    pub fn new(scope: impl Into<String>, viewer: Viewer) -> Self {
        Self {
            scope: scope.into(),
            viewer,
        }
    }
}

/// A message store key: one message, addressed by backend and UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub backend: String,
    pub uid: u32,
}

impl MessageKey {
    #[must_use]
    pub fn new(backend: impl Into<String>, uid: u32) -> Self {
        Self {
            backend: backend.into(),
            uid,
        }
    }
}

/// A payload cache key: one attachment part of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKey {
    pub backend: String,
    pub uid: u32,
    pub attachment_index: usize,
}

/// View cache: per-backend `fetch` results, 200 entries / 10s TTL
/// (spec.md §4.7).
#[must_use]
pub fn new_view_cache<V>() -> TtlLru<ViewKey, V> {
    TtlLru::new(200, Duration::from_secs(10))
}

/// Global message store: individual parsed messages, 500 entries / 3min
/// TTL (spec.md §4.7).
#[must_use]
pub fn new_message_store<V>() -> TtlLru<MessageKey, V> {
    TtlLru::new(500, Duration::from_secs(180))
}

/// Attachment payload cache: decoded bytes, 200 entries / 3min TTL
/// (spec.md §4.7).
#[must_use]
pub fn new_payload_cache<V>() -> TtlLru<PayloadKey, V> {
    TtlLru::new(200, Duration::from_secs(180))
}
