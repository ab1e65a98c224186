//! # Bounded Cache
//!
//! A capacity-bounded most-recently-used cache with watermark eviction.
//!
//! Unlike a classic LRU cache that evicts one entry per insert once full,
//! this cache lets the population grow to a *high* watermark and then, in a
//! single purge, evicts least-recently-used entries down to a *low*
//! watermark. Batched eviction keeps the purge cost off the common insert
//! path and gives evicted entries a chance to be persisted through an
//! eviction hook before they are dropped.
//!
//! ## Semantics
//!
//! - `get_or_create` promotes an existing entry to most-recently-used, or
//!   inserts a fresh one built by the supplied factory.
//! - When an insert would push the population above `high_water`, entries
//!   are evicted from the least-recently-used end until `low_water` remain
//!   (counting the fresh entry). The hook runs once per evicted entry, in
//!   LRU -> MRU order, before the entry is dropped.
//! - The entry touched by the current call is never evicted by that call.
//! - `remove` hands the entry back to the caller without firing the hook.

use std::hash::Hash;

use lru::LruCache;

/// Watermark pair controlling batched eviction.
///
/// `high_water` is the population at which a purge triggers; `low_water` is
/// the population a purge leaves behind. Both are clamped to at least 1 and
/// `low_water` never exceeds `high_water`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    high_water: usize,
    low_water: usize,
}

impl CachePolicy {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        let high_water = high_water.max(1);
        let low_water = low_water.clamp(1, high_water);
        Self {
            high_water,
            low_water,
        }
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(10, 5)
    }
}

type EvictionHook<K, V> = Box<dyn FnMut(&K, &mut V) + Send>;

/// MRU cache bounded by a [`CachePolicy`], with an optional eviction hook.
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    policy: CachePolicy,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: LruCache::unbounded(),
            policy,
            on_evict: None,
        }
    }

    /// Installs a hook invoked once per evicted entry, before the entry is
    /// dropped. Runs for watermark purges and [`evict_all`](Self::evict_all),
    /// not for [`remove`](Self::remove).
    pub fn with_eviction_hook(mut self, hook: impl FnMut(&K, &mut V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Returns the entry for `key`, promoting it to most-recently-used, or
    /// inserts the value built by `create`. A purge triggered by the insert
    /// spares the fresh entry.
    pub fn get_or_create(&mut self, key: K, create: impl FnOnce() -> V) -> &mut V {
        if !self.entries.contains(&key) {
            self.make_room_for_one();
        }
        self.entries.get_or_insert_mut(key, create)
    }

    /// Promotes and returns the entry for `key`, if cached.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Promotes and returns the entry for `key` mutably, if cached.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Returns the entry for `key` without promoting it.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Removes and returns the entry for `key`. The eviction hook does not
    /// run; ownership passes to the caller.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    /// Evicts every entry in LRU -> MRU order, running the hook for each.
    pub fn evict_all(&mut self) {
        while let Some((key, mut value)) = self.entries.pop_lru() {
            if let Some(hook) = self.on_evict.as_mut() {
                hook(&key, &mut value);
            }
        }
    }

    /// Iterates entries in MRU -> LRU order without promoting them.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    // Evicts down to low_water when the pending insert would exceed
    // high_water. Counting the incoming entry here is what keeps it safe
    // from its own purge.
    fn make_room_for_one(&mut self) {
        if self.entries.len() + 1 <= self.policy.high_water {
            return;
        }
        while self.entries.len() + 1 > self.policy.low_water {
            match self.entries.pop_lru() {
                Some((key, mut value)) => {
                    if let Some(hook) = self.on_evict.as_mut() {
                        hook(&key, &mut value);
                    }
                }
                None => break,
            }
        }
    }
}

impl<K: Hash + Eq, V> Default for BoundedCache<K, V> {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}
