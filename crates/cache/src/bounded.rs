//! Size-bounded map paired with an eviction set.

use std::{borrow::Borrow, collections::HashMap, hash::Hash};

use crate::eviction::{CacheReplacementPolicy, EvictionSet};

/// A map whose size never exceeds a configured maximum.
///
/// Keys are tracked in an [`EvictionSet`]; inserting a new key while the map
/// is full first evicts the set's victims until there is room. `BoundedCache`
/// is not synchronized: owners keep it behind the same lock that protects
/// any related state.
///
/// # Examples
///
/// ```
/// use castellan_cache::{BoundedCache, CacheReplacementPolicy};
///
/// let mut cache = BoundedCache::new(CacheReplacementPolicy::Fifo, 2);
/// cache.insert("a", 1);
/// cache.insert("b", 2);
/// cache.insert("c", 3);
///
/// assert_eq!(cache.len(), 2);
/// assert!(cache.get(&"a").is_none());
/// ```
pub struct BoundedCache<K, V> {
    entries: HashMap<K, V>,
    eviction_set: Box<dyn EvictionSet<K> + Send>,
    maximum_size: usize,
    evictions: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Creates an empty cache holding at most `maximum_size` entries.
    ///
    /// A maximum size of zero yields a cache that stores nothing.
    pub fn new(policy: CacheReplacementPolicy, maximum_size: usize) -> Self {
        Self::with_eviction_set(policy.new_eviction_set(), maximum_size)
    }

    /// Creates an empty cache around a caller-provided eviction set.
    pub fn with_eviction_set(
        eviction_set: Box<dyn EvictionSet<K> + Send>,
        maximum_size: usize,
    ) -> Self {
        Self { entries: HashMap::new(), eviction_set, maximum_size, evictions: 0 }
    }

    /// Returns the entry for `key`, recording the access with the eviction set.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (key, value) = self.entries.get_key_value(key)?;
        self.eviction_set.touch(key);
        Some(value)
    }

    /// Returns the entry for `key` without recording an access.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    /// Returns `true` if `key` has an entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Stores `value` under `key`.
    ///
    /// Replacing an existing entry counts as an access. Inserting a new key
    /// evicts as many victims as needed to stay within the maximum size.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            self.eviction_set.touch(&key);
            return;
        }
        if self.maximum_size == 0 {
            return;
        }
        while self.entries.len() >= self.maximum_size {
            let Some(victim) = self.eviction_set.peek().cloned() else {
                break;
            };
            self.eviction_set.remove();
            self.entries.remove(&victim);
            self.evictions += 1;
        }
        self.eviction_set.insert(key.clone());
        self.entries.insert(key, value);
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the configured maximum number of entries.
    pub fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    /// Returns the number of entries evicted to make room for new ones.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
