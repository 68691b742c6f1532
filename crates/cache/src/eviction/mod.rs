//! Cache replacement bookkeeping.
//!
//! An [`EvictionSet`] tracks the keys of a cache and always knows which key
//! should be evicted next. Caches hold the set behind the same lock as their
//! map, so none of the implementations here are synchronized.
//!
//! # Policies
//!
//! | Policy | `touch` | Victim |
//! |--------|---------|--------|
//! | [`LruEvictionSet`] | moves to newest | least recently inserted or touched |
//! | [`FifoEvictionSet`] | no-op | oldest insertion |
//! | [`RrEvictionSet`] | no-op | uniformly random |
//!
//! # Example
//!
//! ```
//! use castellan_cache::eviction::{EvictionSet, LruEvictionSet};
//!
//! let mut set = LruEvictionSet::new();
//! set.insert("a");
//! set.insert("b");
//! set.touch(&"a");
//!
//! assert_eq!(set.peek(), Some(&"b"));
//! set.remove();
//! assert_eq!(set.peek(), Some(&"a"));
//! ```

mod linked;
mod random;

use std::hash::Hash;

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

pub use linked::{FifoEvictionSet, LruEvictionSet};
pub use random::RrEvictionSet;

/// Ordered bookkeeping of cache keys under a replacement policy.
///
/// Callers must pair every [`remove`](Self::remove) with a preceding
/// [`peek`](Self::peek) and must not mutate the set in between.
pub trait EvictionSet<T> {
    /// Adds a value that is not yet part of the set.
    fn insert(&mut self, value: T);

    /// Records a use of a value that is part of the set.
    fn touch(&mut self, value: &T);

    /// Returns the value that should be evicted next, or `None` if the set
    /// is empty.
    fn peek(&self) -> Option<&T>;

    /// Removes the value last returned by [`peek`](Self::peek).
    fn remove(&mut self);

    /// Returns the number of values in the set.
    fn len(&self) -> usize;

    /// Returns `true` if the set holds no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache replacement policy, chosen at configuration time.
///
/// Serialized as `"FIFO"`, `"LRU"` or `"RR"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheReplacementPolicy {
    /// Evict the oldest inserted key.
    #[serde(rename = "FIFO")]
    Fifo,
    /// Evict the least recently used key.
    #[default]
    #[serde(rename = "LRU")]
    Lru,
    /// Evict a uniformly random key.
    #[serde(rename = "RR")]
    Rr,
}

impl CacheReplacementPolicy {
    /// Creates an empty eviction set implementing this policy.
    ///
    /// Random replacement is seeded from the operating system.
    pub fn new_eviction_set<T>(self) -> Box<dyn EvictionSet<T> + Send>
    where
        T: Clone + Eq + Hash + Send + 'static,
    {
        match self {
            Self::Fifo => Box::new(FifoEvictionSet::new()),
            Self::Lru => Box::new(LruEvictionSet::new()),
            Self::Rr => Box::new(RrEvictionSet::new(StdRng::from_entropy())),
        }
    }
}
