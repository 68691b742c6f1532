//! Time-bounded cache with per-key request deduplication.
//!
//! [`SingleFlightCache`] is the shared discipline behind the remote
//! authentication and authorization clients:
//!
//! ```text
//! lookup(key) ── fresh entry? ──────────────────────────► Cached(value)
//!             └─ another task fetching key? ────────────► Wait(waiter)
//!             └─ otherwise: register pending entry ─────► Owner(in_flight)
//!
//! Owner:  perform the remote call without holding the lock
//!         in_flight.complete(Some((value, cache_until)))  // cache + wake waiters
//!         in_flight.complete(None)                        // wake waiters, no entry
//!
//! Waiter: waiter.wait(ctx) then lookup(key) again
//! ```
//!
//! Waiters that observe completion see either a fresh entry (the owner
//! succeeded with a cacheable result) or no entry, in which case their next
//! lookup makes them the owner of a retry. Dropping an [`InFlight`] without
//! completing it (for example because the owning future was cancelled)
//! deregisters the pending entry and wakes the waiters.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    bounded::BoundedCache,
    clock::Clock,
    context::{ContextError, RequestContext},
    eviction::CacheReplacementPolicy,
};

struct CachedValue<V> {
    value: V,
    cache_until: DateTime<Utc>,
}

struct State<K, V> {
    entries: BoundedCache<K, CachedValue<V>>,
    pending: HashMap<K, watch::Receiver<()>>,
}

/// Point-in-time counters of a [`SingleFlightCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a fresh entry.
    pub hits: u64,
    /// Lookups that made the caller the owner of a new request.
    pub misses: u64,
    /// Lookups that had to wait for another caller's request.
    pub waits: u64,
    /// Entries evicted to respect the maximum size.
    pub evictions: u64,
    /// Entries currently stored, fresh or not.
    pub entries: usize,
}

/// Outcome of a [`SingleFlightCache`] lookup.
pub enum Lookup<'a, K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// A fresh cached value.
    Cached(V),
    /// Another caller is fetching this key.
    Wait(Waiter),
    /// The caller must fetch this key and report the outcome.
    Owner(InFlight<'a, K, V>),
}

/// Handle to another caller's in-flight request.
#[derive(Debug)]
pub struct Waiter {
    receiver: watch::Receiver<()>,
}

impl Waiter {
    /// Waits until the in-flight request finishes or `ctx` is done.
    ///
    /// # Errors
    ///
    /// Returns the context's status if it finished first.
    pub async fn wait(mut self, ctx: &RequestContext) -> Result<(), ContextError> {
        tokio::select! {
            // The sender is never written to, so this only resolves once the
            // owner drops it.
            _ = self.receiver.changed() => Ok(()),
            err = ctx.done() => Err(err),
        }
    }
}

/// Ownership of a pending request for one key.
pub struct InFlight<'a, K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    cache: &'a SingleFlightCache<K, V>,
    key: K,
    sender: Option<watch::Sender<()>>,
}

impl<K, V> InFlight<'_, K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Returns the key this request is for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Finishes the request, caching `outcome` if it is still valid, and
    /// wakes all waiters.
    ///
    /// Pass `None` for results that must not be cached.
    pub fn complete(mut self, outcome: Option<(V, DateTime<Utc>)>) {
        let now = self.cache.clock.now();
        {
            let mut state = self.cache.state.lock();
            if let Some((value, cache_until)) = outcome
                && now < cache_until
            {
                state.entries.insert(self.key.clone(), CachedValue { value, cache_until });
            }
            state.pending.remove(&self.key);
        }
        self.sender.take();
    }
}

impl<K, V> Drop for InFlight<'_, K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            self.cache.state.lock().pending.remove(&self.key);
        }
    }
}

/// Bounded, time-aware cache that lets only one caller fetch a given key at
/// a time.
///
/// A single mutex covers both the entry map (with its eviction set) and the
/// pending-request map, so all operations are linearizable.
pub struct SingleFlightCache<K, V> {
    clock: Arc<dyn Clock>,
    state: Mutex<State<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone,
{
    /// Creates an empty cache holding at most `maximum_size` entries.
    pub fn new(
        clock: Arc<dyn Clock>,
        policy: CacheReplacementPolicy,
        maximum_size: usize,
    ) -> Self {
        Self {
            clock,
            state: Mutex::new(State {
                entries: BoundedCache::new(policy, maximum_size),
                pending: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    /// Looks up a single key.
    pub fn lookup(&self, key: &K) -> Lookup<'_, K, V> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.lookup_locked(&mut state, key, now)
    }

    /// Looks up several keys under one lock acquisition.
    ///
    /// The result has one entry per input key, in order.
    pub fn lookup_many(&self, keys: &[K]) -> Vec<Lookup<'_, K, V>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        keys.iter().map(|key| self.lookup_locked(&mut state, key, now)).collect()
    }

    fn lookup_locked(
        &self,
        state: &mut State<K, V>,
        key: &K,
        now: DateTime<Utc>,
    ) -> Lookup<'_, K, V> {
        if let Some(entry) = state.entries.get(key)
            && now < entry.cache_until
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Cached(entry.value.clone());
        }

        if let Some(receiver) = state.pending.get(key) {
            self.waits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Wait(Waiter { receiver: receiver.clone() });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(());
        state.pending.insert(key.clone(), receiver);
        Lookup::Owner(InFlight { cache: self, key: key.clone(), sender: Some(sender) })
    }

    /// Returns the number of keys with a request in flight.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            evictions: state.entries.evictions(),
            entries: state.entries.len(),
        }
    }
}
