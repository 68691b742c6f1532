//! # Castellan Cache
//!
//! Caching primitives shared by the Castellan authentication and
//! authorization crates.
//!
//! This crate provides:
//! - **Eviction sets**: LRU, FIFO and random-replacement victim selection
//! - **Bounded cache**: a size-capped map driven by an eviction set
//! - **Single-flight cache**: time-bounded entries with per-key request deduplication
//! - **Request context**: cancellation and deadlines for suspending operations
//!
//! ## Example
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
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bounded;
pub mod clock;
pub mod context;
pub mod eviction;
pub mod single_flight;
/// Test helpers such as a manually driven clock.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use bounded::BoundedCache;
pub use clock::{Clock, SystemClock};
pub use context::{ContextError, RequestContext};
pub use eviction::{CacheReplacementPolicy, EvictionSet};
pub use single_flight::{CacheStats, InFlight, Lookup, SingleFlightCache, Waiter};
