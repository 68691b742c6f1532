//! Wall-clock abstraction.
//!
//! Cache validity is expressed in wall-clock time because credentials carry
//! absolute timestamps (`exp`, `nbf`, `cacheExpirationTime`). Components take
//! an `Arc<dyn Clock>` so tests can control time.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
