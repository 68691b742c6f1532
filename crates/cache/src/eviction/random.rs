//! Random-replacement eviction set.

use rand::Rng;

use super::EvictionSet;

/// Random-replacement eviction set backed by a vector.
///
/// Insertion places the new value at a uniformly chosen index in
/// `[0, len]`; the value previously stored there moves to the tail. The tail
/// is always the next victim, so every value is equally likely to be evicted
/// regardless of when it was inserted.
#[derive(Debug)]
pub struct RrEvictionSet<T, R> {
    values: Vec<T>,
    rng: R,
}

impl<T, R: Rng> RrEvictionSet<T, R> {
    /// Creates an empty set drawing indices from `rng`.
    pub fn new(rng: R) -> Self {
        Self { values: Vec::new(), rng }
    }
}

impl<T, R: Rng> EvictionSet<T> for RrEvictionSet<T, R> {
    fn insert(&mut self, value: T) {
        let len = self.values.len();
        let idx = self.rng.gen_range(0..=len);
        if idx < len {
            let displaced = std::mem::replace(&mut self.values[idx], value);
            self.values.push(displaced);
        } else {
            self.values.push(value);
        }
    }

    fn touch(&mut self, _value: &T) {}

    fn peek(&self) -> Option<&T> {
        self.values.last()
    }

    fn remove(&mut self) {
        self.values.pop();
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}
