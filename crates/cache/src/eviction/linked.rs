//! Linked-list eviction sets (LRU and FIFO).
//!
//! Both policies keep values in a circular doubly linked list threaded
//! through an arena of nodes. Index 0 is the head sentinel: the node after it
//! is the oldest value, the node before it the newest. The map owns the
//! mapping from value to node index; list links are plain indices.

use std::{collections::HashMap, hash::Hash};

use super::EvictionSet;

const SENTINEL: usize = 0;

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct LinkedSet<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    index: HashMap<T, usize>,
}

impl<T: Clone + Eq + Hash> LinkedSet<T> {
    fn new() -> Self {
        Self {
            nodes: vec![Node { value: None, prev: SENTINEL, next: SENTINEL }],
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn link_newest(&mut self, idx: usize) {
        let newest = self.nodes[SENTINEL].prev;
        self.nodes[idx].prev = newest;
        self.nodes[idx].next = SENTINEL;
        self.nodes[newest].next = idx;
        self.nodes[SENTINEL].prev = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let Node { prev, next, .. } = self.nodes[idx];
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    fn insert(&mut self, value: T) {
        debug_assert!(!self.index.contains_key(&value), "value inserted twice");
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx].value = Some(value.clone());
                idx
            },
            None => {
                self.nodes.push(Node { value: Some(value.clone()), prev: SENTINEL, next: SENTINEL });
                self.nodes.len() - 1
            },
        };
        self.index.insert(value, idx);
        self.link_newest(idx);
    }

    fn move_to_newest(&mut self, value: &T) {
        if let Some(&idx) = self.index.get(value) {
            self.unlink(idx);
            self.link_newest(idx);
        }
    }

    fn peek(&self) -> Option<&T> {
        match self.nodes[SENTINEL].next {
            SENTINEL => None,
            oldest => self.nodes[oldest].value.as_ref(),
        }
    }

    fn remove(&mut self) {
        let oldest = self.nodes[SENTINEL].next;
        if oldest == SENTINEL {
            return;
        }
        self.unlink(oldest);
        if let Some(value) = self.nodes[oldest].value.take() {
            self.index.remove(&value);
        }
        self.free.push(oldest);
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Least-recently-used eviction set.
///
/// [`touch`](EvictionSet::touch) moves a value to the newest position, so
/// [`peek`](EvictionSet::peek) yields the value whose last insert or touch is
/// the oldest.
#[derive(Debug)]
pub struct LruEvictionSet<T> {
    list: LinkedSet<T>,
}

impl<T: Clone + Eq + Hash> LruEvictionSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { list: LinkedSet::new() }
    }
}

impl<T: Clone + Eq + Hash> Default for LruEvictionSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> EvictionSet<T> for LruEvictionSet<T> {
    fn insert(&mut self, value: T) {
        self.list.insert(value);
    }

    fn touch(&mut self, value: &T) {
        self.list.move_to_newest(value);
    }

    fn peek(&self) -> Option<&T> {
        self.list.peek()
    }

    fn remove(&mut self) {
        self.list.remove();
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}

/// First-in-first-out eviction set.
///
/// Identical to [`LruEvictionSet`] except that touching is a no-op.
#[derive(Debug)]
pub struct FifoEvictionSet<T> {
    list: LinkedSet<T>,
}

impl<T: Clone + Eq + Hash> FifoEvictionSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { list: LinkedSet::new() }
    }
}

impl<T: Clone + Eq + Hash> Default for FifoEvictionSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> EvictionSet<T> for FifoEvictionSet<T> {
    fn insert(&mut self, value: T) {
        self.list.insert(value);
    }

    fn touch(&mut self, _value: &T) {}

    fn peek(&self) -> Option<&T> {
        self.list.peek()
    }

    fn remove(&mut self) {
        self.list.remove();
    }

    fn len(&self) -> usize {
        self.list.len()
    }
}
