//! Property tests comparing the eviction sets against a simple ordered model.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::VecDeque;

use castellan_cache::{
    BoundedCache, CacheReplacementPolicy,
    eviction::{EvictionSet, FifoEvictionSet, LruEvictionSet},
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8),
    Touch(u8),
    Evict,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..16).prop_map(Op::Insert),
            (0u8..16).prop_map(Op::Touch),
            Just(Op::Evict),
        ],
        0..128,
    )
}

/// Replays `ops` against both `set` and a deque model, where the front of
/// the deque is the next victim. `touch_moves` selects LRU semantics.
fn check_against_model(
    set: &mut dyn EvictionSet<u8>,
    ops: &[Op],
    touch_moves: bool,
) -> Result<(), TestCaseError> {
    let mut model: VecDeque<u8> = VecDeque::new();
    for op in ops {
        match *op {
            Op::Insert(v) => {
                if !model.contains(&v) {
                    set.insert(v);
                    model.push_back(v);
                }
            },
            Op::Touch(v) => {
                if let Some(pos) = model.iter().position(|x| *x == v) {
                    set.touch(&v);
                    if touch_moves {
                        model.remove(pos);
                        model.push_back(v);
                    }
                }
            },
            Op::Evict => {
                prop_assert_eq!(set.peek().copied(), model.front().copied());
                if !model.is_empty() {
                    set.remove();
                    model.pop_front();
                }
            },
        }
        prop_assert_eq!(set.len(), model.len());
        prop_assert_eq!(set.peek().copied(), model.front().copied());
    }
    Ok(())
}

proptest! {
    /// The LRU victim is always the least recently inserted or touched value.
    #[test]
    fn lru_matches_recency_model(ops in arb_ops()) {
        check_against_model(&mut LruEvictionSet::new(), &ops, true)?;
    }

    /// The FIFO victim is always the oldest insertion, whatever was touched.
    #[test]
    fn fifo_matches_insertion_model(ops in arb_ops()) {
        check_against_model(&mut FifoEvictionSet::new(), &ops, false)?;
    }

    /// No policy lets a bounded cache grow past its maximum size, and the
    /// most recent insertion always survives.
    #[test]
    fn bounded_cache_respects_ceiling(
        keys in prop::collection::vec(0u16..64, 1..256),
        maximum_size in 1usize..16,
        policy in prop_oneof![
            Just(CacheReplacementPolicy::Fifo),
            Just(CacheReplacementPolicy::Lru),
            Just(CacheReplacementPolicy::Rr),
        ],
    ) {
        let mut cache = BoundedCache::new(policy, maximum_size);
        for key in keys {
            cache.insert(key, ());
            prop_assert!(cache.len() <= maximum_size);
            prop_assert!(cache.contains_key(&key));
        }
    }
}
