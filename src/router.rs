//! Shard routing strategies.
//!
//! A [`ShardRouter`] decides which of a counter's `shard_count` shards an
//! increment lands on. Routing is what turns one hot record into many
//! independently writable ones, so the strategy is pluggable:
//!
//! | Router | Policy | Notes |
//! |--------|--------|-------|
//! | [`UniformRouter`] | uniform random | default; balanced without coordination |
//! | [`RoundRobinRouter`] | shared cursor | perfectly even, one atomic per pick |
//! | [`ThreadSlotRouter`] | per-thread slot | stable shard per writer thread |
//!
//! # Thread Slot Assignment
//!
//! [`ThreadSlotRouter`] assigns slots the way in-process sharded counters do:
//! a global atomic sequence hands each thread the next slot the first time
//! it routes, and the slot is kept in thread-local storage. The shard is the
//! slot modulo the current fanout, so a thread keeps hitting the same record
//! until the fanout changes.
//!
//! ```text
//!   Thread 0 ──slot 0──►  shard0
//!   Thread 1 ──slot 1──►  shard1
//!        ...
//!   Thread 20 ─slot 20─►  shard0   (fanout 20)
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

/// Global counter for assigning slot IDs to threads.
static NEXT_SLOT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Slot of the current thread, assigned lazily and stable for its lifetime.
    static THREAD_SLOT_INDEX: usize = NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Chooses the shard an increment is written to.
pub trait ShardRouter: Send + Sync + Debug {
    /// Returns an index in `[0, shard_count)`. A `shard_count` of 0 is
    /// treated as 1.
    fn pick(&self, shard_count: u32) -> u32;
}

/// Picks a shard uniformly at random.
///
/// ```rust
/// use shardtally::router::{ShardRouter, UniformRouter};
///
/// let router = UniformRouter;
/// assert!(router.pick(20) < 20);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformRouter;

impl ShardRouter for UniformRouter {
    #[inline]
    fn pick(&self, shard_count: u32) -> u32 {
        rand::thread_rng().gen_range(0..shard_count.max(1))
    }
}

/// Cycles through shards using a shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    cursor: AtomicUsize,
}

impl RoundRobinRouter {
    /// Creates a router starting at shard 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardRouter for RoundRobinRouter {
    #[inline]
    fn pick(&self, shard_count: u32) -> u32 {
        let n = shard_count.max(1) as usize;
        (self.cursor.fetch_add(1, Ordering::Relaxed) % n) as u32
    }
}

/// Routes each thread to a stable shard derived from its slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSlotRouter;

impl ThreadSlotRouter {
    /// The slot assigned to the calling thread.
    pub fn current_slot() -> usize {
        THREAD_SLOT_INDEX.with(|slot| *slot)
    }
}

impl ShardRouter for ThreadSlotRouter {
    #[inline]
    fn pick(&self, shard_count: u32) -> u32 {
        let n = shard_count.max(1) as usize;
        (Self::current_slot() % n) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_uniform_in_range() {
        let router = UniformRouter;
        for _ in 0..1_000 {
            assert!(router.pick(7) < 7);
        }
    }

    #[test]
    fn test_uniform_covers_all_shards() {
        let router = UniformRouter;
        let seen: HashSet<u32> = (0..2_000).map(|_| router.pick(10)).collect();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_zero_fanout_is_one() {
        assert_eq!(UniformRouter.pick(0), 0);
        assert_eq!(RoundRobinRouter::new().pick(0), 0);
        assert_eq!(ThreadSlotRouter.pick(0), 0);
    }

    #[test]
    fn test_round_robin_cycles() {
        let router = RoundRobinRouter::new();
        let picks: Vec<u32> = (0..6).map(|_| router.pick(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_thread_slot_is_stable() {
        let router = ThreadSlotRouter;
        let first = router.pick(64);
        for _ in 0..100 {
            assert_eq!(router.pick(64), first);
        }
    }

    #[test]
    fn test_thread_slots_differ_between_threads() {
        let slots: HashSet<usize> = (0..4)
            .map(|_| thread::spawn(ThreadSlotRouter::current_slot))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(slots.len(), 4);
    }
}
