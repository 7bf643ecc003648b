//! Object identifier allocation.
//!
//! Identifiers come from a monotonically increasing counter until some are
//! released; released identifiers are then handed out again oldest-first.
//! A live set pairs every release with an earlier allocate so a stray or
//! repeated Delete can never put the same identifier in the queue twice.

use std::collections::{HashSet, VecDeque};

use replica_shared::object::ObjectId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdPoolError {
    #[error("identifier {0} is not live")]
    NotLive(ObjectId),
}

/// FIFO-recycling identifier allocator.
#[derive(Debug, Clone)]
pub struct IdPool {
    /// `None` once every u32 has been handed out fresh.
    next_fresh: Option<u32>,
    freed: VecDeque<ObjectId>,
    live: HashSet<ObjectId>,
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next_fresh: Some(0),
            freed: VecDeque::new(),
            live: HashSet::new(),
        }
    }

    /// Returns the least recently released identifier, or a fresh one.
    ///
    /// `None` only when all 2^32 identifiers are live.
    pub fn allocate(&mut self) -> Option<ObjectId> {
        let id = match self.freed.pop_front() {
            Some(id) => id,
            None => {
                let fresh = self.next_fresh?;
                self.next_fresh = fresh.checked_add(1);
                ObjectId(fresh)
            }
        };
        self.live.insert(id);
        Some(id)
    }

    /// Queues `id` for reuse. Fails if `id` is not currently allocated.
    pub fn release(&mut self, id: ObjectId) -> Result<(), IdPoolError> {
        if !self.live.remove(&id) {
            return Err(IdPoolError::NotLive(id));
        }
        self.freed.push_back(id);
        Ok(())
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_counts_up_from_zero() {
        let mut pool = IdPool::new();
        let ids: Vec<_> = (0..3).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(ids, vec![ObjectId(0), ObjectId(1), ObjectId(2)]);
        assert_eq!(pool.live_count(), 3);
    }

    #[test]
    fn released_ids_are_reused_oldest_first() {
        let mut pool = IdPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.release(a).unwrap();
        pool.release(b).unwrap();

        assert_eq!(pool.allocate(), Some(a));
        assert_eq!(pool.allocate(), Some(b));
        assert_eq!(pool.allocate(), Some(ObjectId(2)));
    }

    #[test]
    fn release_order_not_id_order_decides_reuse() {
        let mut pool = IdPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.release(b).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.allocate(), Some(b));
        assert_eq!(pool.allocate(), Some(a));
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool = IdPool::new();
        let a = pool.allocate().unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.release(a), Err(IdPoolError::NotLive(a)));

        // Only one copy was queued.
        assert_eq!(pool.allocate(), Some(a));
        assert_eq!(pool.allocate(), Some(ObjectId(1)));
    }

    #[test]
    fn releasing_unallocated_id_is_rejected() {
        let mut pool = IdPool::new();
        assert_eq!(pool.release(ObjectId(5)), Err(IdPoolError::NotLive(ObjectId(5))));
        assert_eq!(pool.allocate(), Some(ObjectId(0)));
    }

    #[test]
    fn exhausted_counter_only_serves_released_ids() {
        let mut pool = IdPool {
            next_fresh: Some(u32::MAX),
            ..IdPool::new()
        };
        let last = pool.allocate().unwrap();
        assert_eq!(last, ObjectId(u32::MAX));
        assert_eq!(pool.allocate(), None);

        pool.release(last).unwrap();
        assert_eq!(pool.allocate(), Some(last));
    }
}
