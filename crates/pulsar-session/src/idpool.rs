//! Pooled peer-id allocation.
//!
//! Ids live in `[1, max_peers]` and are handed out lowest-first from a
//! recycling pool. A released id goes to the back of the queue, so recently
//! freed ids are not immediately reissued to new connections.

use std::collections::VecDeque;
use std::sync::Mutex;

use pulsar_proto::PeerId;

/// Errors raised by the id pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdPoolError {
    /// Every id in `[1, max_peers]` is currently assigned.
    #[error("peer id pool exhausted ({capacity} ids in use)")]
    Exhausted {
        /// Total pool capacity.
        capacity: u16,
    },
}

/// A recycling pool of peer ids.
pub struct PeerIdPool {
    free: Mutex<VecDeque<PeerId>>,
    capacity: u16,
}

impl PeerIdPool {
    /// Create a pool covering `[1, max_peers]`. Id 0 is reserved as the
    /// unassigned sentinel and is never issued.
    pub fn new(max_peers: u16) -> Self {
        let free = (1..=max_peers).map(PeerId).collect();
        Self {
            free: Mutex::new(free),
            capacity: max_peers,
        }
    }

    /// Take the next free id.
    pub fn acquire(&self) -> Result<PeerId, IdPoolError> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop_front().ok_or(IdPoolError::Exhausted {
            capacity: self.capacity,
        })
    }

    /// Return an id to the pool. The caller must ensure the id is no longer
    /// referenced anywhere in the session before releasing it.
    pub fn release(&self, id: PeerId) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(!free.contains(&id), "double release of {id}");
        free.push_back(id);
    }

    /// How many ids are currently free.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total pool capacity.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_while_held() {
        let pool = PeerIdPool::new(32);
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let id = pool.acquire().unwrap();
            assert!(seen.insert(id), "pool issued {id} twice");
            assert!(id.0 >= 1 && id.0 <= 32, "id {id} out of range");
        }
    }

    #[test]
    fn test_zero_is_never_issued() {
        let pool = PeerIdPool::new(8);
        for _ in 0..8 {
            assert_ne!(pool.acquire().unwrap(), PeerId(0));
        }
    }

    #[test]
    fn test_exhausted_pool_reports_capacity() {
        let pool = PeerIdPool::new(2);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert_eq!(
            pool.acquire(),
            Err(IdPoolError::Exhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_released_ids_are_reissued() {
        let pool = PeerIdPool::new(1);
        let id = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(id);
        assert_eq!(pool.acquire().unwrap(), id);
    }

    #[test]
    fn test_release_goes_to_the_back() {
        let pool = PeerIdPool::new(3);
        let first = pool.acquire().unwrap();
        pool.release(first);
        // Two untouched ids come out before the recycled one.
        assert_ne!(pool.acquire().unwrap(), first);
        assert_ne!(pool.acquire().unwrap(), first);
        assert_eq!(pool.acquire().unwrap(), first);
    }
}
