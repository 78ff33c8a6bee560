//! `smallBlocksPool`/`smallBlockReferencesPool` (§4.E.1): a reusable
//! allocator for associate-message blocks, capped at `maxNoOfSmallBlocks`
//! live allocations so a burst of missing channels can't run the proxy out
//! of memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use mesh_proto::DataBlock;

pub struct SmallBlockPool {
    block_size: usize,
    max_outstanding: usize,
    outstanding: AtomicUsize,
}

/// An allocation from the pool; dropping it returns the slot.
pub struct SmallBlockHandle<'a> {
    pool: &'a SmallBlockPool,
    pub block: DataBlock,
}

impl Drop for SmallBlockHandle<'_> {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SmallBlockPool {
    pub fn new(block_size: usize, max_outstanding: usize) -> Self {
        Self { block_size, max_outstanding, outstanding: AtomicUsize::new(0) }
    }

    /// Returns `None` once `max_outstanding` handles are alive, signalling
    /// the timer cycle to back off to the shortened period instead of
    /// growing the pool unbounded.
    pub fn try_alloc(&self) -> Option<SmallBlockHandle<'_>> {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current >= self.max_outstanding {
                return None;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SmallBlockHandle { pool: self, block: DataBlock::with_capacity(self.block_size) }),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.max_outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_max_outstanding() {
        let pool = SmallBlockPool::new(16, 2);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        drop(a);
        assert!(pool.try_alloc().is_some());
        drop(b);
    }
}
