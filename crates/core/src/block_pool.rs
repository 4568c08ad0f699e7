use serde::Serialize;

use crate::error::CacheError;

pub type BlockId = usize;

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub utilization_pct: f64,
}

/// Manages physical block allocation. Pure bookkeeping, no tensor awareness.
pub struct BlockPool {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    allocated: Vec<bool>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        // LIFO: push 0..num_blocks so that pop gives low IDs first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            allocated: vec![false; num_blocks],
        }
    }

    /// Allocate n blocks. All-or-nothing: on failure the free list is untouched.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CacheError> {
        if n > self.free_list.len() {
            return Err(CacheError::OutOfBlocks {
                requested: n,
                available: self.free_list.len(),
            });
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.free_list.pop().expect("checked above");
            self.allocated[id] = true;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Return a set of blocks to the pool.
    ///
    /// Releasing an id that is not currently allocated means the caller's
    /// bookkeeping is corrupt; it fails loudly rather than silently no-oping.
    pub fn release(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        for &id in blocks {
            if id >= self.num_blocks || !self.allocated[id] {
                return Err(CacheError::BlockNotAllocated { block_id: id });
            }
            self.allocated[id] = false;
            self.free_list.push(id);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    pub fn utilization_pct(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        self.num_used() as f64 / self.num_blocks as f64 * 100.0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.num_total(),
            used: self.num_used(),
            free: self.num_free(),
            utilization_pct: self.utilization_pct(),
        }
    }
}
