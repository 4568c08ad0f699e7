use crate::block_pool::BlockId;

/// Per-request mapping: logical block index → physical BlockId.
///
/// Covers only blocks the request exclusively owns. A prefix-matched
/// request addresses its shared tokens through the prefix entry's block
/// list, never through this table.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size,
        }
    }

    /// Append newly allocated block IDs.
    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.blocks.extend_from_slice(block_ids);
    }

    /// Total token slots covered by the allocated blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.block_size
    }

    /// Compute physical slot IDs for positions [start_pos..start_pos + n).
    ///
    /// Callers must check `start_pos + n <= capacity()` first.
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Vec<usize> {
        (start_pos..start_pos + n)
            .map(|pos| {
                let block_idx = pos / self.block_size;
                let offset = pos % self.block_size;
                self.blocks[block_idx] * self.block_size + offset
            })
            .collect()
    }

    /// The ordered list of physical block IDs.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Release all blocks, returning their IDs for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table() {
        let table = BlockTable::new(16);
        assert!(table.block_ids().is_empty());
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn capacity_grows_with_blocks() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[0, 3]);
        assert_eq!(table.capacity(), 32);
    }

    #[test]
    fn slot_mapping_sequential() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[5]); // physical block 5
        let slots = table.slot_mapping(0, 16);
        let expected: Vec<usize> = (0..16).map(|i| 5 * 16 + i).collect();
        assert_eq!(slots, expected);
    }

    #[test]
    fn slot_mapping_cross_block() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[3, 7]);
        let slots = table.slot_mapping(14, 4); // positions 14,15,16,17
        assert_eq!(
            slots,
            vec![
                3 * 16 + 14, // pos 14 → block 3, offset 14
                3 * 16 + 15, // pos 15 → block 3, offset 15
                7 * 16,      // pos 16 → block 7, offset 0
                7 * 16 + 1,  // pos 17 → block 7, offset 1
            ]
        );
    }

    #[test]
    fn slot_mapping_with_offset() {
        let mut table = BlockTable::new(4);
        table.append_blocks(&[0, 1]);
        let mapping = table.slot_mapping(3, 3);
        assert_eq!(mapping, vec![3, 4, 5]);
    }

    #[test]
    fn release_returns_all() {
        let mut table = BlockTable::new(16);
        table.append_blocks(&[2, 5, 9]);
        let released = table.release();
        assert_eq!(released, vec![2, 5, 9]);
        assert!(table.block_ids().is_empty());
        assert_eq!(table.capacity(), 0);
    }
}
