//! Free-list allocator over one memory tier.
//!
//! Owns a fixed pool of `num_blocks` physical blocks and a free list. The
//! free list is a bag: no ordering is promised to callers. This
//! implementation uses a `VecDeque` (LIFO via `pop_back`) for cache
//! friendliness, matching the teacher's per-device VRAM allocator.

use std::collections::VecDeque;

use tracing::debug;

use crate::block::{BlockId, PhysicalBlock, Tier};
use crate::error::CoreError;

pub struct TierAllocator {
    tier: Tier,
    blocks: Vec<PhysicalBlock>,
    free_list: VecDeque<BlockId>,
}

impl TierAllocator {
    pub fn new(tier: Tier, num_blocks: usize) -> Self {
        let blocks = vec![PhysicalBlock::default(); num_blocks];
        let free_list = (0..num_blocks as BlockId).collect();
        Self {
            tier,
            blocks,
            free_list,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn num_total(&self) -> usize {
        self.blocks.len()
    }

    /// Pop one block off the free list, set its ref_count to 1.
    pub fn allocate(&mut self) -> Result<BlockId, CoreError> {
        let id = self
            .free_list
            .pop_back()
            .ok_or(CoreError::OutOfMemory { tier: self.tier })?;
        self.blocks[id as usize].ref_count = 1;
        debug!(tier = %self.tier, block = id, "allocated block");
        Ok(id)
    }

    /// Decrement a block's ref_count; push it back to the free list once it
    /// reaches zero. Errors if the incoming count is already zero.
    pub fn free(&mut self, block: BlockId) -> Result<(), CoreError> {
        let phys = &mut self.blocks[block as usize];
        if phys.ref_count == 0 {
            return Err(CoreError::DoubleFree {
                tier: self.tier,
                block_number: block,
            });
        }
        phys.ref_count -= 1;
        if phys.ref_count == 0 {
            self.free_list.push_back(block);
            debug!(tier = %self.tier, block, "freed block (returned to free list)");
        } else {
            debug!(tier = %self.tier, block, ref_count = phys.ref_count, "decremented block refcount");
        }
        Ok(())
    }

    /// Increment a block's ref_count without allocating (used by fork/swap
    /// dedup, which bump an existing handle rather than minting a new one).
    pub fn incref(&mut self, block: BlockId) {
        self.blocks[block as usize].ref_count += 1;
    }

    pub fn ref_count(&self, block: BlockId) -> u32 {
        self.blocks[block as usize].ref_count
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }
}
