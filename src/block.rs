//! Logical/physical block types and the per-sequence block table.
//!
//! A logical block is a fixed-capacity, append-only token buffer local to
//! one sequence. A physical block is a reference-counted handle identifying
//! a slot in a tier's memory pool; block tables map the former onto the
//! latter, one entry per logical block, in order.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Allowed block sizes (spec §3): token capacity per block.
pub const VALID_BLOCK_SIZES: [usize; 3] = [8, 16, 32];

/// Which memory tier a block table currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Fast tier: device memory.
    Device,
    /// Slow tier: host memory.
    Host,
}

impl Tier {
    /// The other tier — the only legal swap target.
    pub fn other(&self) -> Tier {
        match self {
            Tier::Device => Tier::Host,
            Tier::Host => Tier::Device,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Device => write!(f, "device"),
            Tier::Host => write!(f, "host"),
        }
    }
}

/// Tier-local identity of a physical block. Stable across the plan/trait
/// boundary (spec §5): callers outside the core never hold raw references,
/// only these integers.
pub type BlockId = u32;

/// A fixed-capacity, append-only token buffer local to one sequence.
///
/// Invariant: only the last logical block of a sequence may be non-full
/// (enforced by [`crate::sequence::Sequence::append`], which always fills
/// the current tail before allocating a new one).
#[derive(Debug, Clone)]
pub struct LogicalBlock {
    /// Zero-based index within the owning sequence.
    pub block_number: usize,
    /// Fixed capacity in tokens.
    pub block_size: usize,
    /// Token ids currently stored, `len() <= block_size`.
    pub token_ids: Vec<i32>,
}

impl LogicalBlock {
    pub fn new(block_number: usize, block_size: usize) -> Self {
        Self {
            block_number,
            block_size,
            token_ids: Vec::with_capacity(block_size),
        }
    }

    pub fn is_full(&self) -> bool {
        self.token_ids.len() == self.block_size
    }

    pub fn num_empty_slots(&self) -> usize {
        self.block_size - self.token_ids.len()
    }

    /// Append up to `num_empty_slots()` tokens. Panics if `tokens` would
    /// overflow the block — callers must slice to `num_empty_slots()` first.
    pub fn append(&mut self, tokens: &[i32]) {
        assert!(tokens.len() <= self.num_empty_slots());
        self.token_ids.extend_from_slice(tokens);
    }
}

/// A reference-counted physical block living in one tier's pool.
///
/// Invariant: `ref_count == 0` iff the block is on its tier's free list
/// ([`crate::allocator::TierAllocator`] is the only place that mutates this).
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysicalBlock {
    pub ref_count: u32,
}

/// A sequence's ordered block table: `blocks[i]` is the physical block
/// backing logical block `i`, i.e. tokens `[i*block_size, (i+1)*block_size)`.
///
/// Invariant: all blocks in one table share the same tier (no intra-sequence
/// heterogeneity, spec §3).
#[derive(Debug, Clone)]
pub struct BlockTable {
    pub tier: Tier,
    pub blocks: Vec<BlockId>,
}

impl BlockTable {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            blocks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Validate a configured block size against spec §3's construction-time
/// invariant.
pub fn validate_block_size(block_size: usize) -> Result<(), CoreError> {
    if VALID_BLOCK_SIZES.contains(&block_size) {
        Ok(())
    } else {
        Err(CoreError::BlockSizeInvalid { block_size })
    }
}
