//! Core error kinds.
//!
//! Every fallible operation in [`crate::allocator`], [`crate::block_manager`],
//! and [`crate::scheduler`] returns `Result<_, CoreError>`. All variants are
//! fatal to the affected operation; the scheduler does not retry on them —
//! the `can_*` predicates in [`crate::block_manager`] exist precisely so
//! that ordinary memory pressure never reaches this error path.

use thiserror::Error;

use crate::block::Tier;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("out of memory: no free blocks on tier {tier:?}")]
    OutOfMemory { tier: Tier },

    #[error("double free: block {block_number} on tier {tier:?} already has ref_count 0")]
    DoubleFree { tier: Tier, block_number: u32 },

    #[error("unknown sequence: no block table for seq_id {seq_id}")]
    UnknownSequence { seq_id: u64 },

    #[error("invalid block size {block_size}: must be one of 8, 16, 32")]
    BlockSizeInvalid { block_size: usize },
}
