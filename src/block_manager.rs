//! Per-sequence block tables over two memory tiers.
//!
//! Owns one [`TierAllocator`] per tier and a `seq_id -> BlockTable` map.
//! Implements allocate/append/fork/swap-in/swap-out/free with
//! copy-on-write, as specified in spec.md §4.2.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::allocator::TierAllocator;
use crate::block::{validate_block_size, BlockId, BlockTable, Tier};
use crate::error::CoreError;
use crate::sequence::{SeqId, Sequence, SequenceGroup, SequenceStatus};

pub struct BlockSpaceManager {
    block_size: usize,
    device: TierAllocator,
    host: TierAllocator,
    tables: HashMap<SeqId, BlockTable>,
}

impl BlockSpaceManager {
    pub fn new(block_size: usize, num_device_blocks: usize, num_host_blocks: usize) -> Result<Self, CoreError> {
        validate_block_size(block_size)?;
        Ok(Self {
            block_size,
            device: TierAllocator::new(Tier::Device, num_device_blocks),
            host: TierAllocator::new(Tier::Host, num_host_blocks),
            tables: HashMap::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_device_free(&self) -> usize {
        self.device.num_free()
    }

    pub fn num_host_free(&self) -> usize {
        self.host.num_free()
    }

    fn allocator_for(&mut self, tier: Tier) -> &mut TierAllocator {
        match tier {
            Tier::Device => &mut self.device,
            Tier::Host => &mut self.host,
        }
    }

    fn table(&self, seq_id: SeqId) -> Result<&BlockTable, CoreError> {
        self.tables
            .get(&seq_id)
            .ok_or(CoreError::UnknownSequence { seq_id })
    }

    // ---- allocation (prompt admission) ----------------------------------

    /// True iff the device allocator has at least one free block per
    /// prompt logical block (the prompt is common to all siblings, so only
    /// one table-worth of blocks is needed).
    pub fn can_allocate(&self, group: &SequenceGroup) -> bool {
        let needed = group.seqs[0].num_logical_blocks();
        needed <= self.device.num_free()
    }

    /// Allocate one device block per prompt logical block, shared by every
    /// sibling (ref_count = num siblings).
    pub fn allocate(&mut self, group: &SequenceGroup) -> Result<(), CoreError> {
        let num_siblings = group.num_seqs(None) as u32;
        let num_blocks = group.seqs[0].num_logical_blocks();

        let mut table = BlockTable::new(Tier::Device);
        for _ in 0..num_blocks {
            let block = self.device.allocate()?;
            for _ in 1..num_siblings {
                self.device.incref(block);
            }
            table.blocks.push(block);
        }

        for seq in &group.seqs {
            self.tables.insert(seq.seq_id, table.clone());
        }
        debug!(group = group.group_id, blocks = num_blocks, siblings = num_siblings, "allocated prompt blocks");
        Ok(())
    }

    // ---- append (one step per running sibling) --------------------------

    /// Conservative one-block-per-running-sibling heuristic (spec §4.2):
    /// must match the assumption used by [`Self::can_swap_in`].
    pub fn can_append(&self, group: &SequenceGroup) -> bool {
        let num_running = group.num_seqs(Some(SequenceStatus::Running));
        num_running <= self.device.num_free()
    }

    /// Reserve storage for a sequence's next token. Returns
    /// `Some((src_block, dst_block))` when a copy-on-write copy must be
    /// staged by the caller.
    pub fn append(&mut self, seq: &Sequence) -> Result<Option<(BlockId, BlockId)>, CoreError> {
        let num_logical = seq.num_logical_blocks();
        let table = self
            .tables
            .get_mut(&seq.seq_id)
            .ok_or(CoreError::UnknownSequence { seq_id: seq.seq_id })?;

        // Load-bearing invariant (spec §9): swapped groups never append.
        debug_assert_eq!(table.tier, Tier::Device, "append called on a non-device-resident table");

        if table.len() < num_logical {
            let block = self.device.allocate()?;
            table.blocks.push(block);
            return Ok(None);
        }

        let last = *table.blocks.last().expect("non-empty table once prompt is allocated");
        if self.device.ref_count(last) == 1 {
            Ok(None)
        } else {
            let new_block = self.device.allocate()?;
            *table.blocks.last_mut().unwrap() = new_block;
            self.device.free(last)?;
            debug!(seq_id = seq.seq_id, src = last, dst = new_block, "copy-on-write on shared tail block");
            Ok(Some((last, new_block)))
        }
    }

    // ---- fork (beam search) ----------------------------------------------

    /// Clone the parent's table into the child's slot, bumping refcounts.
    /// Allocates no new physical blocks — cannot fail with OOM.
    pub fn fork(&mut self, parent_seq_id: SeqId, child_seq_id: SeqId) -> Result<(), CoreError> {
        let table = self.table(parent_seq_id)?.clone();
        let allocator = self.allocator_for(table.tier);
        for &block in &table.blocks {
            allocator.incref(block);
        }
        self.tables.insert(child_seq_id, table);
        Ok(())
    }

    // ---- swap ---------------------------------------------------------------

    fn distinct_live_blocks(&self, group: &SequenceGroup) -> HashSet<BlockId> {
        let mut blocks = HashSet::new();
        for seq in &group.seqs {
            if seq.status == SequenceStatus::Finished {
                continue;
            }
            if let Some(table) = self.tables.get(&seq.seq_id) {
                blocks.extend(table.blocks.iter().copied());
            }
        }
        blocks
    }

    /// `|distinct_live_blocks| + num_swapped_siblings <= num_device_free`.
    /// The extra term is the same one-block-per-sibling guard `can_append`
    /// uses, so a just-swapped-in group can immediately take its first step.
    pub fn can_swap_in(&self, group: &SequenceGroup) -> bool {
        let distinct = self.distinct_live_blocks(group).len();
        let swapped = group.num_seqs(Some(SequenceStatus::Swapped));
        distinct + swapped <= self.device.num_free()
    }

    pub fn can_swap_out(&self, group: &SequenceGroup) -> bool {
        let distinct = self.distinct_live_blocks(group).len();
        distinct <= self.host.num_free()
    }

    /// Migrate every live sibling's table from host to device, deduping
    /// shared host blocks within the group. Returns host->device mapping.
    pub fn swap_in(&mut self, group: &SequenceGroup) -> Result<HashMap<BlockId, BlockId>, CoreError> {
        self.swap(group, Tier::Host, Tier::Device)
    }

    /// Symmetric to [`Self::swap_in`]. Returns device->host mapping.
    pub fn swap_out(&mut self, group: &SequenceGroup) -> Result<HashMap<BlockId, BlockId>, CoreError> {
        self.swap(group, Tier::Device, Tier::Host)
    }

    fn swap(&mut self, group: &SequenceGroup, from: Tier, to: Tier) -> Result<HashMap<BlockId, BlockId>, CoreError> {
        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();

        for seq in &group.seqs {
            if seq.status == SequenceStatus::Finished {
                continue;
            }
            let old_table = self
                .tables
                .get(&seq.seq_id)
                .ok_or(CoreError::UnknownSequence { seq_id: seq.seq_id })?
                .clone();
            debug_assert_eq!(old_table.tier, from);

            let mut new_table = BlockTable::new(to);
            for &old_block in &old_table.blocks {
                let new_block = if let Some(&mapped) = mapping.get(&old_block) {
                    self.allocator_for(to).incref(mapped);
                    mapped
                } else {
                    let mapped = self.allocator_for(to).allocate()?;
                    mapping.insert(old_block, mapped);
                    mapped
                };
                new_table.blocks.push(new_block);
                self.allocator_for(from).free(old_block)?;
            }
            self.tables.insert(seq.seq_id, new_table);
        }

        debug!(group = group.group_id, from = %from, to = %to, blocks = mapping.len(), "swapped group");
        Ok(mapping)
    }

    // ---- teardown ----------------------------------------------------------

    fn free_table(&mut self, table: &BlockTable) -> Result<(), CoreError> {
        let allocator = match table.tier {
            Tier::Device => &mut self.device,
            Tier::Host => &mut self.host,
        };
        for &block in &table.blocks {
            allocator.free(block)?;
        }
        Ok(())
    }

    pub fn free(&mut self, seq_id: SeqId) -> Result<(), CoreError> {
        let table = self
            .tables
            .remove(&seq_id)
            .ok_or(CoreError::UnknownSequence { seq_id })?;
        self.free_table(&table)
    }

    pub fn reset(&mut self) -> Result<(), CoreError> {
        let tables: Vec<BlockTable> = self.tables.values().cloned().collect();
        for table in &tables {
            self.free_table(table)?;
        }
        self.tables.clear();
        Ok(())
    }

    pub fn get_block_table(&self, seq_id: SeqId) -> Result<&[BlockId], CoreError> {
        Ok(&self.table(seq_id)?.blocks)
    }

    pub fn tier_of(&self, seq_id: SeqId) -> Result<Tier, CoreError> {
        Ok(self.table(seq_id)?.tier)
    }
}
