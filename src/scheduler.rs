//! Per-iteration admission, preemption, swap, and batching (spec §4.3).
//!
//! The scheduler is single-threaded and cooperative: `step()` and
//! `post_step()` run to completion without suspension points of their own
//! (spec §5). They are the sole mutators of the block-space manager, the
//! three queues, and the per-group ancillary maps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::BlockId;
use crate::block_manager::BlockSpaceManager;
use crate::error::CoreError;
use crate::frontend::{Controller, Frontend, StepPlan, TokenSample};
use crate::metrics::SchedulerMetrics;
use crate::sequence::{GroupId, SamplingParams, SeqId, SequenceGroup, SequenceStatus};

pub struct Scheduler {
    block_manager: BlockSpaceManager,
    frontend: Arc<dyn Frontend>,
    controllers: Vec<Arc<dyn Controller>>,
    max_batched_tokens: usize,

    /// Groups currently in device memory, arrival order. The tail is the
    /// youngest and therefore the first preemption victim.
    running: Vec<SequenceGroup>,
    /// Groups currently in host memory, LIFO (most-recently-swapped-out is
    /// the oldest original arrival among swapped groups).
    swapped: Vec<SequenceGroup>,
    /// Groups awaiting first admission, FIFO.
    pending: VecDeque<SequenceGroup>,

    num_steps: HashMap<GroupId, u32>,
    sampling_params: HashMap<GroupId, SamplingParams>,

    metrics: Option<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(
        block_manager: BlockSpaceManager,
        frontend: Arc<dyn Frontend>,
        controllers: Vec<Arc<dyn Controller>>,
        max_batched_tokens: usize,
    ) -> Self {
        Self {
            block_manager,
            frontend,
            controllers,
            max_batched_tokens,
            running: Vec::new(),
            swapped: Vec::new(),
            pending: VecDeque::new(),
            num_steps: HashMap::new(),
            sampling_params: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn swapped_len(&self) -> usize {
        self.swapped.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn block_manager(&self) -> &BlockSpaceManager {
        &self.block_manager
    }

    // ---- phase 1: reserve slots, preempting from the tail on OOM --------

    fn reserve_and_preempt(
        &mut self,
        blocks_to_swap_out: &mut HashMap<BlockId, BlockId>,
        blocks_to_copy: &mut HashMap<BlockId, BlockId>,
    ) -> Result<(), CoreError> {
        if self.running.is_empty() {
            return Ok(());
        }

        let mut victim_idx: isize = self.running.len() as isize - 1;
        let mut i = 0usize;
        while i < self.running.len() {
            if i as isize > victim_idx {
                break;
            }

            let mut can_append_now = self.block_manager.can_append(&self.running[i]);
            while !can_append_now {
                let victim = victim_idx as usize;
                self.preempt(victim, blocks_to_swap_out)?;
                victim_idx -= 1;
                if i as isize > victim_idx {
                    break;
                }
                can_append_now = self.block_manager.can_append(&self.running[i]);
            }

            if i as isize > victim_idx {
                break;
            }

            self.append_group_slots(i, blocks_to_copy)?;
            i += 1;
        }

        self.running.truncate((victim_idx + 1).max(0) as usize);
        Ok(())
    }

    fn preempt(&mut self, idx: usize, blocks_to_swap_out: &mut HashMap<BlockId, BlockId>) -> Result<(), CoreError> {
        let group_id = self.running[idx].group_id;
        let mapping = self.block_manager.swap_out(&self.running[idx])?;
        blocks_to_swap_out.extend(mapping);
        for seq in &mut self.running[idx].seqs {
            if seq.status == SequenceStatus::Running {
                seq.status = SequenceStatus::Swapped;
            }
        }
        self.swapped.push(self.running[idx].clone());
        if let Some(metrics) = &self.metrics {
            metrics.preemptions_total.inc();
        }
        info!(group = group_id, "preempted group to host tier");
        Ok(())
    }

    fn append_group_slots(&mut self, idx: usize, blocks_to_copy: &mut HashMap<BlockId, BlockId>) -> Result<(), CoreError> {
        let num_seqs = self.running[idx].seqs.len();
        for s in 0..num_seqs {
            if self.running[idx].seqs[s].status == SequenceStatus::Finished {
                continue;
            }
            let ret = self.block_manager.append(&self.running[idx].seqs[s])?;
            if let Some((src, dst)) = ret {
                blocks_to_copy.insert(src, dst);
            }
        }
        Ok(())
    }

    // ---- phase 2: opportunistic swap-in ----------------------------------

    fn swap_in_ready(
        &mut self,
        blocks_to_swap_in: &mut HashMap<BlockId, BlockId>,
        blocks_to_copy: &mut HashMap<BlockId, BlockId>,
    ) -> Result<(), CoreError> {
        let n = self.swapped.len();
        let mut all_swapped_in = true;

        for i in 0..n {
            let idx = n - 1 - i; // tail (most-recently-swapped) to head
            if self.block_manager.can_swap_in(&self.swapped[idx]) {
                let group_id = self.swapped[idx].group_id;
                let mapping = self.block_manager.swap_in(&self.swapped[idx])?;
                blocks_to_swap_in.extend(mapping);
                for seq in &mut self.swapped[idx].seqs {
                    if seq.status == SequenceStatus::Swapped {
                        seq.status = SequenceStatus::Running;
                    }
                }
                self.running.push(self.swapped[idx].clone());
                let new_idx = self.running.len() - 1;
                self.append_group_slots(new_idx, blocks_to_copy)?;
                info!(group = group_id, "swapped group back in");
            } else {
                self.swapped.truncate(n - i);
                all_swapped_in = false;
                break;
            }
        }

        if all_swapped_in {
            self.swapped.clear();
        }
        Ok(())
    }

    // ---- phase 3: admission -----------------------------------------------

    fn admit_pending(&mut self) -> Result<(), CoreError> {
        if !self.swapped.is_empty() {
            // Never hold both a pending group and a swapped one: the
            // pending group would jump the queue ahead of an older request.
            return Ok(());
        }

        for (group, params) in self.frontend.get_inputs() {
            self.sampling_params.insert(group.group_id, params);
            self.pending.push_back(group);
        }

        let mut num_batched_tokens: usize = self
            .running
            .iter()
            .map(|g| g.num_seqs(Some(SequenceStatus::Running)))
            .sum();

        loop {
            let admit = match self.pending.front() {
                Some(group) => {
                    let num_prompt_tokens = group.seqs[0].get_len();
                    let fits = self.block_manager.can_allocate(group)
                        && num_batched_tokens + num_prompt_tokens <= self.max_batched_tokens;
                    fits.then_some(num_prompt_tokens)
                }
                None => break,
            };

            match admit {
                Some(num_prompt_tokens) => {
                    let group = self.pending.pop_front().unwrap();
                    self.admit_group(group)?;
                    num_batched_tokens += num_prompt_tokens;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn admit_group(&mut self, mut group: SequenceGroup) -> Result<(), CoreError> {
        self.block_manager.allocate(&group)?;
        for seq in &mut group.seqs {
            seq.status = SequenceStatus::Running;
        }
        let group_id = group.group_id;
        self.num_steps.insert(group_id, 0);
        self.running.push(group);
        debug!(group = group_id, "admitted group");
        Ok(())
    }

    // ---- phase 4: plan emission -------------------------------------------

    fn emit_plan(
        &self,
        blocks_to_swap_in: HashMap<BlockId, BlockId>,
        blocks_to_swap_out: HashMap<BlockId, BlockId>,
        blocks_to_copy: HashMap<BlockId, BlockId>,
    ) -> Result<StepPlan, CoreError> {
        let mut plan = StepPlan {
            blocks_to_swap_in,
            blocks_to_swap_out,
            blocks_to_copy,
            ..Default::default()
        };

        for group in &self.running {
            let num_steps = *self.num_steps.get(&group.group_id).unwrap_or(&0);
            let is_prompt = num_steps == 0;

            for seq in &group.seqs {
                if seq.status != SequenceStatus::Running {
                    continue;
                }
                let block_table = self.block_manager.get_block_table(seq.seq_id)?.to_vec();
                plan.block_tables.insert(seq.seq_id, block_table);

                if is_prompt {
                    plan.prompt_tokens.insert(seq.seq_id, seq.get_token_ids());
                } else {
                    let token_ids = seq.get_token_ids();
                    let last = *token_ids.last().expect("running sequence has at least one token");
                    plan.generation_tokens.insert(seq.seq_id, last);
                    plan.context_lens.insert(seq.seq_id, seq.get_len());
                }
            }
        }
        Ok(plan)
    }

    fn update_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.device_blocks_free.set(self.block_manager.num_device_free() as i64);
            metrics.host_blocks_free.set(self.block_manager.num_host_free() as i64);
            metrics.running_groups.set(self.running.len() as i64);
            metrics.swapped_groups.set(self.swapped.len() as i64);
            metrics.pending_groups.set(self.pending.len() as i64);
        }
    }

    /// Execute one batched model iteration: preempt, swap in, admit, emit
    /// the plan, and hand it to the first controller.
    ///
    /// Known limitation carried from spec.md §9: `max_batched_tokens` only
    /// bounds prompt tokens admitted in phase 3, not the combined
    /// prompt+generation load of a step. This is intentional, not a defect.
    pub async fn step(&mut self) -> Result<StepPlan, CoreError> {
        let mut blocks_to_swap_in = HashMap::new();
        let mut blocks_to_swap_out = HashMap::new();
        let mut blocks_to_copy = HashMap::new();

        self.reserve_and_preempt(&mut blocks_to_swap_out, &mut blocks_to_copy)?;
        self.swap_in_ready(&mut blocks_to_swap_in, &mut blocks_to_copy)?;
        self.admit_pending()?;

        debug_assert!(
            blocks_to_swap_in.is_empty() || blocks_to_swap_out.is_empty(),
            "swap-in and swap-out must never happen in the same step"
        );

        if self.running.is_empty() && !self.swapped.is_empty() {
            warn!("step ended with no running groups; work deferred to next iteration");
        }

        let plan = self.emit_plan(blocks_to_swap_in, blocks_to_swap_out, blocks_to_copy)?;
        self.update_metrics();

        if let Some(controller) = self.controllers.first() {
            controller.execute_stage(plan.clone()).await;
        }

        Ok(plan)
    }

    /// Apply sampled tokens, handle beam-search forks, terminate on stop
    /// tokens or step limits, and return finished groups to the frontend.
    pub fn post_step(&mut self, next_tokens: &HashMap<SeqId, TokenSample>) -> Result<(), CoreError> {
        for gi in 0..self.running.len() {
            let group_id = self.running[gi].group_id;
            *self.num_steps.get_mut(&group_id).expect("running group has a num_steps entry") += 1;
            let current_steps = self.num_steps[&group_id];
            let params = self.sampling_params[&group_id].clone();

            let seq_ids: Vec<SeqId> = self.running[gi].seqs.iter().map(|s| s.seq_id).collect();
            for seq_id in seq_ids {
                let status = self.running[gi].find(seq_id).unwrap().status;
                if status == SequenceStatus::Finished {
                    continue;
                }

                let sample = *next_tokens
                    .get(&seq_id)
                    .expect("every non-finished sequence must have a sampled token");

                if sample.parent_seq_id != seq_id {
                    self.block_manager.free(seq_id)?;
                    let parent_blocks = self
                        .running[gi]
                        .find(sample.parent_seq_id)
                        .expect("fork parent is a sibling in the same group")
                        .logical_blocks
                        .clone();
                    self.running[gi].find_mut(seq_id).unwrap().logical_blocks = parent_blocks;
                    self.block_manager.fork(sample.parent_seq_id, seq_id)?;
                    debug!(group = group_id, seq_id, parent = sample.parent_seq_id, "beam-search fork");
                }

                self.running[gi].find_mut(seq_id).unwrap().append(&[sample.token_id]);

                let should_finish = params.stop_token_ids.contains(&sample.token_id)
                    || current_steps >= params.max_num_steps;
                if should_finish {
                    self.running[gi].find_mut(seq_id).unwrap().status = SequenceStatus::Finished;
                    self.block_manager.free(seq_id)?;
                }
            }
        }

        let mut still_running = Vec::with_capacity(self.running.len());
        for group in self.running.drain(..) {
            if group.is_finished() {
                let group_id = group.group_id;
                self.frontend.print_response(&group);
                self.num_steps.remove(&group_id);
                self.sampling_params.remove(&group_id);
            } else {
                still_running.push(group);
            }
        }
        self.running = still_running;
        self.update_metrics();
        Ok(())
    }

    /// Abort all in-flight work: free every block table, clear every queue.
    /// The only supported bulk-cancellation primitive (spec §5).
    pub fn reset(&mut self) -> Result<(), CoreError> {
        self.running.clear();
        self.swapped.clear();
        self.pending.clear();
        self.num_steps.clear();
        self.sampling_params.clear();
        self.block_manager.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{LoggingController, QueueFrontend};
    use crate::sequence::Sequence;
    use std::collections::HashSet;

    fn params(max_num_steps: u32, stop: &[i32]) -> SamplingParams {
        SamplingParams {
            stop_token_ids: stop.iter().copied().collect::<HashSet<_>>(),
            max_num_steps,
        }
    }

    fn one_seq_group(group_id: GroupId, seq_id: SeqId, prompt_len: usize, block_size: usize) -> SequenceGroup {
        let prompt: Vec<i32> = (0..prompt_len as i32).collect();
        SequenceGroup::new(group_id, vec![Sequence::new(seq_id, &prompt, block_size)])
    }

    fn new_scheduler(
        block_size: usize,
        num_device_blocks: usize,
        num_host_blocks: usize,
        max_batched_tokens: usize,
    ) -> (Scheduler, Arc<QueueFrontend>, Arc<LoggingController>) {
        let bm = BlockSpaceManager::new(block_size, num_device_blocks, num_host_blocks).unwrap();
        let frontend = Arc::new(QueueFrontend::new());
        let controller = Arc::new(LoggingController::new());
        let controllers: Vec<Arc<dyn Controller>> = vec![controller.clone()];
        let scheduler = Scheduler::new(bm, frontend.clone(), controllers, max_batched_tokens);
        (scheduler, frontend, controller)
    }

    #[tokio::test]
    async fn test_single_group_admits_generates_and_finishes_on_step_limit() {
        let (mut sched, frontend, _controller) = new_scheduler(4, 4, 4, 16);
        frontend.submit(one_seq_group(1, 1, 4, 4), params(2, &[]));

        let plan = sched.step().await.unwrap();
        assert_eq!(sched.running_len(), 1);
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(plan.prompt_tokens.get(&1).unwrap().len(), 4);
        assert!(plan.generation_tokens.is_empty());

        let mut tokens = HashMap::new();
        tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 99 });
        sched.post_step(&tokens).unwrap();
        assert_eq!(sched.running_len(), 1); // step 1 of 2, not yet finished

        let plan2 = sched.step().await.unwrap();
        assert_eq!(*plan2.generation_tokens.get(&1).unwrap(), 99);

        let mut tokens2 = HashMap::new();
        tokens2.insert(1, TokenSample { parent_seq_id: 1, token_id: 100 });
        sched.post_step(&tokens2).unwrap();

        assert_eq!(sched.running_len(), 0);
        assert_eq!(frontend.returned_group_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_preemption_moves_group_to_swapped_under_memory_pressure() {
        let (mut sched, frontend, _controller) = new_scheduler(4, 2, 8, 100);
        frontend.submit(one_seq_group(1, 1, 4, 4), params(10, &[]));
        frontend.submit(one_seq_group(2, 2, 4, 4), params(10, &[]));

        sched.step().await.unwrap(); // admits both groups, exhausts both device blocks
        assert_eq!(sched.running_len(), 2);

        let mut tokens = HashMap::new();
        tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 50 });
        tokens.insert(2, TokenSample { parent_seq_id: 2, token_id: 51 });
        sched.post_step(&tokens).unwrap(); // both roll over to a second logical block

        let plan = sched.step().await.unwrap();
        assert_eq!(sched.running_len(), 1);
        assert_eq!(sched.swapped_len(), 1);
        assert_eq!(plan.blocks_to_swap_out.len(), 1);
        assert!(plan.blocks_to_swap_in.is_empty());
    }

    #[tokio::test]
    async fn test_stop_token_terminates_group_before_step_limit() {
        let (mut sched, frontend, _controller) = new_scheduler(4, 4, 4, 16);
        frontend.submit(one_seq_group(1, 1, 4, 4), params(10, &[42]));
        sched.step().await.unwrap();

        let mut tokens = HashMap::new();
        tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 42 });
        sched.post_step(&tokens).unwrap();

        assert_eq!(sched.running_len(), 0);
        assert_eq!(frontend.returned_group_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_beam_search_fork_clones_parent_lineage() {
        let (mut sched, frontend, _controller) = new_scheduler(8, 8, 8, 100);
        let prompt: Vec<i32> = (0..4).collect();
        let group = SequenceGroup::new(
            1,
            vec![Sequence::new(1, &prompt, 8), Sequence::new(2, &prompt, 8)],
        );
        frontend.submit(group, params(10, &[]));
        sched.step().await.unwrap();
        assert_eq!(sched.block_manager().get_block_table(1).unwrap(), sched.block_manager().get_block_table(2).unwrap());

        let mut tokens = HashMap::new();
        tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 77 }); // seq1 samples normally
        tokens.insert(2, TokenSample { parent_seq_id: 1, token_id: 88 }); // seq2 forks from seq1
        sched.post_step(&tokens).unwrap();

        assert_eq!(sched.running_len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_queues_and_frees_blocks() {
        let (mut sched, frontend, _controller) = new_scheduler(4, 4, 4, 16);
        frontend.submit(one_seq_group(1, 1, 4, 4), params(10, &[]));
        sched.step().await.unwrap();
        assert_eq!(sched.running_len(), 1);

        sched.reset().unwrap();
        assert_eq!(sched.running_len(), 0);
        assert_eq!(sched.swapped_len(), 0);
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(sched.block_manager().num_device_free(), 4);
    }

    #[tokio::test]
    async fn test_admission_respects_max_batched_tokens() {
        let (mut sched, frontend, _controller) = new_scheduler(4, 8, 8, 4);
        frontend.submit(one_seq_group(1, 1, 4, 4), params(10, &[]));
        frontend.submit(one_seq_group(2, 2, 4, 4), params(10, &[]));

        sched.step().await.unwrap();
        // budget of 4 tokens admits only the first prompt.
        assert_eq!(sched.running_len(), 1);
        assert_eq!(sched.pending_len(), 1);
    }
}
