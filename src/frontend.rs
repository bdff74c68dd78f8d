//! Frontend / Controller adapters (spec §4.4): narrow, abstract interfaces
//! to the two external collaborators the core never looks inside — request
//! ingress and the worker pipeline that actually runs the model.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::block::BlockId;
use crate::sequence::{GroupId, SamplingParams, SeqId, SequenceGroup, TokenId};

/// The per-iteration payload handed to the first controller (spec §6).
#[derive(Debug, Clone, Default)]
pub struct StepPlan {
    pub prompt_tokens: HashMap<SeqId, Vec<TokenId>>,
    pub generation_tokens: HashMap<SeqId, TokenId>,
    pub context_lens: HashMap<SeqId, usize>,
    pub block_tables: HashMap<SeqId, Vec<BlockId>>,
    pub blocks_to_swap_in: HashMap<BlockId, BlockId>,
    pub blocks_to_swap_out: HashMap<BlockId, BlockId>,
    pub blocks_to_copy: HashMap<BlockId, BlockId>,
}

/// A sampled token for one sequence, naming its parent (spec §6): when
/// `parent_seq_id != seq_id` the sampler has chosen a beam-search fork.
#[derive(Debug, Clone, Copy)]
pub struct TokenSample {
    pub parent_seq_id: SeqId,
    pub token_id: TokenId,
}

/// Inbound request ingress.
///
/// `get_inputs` may be populated by another thread (spec §5's documented
/// concurrency hazard); implementations must serialize it behind a lock or a
/// thread-safe queue. See [`QueueFrontend`] for the reference resolution.
pub trait Frontend: Send + Sync {
    fn get_inputs(&self) -> Vec<(SequenceGroup, SamplingParams)>;
    fn print_response(&self, group: &SequenceGroup);
}

/// The worker pipeline. `execute_stage` hands off the plan and is expected
/// to return without the scheduler blocking on model completion (spec §5);
/// it is async because a real implementation dispatches over a network or
/// process boundary to another device.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn execute_stage(&self, plan: StepPlan);
}

/// Reference `Frontend`: a mutex-guarded FIFO queue, draining atomically.
///
/// Resolves the open question in spec §5/§9 (the original source marks
/// pending-queue access as needing a lock but never takes one) as option
/// (a): ingress is serialized behind a `Mutex`, taken only when the
/// scheduler calls `get_inputs` at the start of admission (phase 3).
#[derive(Default)]
pub struct QueueFrontend {
    queue: Mutex<VecDeque<(SequenceGroup, SamplingParams)>>,
    responses: Mutex<Vec<GroupId>>,
}

impl QueueFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a new request for admission on a future scheduler step.
    pub fn submit(&self, group: SequenceGroup, params: SamplingParams) {
        self.queue.lock().unwrap().push_back((group, params));
    }

    /// Group ids that have been returned via `print_response` so far.
    pub fn returned_group_ids(&self) -> Vec<GroupId> {
        self.responses.lock().unwrap().clone()
    }
}

impl Frontend for QueueFrontend {
    fn get_inputs(&self) -> Vec<(SequenceGroup, SamplingParams)> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    fn print_response(&self, group: &SequenceGroup) {
        info!(group_id = group.group_id, "sequence group finished");
        self.responses.lock().unwrap().push(group.group_id);
    }
}

/// Reference `Controller`: records the plans it was handed instead of
/// driving real workers. Useful for tests and the demonstration binary,
/// in the same spirit as the teacher's stub `LlamaModel`/`LlamaContext`
/// standing in for an out-of-scope external library.
#[derive(Default)]
pub struct LoggingController {
    plans: Mutex<Vec<StepPlan>>,
}

impl LoggingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plans(&self) -> Vec<StepPlan> {
        self.plans.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for LoggingController {
    async fn execute_stage(&self, plan: StepPlan) {
        info!(
            prompts = plan.prompt_tokens.len(),
            generations = plan.generation_tokens.len(),
            swap_in = plan.blocks_to_swap_in.len(),
            swap_out = plan.blocks_to_swap_out.len(),
            copies = plan.blocks_to_copy.len(),
            "executing stage"
        );
        self.plans.lock().unwrap().push(plan);
    }
}
