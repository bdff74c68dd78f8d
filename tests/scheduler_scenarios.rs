//! End-to-end scheduler scenarios driven through the public API only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pagedkv::block_manager::BlockSpaceManager;
use pagedkv::frontend::{Controller, Frontend, LoggingController, QueueFrontend, StepPlan, TokenSample};
use pagedkv::scheduler::Scheduler;
use pagedkv::sequence::{SamplingParams, SeqId, Sequence, SequenceGroup};

fn build(block_size: usize, device_blocks: usize, host_blocks: usize, max_batched_tokens: usize) -> (Scheduler, Arc<QueueFrontend>) {
    let bm = BlockSpaceManager::new(block_size, device_blocks, host_blocks).unwrap();
    let frontend = Arc::new(QueueFrontend::new());
    let controller = Arc::new(LoggingController::new());
    let controllers: Vec<Arc<dyn Controller>> = vec![controller];
    (Scheduler::new(bm, frontend.clone(), controllers, max_batched_tokens), frontend)
}

fn params(max_num_steps: u32, stop: &[i32]) -> SamplingParams {
    SamplingParams {
        stop_token_ids: stop.iter().copied().collect::<HashSet<_>>(),
        max_num_steps,
    }
}

fn greedy_sample(plan: &StepPlan) -> HashMap<SeqId, TokenSample> {
    let mut next = HashMap::new();
    for (&seq_id, ctx_len) in &plan.context_lens {
        next.insert(seq_id, TokenSample { parent_seq_id: seq_id, token_id: *ctx_len as i32 });
    }
    for &seq_id in plan.prompt_tokens.keys() {
        next.insert(seq_id, TokenSample { parent_seq_id: seq_id, token_id: 1000 });
    }
    next
}

/// Scenario A: a single group with a 16-token prompt grows block by block
/// over its generation budget and frees everything on completion.
#[tokio::test]
async fn scenario_a_single_group_grows_and_completes() {
    let (mut sched, frontend) = build(4, 16, 16, 64);
    let prompt: Vec<i32> = (0..16).collect();
    frontend.submit(SequenceGroup::new(1, vec![Sequence::new(1, &prompt, 4)]), params(4, &[]));

    let mut steps = 0;
    loop {
        let plan = sched.step().await.unwrap();
        steps += 1;
        assert!(steps < 20, "scenario should complete well within 20 steps");
        if sched.running_len() == 0 {
            break;
        }
        let tokens = greedy_sample(&plan);
        sched.post_step(&tokens).unwrap();
    }

    assert_eq!(frontend.returned_group_ids(), vec![1]);
    assert_eq!(sched.block_manager().num_device_free(), 16);
}

/// Scenario B: two groups contend for a tight device budget. One is
/// preempted to host, the other finishes first and frees its blocks, and
/// the preempted group is later swapped back in to finish as well.
#[tokio::test]
async fn scenario_b_preemption_then_swap_back_in() {
    let (mut sched, frontend) = build(4, 3, 8, 64);
    let prompt: Vec<i32> = (0..4).collect();
    frontend.submit(SequenceGroup::new(1, vec![Sequence::new(1, &prompt, 4)]), params(3, &[]));
    frontend.submit(SequenceGroup::new(2, vec![Sequence::new(2, &prompt, 4)]), params(3, &[]));

    let mut saw_swap_out = false;
    let mut saw_swap_in = false;
    let mut steps = 0;
    loop {
        let plan = sched.step().await.unwrap();
        steps += 1;
        assert!(steps < 30, "scenario should converge");
        saw_swap_out |= !plan.blocks_to_swap_out.is_empty();
        saw_swap_in |= !plan.blocks_to_swap_in.is_empty();

        if sched.running_len() == 0 && sched.swapped_len() == 0 && sched.pending_len() == 0 {
            break;
        }
        let tokens = greedy_sample(&plan);
        sched.post_step(&tokens).unwrap();
    }

    assert!(saw_swap_out, "tight device budget should force a preemption");
    assert!(saw_swap_in, "freed capacity should allow the swapped group back in");

    let mut returned = frontend.returned_group_ids();
    returned.sort();
    assert_eq!(returned, vec![1, 2]);
    assert_eq!(sched.block_manager().num_device_free(), 3);
    assert_eq!(sched.block_manager().num_host_free(), 8);
}

/// Scenario D: a stop token ends a group immediately, well before its
/// step budget would have.
#[tokio::test]
async fn scenario_d_stop_token_short_circuits_step_budget() {
    let (mut sched, frontend) = build(4, 4, 4, 16);
    let prompt: Vec<i32> = (0..4).collect();
    frontend.submit(SequenceGroup::new(1, vec![Sequence::new(1, &prompt, 4)]), params(50, &[42]));

    sched.step().await.unwrap();
    let mut tokens = HashMap::new();
    tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 42 });
    sched.post_step(&tokens).unwrap();

    assert_eq!(sched.running_len(), 0);
    assert_eq!(frontend.returned_group_ids(), vec![1]);
    assert_eq!(sched.block_manager().num_device_free(), 4);
}

/// Scenario C: two beam-search siblings start on a fully shared block
/// table; once they sample diverging tokens, copy-on-write splits their
/// tail block apart.
#[tokio::test]
async fn scenario_c_beam_search_copy_on_write_splits_shared_tail() {
    let (mut sched, frontend) = build(8, 8, 8, 64);
    let prompt: Vec<i32> = (0..4).collect(); // half a block, room to diverge in place
    let group = SequenceGroup::new(1, vec![Sequence::new(1, &prompt, 8), Sequence::new(2, &prompt, 8)]);
    frontend.submit(group, params(50, &[999]));

    sched.step().await.unwrap();
    assert_eq!(
        sched.block_manager().get_block_table(1).unwrap(),
        sched.block_manager().get_block_table(2).unwrap(),
        "siblings start on the same physical block"
    );

    let mut tokens = HashMap::new();
    tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 5 });
    tokens.insert(2, TokenSample { parent_seq_id: 1, token_id: 6 }); // fork from seq 1
    sched.post_step(&tokens).unwrap();

    sched.step().await.unwrap();
    tokens.clear();
    tokens.insert(1, TokenSample { parent_seq_id: 1, token_id: 999 }); // stop seq 1
    tokens.insert(2, TokenSample { parent_seq_id: 2, token_id: 7 });
    sched.post_step(&tokens).unwrap();
    assert_eq!(frontend.returned_group_ids().len(), 0, "group finishes only once every sibling stops");
}

/// Scenario F: reset aborts all in-flight work regardless of queue.
#[tokio::test]
async fn scenario_f_reset_aborts_everything() {
    let (mut sched, frontend) = build(4, 4, 4, 16);
    let prompt: Vec<i32> = (0..4).collect();
    frontend.submit(SequenceGroup::new(1, vec![Sequence::new(1, &prompt, 4)]), params(50, &[]));
    frontend.submit(SequenceGroup::new(2, vec![Sequence::new(2, &prompt, 4)]), params(50, &[]));

    sched.step().await.unwrap();
    assert!(sched.running_len() + sched.pending_len() > 0);

    sched.reset().unwrap();
    assert_eq!(sched.running_len(), 0);
    assert_eq!(sched.swapped_len(), 0);
    assert_eq!(sched.pending_len(), 0);
    assert_eq!(sched.block_manager().num_device_free(), 4);
}
