//! pagedkv: paged KV-cache block manager and request scheduler.
//!
//! Demonstration binary: builds a scheduler over a synthetic workload and
//! drives it to completion, printing the plan shape at each iteration.
//! Real deployments wire a [`Frontend`] to actual request ingress and a
//! [`Controller`] to an actual model-execution worker; this binary uses the
//! in-tree reference implementations of both.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use pagedkv::block_manager::BlockSpaceManager;
use pagedkv::config::{Cli, Config};
use pagedkv::frontend::{Controller, Frontend, LoggingController, QueueFrontend, TokenSample};
use pagedkv::scheduler::Scheduler;
use pagedkv::sequence::{SamplingParams, Sequence, SequenceGroup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "pagedkv=debug" } else { "pagedkv=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(true)
        .init();

    info!("pagedkv v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?.apply_cli_overrides(&cli);
    info!(
        block_size = config.block_size,
        num_device_blocks = config.num_device_blocks,
        num_host_blocks = config.num_host_blocks,
        max_batched_tokens = config.max_batched_tokens,
        "configuration loaded"
    );

    let block_manager = BlockSpaceManager::new(config.block_size, config.num_device_blocks, config.num_host_blocks)?;

    let frontend = Arc::new(QueueFrontend::new());
    let controller = Arc::new(LoggingController::new());
    let controllers: Vec<Arc<dyn Controller>> = vec![controller.clone()];

    let mut scheduler = Scheduler::new(block_manager, frontend.clone(), controllers, config.max_batched_tokens);

    submit_demo_workload(&frontend, config.block_size);

    let mut step_count = 0u32;
    loop {
        let plan = scheduler.step().await?;
        step_count += 1;
        info!(
            step = step_count,
            prompts = plan.prompt_tokens.len(),
            generations = plan.generation_tokens.len(),
            running = scheduler.running_len(),
            swapped = scheduler.swapped_len(),
            pending = scheduler.pending_len(),
            "scheduler step"
        );

        if scheduler.running_len() == 0 && scheduler.swapped_len() == 0 && scheduler.pending_len() == 0 {
            break;
        }

        let next_tokens = greedy_sample(&plan);
        scheduler.post_step(&next_tokens)?;
    }

    info!(steps = step_count, finished = frontend.returned_group_ids().len(), "workload complete");
    Ok(())
}

/// Submit a couple of synthetic requests. Real frontends translate a wire
/// request into a [`SequenceGroup`]/[`SamplingParams`] pair instead.
fn submit_demo_workload(frontend: &QueueFrontend, block_size: usize) {
    let prompt_a: Vec<i32> = (0..block_size as i32 * 2).collect();
    frontend.submit(
        SequenceGroup::new(1, vec![Sequence::new(1, &prompt_a, block_size)]),
        SamplingParams {
            stop_token_ids: HashSet::new(),
            max_num_steps: 4,
        },
    );

    let prompt_b: Vec<i32> = (0..block_size as i32).collect();
    frontend.submit(
        SequenceGroup::new(2, vec![Sequence::new(2, &prompt_b, block_size)]),
        SamplingParams {
            stop_token_ids: [999].into_iter().collect(),
            max_num_steps: 6,
        },
    );
}

/// Stand-in sampler: every running sequence "samples" a strictly
/// increasing token id, so it never hits a stop token by coincidence.
fn greedy_sample(plan: &pagedkv::frontend::StepPlan) -> HashMap<u64, TokenSample> {
    let mut next = HashMap::new();
    for (&seq_id, ctx_len) in &plan.context_lens {
        next.insert(
            seq_id,
            TokenSample {
                parent_seq_id: seq_id,
                token_id: *ctx_len as i32,
            },
        );
    }
    for &seq_id in plan.prompt_tokens.keys() {
        next.insert(
            seq_id,
            TokenSample {
                parent_seq_id: seq_id,
                token_id: 1000,
            },
        );
    }
    next
}
