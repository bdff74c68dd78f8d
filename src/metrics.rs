//! Scheduler observability: queue depths and block utilization.
//!
//! Purely observational — nothing in the core contract (spec §1/§9) depends
//! on these values. Updated once at the end of each [`crate::scheduler::Scheduler::step`].

use prometheus::{IntCounter, IntGauge, Registry};

pub struct SchedulerMetrics {
    pub device_blocks_free: IntGauge,
    pub host_blocks_free: IntGauge,
    pub running_groups: IntGauge,
    pub swapped_groups: IntGauge,
    pub pending_groups: IntGauge,
    pub preemptions_total: IntCounter,
}

impl SchedulerMetrics {
    /// Create and register all gauges/counters against `registry`.
    pub fn new(registry: &Registry) -> Self {
        let device_blocks_free = IntGauge::new(
            "pagedkv_device_blocks_free",
            "Free blocks remaining in the device tier",
        )
        .unwrap();
        let host_blocks_free = IntGauge::new(
            "pagedkv_host_blocks_free",
            "Free blocks remaining in the host tier",
        )
        .unwrap();
        let running_groups = IntGauge::new("pagedkv_running_groups", "Sequence groups currently running").unwrap();
        let swapped_groups = IntGauge::new("pagedkv_swapped_groups", "Sequence groups currently swapped to host").unwrap();
        let pending_groups = IntGauge::new("pagedkv_pending_groups", "Sequence groups awaiting admission").unwrap();
        let preemptions_total = IntCounter::new(
            "pagedkv_preemptions_total",
            "Total number of sequence groups preempted to the host tier",
        )
        .unwrap();

        registry.register(Box::new(device_blocks_free.clone())).ok();
        registry.register(Box::new(host_blocks_free.clone())).ok();
        registry.register(Box::new(running_groups.clone())).ok();
        registry.register(Box::new(swapped_groups.clone())).ok();
        registry.register(Box::new(pending_groups.clone())).ok();
        registry.register(Box::new(preemptions_total.clone())).ok();

        Self {
            device_blocks_free,
            host_blocks_free,
            running_groups,
            swapped_groups,
            pending_groups,
            preemptions_total,
        }
    }
}
