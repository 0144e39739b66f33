//! Shared fixtures for the runtime integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use veld_runtime::{Runtime, RuntimeConfig};

/// Compact configuration for tests: small heap, small stacks, explicit
/// worker count.
pub fn test_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        worker_count: workers,
        heap_initial_regions: 64,
        heap_max_regions: 256,
        fiber_stack_size: 128 * 1024,
        ..Default::default()
    }
}

/// A started runtime with `workers` workers.
pub fn started_runtime(workers: usize) -> Arc<Runtime> {
    let rt = Runtime::new(test_config(workers)).expect("runtime construction failed");
    rt.start();
    rt
}

/// A started runtime with a custom configuration.
pub fn started_with(config: RuntimeConfig) -> Arc<Runtime> {
    let rt = Runtime::new(config).expect("runtime construction failed");
    rt.start();
    rt
}
