//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages all configuration parameters for the Veld runtime: heap sizing,
//! collector watermarks, scheduler fairness and fiber stack geometry. Most
//! parameters have sensible defaults; `validate()` rejects inconsistent
//! combinations before any OS resources are committed.

use crate::error::{Result, RuntimeError};

/// Main configuration for the Veld runtime
///
/// # Examples
///
/// ```
/// use veld_runtime::RuntimeConfig;
///
/// // Use default configuration
/// let config = RuntimeConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Single-processor setup for deterministic scheduling tests
/// let config = RuntimeConfig {
///     worker_count: 1,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of OS worker threads (and processors)
    ///
    /// Parallelism degree of the fiber scheduler. One processor exists per
    /// worker; each processor owns a local run queue and an active heap
    /// region.
    ///
    /// Default: hardware concurrency
    pub worker_count: usize,

    /// Number of heap regions allocated at startup
    ///
    /// Regions are 16 KiB each; the initial set is placed on the free list
    /// before any worker starts.
    ///
    /// Default: 64
    pub heap_initial_regions: usize,

    /// Hard cap on the number of heap regions
    ///
    /// An allocation performed after this cap is reached waits for the
    /// collector and eventually fails with `OutOfMemory`.
    ///
    /// Default: 1024
    pub heap_max_regions: usize,

    /// Heap fill ratio that triggers a concurrent collection
    ///
    /// Default: 0.5
    pub gc_trigger: f32,

    /// Heap fill ratio at which the heap grows eagerly
    ///
    /// Above this ratio the allocator provisions fresh system regions ahead
    /// of demand (up to `heap_max_regions`).
    ///
    /// Default: 0.9
    pub heap_grow_trigger: f32,

    /// Live-byte ratio below which a released region is evacuated
    ///
    /// Regions denser than this keep their objects in place and wait for a
    /// later cycle.
    ///
    /// Default: 0.5
    pub evacuate_live_ratio: f32,

    /// How many GC cycles an allocation waits for free regions before it
    /// reports `OutOfMemory`
    ///
    /// Default: 10
    pub allocation_attempts: u32,

    /// Maximum number of threads queued in a processor's local run queue
    ///
    /// On overflow the older half of the queue is spilled to the global run
    /// queue as a single batch.
    ///
    /// Default: 256
    pub local_queue_cap: usize,

    /// Denominator of the global-queue bias
    ///
    /// A scheduling worker polls the global run queue first with probability
    /// `1/global_queue_bias`, preventing starvation of globally enqueued
    /// work.
    ///
    /// Default: 32
    pub global_queue_bias: u32,

    /// Milliseconds a fiber may run before it is preempted at the next
    /// safepoint
    ///
    /// Default: 10
    pub timeslice_ms: u64,

    /// Maximum milliseconds an idle worker sleeps before re-checking for
    /// work (liveness backstop)
    ///
    /// Default: 1000
    pub max_idle_sleep_ms: u64,

    /// Fiber stack size in bytes
    ///
    /// Rounded up to page granularity; a guard page is placed on both ends.
    ///
    /// Default: 512 KiB
    pub fiber_stack_size: usize,

    /// Remaining native stack (bytes) below which a call raises the
    /// stack-overflow exception
    ///
    /// Default: 16 KiB
    pub stack_overflow_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            heap_initial_regions: 64,
            heap_max_regions: 1024,
            gc_trigger: 0.5,
            heap_grow_trigger: 0.9,
            evacuate_live_ratio: 0.5,
            allocation_attempts: 10,
            local_queue_cap: 256,
            global_queue_bias: 32,
            timeslice_ms: 10,
            max_idle_sleep_ms: 1000,
            fiber_stack_size: 512 * 1024,
            stack_overflow_limit: 16 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Validate the configuration
    ///
    /// Returns `RuntimeError::Configuration` describing the first
    /// inconsistency found.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(RuntimeError::Configuration(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.heap_initial_regions == 0 {
            return Err(RuntimeError::Configuration(
                "heap_initial_regions must be at least 1".into(),
            ));
        }
        if self.heap_initial_regions > self.heap_max_regions {
            return Err(RuntimeError::Configuration(format!(
                "heap_initial_regions ({}) exceeds heap_max_regions ({})",
                self.heap_initial_regions, self.heap_max_regions
            )));
        }
        if !(0.0..=1.0).contains(&self.gc_trigger) || !(0.0..=1.0).contains(&self.heap_grow_trigger)
        {
            return Err(RuntimeError::Configuration(
                "gc_trigger and heap_grow_trigger must be within 0.0..=1.0".into(),
            ));
        }
        if self.gc_trigger > self.heap_grow_trigger {
            return Err(RuntimeError::Configuration(
                "gc_trigger must not exceed heap_grow_trigger".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evacuate_live_ratio) {
            return Err(RuntimeError::Configuration(
                "evacuate_live_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if self.local_queue_cap < 2 {
            return Err(RuntimeError::Configuration(
                "local_queue_cap must be at least 2".into(),
            ));
        }
        if self.global_queue_bias == 0 {
            return Err(RuntimeError::Configuration(
                "global_queue_bias must be at least 1".into(),
            ));
        }
        if self.fiber_stack_size < 4 * self.stack_overflow_limit {
            return Err(RuntimeError::Configuration(format!(
                "fiber_stack_size ({}) too small for stack_overflow_limit ({})",
                self.fiber_stack_size, self.stack_overflow_limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = RuntimeConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_exceeding_max_rejected() {
        let config = RuntimeConfig {
            heap_initial_regions: 2048,
            heap_max_regions: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_ordering_rejected() {
        let config = RuntimeConfig {
            gc_trigger: 0.95,
            heap_grow_trigger: 0.9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_stack_rejected() {
        let config = RuntimeConfig {
            fiber_stack_size: 8 * 1024,
            stack_overflow_limit: 16 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
