//! Memory Allocator - Region Lifecycle and Allocation Paths
//!
//! The allocator manages:
//! - the free list of `Available` regions
//! - a registry of every region ever allocated (for collector iteration)
//! - the per-worker fast path through the processor's active region
//! - the mutex-guarded global region for non-worker callers: bootstrap
//!   and other host threads
//! - a dedicated collector region for evacuation copies
//!
//! Watermarks:
//! - `gc_trigger` (50%): request a concurrent collection
//! - `heap_grow_trigger` (90%): provision fresh regions early
//!
//! An allocation that runs out of regions waits on the collector for up
//! to `allocation_attempts` cycles before failing with `OutOfMemory`.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

use veld_util::align_up;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::runtime::Runtime;
use crate::value::{ShapeId, Value};

use super::header::{HeapHeader, HEADER_SIZE};
use super::region::{HeapRegion, RegionState, OBJECT_ALIGNMENT, REGION_SIZE};

/// Minimum body size. Bodies share their address space with forwarding
/// targets, so two live bodies can never coincide.
const MIN_BODY_SIZE: usize = 8;

/// Batch size used when the heap grow trigger is reached
const GROW_BATCH: usize = 16;

pub struct MemoryAllocator {
    max_regions: usize,
    gc_trigger: f32,
    grow_trigger: f32,
    allocation_attempts: u32,

    /// Registry of every region (ownership); entries are never removed
    /// until teardown
    regions: Mutex<Vec<Box<HeapRegion>>>,
    allocated_count: AtomicUsize,

    /// Free list of `Available` regions
    freelist: Mutex<VecDeque<NonNull<HeapRegion>>>,
    freelist_cv: Condvar,
    free_count: AtomicUsize,

    /// Region serving allocations outside worker threads. The mutex is
    /// held for the whole carve so the collector can fence its walks with
    /// the same lock.
    global_region: Mutex<Option<NonNull<HeapRegion>>>,

    /// Collector-owned region for evacuation copies
    gc_region: Mutex<Option<NonNull<HeapRegion>>>,
}

unsafe impl Send for MemoryAllocator {}
unsafe impl Sync for MemoryAllocator {}

impl MemoryAllocator {
    /// Create the allocator and pre-allocate the initial free regions
    pub fn new(config: &RuntimeConfig) -> Result<MemoryAllocator> {
        let allocator = MemoryAllocator {
            max_regions: config.heap_max_regions,
            gc_trigger: config.gc_trigger,
            grow_trigger: config.heap_grow_trigger,
            allocation_attempts: config.allocation_attempts,
            regions: Mutex::new(Vec::with_capacity(config.heap_initial_regions)),
            allocated_count: AtomicUsize::new(0),
            freelist: Mutex::new(VecDeque::with_capacity(config.heap_initial_regions)),
            freelist_cv: Condvar::new(),
            free_count: AtomicUsize::new(0),
            global_region: Mutex::new(None),
            gc_region: Mutex::new(None),
        };

        for _ in 0..config.heap_initial_regions {
            let region = allocator
                .allocate_new_region()
                .expect("initial region count exceeds cap");
            allocator.free_region(region);
        }

        Ok(allocator)
    }

    // === Public allocation paths ===

    /// Allocate a heap value: header + body, stamped `Black` with a
    /// self-forward pointer. Instance bodies are filled with Null, data
    /// bodies with zero.
    ///
    /// `count` is the field count (instance shapes) or the byte length
    /// (data shapes).
    pub fn allocate(&self, rt: &Runtime, shape: ShapeId, count: u32) -> Result<Value> {
        debug_assert!(shape.is_object());
        let size = Self::body_size_for(shape, count);
        if HEADER_SIZE + size > REGION_SIZE {
            return Err(RuntimeError::Internal(format!(
                "allocation of {} bytes exceeds region capacity",
                size
            )));
        }

        if let Some(proc_ptr) = crate::scheduler::current_processor() {
            self.allocate_worker(rt, proc_ptr, shape, count, size)
        } else {
            self.allocate_global(rt, shape, count, size)
        }
    }

    /// Allocation path for the collector's evacuation copies.
    ///
    /// Never triggers a collection and never waits; `None` means the
    /// collector has to finish the cycle with the regions it has.
    pub fn gc_allocate(&self, shape: ShapeId, count: u32) -> Option<Value> {
        let size = Self::body_size_for(shape, count);
        debug_assert!(HEADER_SIZE + size <= REGION_SIZE);

        let mut slot = self.gc_region.lock();
        let needs_refill = match *slot {
            Some(region) => !unsafe { region.as_ref() }.fits(HEADER_SIZE + size),
            None => true,
        };

        if needs_refill {
            if let Some(old) = slot.take() {
                unsafe { old.as_ref() }.release();
            }
            let fresh = self.try_acquire_region()?;
            unsafe { fresh.as_ref() }.acquire();
            *slot = Some(fresh);
        }

        let region = unsafe { slot.unwrap().as_ref() };
        Some(unsafe { self.carve(region, shape, count, size) })
    }

    /// Release the collector's active region (end of cycle)
    pub fn gc_release_region(&self) {
        let mut slot = self.gc_region.lock();
        if let Some(region) = slot.take() {
            unsafe { region.as_ref() }.release();
        }
    }

    // === Worker / global paths ===

    fn allocate_worker(
        &self,
        rt: &Runtime,
        proc_ptr: NonNull<crate::scheduler::Processor>,
        shape: ShapeId,
        count: u32,
        size: usize,
    ) -> Result<Value> {
        let proc = unsafe { proc_ptr.as_ref() };

        let region_ok = proc
            .active_region()
            .map(|r| unsafe { r.as_ref() }.fits(HEADER_SIZE + size))
            .unwrap_or(false);

        if !region_ok {
            if let Some(old) = proc.take_active_region() {
                unsafe { old.as_ref() }.release();
            }
            let fresh = self.acquire_region_blocking(rt, size)?;
            unsafe { fresh.as_ref() }.acquire();
            proc.set_active_region(fresh);
        }

        let region = unsafe { proc.active_region().unwrap().as_ref() };
        Ok(unsafe { self.carve(region, shape, count, size) })
    }

    fn allocate_global(
        &self,
        rt: &Runtime,
        shape: ShapeId,
        count: u32,
        size: usize,
    ) -> Result<Value> {
        loop {
            // carve under the slot lock so the collector can fence its
            // stop-the-world walks with the same lock
            {
                let mut slot = self.global_region.lock();
                match *slot {
                    Some(region) if unsafe { region.as_ref() }.fits(HEADER_SIZE + size) => {
                        let region = unsafe { region.as_ref() };
                        return Ok(unsafe { self.carve(region, shape, count, size) });
                    }
                    Some(region) => {
                        unsafe { region.as_ref() }.release();
                        *slot = None;
                    }
                    None => {}
                }
            }

            // refill without holding the slot lock: the wait inside may
            // span whole collection cycles
            let fresh = self.acquire_region_blocking(rt, size)?;
            unsafe { fresh.as_ref() }.acquire();

            let mut slot = self.global_region.lock();
            if let Some(raced) = slot.replace(fresh) {
                // another thread installed a region first; keep the newer
                // one and hand the raced one to the collector
                unsafe { raced.as_ref() }.release();
            }
        }
    }

    /// Carve header + body out of a region already checked to fit.
    ///
    /// # Safety
    /// The caller owns the region (processor owner, global lock or gc
    /// lock) and has verified `fits(HEADER_SIZE + size)`.
    unsafe fn carve(&self, region: &HeapRegion, shape: ShapeId, count: u32, size: usize) -> Value {
        let header_ptr = region
            .allocate(HEADER_SIZE)
            .expect("carve after fits check");
        let body = region.allocate(size).expect("carve after fits check");

        // initialize the body first so a walker never sees garbage
        if shape.is_instance() {
            let slots = body as *mut u64;
            for i in 0..count as usize {
                std::ptr::write(slots.add(i), Value::NULL.raw());
            }
        } else {
            std::ptr::write_bytes(body, 0, size);
        }

        let header = &*(header_ptr as *const HeapHeader);
        header.init(shape, count, body);

        Value::object_from_body(body)
    }

    fn body_size_for(shape: ShapeId, count: u32) -> usize {
        let raw = if shape.is_instance() {
            count as usize * 8
        } else {
            count as usize
        };
        align_up(raw.max(MIN_BODY_SIZE), OBJECT_ALIGNMENT)
    }

    /// Stride a walker uses to skip over one object
    pub(crate) fn object_stride(header: &HeapHeader) -> usize {
        HEADER_SIZE + align_up(header.body_size().max(MIN_BODY_SIZE), OBJECT_ALIGNMENT)
    }

    // === Region lifecycle ===

    /// Pop from the free list, or allocate a fresh region from the
    /// system heap.
    fn try_acquire_region(&self) -> Option<NonNull<HeapRegion>> {
        {
            let mut freelist = self.freelist.lock();
            if let Some(region) = freelist.pop_front() {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                return Some(region);
            }
        }
        self.allocate_new_region()
    }

    /// Acquire a region for a mutator: run the watermark triggers, wait
    /// on the collector when exhausted, fail with `OutOfMemory` after
    /// `allocation_attempts`.
    fn acquire_region_blocking(&self, rt: &Runtime, size: usize) -> Result<NonNull<HeapRegion>> {
        for _attempt in 0..=self.allocation_attempts {
            if let Some(region) = self.try_acquire_region() {
                self.run_watermark_triggers(rt);
                return Ok(region);
            }

            if rt.scheduler().is_shutting_down() {
                return Err(RuntimeError::SchedulerShutdown);
            }

            log::debug!("allocator exhausted, waiting for collection");
            rt.gc().request_gc();

            {
                let mut freelist = self.freelist.lock();
                if freelist.is_empty() {
                    let _ = self
                        .freelist_cv
                        .wait_for(&mut freelist, Duration::from_millis(10));
                }
            }

            // allocation is a safepoint; the wait above must not stall a
            // pending stop-the-world
            rt.checkpoint_current_worker();
        }

        log::error!("heap exhausted after waiting for collection");
        Err(RuntimeError::OutOfMemory {
            requested: size,
            allocated_regions: self.allocated_count.load(Ordering::Relaxed),
        })
    }

    /// Allocate a fresh region from the system heap (up to the cap)
    fn allocate_new_region(&self) -> Option<NonNull<HeapRegion>> {
        let mut regions = self.regions.lock();
        if regions.len() >= self.max_regions {
            return None;
        }
        let region = HeapRegion::new();
        let ptr = NonNull::from(region.as_ref());
        regions.push(region);
        self.allocated_count.store(regions.len(), Ordering::Relaxed);
        Some(ptr)
    }

    /// Return an `Available` region to the free list
    pub fn free_region(&self, region: NonNull<HeapRegion>) {
        debug_assert_eq!(unsafe { region.as_ref() }.state(), RegionState::Available);
        {
            let mut freelist = self.freelist.lock();
            freelist.push_back(region);
            self.free_count.fetch_add(1, Ordering::Relaxed);
        }
        self.freelist_cv.notify_one();
    }

    fn run_watermark_triggers(&self, rt: &Runtime) {
        let fill = self.utilization();
        if fill >= self.grow_trigger {
            for _ in 0..GROW_BATCH {
                match self.allocate_new_region() {
                    Some(region) => self.free_region(region),
                    None => break,
                }
            }
        }
        if fill >= self.gc_trigger {
            rt.gc().request_gc();
        }
    }

    // === Introspection ===

    /// Fraction of regions currently in use (Used / Released)
    pub fn utilization(&self) -> f32 {
        let allocated = self.allocated_count.load(Ordering::Relaxed);
        if allocated == 0 {
            return 0.0;
        }
        let free = self.free_count.load(Ordering::Relaxed);
        (allocated - free.min(allocated)) as f32 / allocated as f32
    }

    /// Total regions ever allocated
    pub fn allocated_regions(&self) -> usize {
        self.allocated_count.load(Ordering::Relaxed)
    }

    /// Regions on the free list
    pub fn free_regions(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Snapshot of every region pointer for collector iteration
    pub(crate) fn region_snapshot(&self) -> Vec<NonNull<HeapRegion>> {
        let regions = self.regions.lock();
        regions.iter().map(|r| NonNull::from(r.as_ref())).collect()
    }

    /// Lock the global region for the collector's stop-the-world walks
    pub(crate) fn global_guard(&self) -> MutexGuard<'_, Option<NonNull<HeapRegion>>> {
        self.global_region.lock()
    }
}
