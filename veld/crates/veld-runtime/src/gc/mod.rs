//! Garbage Collector - Concurrent Mark / Evacuate / UpdateRef
//!
//! The collector runs on a dedicated OS thread (not a scheduler worker).
//! By default it idles waiting for the allocator's watermark signal; one
//! cycle consists of three concurrent phases with a short STW pause at
//! every phase boundary:
//!
//! ```text
//! Idle ──▶ Mark ──▶ Evacuate ──▶ UpdateRef ──▶ Idle
//!      STW      STW          STW           STW
//! ```
//!
//! - **Mark**: whiten every object (STW), grey the roots, then trace
//!   concurrently under the tri-color discipline. The mutator's write
//!   barrier re-greys mutated black objects (snapshot-at-the-beginning).
//!   New objects are born black.
//! - **Evacuate**: sparsely occupied `Released` regions become
//!   from-space; every live object is copied and its forward pointer
//!   published under the header's small lock.
//! - **UpdateRef**: every live object is swept and each reference field
//!   rewritten through its forward pointer; roots are rewritten in the
//!   final STW, then the from-space regions reset to `Available`.

pub mod marker;
pub mod relocate;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::heap::object;
use crate::heap::MarkColor;
use crate::runtime::Runtime;
use crate::value::Value;

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle = 0,
    Mark = 1,
    Evacuate = 2,
    UpdateRef = 3,
}

impl GcPhase {
    fn from_u8(raw: u8) -> GcPhase {
        match raw {
            0 => GcPhase::Idle,
            1 => GcPhase::Mark,
            2 => GcPhase::Evacuate,
            3 => GcPhase::UpdateRef,
            _ => unreachable!("invalid gc phase"),
        }
    }
}

pub struct GarbageCollector {
    phase: AtomicU8,
    cycle_count: AtomicU64,
    wants_exit: AtomicBool,
    request_pending: AtomicBool,

    pub(crate) evacuate_live_ratio: f32,

    request_mutex: Mutex<()>,
    request_cv: Condvar,

    cycle_mutex: Mutex<()>,
    cycle_cv: Condvar,

    /// Grey list: object values awaiting traversal
    grey: SegQueue<Value>,

    marked_count: AtomicU64,
    evacuated_count: AtomicU64,

    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(config: &RuntimeConfig) -> GarbageCollector {
        GarbageCollector {
            phase: AtomicU8::new(GcPhase::Idle as u8),
            cycle_count: AtomicU64::new(0),
            wants_exit: AtomicBool::new(false),
            request_pending: AtomicBool::new(false),
            evacuate_live_ratio: config.evacuate_live_ratio,
            request_mutex: Mutex::new(()),
            request_cv: Condvar::new(),
            cycle_mutex: Mutex::new(()),
            cycle_cv: Condvar::new(),
            grey: SegQueue::new(),
            marked_count: AtomicU64::new(0),
            evacuated_count: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    // === Lifecycle ===

    /// Spawn the collector thread. Called once by `Runtime::start`.
    pub(crate) fn start(&self, rt: Arc<Runtime>) {
        let mut handle = self.handle.lock();
        debug_assert!(handle.is_none());
        *handle = Some(
            std::thread::Builder::new()
                .name("veld-gc".into())
                .spawn(move || gc_main(rt))
                .expect("failed to spawn gc thread"),
        );
    }

    /// Stop the collector thread; a cycle in flight finishes first.
    pub(crate) fn stop(&self) {
        {
            let _guard = self.request_mutex.lock();
            self.wants_exit.store(true, Ordering::Release);
            self.request_cv.notify_one();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    // === Control surface ===

    /// Request one collection cycle. No-op while the collector runs.
    pub fn request_gc(&self) {
        let _guard = self.request_mutex.lock();
        self.request_pending.store(true, Ordering::Release);
        self.request_cv.notify_one();
    }

    /// Request a collection and block until that cycle completes.
    ///
    /// Only for callers outside the workers (bootstrap, embedder, test);
    /// a fiber calling this would deadlock with its own stop-the-world.
    pub fn collect_now(&self) {
        let start_cycle = self.cycle_count();
        self.request_gc();

        let mut guard = self.cycle_mutex.lock();
        while self.cycle_count() == start_cycle || self.phase() != GcPhase::Idle {
            if self.wants_exit.load(Ordering::Acquire) {
                return;
            }
            let _ = self
                .cycle_cv
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Acquire)
    }

    /// Total objects marked over the collector's lifetime
    pub fn marked_count(&self) -> u64 {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Total objects evacuated over the collector's lifetime
    pub fn evacuated_count(&self) -> u64 {
        self.evacuated_count.load(Ordering::Relaxed)
    }

    // === Barriers ===

    /// Write barrier hook: a black object that was just mutated is
    /// re-greyed so the mark snapshot cannot lose the new reference.
    pub fn write_barrier(&self, object: Value) {
        debug_assert!(object.is_object());
        let header = unsafe { crate::heap::object::header(object) };
        if header.cas_color(MarkColor::Black, MarkColor::Grey) {
            self.grey.push(object);
        }
    }

    /// Grey a value that is still white (marking path)
    pub(crate) fn mark_value(&self, value: Value) {
        if !value.is_object() {
            return;
        }
        let header = unsafe { object::header(value) };
        if header.cas_color(MarkColor::White, MarkColor::Grey) {
            self.grey.push(value);
        }
    }

    pub(crate) fn pop_grey(&self) -> Option<Value> {
        self.grey.pop()
    }

    pub(crate) fn grey_is_empty(&self) -> bool {
        self.grey.is_empty()
    }

    pub(crate) fn note_marked(&self) {
        self.marked_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_evacuated(&self) {
        self.evacuated_count.fetch_add(1, Ordering::Relaxed);
    }

    // === Collector thread internals ===

    fn wait_for_request(&self) -> bool {
        let mut guard = self.request_mutex.lock();
        loop {
            if self.wants_exit.load(Ordering::Acquire) {
                return false;
            }
            if self.request_pending.swap(false, Ordering::AcqRel) {
                return true;
            }
            self.request_cv.wait(&mut guard);
        }
    }

    fn finish_cycle(&self) {
        self.cycle_count.fetch_add(1, Ordering::AcqRel);
        let _guard = self.cycle_mutex.lock();
        self.cycle_cv.notify_all();
    }
}

/// Collector thread main loop
fn gc_main(rt: Arc<Runtime>) {
    log::debug!("gc worker starting");
    while rt.gc().wait_for_request() {
        run_cycle(&rt);
    }
    log::debug!("gc worker exited");
}

fn run_cycle(rt: &Runtime) {
    let gc = rt.gc();
    let scheduler = rt.scheduler();
    let allocator = rt.allocator();
    let start = std::time::Instant::now();

    // === Mark init (STW) ===
    scheduler.stop_the_world();
    gc.set_phase(GcPhase::Mark);
    {
        let _global = allocator.global_guard();
        marker::whiten_all(allocator);
        marker::scan_roots(rt);
    }
    scheduler.start_the_world();
    log::debug!("gc cycle {}: mark phase", gc.cycle_count());

    // === Mark (concurrent) ===
    marker::drain_grey(gc);

    // === Mark finish (STW) ===
    scheduler.stop_the_world();
    // rescan roots: references moved into locals or globals during the
    // concurrent phase may point at still-white objects
    {
        let _global = allocator.global_guard();
        marker::scan_roots(rt);
    }
    marker::drain_grey(gc);
    debug_assert!(gc.grey_is_empty());
    gc.set_phase(GcPhase::Evacuate);
    scheduler.start_the_world();
    log::debug!("gc cycle {}: evacuate phase", gc.cycle_count());

    // === Evacuate (concurrent) ===
    let evacuated = relocate::evacuate(rt);

    // === Evacuate finish (STW) ===
    scheduler.stop_the_world();
    gc.set_phase(GcPhase::UpdateRef);
    scheduler.start_the_world();
    log::debug!("gc cycle {}: updateref phase", gc.cycle_count());

    // === UpdateRef (concurrent) ===
    let watermarks = relocate::update_references(rt, &evacuated);

    // === UpdateRef finish (STW) ===
    scheduler.stop_the_world();
    {
        let _global = allocator.global_guard();
        relocate::update_reference_deltas(rt, &watermarks, &evacuated);
        marker::update_roots(rt);
        for region in &evacuated {
            let region_ref = unsafe { region.as_ref() };
            region_ref.reset();
            allocator.free_region(*region);
        }
        allocator.gc_release_region();
    }
    gc.set_phase(GcPhase::Idle);
    scheduler.start_the_world();

    gc.finish_cycle();
    log::debug!(
        "gc cycle {} complete in {:?}: {} regions reclaimed, {} free / {} allocated",
        gc.cycle_count(),
        start.elapsed(),
        evacuated.len(),
        allocator.free_regions(),
        allocator.allocated_regions(),
    );
}
