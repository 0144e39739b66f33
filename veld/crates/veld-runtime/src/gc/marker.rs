//! Marker - Tri-Color Tracing and Root Scanning
//!
//! Mark init (STW): every object in a non-`Available` region is colored
//! white by a linear region walk, then the root set is greyed: each
//! thread's frame chain (locals, operand stack, self, function, context,
//! return slot, intercept state), pending exception, entry task, and the
//! VM globals.
//!
//! Concurrent mark: pop a grey object, scan its fields by shape id, turn
//! white children grey, turn the object itself black. The tracer only
//! ever sees initialized bodies because the allocator writes the body
//! before the bump pointer advances past it, and walks are bounded by
//! watermarks.

use std::ptr::NonNull;

use crate::heap::allocator::MemoryAllocator;
use crate::heap::object;
use crate::heap::{HeapHeader, HeapRegion, MarkColor, RegionState, HEADER_SIZE};
use crate::runtime::Runtime;
use crate::value::Value;

use super::GarbageCollector;

/// Linear walk over every object of `region` within `[start, limit)`
/// offsets.
///
/// # Safety (internal)
/// `start` must be 0 or a valid object start offset; `limit` must be a
/// watermark taken while no carve below it was in flight.
pub(crate) fn walk_objects(
    region: &HeapRegion,
    start: usize,
    limit: usize,
    mut f: impl FnMut(&HeapHeader, *mut u8),
) {
    let base = region.start_ptr();
    let mut offset = start;
    while offset + HEADER_SIZE <= limit {
        let header = unsafe { &*(base.add(offset) as *const HeapHeader) };
        let body = unsafe { base.add(offset + HEADER_SIZE) };
        f(header, body);
        offset += MemoryAllocator::object_stride(header);
    }
}

/// Mark init: color every object white in each region that can hold data
/// (world stopped).
pub(crate) fn whiten_all(allocator: &MemoryAllocator) {
    for region in allocator.region_snapshot() {
        let region = unsafe { region.as_ref() };
        if region.state() == RegionState::Available {
            continue;
        }
        walk_objects(region, 0, region.used_bytes(), |header, _| {
            header.set_color(MarkColor::White);
        });
    }
}

/// Run `f` over every root slot, writing its return value back.
///
/// Used both ways: scanning (identity + grey side effect) and rewriting
/// (resolve the forward pointer). The world must be stopped.
pub(crate) fn visit_roots(rt: &Runtime, mut f: impl FnMut(Value) -> Value) {
    let scheduler = rt.scheduler();

    for thread in scheduler.threads_snapshot() {
        let thread = unsafe { thread.as_ref() };

        for slot in thread.root_slots() {
            let value = Value::from_raw(slot.load(std::sync::atomic::Ordering::Acquire));
            let new = f(value);
            if new.raw() != value.raw() {
                slot.store(new.raw(), std::sync::atomic::Ordering::Release);
            }
        }

        for value in thread.entry_args_for_roots().iter_mut() {
            *value = f(*value);
        }

        let mut frame = thread.top_frame();
        while !frame.is_null() {
            let frame_ref = unsafe { &mut *frame };
            for slot in frame_ref.gc_fixed_slots() {
                *slot = f(*slot);
            }
            if let Some(slot) = frame_ref.gc_intercept_slot() {
                *slot = f(*slot);
            }
            let (locals, stack) = frame_ref.gc_slots();
            for slot in locals.iter_mut() {
                *slot = f(*slot);
            }
            for slot in stack.iter_mut() {
                *slot = f(*slot);
            }
            frame = frame_ref.parent;
        }
    }

    rt.visit_globals(&mut f);
}

/// Mark init: grey the entire root set (world stopped).
pub(crate) fn scan_roots(rt: &Runtime) {
    let gc = rt.gc();
    let mut count = 0usize;
    visit_roots(rt, |value| {
        gc.mark_value(value);
        count += 1;
        value
    });
    log::trace!("scanned {} root slots", count);
}

/// UpdateRef finish: rewrite every root through its forward pointer
/// (world stopped).
pub(crate) fn update_roots(rt: &Runtime) {
    visit_roots(rt, object::resolve);
}

/// Concurrent mark: drain the grey queue until empty.
pub(crate) fn drain_grey(gc: &GarbageCollector) {
    while let Some(value) = gc.pop_grey() {
        let header = unsafe { object::header(value) };

        if header.shape_id().is_instance() {
            let body = value.as_body_ptr() as *const u64;
            for index in 0..header.count() {
                let child =
                    Value::from_raw(unsafe { std::ptr::read_volatile(body.add(index as usize)) });
                gc.mark_value(child);
            }
        }

        header.set_color(MarkColor::Black);
        gc.note_marked();
    }
}

/// Count the live bytes (stride included) of one region.
pub(crate) fn live_bytes(region: &HeapRegion, limit: usize) -> usize {
    let mut live = 0usize;
    walk_objects(region, 0, limit, |header, _| {
        if header.color() != MarkColor::White {
            live += MemoryAllocator::object_stride(header);
        }
    });
    live
}

/// Region snapshot relevant for a sweep: Used or Released, minus the
/// already-evacuated from-space.
pub(crate) fn sweepable_regions(
    allocator: &MemoryAllocator,
    exclude: &[NonNull<HeapRegion>],
) -> Vec<NonNull<HeapRegion>> {
    allocator
        .region_snapshot()
        .into_iter()
        .filter(|region| {
            let state = unsafe { region.as_ref() }.state();
            state != RegionState::Available && !exclude.contains(region)
        })
        .collect()
}
