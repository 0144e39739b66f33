//! Relocator - Evacuation and Reference Update
//!
//! Evacuate (concurrent): `Released` regions with a live ratio below the
//! threshold become from-space. Every live object is copied into the
//! collector's region through the allocator, then its forward pointer is
//! published with a release store under the header's small lock. A
//! reader resolving through the header always sees either the old body,
//! still intact, or the fully written copy.
//!
//! UpdateRef (concurrent): sweep every live object and rewrite each
//! outgoing reference through its forward pointer. Objects allocated
//! during the sweep are handled later by a delta walk in the final STW,
//! together with the root rewrite; after that the from-space regions are
//! reset to `Available`.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::heap::lock::lock_header;
use crate::heap::object;
use crate::heap::{HeapRegion, MarkColor, RegionState};
use crate::runtime::Runtime;
use crate::value::Value;

use super::marker::{live_bytes, sweepable_regions, walk_objects};

/// Evacuate phase. Returns the regions whose live objects were all copied
/// out; they are reset at the end of the cycle.
pub(crate) fn evacuate(rt: &Runtime) -> Vec<NonNull<HeapRegion>> {
    let gc = rt.gc();
    let allocator = rt.allocator();
    let threshold = gc.evacuate_live_ratio;
    let mut evacuated = Vec::new();

    for region_ptr in allocator.region_snapshot() {
        let region = unsafe { region_ptr.as_ref() };
        if region.state() != RegionState::Released {
            continue;
        }

        let limit = region.used_bytes();
        if limit == 0 {
            // released without ever being written; reclaim directly
            evacuated.push(region_ptr);
            continue;
        }

        let ratio = live_bytes(region, limit) as f32 / limit as f32;
        if ratio > threshold {
            // dense region: leave it in place for a later cycle
            continue;
        }

        let mut complete = true;
        walk_objects(region, 0, limit, |header, body| {
            if !complete || header.color() == MarkColor::White {
                return;
            }

            let _guard = lock_header(&header.lock);
            if header.is_forwarded(body) {
                return;
            }

            match allocator.gc_allocate(header.shape_id(), header.count()) {
                Some(new_value) => {
                    let new_body = new_value.as_body_ptr();
                    unsafe {
                        std::ptr::copy_nonoverlapping(body as *const u8, new_body, header.body_size());
                    }
                    header.set_forward(new_body);
                    gc.note_evacuated();
                }
                None => {
                    // heap growth failure mid-evacuation: finish the cycle
                    // with the regions we have (the from-space stays live)
                    log::warn!(
                        "evacuation of region {} abandoned: no to-space available",
                        region.id()
                    );
                    complete = false;
                }
            }
        });

        if complete {
            evacuated.push(region_ptr);
        }
    }

    evacuated
}

/// Watermarks recorded by the concurrent sweep, keyed by region address
pub(crate) type SweepWatermarks = FxHashMap<usize, usize>;

/// Concurrent reference update: rewrite the fields of every live object
/// allocated before this sweep.
pub(crate) fn update_references(
    rt: &Runtime,
    evacuated: &[NonNull<HeapRegion>],
) -> SweepWatermarks {
    let allocator = rt.allocator();
    let mut watermarks = SweepWatermarks::default();

    for region_ptr in sweepable_regions(allocator, evacuated) {
        let region = unsafe { region_ptr.as_ref() };
        let limit = region.used_bytes();
        watermarks.insert(region_ptr.as_ptr() as usize, limit);
        rewrite_range(region, 0, limit);
    }

    watermarks
}

/// Final STW: rewrite objects allocated while the concurrent sweep ran
/// (above the recorded watermarks, or whole regions the sweep never saw).
pub(crate) fn update_reference_deltas(
    rt: &Runtime,
    watermarks: &SweepWatermarks,
    evacuated: &[NonNull<HeapRegion>],
) {
    let allocator = rt.allocator();

    for region_ptr in sweepable_regions(allocator, evacuated) {
        let region = unsafe { region_ptr.as_ref() };
        let start = watermarks
            .get(&(region_ptr.as_ptr() as usize))
            .copied()
            .unwrap_or(0);
        let limit = region.used_bytes();
        if start < limit {
            rewrite_range(region, start, limit);
        }
    }
}

fn rewrite_range(region: &HeapRegion, start: usize, limit: usize) {
    walk_objects(region, start, limit, |header, body| {
        if header.color() == MarkColor::White {
            return;
        }
        if !header.shape_id().is_instance() {
            return;
        }

        let slots = body as *mut u64;
        for index in 0..header.count() {
            let slot = unsafe { slots.add(index as usize) };
            let value = Value::from_raw(unsafe { std::ptr::read_volatile(slot) });
            if !value.is_object() {
                continue;
            }
            let resolved = object::resolve(value);
            if resolved.raw() != value.raw() {
                unsafe { std::ptr::write_volatile(slot, resolved.raw()) };
            }
        }
    });
}
