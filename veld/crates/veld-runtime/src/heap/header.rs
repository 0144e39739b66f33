//! Heap Object Header - Metadata Prefix for Every Heap Value
//!
//! Header Layout (16 bytes, 8-byte aligned):
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      Forward Pointer (8 bytes)          │  <- AtomicUsize
//! │  points to the body itself, or to the   │
//! │  relocated copy during evacuation       │
//! ├──────────┬──────────┬─────────┬─────────┤
//! │ Shape id │  Color   │  Lock   │  Magic  │  <- 4 x u8
//! ├──────────┴──────────┴─────────┴─────────┤
//! │          Count (4 bytes)                │  <- AtomicU32
//! │  field count (instance shapes)          │
//! │  byte length (data shapes)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The header sits immediately before the object body; a body pointer minus
//! `HEADER_SIZE` recovers it. The magic byte validates that arithmetic in
//! debug builds.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::value::ShapeId;

use super::region::OBJECT_ALIGNMENT;

/// Size of the heap header in bytes
pub const HEADER_SIZE: usize = 16;

/// Magic byte stamped into every header
pub const HEADER_MAGIC: u8 = 0x56;

/// Tri-color mark state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Value not reachable
    White = 0,
    /// Value currently being traversed
    Grey = 1,
    /// Value reachable
    Black = 2,
}

impl MarkColor {
    pub fn from_u8(raw: u8) -> MarkColor {
        match raw {
            0 => MarkColor::White,
            1 => MarkColor::Grey,
            2 => MarkColor::Black,
            _ => unreachable!("invalid mark color"),
        }
    }
}

/// Small per-object lock states
pub const LOCK_FREE: u8 = 0;
pub const LOCK_LOCKED: u8 = 1;
pub const LOCK_HAS_PARKED: u8 = 2;

/// Heap object header
///
/// Every heap value is prefixed by this header. It carries the forwarding
/// pointer the mutator's load barrier resolves through, the shape id that
/// drives the tracer, the tri-color mark state and a one-byte lock that
/// serializes header mutations (forwarding in particular).
#[repr(C)]
pub struct HeapHeader {
    /// Forward pointer: the body address, or the relocated copy
    forward: AtomicUsize,
    /// Shape id classifying the body layout
    shape: AtomicU8,
    /// Tri-color mark state
    color: AtomicU8,
    /// Small lock (`LOCK_*` states)
    pub(crate) lock: AtomicU8,
    /// Magic byte validating header resolution
    magic: AtomicU8,
    /// Field count (instance) or byte length (data)
    count: AtomicU32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<HeapHeader>(), HEADER_SIZE);
static_assertions::const_assert!(HEADER_SIZE % OBJECT_ALIGNMENT == 0);

impl HeapHeader {
    /// Initialize a freshly carved header.
    ///
    /// Newly allocated values are colored `Black` so objects allocated
    /// during a running collection cycle survive it.
    pub fn init(&self, shape: ShapeId, count: u32, body: *mut u8) {
        self.forward.store(body as usize, Ordering::Relaxed);
        self.shape.store(shape as u8, Ordering::Relaxed);
        self.color.store(MarkColor::Black as u8, Ordering::Relaxed);
        self.lock.store(LOCK_FREE, Ordering::Relaxed);
        self.magic.store(HEADER_MAGIC, Ordering::Relaxed);
        self.count.store(count, Ordering::Release);
    }

    /// Recover the header from a body pointer.
    ///
    /// # Safety
    /// `body` must point to the body of a live heap allocation made by the
    /// runtime's allocator.
    #[inline]
    pub unsafe fn for_body<'a>(body: *const u8) -> &'a HeapHeader {
        let header = &*(body.sub(HEADER_SIZE) as *const HeapHeader);
        debug_assert_eq!(
            header.magic.load(Ordering::Relaxed),
            HEADER_MAGIC,
            "heap header magic mismatch at {:p}",
            body
        );
        header
    }

    /// Resolve the forward pointer (acquire).
    ///
    /// Idempotent: resolving an already-resolved pointer returns the same
    /// address.
    #[inline]
    pub fn forward(&self) -> *mut u8 {
        self.forward.load(Ordering::Acquire) as *mut u8
    }

    /// Publish a relocated copy (release). Must be called with the header
    /// lock held.
    #[inline]
    pub fn set_forward(&self, target: *mut u8) {
        self.forward.store(target as usize, Ordering::Release);
    }

    /// Whether the object has been relocated
    #[inline]
    pub fn is_forwarded(&self, body: *const u8) -> bool {
        self.forward.load(Ordering::Acquire) != body as usize
    }

    /// Shape id
    #[inline]
    pub fn shape_id(&self) -> ShapeId {
        ShapeId::from_u8(self.shape.load(Ordering::Relaxed)).expect("invalid shape id in header")
    }

    /// Mark color
    #[inline]
    pub fn color(&self) -> MarkColor {
        MarkColor::from_u8(self.color.load(Ordering::Acquire))
    }

    /// Set mark color
    #[inline]
    pub fn set_color(&self, color: MarkColor) {
        self.color.store(color as u8, Ordering::Release);
    }

    /// Compare-and-set the mark color. Returns true when the transition
    /// happened.
    #[inline]
    pub fn cas_color(&self, expected: MarkColor, new: MarkColor) -> bool {
        self.color
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Field count (instance shapes) or byte length (data shapes)
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Body size in bytes implied by shape id and count
    pub fn body_size(&self) -> usize {
        let shape = self.shape_id();
        if shape.is_instance() {
            self.count() as usize * 8
        } else {
            self.count() as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_header_and_body() -> (Box<[u64]>, *mut u8) {
        // carve a header + 3 field slots out of an 8-aligned buffer
        let buf = vec![0u64; (HEADER_SIZE + 24) / 8].into_boxed_slice();
        let base = buf.as_ptr() as *mut u8;
        assert_eq!(base as usize % OBJECT_ALIGNMENT, 0);
        (buf, unsafe { base.add(HEADER_SIZE) })
    }

    #[test]
    fn test_init_and_recover() {
        let (_buf, body) = boxed_header_and_body();
        let header = unsafe { &*(body.sub(HEADER_SIZE) as *const HeapHeader) };
        header.init(crate::value::ShapeId::Tuple, 3, body);

        let recovered = unsafe { HeapHeader::for_body(body) };
        assert_eq!(recovered.shape_id(), crate::value::ShapeId::Tuple);
        assert_eq!(recovered.count(), 3);
        assert_eq!(recovered.color(), MarkColor::Black);
        assert_eq!(recovered.forward(), body);
        assert!(!recovered.is_forwarded(body));
    }

    #[test]
    fn test_forward_resolution_is_idempotent() {
        let (_buf, body) = boxed_header_and_body();
        let header = unsafe { &*(body.sub(HEADER_SIZE) as *const HeapHeader) };
        header.init(crate::value::ShapeId::Tuple, 3, body);

        assert_eq!(header.forward(), body);
        assert_eq!(header.forward(), header.forward());

        let target = 0x8000usize as *mut u8;
        header.set_forward(target);
        assert!(header.is_forwarded(body));
        assert_eq!(header.forward(), target);
        // resolving again yields the same address
        assert_eq!(header.forward(), target);
    }

    #[test]
    fn test_color_transitions() {
        let (_buf, body) = boxed_header_and_body();
        let header = unsafe { &*(body.sub(HEADER_SIZE) as *const HeapHeader) };
        header.init(crate::value::ShapeId::Tuple, 3, body);

        header.set_color(MarkColor::White);
        assert!(header.cas_color(MarkColor::White, MarkColor::Grey));
        assert!(!header.cas_color(MarkColor::White, MarkColor::Grey));
        assert_eq!(header.color(), MarkColor::Grey);
        assert!(header.cas_color(MarkColor::Grey, MarkColor::Black));
        assert_eq!(header.color(), MarkColor::Black);
    }

    #[test]
    fn test_body_size_by_shape_group() {
        let (_buf, body) = boxed_header_and_body();
        let header = unsafe { &*(body.sub(HEADER_SIZE) as *const HeapHeader) };

        header.init(crate::value::ShapeId::Tuple, 3, body);
        assert_eq!(header.body_size(), 24);

        header.init(crate::value::ShapeId::LargeString, 13, body);
        assert_eq!(header.body_size(), 13);
    }
}
