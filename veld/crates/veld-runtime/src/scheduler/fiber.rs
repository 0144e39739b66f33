//! Fiber Stacks and Machine Context
//!
//! Every fiber owns a native stack (an anonymous mapping) with a guard
//! page at both ends so a stack overflow traps deterministically. The
//! fiber context is a single saved stack pointer; the callee-saved
//! registers live in the frame pushed by the switch shim (see
//! [`super::arch`]).
//!
//! A new fiber starts in a trampoline that runs the thread's task
//! function and, when it finishes, signals exit to the scheduler and
//! switches back.

use std::cell::UnsafeCell;
use std::panic::AssertUnwindSafe;

use memmap2::MmapMut;

use veld_util::align_up;

use crate::error::{Result, RuntimeError};
use crate::interp::thread::{RunResult, Thread};

use super::arch;

/// Guard-paged native stack for one fiber.
///
/// A stack is owned by exactly one thread control block; the scheduler
/// recycles them through a free pool.
pub struct Stack {
    map: MmapMut,
    /// Offset of the usable low end within the mapping (above the guard
    /// page)
    lo_offset: usize,
    /// Usable size in bytes
    size: usize,
}

// The mapping is owned exclusively by one fiber; pointers into it are
// only used by the thread currently running that fiber.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a fresh stack with lower and upper guard pages.
    pub fn new(size: usize) -> Result<Stack> {
        let page = page_size::get();
        let usable = align_up(size, page);
        let total = usable + 2 * page;

        let mut map = MmapMut::map_anon(total)
            .map_err(|e| RuntimeError::StackAllocation(e.to_string()))?;

        let base = map.as_mut_ptr();
        // guard pages are best effort: a platform without mprotect
        // support still runs, just without the deterministic trap
        unsafe {
            if libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) != 0 {
                log::warn!("failed to protect lower stack guard page");
            }
            if libc::mprotect(
                base.add(page + usable) as *mut libc::c_void,
                page,
                libc::PROT_NONE,
            ) != 0
            {
                log::warn!("failed to protect upper stack guard page");
            }
        }

        Ok(Stack {
            map,
            lo_offset: page,
            size: usable,
        })
    }

    /// Low end of the usable area
    #[inline]
    pub fn lo(&self) -> *mut u8 {
        unsafe { (self.map.as_ptr() as *mut u8).add(self.lo_offset) }
    }

    /// High end of the usable area (initial stack pointer)
    #[inline]
    pub fn hi(&self) -> *mut u8 {
        unsafe { self.lo().add(self.size) }
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check whether an address lies in the usable area
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let lo = self.lo() as usize;
        addr >= lo && addr < lo + self.size
    }
}

/// Saved machine context: a single stack pointer.
#[derive(Clone, Copy)]
pub struct FiberContext {
    sp: *mut u8,
}

impl FiberContext {
    pub const fn null() -> FiberContext {
        FiberContext {
            sp: std::ptr::null_mut(),
        }
    }

    /// Fabricate the context for a fresh fiber on top of `stack`,
    /// starting in the trampoline with `thread` as its argument.
    pub fn for_new_fiber(stack: &Stack, thread: *mut Thread) -> FiberContext {
        let sp = unsafe { arch::init_context(stack.hi(), thread as *mut u8, fiber_trampoline) };
        FiberContext { sp }
    }
}

/// Cell for a context mutated by switches.
///
/// Only the context's owner (a worker on its own OS thread, or the
/// currently running fiber) may touch this cell.
pub struct ContextCell(UnsafeCell<FiberContext>);

unsafe impl Send for ContextCell {}
unsafe impl Sync for ContextCell {}

impl ContextCell {
    pub const fn new() -> ContextCell {
        ContextCell(UnsafeCell::new(FiberContext::null()))
    }

    pub fn set(&self, context: FiberContext) {
        unsafe { *self.0.get() = context }
    }

    #[inline]
    pub(crate) fn sp_slot(&self) -> *mut *mut u8 {
        self.0.get() as *mut *mut u8
    }
}

/// Symmetric context switch: save the running context into `save`,
/// continue execution from `restore`.
///
/// # Safety
/// `restore` must hold a live context (produced by `for_new_fiber` or a
/// previous switch); the caller must own both contexts.
pub unsafe fn switch(save: &ContextCell, restore: &ContextCell) {
    arch::switch_context(save.sp_slot(), restore.sp_slot() as *const *mut u8);
}

/// Entry point of every fiber. Runs the thread's task function, marks
/// the exit, then switches back to the scheduler forever.
extern "C" fn fiber_trampoline(thread: *mut u8) -> ! {
    let thread = unsafe { &*(thread as *const Thread) };
    let rt = unsafe { &*thread.runtime() };

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        crate::interp::thread_main(rt, thread);
    }));
    if outcome.is_err() {
        log::error!("fiber {} panicked, terminating fiber", thread.id());
    }

    thread.set_run_result(RunResult::Exited);
    loop {
        thread.switch_to_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_geometry() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        assert_eq!(stack.hi() as usize - stack.lo() as usize, stack.size());
        assert!(stack.contains(stack.lo() as usize));
        assert!(stack.contains(stack.hi() as usize - 1));
        assert!(!stack.contains(stack.hi() as usize));
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        unsafe {
            stack.lo().write(0xaa);
            stack.hi().sub(1).write(0xbb);
            assert_eq!(stack.lo().read(), 0xaa);
            assert_eq!(stack.hi().sub(1).read(), 0xbb);
        }
    }

    #[test]
    fn test_stack_size_rounds_to_pages() {
        let stack = Stack::new(1).unwrap();
        assert_eq!(stack.size() % page_size::get(), 0);
        assert!(stack.size() >= page_size::get());
    }
}
