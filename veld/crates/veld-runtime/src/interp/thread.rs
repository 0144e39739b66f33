//! Thread - Fiber Control Block
//!
//! The runtime's record for one fiber (distinct from an OS thread): the
//! fiber stack and saved context, the chain of call frames, the pending
//! exception, entry task and result publication slots, and the scheduling
//! state the workers and collector coordinate through.
//!
//! Ownership protocol: a thread is owned by exactly one run queue or one
//! worker at a time. Fields are atomics so the collector can read (and,
//! during the stop-the-world root fixups, write) them from its own OS
//! thread; `Value` slots are stored as raw words in `AtomicU64`s.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::runtime::Runtime;
use crate::scheduler::fiber::{ContextCell, FiberContext, Stack};
use crate::scheduler::worker::Worker;
use crate::value::Value;

use super::frame::Frame;

/// Fiber state machine. Transitions are monotonic toward `Exited` within
/// one spawn; recycling bumps the generation and starts over.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Ready to be executed (queued)
    Ready = 0,
    /// Currently executing on some worker
    Running = 1,
    /// Parked; some facility holds the wake reference
    Paused = 2,
    /// Finished; control block may be recycled
    Exited = 3,
}

impl ThreadStatus {
    fn from_u8(raw: u8) -> ThreadStatus {
        match raw {
            0 => ThreadStatus::Ready,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Paused,
            3 => ThreadStatus::Exited,
            _ => unreachable!("invalid thread status"),
        }
    }
}

/// Why the fiber handed control back to the scheduler loop
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    None = 0,
    /// Requeue at the local tail
    Yielded = 1,
    /// Parked elsewhere; do not requeue
    Paused = 2,
    /// Finished; publish exit and recycle
    Exited = 3,
}

impl RunResult {
    fn from_u8(raw: u8) -> RunResult {
        match raw {
            0 => RunResult::None,
            1 => RunResult::Yielded,
            2 => RunResult::Paused,
            3 => RunResult::Exited,
            _ => unreachable!("invalid run result"),
        }
    }
}

pub struct Thread {
    id: u64,
    /// Bumped on every recycle; fiber handles compare this to detect
    /// stale thread references
    generation: AtomicU64,

    status: AtomicU8,
    run_result: AtomicU8,
    /// Handoff flag: false while a worker still holds the fiber's saved
    /// context in flight. A dispatcher spins until it becomes true.
    schedulable: AtomicBool,

    /// Saved machine context (valid while off-CPU)
    context: ContextCell,
    /// Fiber stack; absent while recycled
    stack: Mutex<Option<Stack>>,

    /// Entry task: function value and arguments, consumed by the fiber
    entry_function: AtomicU64,
    entry_args: Mutex<Vec<Value>>,
    /// Fiber instance value for result publication (GC root)
    fiber_value: AtomicU64,

    /// Innermost call frame (frames live on the fiber stack)
    top_frame: AtomicPtr<Frame>,
    /// Pending exception slot (GC root)
    pending_exception: AtomicU64,

    /// Millisecond timestamp of the last dispatch; drives preemption
    scheduled_at: AtomicU64,
    /// Worker currently hosting this fiber
    worker: AtomicPtr<Worker>,
    /// Owning runtime (stable for the thread's lifetime)
    runtime: AtomicPtr<Runtime>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn new(id: u64) -> Thread {
        Thread {
            id,
            generation: AtomicU64::new(0),
            status: AtomicU8::new(ThreadStatus::Exited as u8),
            run_result: AtomicU8::new(RunResult::None as u8),
            schedulable: AtomicBool::new(true),
            context: ContextCell::new(),
            stack: Mutex::new(None),
            entry_function: AtomicU64::new(Value::NULL.raw()),
            entry_args: Mutex::new(Vec::new()),
            fiber_value: AtomicU64::new(Value::NULL.raw()),
            top_frame: AtomicPtr::new(std::ptr::null_mut()),
            pending_exception: AtomicU64::new(Value::NULL.raw()),
            scheduled_at: AtomicU64::new(0),
            worker: AtomicPtr::new(std::ptr::null_mut()),
            runtime: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    // === Identity ===

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // === Spawn / recycle lifecycle ===

    /// Arm a (fresh or recycled) control block for execution.
    pub fn init_for_spawn(
        &self,
        rt: *const Runtime,
        function: Value,
        args: Vec<Value>,
        fiber_value: Value,
        stack: Stack,
    ) {
        debug_assert_eq!(self.status(), ThreadStatus::Exited);

        self.runtime.store(rt as *mut Runtime, Ordering::Release);
        self.entry_function.store(function.raw(), Ordering::Release);
        *self.entry_args.lock() = args;
        self.fiber_value.store(fiber_value.raw(), Ordering::Release);
        self.pending_exception
            .store(Value::NULL.raw(), Ordering::Release);
        self.top_frame.store(std::ptr::null_mut(), Ordering::Release);
        self.run_result.store(RunResult::None as u8, Ordering::Release);
        self.schedulable.store(true, Ordering::Release);

        self.context
            .set(FiberContext::for_new_fiber(&stack, self as *const Thread as *mut Thread));
        *self.stack.lock() = Some(stack);

        self.status.store(ThreadStatus::Ready as u8, Ordering::Release);
    }

    /// Strip the control block after exit so the collector never traces
    /// stale values, and bump the generation. Returns the stack for the
    /// free pool.
    pub fn reset_for_recycle(&self) -> Option<Stack> {
        debug_assert_eq!(self.status(), ThreadStatus::Exited);

        self.entry_function.store(Value::NULL.raw(), Ordering::Release);
        self.entry_args.lock().clear();
        self.fiber_value.store(Value::NULL.raw(), Ordering::Release);
        self.pending_exception
            .store(Value::NULL.raw(), Ordering::Release);
        self.top_frame.store(std::ptr::null_mut(), Ordering::Release);
        self.worker.store(std::ptr::null_mut(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        self.stack.lock().take()
    }

    // === Status / scheduling state ===

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn set_run_result(&self, result: RunResult) {
        self.run_result.store(result as u8, Ordering::Release);
    }

    #[inline]
    pub fn take_run_result(&self) -> RunResult {
        RunResult::from_u8(
            self.run_result
                .swap(RunResult::None as u8, Ordering::AcqRel),
        )
    }

    /// Dispatcher handoff: spin until the previous worker has fully saved
    /// this fiber's context, then claim it.
    pub fn acquire_for_dispatch(&self) {
        while self
            .schedulable
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Called by the worker after switching back: the saved context is
    /// complete and the fiber may be dispatched again.
    pub fn release_after_switch(&self) {
        self.schedulable.store(true, Ordering::Release);
    }

    // === Context / worker plumbing ===

    #[inline]
    pub fn context(&self) -> &ContextCell {
        &self.context
    }

    #[inline]
    pub fn worker(&self) -> *mut Worker {
        self.worker.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_worker(&self, worker: *mut Worker) {
        self.worker.store(worker, Ordering::Release);
    }

    #[inline]
    pub fn runtime(&self) -> *const Runtime {
        self.runtime.load(Ordering::Acquire)
    }

    #[inline]
    pub fn scheduled_at(&self) -> u64 {
        self.scheduled_at.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_scheduled_at(&self, millis: u64) {
        self.scheduled_at.store(millis, Ordering::Release);
    }

    /// Switch from this fiber back to its worker's scheduler loop. Only
    /// legal on the fiber's own stack.
    pub fn switch_to_scheduler(&self) {
        let worker = self.worker();
        debug_assert!(!worker.is_null());
        let worker = unsafe { &*worker };
        unsafe { crate::scheduler::fiber::switch(&self.context, worker.context()) };
    }

    // === Entry task ===

    pub fn entry_function(&self) -> Value {
        Value::from_raw(self.entry_function.load(Ordering::Acquire))
    }

    pub fn fiber_value(&self) -> Value {
        Value::from_raw(self.fiber_value.load(Ordering::Acquire))
    }

    // === GC interface ===

    #[inline]
    pub fn top_frame(&self) -> *mut Frame {
        self.top_frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_top_frame(&self, frame: *mut Frame) {
        self.top_frame.store(frame, Ordering::Release);
    }

    pub fn pending_exception(&self) -> Value {
        Value::from_raw(self.pending_exception.load(Ordering::Acquire))
    }

    pub fn set_pending_exception(&self, value: Value) {
        self.pending_exception.store(value.raw(), Ordering::Release);
    }

    /// Root slots the collector scans and rewrites: entry function, fiber
    /// value, pending exception. Frame chains and entry args are walked
    /// separately.
    pub(crate) fn root_slots(&self) -> [&AtomicU64; 3] {
        [
            &self.entry_function,
            &self.fiber_value,
            &self.pending_exception,
        ]
    }

    /// Entry args storage for root scanning (collector-side, world
    /// stopped).
    pub(crate) fn entry_args_for_roots(&self) -> parking_lot::MutexGuard<'_, Vec<Value>> {
        self.entry_args.lock()
    }

    // === Safepoints ===

    /// Safepoint: synchronize with a pending stop-the-world and preempt
    /// the fiber when its timeslice has expired. Called at function entry,
    /// loop back-edges, allocations and native-call boundaries.
    pub fn checkpoint(&self, rt: &Runtime) {
        let worker = self.worker();
        debug_assert!(!worker.is_null());
        unsafe { &*worker }.checkpoint_stw();

        let now = crate::scheduler::now_millis();
        if now.saturating_sub(self.scheduled_at()) >= rt.config().timeslice_ms {
            self.yield_now();
        }
    }

    /// Cooperative yield: requeue at the local tail and hand control to
    /// the scheduler.
    pub fn yield_now(&self) {
        self.set_run_result(RunResult::Yielded);
        self.switch_to_scheduler();
    }

    /// Remaining native stack below `probe_addr`, for overflow checks.
    pub fn stack_headroom(&self, probe_addr: usize) -> usize {
        let guard = self.stack.lock();
        match &*guard {
            Some(stack) if stack.contains(probe_addr) => probe_addr - stack.lo() as usize,
            _ => usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        let thread = Thread::new(1);
        assert_eq!(thread.status(), ThreadStatus::Exited);
        thread.set_status(ThreadStatus::Ready);
        assert_eq!(thread.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_run_result_take_clears() {
        let thread = Thread::new(1);
        thread.set_run_result(RunResult::Yielded);
        assert_eq!(thread.take_run_result(), RunResult::Yielded);
        assert_eq!(thread.take_run_result(), RunResult::None);
    }

    #[test]
    fn test_dispatch_handoff() {
        let thread = Thread::new(1);
        thread.acquire_for_dispatch();
        // released by the worker once the context is saved
        thread.release_after_switch();
        thread.acquire_for_dispatch();
        thread.release_after_switch();
    }

    #[test]
    fn test_pending_exception_slot() {
        let thread = Thread::new(1);
        assert!(thread.pending_exception().is_null());
        thread.set_pending_exception(Value::int(7).unwrap());
        assert_eq!(thread.pending_exception().as_int(), 7);
    }
}
