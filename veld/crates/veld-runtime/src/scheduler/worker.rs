//! Worker - the OS Thread Running the Scheduler Loop
//!
//! A worker is an OS thread that binds to one processor and runs fibers.
//! State machine (every other transition is illegal and rejected by the
//! CAS):
//!
//! ```text
//! Created ──▶ AcquiringProc ──▶ Scheduling ◀──▶ Running
//!                                   │               │
//!                                   ▼               ▼
//!                                 Idle          Native, WorldStopped
//!                                   │
//!                                   ▼
//!                                 Exited
//! ```
//!
//! A worker owns a processor only in the last four states (Scheduling,
//! Running, Native, WorldStopped).
//!
//! Stop-the-world protocol: the collector raises every worker's stop
//! flag under that worker's mutex, then waits for each unsafe worker
//! (Scheduling / Running) to reach `WorldStopped` through a checkpoint.
//! Transitions into the unsafe states always check the stop flag under
//! the same mutex, so a worker cannot slip in after the collector has
//! passed it. A worker in `Native` counts as already stopped without
//! being polled; on leaving native mode it has to synchronize with the
//! collector first.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::interp::thread::{RunResult, Thread, ThreadStatus};
use crate::runtime::Runtime;

use super::fiber::{self, ContextCell};
use super::processor::Processor;
use super::now_millis;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Initial state, no processor yet
    Created = 0,
    /// Idling, can be woken
    Idle = 1,
    /// Trying to acquire a processor
    AcquiringProc = 2,
    /// Has exited
    Exited = 3,
    /// Inside the scheduler loop (owns a processor)
    Scheduling = 4,
    /// Executing a fiber
    Running = 5,
    /// Executing a native section (no heap access)
    Native = 6,
    /// Stopped by a stop-the-world request
    WorldStopped = 7,
}

impl WorkerState {
    fn from_u8(raw: u8) -> WorkerState {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::Idle,
            2 => WorkerState::AcquiringProc,
            3 => WorkerState::Exited,
            4 => WorkerState::Scheduling,
            5 => WorkerState::Running,
            6 => WorkerState::Native,
            7 => WorkerState::WorldStopped,
            _ => unreachable!("invalid worker state"),
        }
    }

    /// States in which the worker is guaranteed not to touch the heap
    pub fn is_heap_safe(self) -> bool {
        !matches!(self, WorkerState::Scheduling | WorkerState::Running)
    }
}

pub struct Worker {
    id: usize,
    state: AtomicU8,
    stop_flag: AtomicBool,
    idle_flag: AtomicBool,
    wake_pending: AtomicBool,

    /// Scheduler-side saved context
    context: ContextCell,
    current_thread: AtomicPtr<Thread>,
    processor: AtomicPtr<Processor>,
    context_switches: AtomicU64,

    /// Mutex shared by the three condvars; also the stop-flag fence
    mutex: Mutex<()>,
    /// Signalled by the scheduler to leave Idle
    idle_cv: Condvar,
    /// Signalled by the collector when the world starts again
    stw_cv: Condvar,
    /// Notified by the worker on every state change
    state_cv: Condvar,
}

unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(id: usize) -> Worker {
        Worker {
            id,
            state: AtomicU8::new(WorkerState::Created as u8),
            stop_flag: AtomicBool::new(false),
            idle_flag: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            context: ContextCell::new(),
            current_thread: AtomicPtr::new(std::ptr::null_mut()),
            processor: AtomicPtr::new(std::ptr::null_mut()),
            context_switches: AtomicU64::new(0),
            mutex: Mutex::new(()),
            idle_cv: Condvar::new(),
            stw_cv: Condvar::new(),
            state_cv: Condvar::new(),
        }
    }

    // === Getters ===

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn context(&self) -> &ContextCell {
        &self.context
    }

    #[inline]
    pub fn current_thread(&self) -> Option<NonNull<Thread>> {
        NonNull::new(self.current_thread.load(Ordering::Acquire))
    }

    #[inline]
    pub fn processor(&self) -> Option<NonNull<Processor>> {
        NonNull::new(self.processor.load(Ordering::Acquire))
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn has_stop_flag(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_idle_flag(&self) -> bool {
        self.idle_flag.load(Ordering::Acquire)
    }

    pub(crate) fn set_processor(&self, proc: Option<NonNull<Processor>>) {
        let ptr = proc.map(|p| p.as_ptr()).unwrap_or(std::ptr::null_mut());
        self.processor.store(ptr, Ordering::Release);
    }

    fn set_current_thread(&self, thread: *mut Thread) {
        self.current_thread.store(thread, Ordering::Release);
    }

    // === State transitions ===

    /// Attempt a state transition; returns false when the current state
    /// differs from `expected`.
    pub fn change_state(&self, expected: WorkerState, new: WorkerState) -> bool {
        let ok = self
            .state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok {
            let _guard = self.mutex.lock();
            self.state_cv.notify_all();
        }
        ok
    }

    /// Asserting variant: any other transition is a scheduler bug.
    pub fn acas_state(&self, expected: WorkerState, new: WorkerState) {
        let ok = self.change_state(expected, new);
        assert!(
            ok,
            "illegal worker state transition {:?} -> {:?} (was {:?})",
            expected,
            new,
            self.state()
        );
    }

    // === Stop-the-world protocol ===

    /// Collector side: raise the stop flag under the worker mutex.
    pub(crate) fn set_stop_flag(&self) {
        let _guard = self.mutex.lock();
        self.stop_flag.store(true, Ordering::Release);
    }

    /// Collector side: clear the flag and release the worker.
    pub(crate) fn clear_stop_flag(&self) {
        let _guard = self.mutex.lock();
        self.stop_flag.store(false, Ordering::Release);
        self.stw_cv.notify_all();
    }

    /// Collector side: wait until this worker is in a heap-safe state.
    /// Workers in `Native` count as already stopped; they block at their
    /// exit boundary instead.
    pub(crate) fn wait_until_stopped(&self) {
        let mut guard = self.mutex.lock();
        while !self.state().is_heap_safe() {
            self.state_cv.wait(&mut guard);
        }
    }

    /// Worker side, from `Running` or `Scheduling`: synchronize with a
    /// pending stop-the-world request. Polled at every safepoint.
    pub fn checkpoint_stw(&self) {
        if !self.stop_flag.load(Ordering::Acquire) {
            return;
        }

        let prev = self.state();
        debug_assert!(
            matches!(prev, WorkerState::Running | WorkerState::Scheduling),
            "checkpoint from {:?}",
            prev
        );

        self.state
            .store(WorkerState::WorldStopped as u8, Ordering::Release);
        let mut guard = self.mutex.lock();
        self.state_cv.notify_all();
        while self.stop_flag.load(Ordering::Acquire) {
            self.stw_cv.wait(&mut guard);
        }
        self.state.store(prev as u8, Ordering::Release);
        self.state_cv.notify_all();
    }

    /// Worker side, in a heap-safe state: block while a stop-the-world is
    /// pending. Keeps idle/acquiring workers from waking into a stopped
    /// world.
    pub fn stw_barrier(&self) {
        if !self.stop_flag.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.mutex.lock();
        while self.stop_flag.load(Ordering::Acquire) {
            self.stw_cv.wait(&mut guard);
        }
    }

    /// Transition `AcquiringProc -> Scheduling`, holding at the barrier
    /// first. The flag check and the state store happen under the worker
    /// mutex, which is what makes the STW protocol race-free.
    pub fn enter_scheduling(&self) {
        let mut guard = self.mutex.lock();
        while self.stop_flag.load(Ordering::Acquire) {
            self.stw_cv.wait(&mut guard);
        }
        debug_assert_eq!(self.state(), WorkerState::AcquiringProc);
        self.state
            .store(WorkerState::Scheduling as u8, Ordering::Release);
        self.state_cv.notify_all();
    }

    // === Native mode ===

    /// Enter a native section. The fiber must not touch the heap until
    /// [`Worker::exit_native`].
    pub fn enter_native(&self) {
        self.acas_state(WorkerState::Running, WorkerState::Native);
    }

    /// Leave the native section, re-synchronizing with the collector
    /// first.
    pub fn exit_native(&self) {
        let mut guard = self.mutex.lock();
        while self.stop_flag.load(Ordering::Acquire) {
            self.stw_cv.wait(&mut guard);
        }
        debug_assert_eq!(self.state(), WorkerState::Native);
        self.state
            .store(WorkerState::Running as u8, Ordering::Release);
        self.state_cv.notify_all();
    }

    // === Idle / wake ===

    /// Wake the worker out of `Idle`. Returns whether it advertised the
    /// idle flag.
    pub fn wake(&self) -> bool {
        self.wake_pending.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.idle_cv.notify_one();
        self.has_idle_flag()
    }

    /// Park in `Idle` until woken, with `max_sleep` as the liveness
    /// backstop.
    pub fn idle_wait(&self, max_sleep: Duration) {
        let mut guard = self.mutex.lock();
        self.idle_flag.store(true, Ordering::Release);
        if !self.wake_pending.swap(false, Ordering::AcqRel) {
            let _ = self.idle_cv.wait_for(&mut guard, max_sleep);
            self.wake_pending.store(false, Ordering::Release);
        }
        self.idle_flag.store(false, Ordering::Release);
    }

    fn increment_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Main function of every worker OS thread.
pub(crate) fn scheduler_loop(rt: Arc<Runtime>, worker_index: usize) {
    let scheduler = rt.scheduler();
    let worker = scheduler.worker(worker_index);
    super::set_current_worker(worker as *const Worker as *mut Worker);

    log::debug!("worker {} starting", worker.id());
    worker.acas_state(WorkerState::Created, WorkerState::AcquiringProc);

    'outer: loop {
        if scheduler.is_shutting_down() {
            break;
        }
        worker.stw_barrier();

        let proc = match scheduler.acquire_processor_for_worker(worker) {
            Some(proc) => proc,
            None => {
                worker.acas_state(WorkerState::AcquiringProc, WorkerState::Idle);
                worker.idle_wait(scheduler.max_idle_sleep());
                worker.acas_state(WorkerState::Idle, WorkerState::AcquiringProc);
                continue;
            }
        };
        worker.enter_scheduling();

        loop {
            if scheduler.is_shutting_down() {
                break;
            }
            worker.checkpoint_stw();

            match scheduler.next_ready_thread(unsafe { proc.as_ref() }) {
                Some(thread) => run_thread(&rt, worker, unsafe { proc.as_ref() }, thread),
                None => {
                    scheduler.release_processor_from_worker(worker);
                    worker.acas_state(WorkerState::Scheduling, WorkerState::Idle);
                    worker.idle_wait(scheduler.max_idle_sleep());
                    worker.acas_state(WorkerState::Idle, WorkerState::AcquiringProc);
                    continue 'outer;
                }
            }
        }

        // shutdown while holding a processor
        scheduler.release_processor_from_worker(worker);
        worker.acas_state(WorkerState::Scheduling, WorkerState::Idle);
        break 'outer;
    }

    // exits funnel through Idle, the only state Exited is legal from
    match worker.state() {
        WorkerState::Idle => {}
        other => worker.acas_state(other, WorkerState::Idle),
    }
    worker.acas_state(WorkerState::Idle, WorkerState::Exited);
    log::debug!("worker {} exited", worker.id());
}

/// Dispatch one ready thread: context-switch into the fiber and handle its
/// run result afterwards.
fn run_thread(rt: &Runtime, worker: &Worker, proc: &Processor, thread: NonNull<Thread>) {
    let t = unsafe { thread.as_ref() };

    worker.acas_state(WorkerState::Scheduling, WorkerState::Running);
    worker.set_current_thread(thread.as_ptr());
    t.set_worker(worker as *const Worker as *mut Worker);
    t.set_status(ThreadStatus::Running);
    t.set_scheduled_at(now_millis());

    t.acquire_for_dispatch();
    worker.increment_context_switches();

    unsafe { fiber::switch(worker.context(), t.context()) };

    // fiber context fully saved again
    t.release_after_switch();
    worker.set_current_thread(std::ptr::null_mut());
    worker.acas_state(WorkerState::Running, WorkerState::Scheduling);

    match t.take_run_result() {
        RunResult::Yielded => {
            t.set_status(ThreadStatus::Ready);
            rt.scheduler().schedule_thread(thread, Some(proc));
        }
        RunResult::Paused => {
            // parked; whoever holds the wake reference requeues it
        }
        RunResult::Exited => {
            rt.scheduler().finish_thread(rt, thread);
        }
        RunResult::None => {
            log::error!("fiber {} returned without a run result", t.id());
            t.set_status(ThreadStatus::Ready);
            rt.scheduler().schedule_thread(thread, Some(proc));
        }
    }
}
