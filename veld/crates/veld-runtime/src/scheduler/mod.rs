//! Scheduler Module - M:N Fiber Scheduling
//!
//! Fibers (user-space threads) are multiplexed onto a fixed pool of OS
//! worker threads. Each worker binds to one processor holding a local
//! run queue; work comes from the local queue, the global queue (with a
//! 1/32 bias so it cannot starve), or is stolen from another processor.
//!
//! The scheduler also provides the stop-the-world barrier used
//! exclusively by the collector.
//!
//! Submodules:
//! - [`arch`]: per-architecture context-switch shim
//! - [`fiber`]: guard-paged stacks and machine context
//! - [`processor`]: logical CPU with a local run queue
//! - [`worker`]: OS thread state machine and scheduler loop
//! - [`parking`]: address-keyed parking for fibers

pub mod arch;
pub mod fiber;
pub mod parking;
pub mod processor;
pub mod worker;

pub use processor::Processor;
pub use worker::{Worker, WorkerState};

use std::cell::Cell;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::interp::thread::{Thread, ThreadStatus};
use crate::runtime::Runtime;
use crate::value::Value;

use fiber::Stack;
use parking::ParkingLot;

// === Monotonic millisecond clock ===

static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds since process start (monotonic)
pub fn now_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

// === Current-worker TLS ===

thread_local! {
    static CURRENT_WORKER: Cell<*mut Worker> = const { Cell::new(std::ptr::null_mut()) };
}

pub(crate) fn set_current_worker(worker: *mut Worker) {
    CURRENT_WORKER.with(|cell| cell.set(worker));
}

/// Worker hosting the calling OS thread, if any
pub fn current_worker<'a>() -> Option<&'a Worker> {
    let ptr = CURRENT_WORKER.with(|cell| cell.get());
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Processor bound to the calling OS thread's worker, if any.
/// This is the allocator's fast-path discriminator.
pub fn current_processor() -> Option<NonNull<Processor>> {
    current_worker().and_then(|worker| worker.processor())
}

/// Fiber thread currently running on the calling OS thread, if any
pub fn current_thread<'a>() -> Option<&'a Thread> {
    current_worker()
        .and_then(|worker| worker.current_thread())
        .map(|ptr| unsafe { &*ptr.as_ptr() })
}

// === Scheduler ===

pub struct Scheduler {
    config: RuntimeConfig,

    workers: Vec<Box<Worker>>,
    processors: Vec<Box<Processor>>,

    /// Global run queue (unbounded FIFO)
    global_queue: Mutex<VecDeque<NonNull<Thread>>>,

    /// Processors currently unbound from any worker (LIFO)
    idle_processors: Mutex<Vec<NonNull<Processor>>>,

    /// All thread control blocks ever created (ownership + GC registry)
    threads: Mutex<Vec<Box<Thread>>>,
    free_threads: Mutex<Vec<NonNull<Thread>>>,
    free_stacks: Mutex<Vec<Stack>>,
    next_thread_id: AtomicU64,

    parking: ParkingLot,

    shutting_down: AtomicBool,
    stw_active: AtomicBool,

    /// Broadcast on every fiber exit; non-fiber callers block on it
    exit_mutex: Mutex<()>,
    exit_cv: Condvar,

    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new(config: &RuntimeConfig) -> Scheduler {
        let processors: Vec<Box<Processor>> = (0..config.worker_count)
            .map(|id| Box::new(Processor::new(id, config)))
            .collect();
        let workers: Vec<Box<Worker>> = (0..config.worker_count)
            .map(|id| Box::new(Worker::new(id)))
            .collect();
        let idle = processors
            .iter()
            .map(|p| NonNull::from(p.as_ref()))
            .collect();

        Scheduler {
            config: config.clone(),
            workers,
            processors,
            global_queue: Mutex::new(VecDeque::new()),
            idle_processors: Mutex::new(idle),
            threads: Mutex::new(Vec::new()),
            free_threads: Mutex::new(Vec::new()),
            free_stacks: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(1),
            parking: ParkingLot::new(),
            shutting_down: AtomicBool::new(false),
            stw_active: AtomicBool::new(false),
            exit_mutex: Mutex::new(()),
            exit_cv: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker OS threads. Called once by `Runtime::start`.
    pub(crate) fn start(&self, rt: &Arc<Runtime>) {
        let mut handles = self.handles.lock();
        debug_assert!(handles.is_empty());
        for index in 0..self.workers.len() {
            let rt = Arc::clone(rt);
            let handle = std::thread::Builder::new()
                .name(format!("veld-worker-{}", index))
                .spawn(move || worker::scheduler_loop(rt, index))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    // === Accessors ===

    pub(crate) fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Total fiber dispatches across all workers. A fiber preempted at its
    /// timeslice shows up here once per re-dispatch.
    pub fn context_switch_total(&self) -> u64 {
        self.workers.iter().map(|w| w.context_switches()).sum()
    }

    pub fn max_idle_sleep(&self) -> Duration {
        Duration::from_millis(self.config.max_idle_sleep_ms)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn parking(&self) -> &ParkingLot {
        &self.parking
    }

    // === Thread / stack pools ===

    fn get_free_thread(&self) -> NonNull<Thread> {
        if let Some(thread) = self.free_threads.lock().pop() {
            return thread;
        }
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let boxed = Box::new(Thread::new(id));
        let ptr = NonNull::from(boxed.as_ref());
        self.threads.lock().push(boxed);
        ptr
    }

    fn get_free_stack(&self) -> Result<Stack> {
        if let Some(stack) = self.free_stacks.lock().pop() {
            return Ok(stack);
        }
        Stack::new(self.config.fiber_stack_size)
    }

    fn recycle_stack(&self, stack: Stack) {
        self.free_stacks.lock().push(stack);
    }

    /// Snapshot of every thread control block, for the collector's root
    /// scan (world stopped).
    pub(crate) fn threads_snapshot(&self) -> Vec<NonNull<Thread>> {
        let threads = self.threads.lock();
        threads.iter().map(|t| NonNull::from(t.as_ref())).collect()
    }

    // === Spawning / scheduling ===

    /// Create (or recycle) a thread armed to run `function(args)`. The
    /// thread is not queued yet: the caller finishes publishing its
    /// handle state and then calls [`Scheduler::commit_thread`].
    pub fn prepare_thread(
        &self,
        rt: &Runtime,
        function: Value,
        args: Vec<Value>,
        fiber_value: Value,
    ) -> Result<NonNull<Thread>> {
        if self.is_shutting_down() {
            return Err(RuntimeError::SchedulerShutdown);
        }

        let thread = self.get_free_thread();
        let stack = match self.get_free_stack() {
            Ok(stack) => stack,
            Err(e) => {
                // thread block back to the pool, no state was armed yet
                self.free_threads.lock().push(thread);
                return Err(e);
            }
        };

        unsafe { thread.as_ref() }.init_for_spawn(
            rt as *const Runtime,
            function,
            args,
            fiber_value,
            stack,
        );
        Ok(thread)
    }

    /// Queue a thread armed by [`Scheduler::prepare_thread`]: onto the
    /// current processor's local queue when called from a worker, else
    /// the global queue.
    pub fn commit_thread(&self, thread: NonNull<Thread>) {
        self.schedule_thread(thread, current_processor().map(|p| unsafe { &*p.as_ptr() }));
    }

    /// Queue a ready thread: on the given processor's local queue when
    /// available, else the global queue. Wakes one idle worker.
    pub fn schedule_thread(&self, thread: NonNull<Thread>, proc: Option<&Processor>) {
        debug_assert_eq!(unsafe { thread.as_ref() }.status(), ThreadStatus::Ready);
        match proc {
            Some(proc) => {
                if let Some(spill) = proc.push_local(thread) {
                    self.global_push_batch(spill);
                }
            }
            None => self.global_push(thread),
        }
        self.wake_idle_worker();
    }

    /// Pick the next ready thread for a scheduling worker:
    /// local queue -> (1/32 bias) global -> global -> steal -> global.
    pub fn next_ready_thread(&self, proc: &Processor) -> Option<NonNull<Thread>> {
        if proc.should_poll_global() {
            if let Some(thread) = self.global_pop() {
                return Some(thread);
            }
        }

        if let Some(thread) = proc.pop_local() {
            return Some(thread);
        }

        if let Some(thread) = self.global_pop() {
            return Some(thread);
        }

        // work stealing: bounded random probing over the other processors
        let count = self.processors.len();
        if count > 1 {
            for _ in 0..count * 2 {
                let index = proc.random_victim(count);
                let victim = self.processors[index].as_ref();
                if victim.id() == proc.id() {
                    continue;
                }
                if let Some(thread) = proc.steal_from(victim) {
                    return Some(thread);
                }
            }
        }

        self.global_pop()
    }

    fn global_push(&self, thread: NonNull<Thread>) {
        self.global_queue.lock().push_back(thread);
    }

    fn global_push_batch(&self, batch: Vec<NonNull<Thread>>) {
        let mut queue = self.global_queue.lock();
        for thread in batch {
            queue.push_back(thread);
        }
    }

    fn global_pop(&self) -> Option<NonNull<Thread>> {
        self.global_queue.lock().pop_front()
    }

    /// Length of the global run queue (diagnostics)
    pub fn global_queue_len(&self) -> usize {
        self.global_queue.lock().len()
    }

    fn wake_idle_worker(&self) {
        for worker in &self.workers {
            if worker.has_idle_flag() {
                worker.wake();
                return;
            }
        }
    }

    // === Processor binding ===

    pub(crate) fn acquire_processor_for_worker(
        &self,
        worker: &Worker,
    ) -> Option<NonNull<Processor>> {
        let proc = self.idle_processors.lock().pop()?;
        worker.set_processor(Some(proc));
        Some(proc)
    }

    pub(crate) fn release_processor_from_worker(&self, worker: &Worker) {
        let Some(proc) = worker.processor() else {
            return;
        };
        worker.set_processor(None);

        // the processor goes idle: its active region is handed back to the
        // collector's reclamation path
        if let Some(region) = unsafe { proc.as_ref() }.take_active_region() {
            unsafe { region.as_ref() }.release();
        }

        self.idle_processors.lock().push(proc);
    }

    // === Fiber exit ===

    /// Publish a fiber's exit: flip its status under the parking bucket
    /// lock, wake joiners, recycle the control block and stack.
    pub(crate) fn finish_thread(&self, _rt: &Runtime, thread: NonNull<Thread>) {
        let t = unsafe { thread.as_ref() };
        let key = thread.as_ptr() as usize;

        self.parking
            .with_key_locked(key, || t.set_status(ThreadStatus::Exited));

        let waiters = self.parking.take_waiters(key);
        let proc = current_processor().map(|p| unsafe { &*p.as_ptr() });
        for waiter in waiters {
            unsafe { waiter.as_ref() }.set_status(ThreadStatus::Ready);
            self.schedule_thread(waiter, proc);
        }

        if let Some(stack) = t.reset_for_recycle() {
            self.recycle_stack(stack);
        }
        self.free_threads.lock().push(thread);

        let _guard = self.exit_mutex.lock();
        self.exit_cv.notify_all();
    }

    /// Block the calling (non-fiber) OS thread until `predicate` holds,
    /// re-checking on every fiber exit. The backstop timeout keeps a
    /// missed signal from hanging the caller.
    pub(crate) fn wait_for_exit_signal(&self, predicate: impl Fn() -> bool) {
        while !predicate() {
            let mut guard = self.exit_mutex.lock();
            let _ = self
                .exit_cv
                .wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    // === Stop the world ===

    /// Stop every worker at a safepoint. Used exclusively by the
    /// collector; must be paired with [`Scheduler::start_the_world`].
    pub fn stop_the_world(&self) {
        let was_active = self.stw_active.swap(true, Ordering::AcqRel);
        debug_assert!(!was_active, "nested stop-the-world");

        for worker in &self.workers {
            worker.set_stop_flag();
        }
        for worker in &self.workers {
            worker.wait_until_stopped();
        }
        log::trace!("world stopped");
    }

    /// Release every worker stopped by [`Scheduler::stop_the_world`].
    pub fn start_the_world(&self) {
        for worker in &self.workers {
            worker.clear_stop_flag();
        }
        self.stw_active.store(false, Ordering::Release);
        log::trace!("world started");
    }

    /// Whether a stop-the-world is currently active
    pub fn world_stopped(&self) -> bool {
        self.stw_active.load(Ordering::Acquire)
    }

    // === Shutdown ===

    /// Stop accepting work, wake every worker and join them. Queued
    /// fibers that never ran are dropped.
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for worker in &self.workers {
            worker.wake();
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        let mut dropped = self.global_queue.lock().len();
        for proc in &self.processors {
            dropped += proc.drain().len();
        }
        if dropped > 0 {
            log::debug!("scheduler shutdown dropped {} queued fibers", dropped);
        }
    }
}
