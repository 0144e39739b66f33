//! Runtime - Process-Wide Ownership and Embedder Surface
//!
//! `Runtime` owns the four core subsystems and fixes their lifecycle
//! order: symbol interner, allocator, collector, scheduler on the way up;
//! the reverse on the way down. There are no singletons; everything hangs
//! off this struct behind an `Arc` shared with the worker and collector
//! threads.
//!
//! Embedder-held values: the collector only rewrites *roots* it knows
//! about. Values kept across calls on a host thread must be pinned
//! ([`Runtime::pin_value`]); [`FiberHandle`] does this for spawned fibers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use veld_util::Symbol;

use crate::bytecode::module::CompiledModule;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::gc::GarbageCollector;
use crate::heap::object::{self, layout};
use crate::heap::MemoryAllocator;
use crate::interp;
use crate::scheduler::{self, Scheduler};
use crate::value::{ShapeId, Value};

/// Host callable: receives the runtime handle, the `self` value and the
/// marshalled arguments; returns a value or a thrown exception value.
pub type NativeFn = fn(&Runtime, Value, &[Value]) -> std::result::Result<Value, Value>;

/// Registry record for one native function
#[derive(Clone, Copy)]
pub struct NativeEntry {
    pub name: Symbol,
    pub argc: u8,
    pub func: NativeFn,
}

/// Final state of a joined fiber
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FiberOutcome {
    /// The fiber returned a value
    Completed(Value),
    /// The fiber died with an uncaught exception
    Failed(Value),
}

impl FiberOutcome {
    pub fn value(self) -> Value {
        match self {
            FiberOutcome::Completed(value) | FiberOutcome::Failed(value) => value,
        }
    }

    pub fn is_completed(self) -> bool {
        matches!(self, FiberOutcome::Completed(_))
    }
}

#[derive(Default)]
struct PinTable {
    slots: Vec<Value>,
    free: Vec<usize>,
}

pub struct Runtime {
    config: RuntimeConfig,

    // teardown runs in field order: scheduler first, collector second,
    // allocator last (spec'd reverse of the init order)
    scheduler: Scheduler,
    gc: GarbageCollector,
    allocator: MemoryAllocator,

    /// VM globals: insertion-ordered so root scans are deterministic
    globals: Mutex<IndexMap<Symbol, Value>>,
    /// Embedder-pinned values, visited as roots
    pins: Mutex<PinTable>,
    natives: RwLock<Vec<NativeEntry>>,
    /// Loaded modules; function values carry raw pointers into these
    modules: Mutex<Vec<Arc<CompiledModule>>>,

    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Build a runtime. Call [`Runtime::start`] before spawning fibers.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        config.validate()?;

        // interner first: touching it forces the process-wide table into
        // existence before any subsystem can race its initialization
        let _ = Symbol::intern("main");

        let allocator = MemoryAllocator::new(&config)?;
        let gc = GarbageCollector::new(&config);
        let scheduler = Scheduler::new(&config);

        Ok(Arc::new(Runtime {
            config,
            scheduler,
            gc,
            allocator,
            globals: Mutex::new(IndexMap::new()),
            pins: Mutex::new(PinTable::default()),
            natives: RwLock::new(Vec::new()),
            modules: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Build with default configuration
    pub fn with_defaults() -> Result<Arc<Runtime>> {
        Runtime::new(RuntimeConfig::default())
    }

    /// Spawn the collector thread and the worker pool. Idempotent.
    pub fn start(self: &Arc<Runtime>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gc.start(Arc::clone(self));
        self.scheduler.start(self);
        log::debug!(
            "runtime started: {} workers, {} initial heap regions",
            self.config.worker_count,
            self.config.heap_initial_regions
        );
    }

    /// Stop the scheduler, then the collector. Queued fibers that never
    /// ran are dropped; running fibers finish their current slice first.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        self.gc.stop();
        log::debug!("runtime shut down");
    }

    // === Accessors ===

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    /// Safepoint hook for blocking paths on worker threads
    pub(crate) fn checkpoint_current_worker(&self) {
        if let Some(worker) = scheduler::current_worker() {
            worker.checkpoint_stw();
        }
    }

    // === Allocation ===

    /// Allocate a heap value. Allocation is a safepoint for the calling
    /// fiber.
    pub fn allocate(&self, shape: ShapeId, count: u32) -> Result<Value> {
        if let Some(thread) = scheduler::current_thread() {
            thread.checkpoint(self);
        }
        self.allocator.allocate(self, shape, count)
    }

    // === Globals ===

    pub fn global_get(&self, name: Symbol) -> Option<Value> {
        self.globals.lock().get(&name).copied()
    }

    pub fn global_set(&self, name: Symbol, value: Value) {
        self.globals.lock().insert(name, value);
    }

    /// Visit every global-ish root slot (VM globals and embedder pins),
    /// writing back the closure's result. Collector-side; world stopped
    /// for the rewriting uses.
    pub(crate) fn visit_globals(&self, f: &mut impl FnMut(Value) -> Value) {
        {
            let mut globals = self.globals.lock();
            for value in globals.values_mut() {
                *value = f(*value);
            }
        }
        let mut pins = self.pins.lock();
        for slot in pins.slots.iter_mut() {
            *slot = f(*slot);
        }
    }

    // === Pins ===

    /// Register an embedder-held value as a root. Returns a token for
    /// [`Runtime::pinned_value`] / [`Runtime::unpin_value`].
    pub fn pin_value(&self, value: Value) -> usize {
        let mut pins = self.pins.lock();
        match pins.free.pop() {
            Some(token) => {
                pins.slots[token] = value;
                token
            }
            None => {
                pins.slots.push(value);
                pins.slots.len() - 1
            }
        }
    }

    /// Current (collector-maintained) value behind a pin token
    pub fn pinned_value(&self, token: usize) -> Value {
        self.pins.lock().slots[token]
    }

    pub fn unpin_value(&self, token: usize) {
        let mut pins = self.pins.lock();
        pins.slots[token] = Value::NULL;
        pins.free.push(token);
    }

    /// RAII pin for values held across safepoints inside the runtime.
    ///
    /// A raw `Value` in a Rust local is not a root: if a collection cycle
    /// crosses its final phase boundary at an intervening safepoint, the
    /// copy can end up pointing into a reclaimed region. Reads through the
    /// guard return the collector-maintained value.
    pub(crate) fn root(&self, value: Value) -> RootGuard<'_> {
        RootGuard {
            rt: self,
            token: self.pin_value(value),
        }
    }

    // === Natives ===

    /// Register a host function and return the callable NativeFunction
    /// value.
    pub fn register_native(&self, name: &str, argc: u8, func: NativeFn) -> Result<Value> {
        let name = Symbol::intern(name);
        let index = {
            let mut natives = self.natives.write();
            natives.push(NativeEntry { name, argc, func });
            natives.len() - 1
        };

        let value = self.allocate(ShapeId::NativeFunction, layout::native_function::FIELD_COUNT)?;
        unsafe {
            object::set_field(
                &self.gc,
                value,
                layout::native_function::NAME,
                Value::symbol(name),
            );
            object::set_field(
                &self.gc,
                value,
                layout::native_function::REGISTRY_INDEX,
                Value::int(index as i64).unwrap(),
            );
            object::set_field(
                &self.gc,
                value,
                layout::native_function::ARGC,
                Value::int(argc as i64).unwrap(),
            );
        }
        Ok(value)
    }

    pub(crate) fn native(&self, index: usize) -> Option<NativeEntry> {
        self.natives.read().get(index).copied()
    }

    /// Run `f` with the calling worker in native mode: the collector
    /// treats it as already stopped, so `f` must not touch the heap.
    pub fn with_native_mode<R>(&self, f: impl FnOnce() -> R) -> R {
        match scheduler::current_worker() {
            Some(worker) => {
                worker.enter_native();
                let result = f();
                worker.exit_native();
                result
            }
            None => f(),
        }
    }

    // === Modules ===

    /// Validate and register a compiled module. Function values hold raw
    /// pointers into the module, so it stays registered for the runtime's
    /// lifetime.
    pub fn load_module(&self, module: CompiledModule) -> Result<Arc<CompiledModule>> {
        module.validate()?;
        let module = Arc::new(module);
        self.modules.lock().push(Arc::clone(&module));
        Ok(module)
    }

    /// Number of modules loaded into this runtime
    pub fn loaded_module_count(&self) -> usize {
        self.modules.lock().len()
    }

    /// Build a Function value for `module.functions[index]` with no
    /// captured context.
    pub fn make_function(&self, module: &Arc<CompiledModule>, index: u32) -> Result<Value> {
        let fdata = module
            .functions
            .get(index as usize)
            .ok_or_else(|| RuntimeError::ModuleValidation(format!(
                "function index {} out of range",
                index
            )))?;
        interp::make_function_value(self, module, fdata, Value::NULL)
            .map_err(|_| RuntimeError::SchedulerShutdown)
    }

    // === Fibers ===

    /// Arm and queue a fiber into an already-allocated Fiber instance.
    ///
    /// Safepoint-free: callers allocate the instance first, re-read
    /// `function`/`args` from rooted storage, then hand everything over.
    pub(crate) fn spawn_into_fiber(
        &self,
        fiber: Value,
        function: Value,
        args: Vec<Value>,
    ) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RuntimeError::InvalidState {
                expected: "started runtime".into(),
                actual: "not started".into(),
            });
        }

        unsafe {
            object::set_field(&self.gc, fiber, layout::fiber::FUNCTION, function);
            object::set_field(
                &self.gc,
                fiber,
                layout::fiber::STATUS,
                Value::int(0).unwrap(),
            );
        }

        // two-phase spawn: the fiber handle fields must be in place
        // before the thread can run (and possibly exit and recycle)
        let thread = self.scheduler.prepare_thread(self, function, args, fiber)?;
        let thread_ref = unsafe { thread.as_ref() };
        unsafe {
            object::set_field(
                &self.gc,
                fiber,
                layout::fiber::HANDLE,
                Value::from_external_pointer(thread.as_ptr() as usize),
            );
            object::set_field(
                &self.gc,
                fiber,
                layout::fiber::GENERATION,
                Value::int(thread_ref.generation() as i64).unwrap(),
            );
        }
        self.scheduler.commit_thread(thread);
        Ok(())
    }

    /// Spawn a fiber and return its (unpinned) Fiber value. Interpreter
    /// internal; embedders use [`Runtime::spawn`].
    pub(crate) fn spawn_fiber(&self, function: Value, args: Vec<Value>) -> Result<Value> {
        let function_guard = self.root(function);
        let fiber = self.allocate(ShapeId::Fiber, layout::fiber::FIELD_COUNT)?;
        let function = function_guard.get();
        self.spawn_into_fiber(fiber, function, args)?;
        Ok(fiber)
    }

    /// Spawn a fiber running `function(args)` and return a pinned handle.
    pub fn spawn(self: &Arc<Runtime>, function: Value, args: Vec<Value>) -> Result<FiberHandle> {
        let fiber = self.spawn_fiber(function, args)?;
        let token = self.pin_value(fiber);
        Ok(FiberHandle {
            rt: Arc::clone(self),
            token,
        })
    }

    /// Load and run a module to completion on a fresh root fiber,
    /// blocking the calling host thread.
    pub fn run_module(self: &Arc<Runtime>, module: CompiledModule) -> Result<FiberOutcome> {
        let module = self.load_module(module)?;
        let entry = self.make_function(&module, module.entry)?;
        let handle = self.spawn(entry, Vec::new())?;
        Ok(handle.join())
    }

    fn join_pinned(&self, token: usize) -> FiberOutcome {
        self.scheduler.wait_for_exit_signal(|| {
            let fiber = self.pinned_value(token);
            let status = unsafe { object::field(fiber, layout::fiber::STATUS) };
            status.as_int() != 0
        });

        let fiber = self.pinned_value(token);
        let status = unsafe { object::field(fiber, layout::fiber::STATUS) }.as_int();
        let result = unsafe { object::field(fiber, layout::fiber::RESULT) };
        if status == 2 {
            FiberOutcome::Failed(result)
        } else {
            FiberOutcome::Completed(result)
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pinned handle to a spawned fiber. Dropping the handle unpins the
/// fiber value; `join` blocks the calling host thread (never call it
/// from inside a fiber — fibers use the `fiberawait` opcode).
pub struct FiberHandle {
    rt: Arc<Runtime>,
    token: usize,
}

impl FiberHandle {
    /// The fiber value, kept current across collections
    pub fn value(&self) -> Value {
        self.rt.pinned_value(self.token)
    }

    /// Block until the fiber exits and return its outcome
    pub fn join(self) -> FiberOutcome {
        self.rt.join_pinned(self.token)
    }
}

impl Drop for FiberHandle {
    fn drop(&mut self) {
        self.rt.unpin_value(self.token);
    }
}

/// RAII pin used inside the runtime for values that must survive
/// safepoints in multi-allocation sequences. See [`Runtime::root`].
pub(crate) struct RootGuard<'rt> {
    rt: &'rt Runtime,
    token: usize,
}

impl RootGuard<'_> {
    /// The collector-maintained value behind this root
    #[inline]
    pub(crate) fn get(&self) -> Value {
        self.rt.pinned_value(self.token)
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.rt.unpin_value(self.token);
    }
}
