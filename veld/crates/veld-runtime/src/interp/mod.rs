//! Interpreter - Bytecode Execution
//!
//! The dispatch loop runs on the fiber's own stack; `call` recurses into
//! `vm_call`, so the machine call stack mirrors the language call stack
//! and the stack-overflow check is a headroom probe against the fiber
//! stack's guard page.
//!
//! Exceptions propagate as an [`Unwind`] value returned frame by frame:
//! a `throwex` first searches the current function's exception table for
//! the innermost handler covering the throw site; otherwise the frame is
//! destroyed and the value is re-thrown into the caller. No host-level
//! unwinding is involved.
//!
//! Safepoints: function entry, backward branches, allocations, native-call
//! boundaries and explicit yields. A raw `Value` held in a Rust local is
//! not a root, so every sequence that crosses a safepoint either reads its
//! values back out of rooted storage (the operand stack, frame locals, a
//! linked frame) or holds them in a [`RootGuard`](crate::runtime::Runtime).

pub mod frame;
pub mod thread;

use crate::bytecode::module::{CompiledFunction, CompiledModule};
use crate::bytecode::{
    Opcode, CMP_EQ, CMP_GE, CMP_GT, CMP_LE, CMP_LT, CMP_NEQ, INTERCEPT_BREAK, INTERCEPT_CONTINUE,
    INTERCEPT_RETURN, INTERCEPT_THROW, POOL_STRING, POOL_SYMBOL,
};
use crate::error::RuntimeError;
use crate::heap::object::{self, layout};
use crate::runtime::Runtime;
use crate::value::{self, ArithResult, BinOp, BitOp, RelOp, ShapeId, Value};

use frame::{Frame, InterceptAction};
use thread::{Thread, ThreadStatus};

/// An exception unwinding out of a frame
#[derive(Debug)]
pub struct Unwind(pub Value);

pub type VmResult = std::result::Result<Value, Unwind>;

/// Abort the process with a diagnostic. Fatal runtime errors: conditions
/// no handler can observe (call-of-non-callable, allocation failure after
/// a failed collection, malformed bytecode reaching execution).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("fatal runtime error: {}", format_args!($($arg)*));
        std::process::abort();
    }};
}

// === Entry point ===

/// Task function of every fiber: run the entry function and publish the
/// outcome into the fiber instance.
pub(crate) fn thread_main(rt: &Runtime, thread: &Thread) {
    let function = thread.entry_function();

    // view the entry args in place: the vector stays on the thread where
    // the collector scans and rewrites it, so the slice reads current
    // values across safepoints; it is only cleared again at recycle time
    let args = {
        let guard = thread.entry_args_for_roots();
        let ptr = guard.as_ptr();
        let len = guard.len();
        unsafe { std::slice::from_raw_parts(ptr, len) }
    };

    let outcome = vm_call(rt, thread, std::ptr::null_mut(), Value::NULL, function, args);

    // the fiber slot on the thread is a root and therefore current
    let fiber = object::resolve(thread.fiber_value());
    if !fiber.is_object() {
        return;
    }
    let gc = rt.gc();
    unsafe {
        match outcome {
            Ok(result) => {
                object::set_field(gc, fiber, layout::fiber::RESULT, result);
                object::set_field(gc, fiber, layout::fiber::STATUS, Value::int(1).unwrap());
            }
            Err(Unwind(exception)) => {
                log::warn!(
                    "fiber {} terminated by uncaught exception: {:?}",
                    thread.id(),
                    exception
                );
                object::set_field(gc, fiber, layout::fiber::RESULT, exception);
                object::set_field(gc, fiber, layout::fiber::STATUS, Value::int(2).unwrap());
            }
        }
    }
}

// === Allocation helpers ===

/// Allocate or die. Out-of-memory after a failed collection is fatal; a
/// scheduler shutdown quietly unwinds the fiber instead.
fn alloc(rt: &Runtime, shape: ShapeId, count: u32) -> std::result::Result<Value, Unwind> {
    match rt.allocate(shape, count) {
        Ok(value) => Ok(value),
        Err(RuntimeError::SchedulerShutdown) => Err(Unwind(Value::ERROR_OUT_OF_MEMORY)),
        Err(e) => fatal!("heap allocation failed: {}", e),
    }
}

/// Build a string value: inline when it fits, heap otherwise.
pub(crate) fn make_string(rt: &Runtime, s: &str) -> std::result::Result<Value, Unwind> {
    if let Some(small) = Value::small_string(s) {
        return Ok(small);
    }
    let value = alloc(rt, ShapeId::LargeString, s.len() as u32)?;
    unsafe {
        std::ptr::copy_nonoverlapping(s.as_ptr(), value.as_body_ptr(), s.len());
    }
    Ok(value)
}

/// Build an exception instance with a message string.
pub(crate) fn make_exception(rt: &Runtime, message: &str) -> std::result::Result<Value, Unwind> {
    let text = rt.root(make_string(rt, message)?);
    let exception = alloc(rt, ShapeId::Exception, layout::exception::FIELD_COUNT)?;
    unsafe {
        object::set_field(rt.gc(), exception, layout::exception::MESSAGE, text.get());
    }
    Ok(exception)
}

fn throw_new(rt: &Runtime, message: &str) -> Unwind {
    match make_exception(rt, message) {
        Ok(exception) => Unwind(exception),
        Err(unwind) => unwind,
    }
}

/// Build a tuple from a slice that lives in rooted, collector-maintained
/// storage (an operand stack or frame locals): every element is re-read
/// from the slice after the allocation safepoint.
fn make_tuple(rt: &Runtime, items: &[Value]) -> std::result::Result<Value, Unwind> {
    let tuple = alloc(rt, ShapeId::Tuple, items.len() as u32)?;
    let gc = rt.gc();
    for (index, item) in items.iter().enumerate() {
        unsafe { object::set_field(gc, tuple, index as u32, *item) };
    }
    Ok(tuple)
}

/// Build a list from a rooted slice.
fn make_list(rt: &Runtime, items: &[Value]) -> std::result::Result<Value, Unwind> {
    let capacity = (items.len() as u32).max(4);
    let data = rt.root(alloc(rt, ShapeId::Tuple, capacity)?);
    let gc = rt.gc();
    for (index, item) in items.iter().enumerate() {
        unsafe { object::set_field(gc, data.get(), index as u32, *item) };
    }

    let list = alloc(rt, ShapeId::List, layout::list::FIELD_COUNT)?;
    unsafe {
        object::set_field(gc, list, layout::list::DATA, data.get());
        object::set_field(
            gc,
            list,
            layout::list::SIZE,
            Value::int(items.len() as i64).unwrap(),
        );
    }
    Ok(list)
}

/// Build a dict from a rooted slice of key/value pairs.
fn make_dict(rt: &Runtime, pairs: &[Value]) -> std::result::Result<Value, Unwind> {
    debug_assert!(pairs.len() % 2 == 0);
    let capacity = ((pairs.len() / 2) as u32).max(8);
    let gc = rt.gc();

    let keys = rt.root(alloc(rt, ShapeId::Tuple, capacity)?);
    let values = rt.root(alloc(rt, ShapeId::Tuple, capacity)?);
    let dict = rt.root(alloc(rt, ShapeId::Dict, layout::dict::FIELD_COUNT)?);
    unsafe {
        object::set_field(gc, dict.get(), layout::dict::KEYS, keys.get());
        object::set_field(gc, dict.get(), layout::dict::VALUES, values.get());
        object::set_field(gc, dict.get(), layout::dict::SIZE, Value::int(0).unwrap());
    }
    for pair in pairs.chunks(2) {
        dict_insert(rt, dict.get(), pair[0], pair[1])?;
    }
    Ok(dict.get())
}

// === Calls ===

/// Build a call frame for `callee` and execute its bytecode.
///
/// The contract: argc within `[minargc, argc]` (spread lifts the upper
/// bound), native-stack headroom above the overflow limit, missing
/// arguments initialized through the default-argument dispatch table,
/// constructors return `self` unless overridden.
///
/// `args` must live in rooted storage (the caller's operand stack, a
/// thread's entry args); the callee copies it into the new frame's locals
/// before the first safepoint.
pub fn vm_call(
    rt: &Runtime,
    thread: &Thread,
    parent: *mut Frame,
    self_value: Value,
    callee: Value,
    args: &[Value],
) -> VmResult {
    let callee = object::resolve(callee);
    if !callee.is_object() {
        fatal!("called value is not callable: {:?}", callee);
    }
    match object::shape_of(callee) {
        ShapeId::Function => {}
        ShapeId::NativeFunction => return call_native(rt, thread, self_value, callee, args),
        other => fatal!("called value is not callable (shape {:?})", other),
    }

    // compiled records live outside the heap and never move
    let fdata = unsafe {
        &*(object::field(callee, layout::function::CODE).as_external_pointer()
            as *const CompiledFunction)
    };
    let module = unsafe {
        &*(object::field(callee, layout::function::MODULE).as_external_pointer()
            as *const CompiledModule)
    };
    let info = fdata.info;

    // native stack headroom check against the fiber stack
    let probe = &info as *const _ as usize;
    if thread.stack_headroom(probe) < rt.config().stack_overflow_limit {
        return Err(throw_new(rt, "stack overflow"));
    }

    // argument window
    if args.len() < info.minargc as usize {
        return Err(throw_new(rt, "not enough arguments for function call"));
    }
    if args.len() > info.argc as usize && !info.spread {
        return Err(throw_new(rt, "too many arguments for function call"));
    }

    let declared = info.argc as usize;
    let supplied = args.len().min(declared);

    let mut frame = Frame::new(
        parent,
        callee,
        self_value,
        Value::NULL,
        info.local_count as usize,
        info.stacksize as usize,
        supplied as u8,
    );
    for (index, arg) in args.iter().take(supplied).enumerate() {
        frame.set_local(index, *arg);
    }
    if info.constructor {
        frame.return_value = self_value;
    }
    // default-argument dispatch: entry i initializes argument minargc + i
    if info.minargc < info.argc {
        frame.ip = supplied - info.minargc as usize;
    }

    // link the frame before the first safepoint so everything it holds is
    // rooted from here on
    thread.set_top_frame(&mut frame as *mut Frame);

    let result = frame_body(rt, thread, module, fdata, &mut frame, args, supplied);

    thread.set_top_frame(frame.parent);
    result
}

/// Post-link portion of `vm_call`: frame context, spread collection, the
/// entry safepoint and the dispatch loop. Split out so every exit path
/// funnels through the caller's unlink.
fn frame_body(
    rt: &Runtime,
    thread: &Thread,
    module: &CompiledModule,
    fdata: &CompiledFunction,
    frame: &mut Frame,
    args: &[Value],
    supplied: usize,
) -> VmResult {
    let info = fdata.info;

    // frame context: fresh when the function captures variables on the
    // heap, otherwise the closure's chain is shared. The closure context
    // is re-read through the (rooted) frame after the allocation.
    if info.heap_variables > 0 {
        let context = alloc(rt, ShapeId::FrameContext, info.heap_variables as u32 + 1)?;
        let closure_context = unsafe { object::field(frame.function, layout::function::CONTEXT) };
        unsafe {
            object::set_field(
                rt.gc(),
                context,
                layout::frame_context::PARENT,
                closure_context,
            );
        }
        frame.context = context;
    } else {
        frame.context = unsafe { object::field(frame.function, layout::function::CONTEXT) };
    }

    // spread arguments: the extras slice aliases rooted storage, so the
    // tuple constructor reads current values even across its safepoint
    if info.spread {
        let extras = make_tuple(rt, &args[supplied..])?;
        frame.set_local(info.argc as usize, extras);
    }

    thread.checkpoint(rt); // function entry safepoint

    execute(rt, thread, module, fdata, frame)
}

/// Dispatch a native callable: up to 15 marshalled arguments, runtime
/// handle first.
fn call_native(
    rt: &Runtime,
    thread: &Thread,
    self_value: Value,
    callee: Value,
    args: &[Value],
) -> VmResult {
    const MAX_NATIVE_ARGS: usize = 15;

    if args.len() > MAX_NATIVE_ARGS {
        return Err(throw_new(rt, "too many arguments for native function call"));
    }

    let declared =
        unsafe { object::field(callee, layout::native_function::ARGC) }.as_int() as usize;
    if args.len() < declared {
        return Err(throw_new(rt, "not enough arguments for native function call"));
    }

    let index = unsafe { object::field(callee, layout::native_function::REGISTRY_INDEX) }.as_int()
        as usize;
    let Some(entry) = rt.native(index) else {
        fatal!("native function index {} not registered", index);
    };

    thread.checkpoint(rt); // native boundary safepoint
    let result = (entry.func)(rt, self_value, args);
    thread.checkpoint(rt);

    result.map_err(Unwind)
}

// === Exceptions ===

/// Throw `value` inside `frame`. When the current function has a handler
/// covering the throw site the frame is redirected there and execution
/// continues; otherwise the value unwinds to the caller.
fn throw_value(
    thread: &Thread,
    fdata: &CompiledFunction,
    frame: &mut Frame,
    value: Value,
) -> std::result::Result<(), Unwind> {
    // the slot keeps the value rooted while it unwinds
    thread.set_pending_exception(value);

    let throw_ip = (frame.ip - 1) as u32;
    if let Some(entry) = fdata.find_handler(throw_ip) {
        frame.truncate_stack(entry.depth as usize);
        frame.push(value);
        frame.ip = entry.handler as usize;
        thread.set_pending_exception(Value::NULL);
        return Ok(());
    }

    Err(Unwind(value))
}

// === Fibers ===

/// Await the fiber on top of the operand stack. The fiber value stays on
/// the stack (rooted) while the caller is parked; every iteration re-reads
/// it, so relocations during the wait are transparent. Pops the fiber and
/// returns its result.
fn await_fiber(rt: &Runtime, thread: &Thread, frame: &mut Frame) -> VmResult {
    loop {
        let fiber = object::resolve(frame.top());
        let status = unsafe { object::field(fiber, layout::fiber::STATUS) };
        if status.as_int() != 0 {
            let result = unsafe { object::field(fiber, layout::fiber::RESULT) };
            frame.pop();
            return if status.as_int() == 2 {
                Err(Unwind(result))
            } else {
                Ok(result)
            };
        }

        let handle = unsafe { object::field(fiber, layout::fiber::HANDLE) }.as_external_pointer()
            as *mut Thread;
        let generation =
            unsafe { object::field(fiber, layout::fiber::GENERATION) }.as_int() as u64;
        let target = unsafe { &*handle };

        // park keyed on the target control block; the condition re-checks
        // liveness under the bucket lock so an exit cannot slip between
        rt.scheduler()
            .parking()
            .park_current(thread, handle as usize, || {
                target.generation() == generation && target.status() != ThreadStatus::Exited
            });
    }
}

// === Indexing ===

fn get_index(rt: &Runtime, target: Value, index: Value) -> VmResult {
    let target = object::resolve(target);

    // string indexing: code point at position
    if target.is_small_string()
        || (target.is_object() && object::shape_of(target) == ShapeId::LargeString)
    {
        if !index.is_int() {
            return Err(throw_new(rt, "string index must be an integer"));
        }
        let i = index.as_int();
        let cp = object::with_string(target, |s| {
            if i < 0 {
                None
            } else {
                s.chars().nth(i as usize)
            }
        })
        .flatten();
        return match cp {
            Some(cp) => Ok(Value::small_string_from_char(cp)),
            None => Err(throw_new(rt, "string index out of bounds")),
        };
    }

    if !target.is_object() {
        return Err(throw_new(rt, "value is not indexable"));
    }

    match object::shape_of(target) {
        ShapeId::Tuple => {
            let count = unsafe { object::header(target) }.count() as i64;
            let i = expect_index(rt, index, count)?;
            Ok(unsafe { object::field(target, i as u32) })
        }
        ShapeId::List => {
            let size = unsafe { object::field(target, layout::list::SIZE) }.as_int();
            let i = expect_index(rt, index, size)?;
            let data = unsafe { object::field(target, layout::list::DATA) };
            Ok(unsafe { object::field(data, i as u32) })
        }
        ShapeId::Dict => {
            let size = unsafe { object::field(target, layout::dict::SIZE) }.as_int();
            let keys = unsafe { object::field(target, layout::dict::KEYS) };
            for slot in 0..size {
                let key = unsafe { object::field(keys, slot as u32) };
                if object::value_equals(key, index) {
                    let values = unsafe { object::field(target, layout::dict::VALUES) };
                    return Ok(unsafe { object::field(values, slot as u32) });
                }
            }
            Ok(Value::NULL)
        }
        _ => Err(throw_new(rt, "value is not indexable")),
    }
}

fn set_index(
    rt: &Runtime,
    target: Value,
    index: Value,
    value: Value,
) -> std::result::Result<(), Unwind> {
    let target = object::resolve(target);
    if !target.is_object() {
        return Err(throw_new(rt, "value is not indexable"));
    }

    match object::shape_of(target) {
        ShapeId::Tuple => Err(throw_new(rt, "tuples are read-only")),
        ShapeId::List => {
            let size = unsafe { object::field(target, layout::list::SIZE) }.as_int();
            let i = expect_index(rt, index, size)?;
            let data = unsafe { object::field(target, layout::list::DATA) };
            unsafe { object::set_field(rt.gc(), data, i as u32, value) };
            Ok(())
        }
        ShapeId::Dict => dict_insert(rt, target, index, value),
        _ => Err(throw_new(rt, "value is not indexable")),
    }
}

fn expect_index(rt: &Runtime, index: Value, len: i64) -> std::result::Result<i64, Unwind> {
    if !index.is_int() {
        return Err(throw_new(rt, "index must be an integer"));
    }
    let i = index.as_int();
    if i < 0 || i >= len {
        return Err(throw_new(rt, "index out of bounds"));
    }
    Ok(i)
}

fn dict_insert(
    rt: &Runtime,
    dict: Value,
    key: Value,
    value: Value,
) -> std::result::Result<(), Unwind> {
    if key.is_object() {
        let shape = object::shape_of(key);
        if shape != ShapeId::LargeString {
            return Err(throw_new(rt, "dict keys must be immediate values or strings"));
        }
    }

    let gc = rt.gc();
    let size = unsafe { object::field(dict, layout::dict::SIZE) }.as_int();
    let keys = unsafe { object::field(dict, layout::dict::KEYS) };
    let values = unsafe { object::field(dict, layout::dict::VALUES) };

    // replace an existing entry
    for slot in 0..size {
        let existing = unsafe { object::field(keys, slot as u32) };
        if object::value_equals(existing, key) {
            unsafe { object::set_field(gc, values, slot as u32, value) };
            return Ok(());
        }
    }

    let capacity = unsafe { object::header(object::resolve(keys)) }.count() as i64;
    if size < capacity {
        unsafe {
            object::set_field(gc, keys, size as u32, key);
            object::set_field(gc, values, size as u32, value);
            object::set_field(gc, dict, layout::dict::SIZE, Value::int(size + 1).unwrap());
        }
        return Ok(());
    }

    // grow: the replacement tuples are built across two allocation
    // safepoints, so everything involved is held in root guards and
    // re-read afterwards
    let dict = rt.root(dict);
    let key = rt.root(key);
    let value = rt.root(value);
    let new_capacity = (capacity * 2).max(8) as u32;
    let new_keys = rt.root(alloc(rt, ShapeId::Tuple, new_capacity)?);
    let new_values = rt.root(alloc(rt, ShapeId::Tuple, new_capacity)?);

    unsafe {
        let old_keys = object::field(dict.get(), layout::dict::KEYS);
        let old_values = object::field(dict.get(), layout::dict::VALUES);
        for slot in 0..size {
            let k = object::field(old_keys, slot as u32);
            let v = object::field(old_values, slot as u32);
            object::set_field(gc, new_keys.get(), slot as u32, k);
            object::set_field(gc, new_values.get(), slot as u32, v);
        }
        object::set_field(gc, new_keys.get(), size as u32, key.get());
        object::set_field(gc, new_values.get(), size as u32, value.get());
        object::set_field(gc, dict.get(), layout::dict::KEYS, new_keys.get());
        object::set_field(gc, dict.get(), layout::dict::VALUES, new_values.get());
        object::set_field(
            gc,
            dict.get(),
            layout::dict::SIZE,
            Value::int(size + 1).unwrap(),
        );
    }
    Ok(())
}

// === Dispatch loop ===

fn execute(
    rt: &Runtime,
    thread: &Thread,
    module: &CompiledModule,
    fdata: &CompiledFunction,
    frame: &mut Frame,
) -> VmResult {
    macro_rules! throw {
        ($unwind:expr) => {{
            let Unwind(value) = $unwind;
            throw_value(thread, fdata, frame, value)?;
            continue;
        }};
    }

    loop {
        debug_assert!(frame.ip < fdata.bytecode.len(), "ip ran off the bytecode");
        let instr = fdata.fetch(frame.ip);
        let opcode = match instr.opcode() {
            Some(opcode) => opcode,
            None => fatal!("invalid opcode {:#x} at ip {}", instr.0, frame.ip),
        };
        frame.ip += 1;

        match opcode {
            Opcode::Nop => {}

            Opcode::Panic => {
                fatal!("panic opcode executed in {}", fdata.name);
            }

            // === Stack shuffling ===
            Opcode::Pop => {
                frame.pop();
            }
            Opcode::Dup => {
                let top = frame.top();
                frame.push(top);
            }
            Opcode::Dup2 => {
                let under = frame.peek(1);
                let top = frame.peek(0);
                frame.push(under);
                frame.push(top);
            }
            Opcode::Swap => {
                let top = frame.pop();
                let under = frame.pop();
                frame.push(top);
                frame.push(under);
            }

            // === Branches (backward branches are safepoints) ===
            Opcode::Jmp => {
                branch(rt, thread, frame, instr.iaaa());
            }
            Opcode::JmpF => {
                let condition = frame.pop();
                if !object::value_truthy(condition) {
                    branch(rt, thread, frame, instr.iaaa());
                }
            }
            Opcode::JmpT => {
                let condition = frame.pop();
                if object::value_truthy(condition) {
                    branch(rt, thread, frame, instr.iaaa());
                }
            }
            Opcode::TestJmp => {
                let top = frame.pop();
                let check = Value::int(instr.a() as i8 as i64).unwrap();
                if top.compare(check) {
                    branch(rt, thread, frame, instr.ibb() as i32);
                } else {
                    frame.push(top);
                }
            }
            Opcode::CmpJmp => {
                let right = frame.pop();
                let left = frame.pop();
                if !(left.is_int() && right.is_int()) {
                    throw!(throw_new(rt, "integer compare-and-branch on non-integers"));
                }
                let l = left.as_int();
                let r = right.as_int();
                let taken = match instr.a() {
                    CMP_LT => l < r,
                    CMP_GT => l > r,
                    CMP_LE => l <= r,
                    CMP_GE => l >= r,
                    CMP_EQ => l == r,
                    CMP_NEQ => l != r,
                    other => fatal!("invalid cmpjmp kind {}", other),
                };
                if taken {
                    branch(rt, thread, frame, instr.ibb() as i32);
                }
            }

            // === Exceptions / intercepts ===
            Opcode::ThrowEx => {
                let value = frame.pop();
                throw_value(thread, fdata, frame, value)?;
            }
            Opcode::GetException => {
                // the handler entry already placed the exception on top
            }
            Opcode::SetIntercept => match instr.a() {
                INTERCEPT_RETURN => {
                    let value = frame.pop();
                    frame.intercept = InterceptAction::Return(value);
                }
                INTERCEPT_BREAK | INTERCEPT_CONTINUE => {
                    let target = (frame.ip as i64 + instr.ibb() as i64) as u32;
                    frame.intercept = InterceptAction::Jump(target);
                }
                INTERCEPT_THROW => {
                    let value = frame.pop();
                    frame.intercept = InterceptAction::Throw(value);
                }
                other => fatal!("invalid intercept kind {}", other),
            },
            Opcode::FinallyEnd => {
                match std::mem::replace(&mut frame.intercept, InterceptAction::None) {
                    InterceptAction::None => {}
                    InterceptAction::Return(value) => {
                        frame.return_value = value;
                        return Ok(frame.return_value);
                    }
                    InterceptAction::Jump(target) => {
                        frame.ip = target as usize;
                    }
                    InterceptAction::Throw(value) => {
                        throw_value(thread, fdata, frame, value)?;
                    }
                }
            }

            // === Calls ===
            Opcode::Call => {
                let argc = instr.a() as usize;
                let callee = frame.peek(argc);
                let self_value = frame.peek(argc + 1);
                let frame_ptr = frame as *mut Frame;

                // the args slice aliases this frame's operand stack, so
                // the callee reads collector-current values
                let result = {
                    let args = frame.top_n(argc);
                    vm_call(rt, thread, frame_ptr, self_value, callee, args)
                };
                match result {
                    Ok(result) => {
                        frame.drop_n(argc + 2);
                        frame.push(result);
                    }
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::CallSpread => {
                // expand the argument tuple onto the operand stack, then
                // proceed exactly like a plain call
                let spread = object::resolve(frame.top());
                if !spread.is_object() || object::shape_of(spread) != ShapeId::Tuple {
                    frame.pop();
                    throw!(throw_new(rt, "spread call expects a tuple of arguments"));
                }
                let count = unsafe { object::header(spread) }.count() as usize;
                frame.pop();
                for index in 0..count {
                    let item = unsafe { object::field(spread, index as u32) };
                    frame.push(item);
                }

                let callee = frame.peek(count);
                let self_value = frame.peek(count + 1);
                let frame_ptr = frame as *mut Frame;
                let result = {
                    let args = frame.top_n(count);
                    vm_call(rt, thread, frame_ptr, self_value, callee, args)
                };
                match result {
                    Ok(result) => {
                        frame.drop_n(count + 2);
                        frame.push(result);
                    }
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::Ret => {
                return Ok(frame.return_value);
            }

            // === Loads / stores ===
            Opcode::Load => match instr.a() {
                0 => frame.push(Value::NULL),
                1 => frame.push(Value::TRUE),
                2 => frame.push(Value::FALSE),
                other => fatal!("invalid load operand {}", other),
            },
            Opcode::LoadConst => match instr.a() {
                POOL_STRING => {
                    let text = &module.string_pool[instr.bb() as usize];
                    match make_string(rt, text) {
                        Ok(value) => frame.push(value),
                        Err(unwind) => throw!(unwind),
                    }
                }
                POOL_SYMBOL => {
                    let symbol = module.symbol_pool[instr.bb() as usize];
                    frame.push(Value::symbol(symbol));
                }
                other => fatal!("invalid constant pool kind {}", other),
            },
            Opcode::LoadSmi => {
                frame.push(Value::int(instr.iaaa() as i64).unwrap());
            }
            Opcode::LoadSelf => {
                frame.push(frame.self_value);
            }
            Opcode::LoadArgc => {
                frame.push(Value::int(frame.argc as i64).unwrap());
            }
            Opcode::LoadGlobal => {
                let symbol = module.symbol_pool[instr.bb() as usize];
                match rt.global_get(symbol) {
                    Some(value) => frame.push(value),
                    None => throw!(throw_new(rt, "undefined global variable")),
                }
            }
            Opcode::SetGlobal => {
                let symbol = module.symbol_pool[instr.bb() as usize];
                let value = frame.top();
                rt.global_set(symbol, value);
            }
            Opcode::LoadLocal => {
                let value = frame.local(instr.bb() as usize);
                frame.push(value);
            }
            Opcode::SetLocal => {
                let value = frame.top();
                frame.set_local(instr.bb() as usize, value);
            }
            Opcode::LoadFar => {
                let context = context_at_depth(frame.context, instr.a());
                match context {
                    Some(context) => {
                        let slot = layout::frame_context::SLOT_BASE + instr.b() as u32;
                        frame.push(unsafe { object::field(context, slot) });
                    }
                    None => throw!(throw_new(rt, "captured variable context missing")),
                }
            }
            Opcode::SetFar => {
                let context = context_at_depth(frame.context, instr.a());
                match context {
                    Some(context) => {
                        let slot = layout::frame_context::SLOT_BASE + instr.b() as u32;
                        let value = frame.top();
                        unsafe { object::set_field(rt.gc(), context, slot, value) };
                    }
                    None => throw!(throw_new(rt, "captured variable context missing")),
                }
            }
            Opcode::SetReturn => {
                frame.return_value = frame.pop();
            }

            // === Allocation ===
            Opcode::MakeFunc => {
                let child_slot = instr.bb() as usize;
                let child_index = fdata.children[child_slot] as usize;
                let child = &module.functions[child_index];
                match make_function_value(rt, module, child, frame.context) {
                    Ok(value) => frame.push(value),
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::MakeTuple => {
                let count = instr.bb() as usize;
                match make_tuple(rt, frame.top_n(count)) {
                    Ok(tuple) => {
                        frame.drop_n(count);
                        frame.push(tuple);
                    }
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::MakeList => {
                let count = instr.bb() as usize;
                match make_list(rt, frame.top_n(count)) {
                    Ok(list) => {
                        frame.drop_n(count);
                        frame.push(list);
                    }
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::MakeDict => {
                let pairs = instr.bb() as usize;
                match make_dict(rt, frame.top_n(pairs * 2)) {
                    Ok(dict) => {
                        frame.drop_n(pairs * 2);
                        frame.push(dict);
                    }
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::MakeFiber => {
                let argc = instr.a() as usize;
                // the fiber instance is allocated first; function and
                // arguments are then re-read from the operand stack, and
                // the arming path is safepoint-free
                let fiber = match alloc(rt, ShapeId::Fiber, layout::fiber::FIELD_COUNT) {
                    Ok(fiber) => fiber,
                    Err(unwind) => throw!(unwind),
                };
                let args = frame.top_n(argc).to_vec();
                let callee = frame.peek(argc);
                match rt.spawn_into_fiber(fiber, callee, args) {
                    Ok(()) => {
                        frame.drop_n(argc + 1);
                        frame.push(fiber);
                    }
                    Err(RuntimeError::SchedulerShutdown) => {
                        throw!(Unwind(Value::ERROR_OUT_OF_MEMORY));
                    }
                    Err(e) => fatal!("fiber spawn failed: {}", e),
                }
            }

            // === Indexing ===
            Opcode::GetIndex => {
                let index = frame.pop();
                let target = frame.pop();
                match get_index(rt, target, index) {
                    Ok(value) => frame.push(value),
                    Err(unwind) => throw!(unwind),
                }
            }
            Opcode::SetIndex => {
                let value = frame.pop();
                let index = frame.pop();
                let target = frame.pop();
                match set_index(rt, target, index, value) {
                    Ok(()) => frame.push(value),
                    Err(unwind) => throw!(unwind),
                }
            }

            // === Fiber control ===
            Opcode::FiberYield => {
                thread.yield_now();
            }
            Opcode::FiberAwait => {
                let top = object::resolve(frame.top());
                if !top.is_object() || object::shape_of(top) != ShapeId::Fiber {
                    frame.pop();
                    throw!(throw_new(rt, "await expects a fiber"));
                }
                match await_fiber(rt, thread, frame) {
                    Ok(value) => frame.push(value),
                    Err(unwind) => throw!(unwind),
                }
            }

            // === Binary operators ===
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow => {
                let right = frame.pop();
                let left = frame.pop();
                let op = match opcode {
                    Opcode::Add => BinOp::Add,
                    Opcode::Sub => BinOp::Sub,
                    Opcode::Mul => BinOp::Mul,
                    Opcode::Div => BinOp::Div,
                    Opcode::Mod => BinOp::Mod,
                    _ => BinOp::Pow,
                };
                match value::arith(op, left, right) {
                    ArithResult::Value(value) => frame.push(value),
                    ArithResult::DivisionByZero => {
                        throw!(throw_new(rt, "division by zero"));
                    }
                    ArithResult::TypeMismatch => {
                        throw!(throw_new(rt, "unsupported operand types"));
                    }
                }
            }
            Opcode::Eq => {
                let right = frame.pop();
                let left = frame.pop();
                frame.push(Value::bool_value(object::value_equals(left, right)));
            }
            Opcode::Neq => {
                let right = frame.pop();
                let left = frame.pop();
                frame.push(Value::bool_value(!object::value_equals(left, right)));
            }
            Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
                let right = frame.pop();
                let left = frame.pop();
                let op = match opcode {
                    Opcode::Lt => RelOp::Lt,
                    Opcode::Gt => RelOp::Gt,
                    Opcode::Le => RelOp::Le,
                    _ => RelOp::Ge,
                };
                match value::relational(op, left, right) {
                    Some(result) => frame.push(Value::bool_value(result)),
                    None => throw!(throw_new(rt, "comparison on non-numeric values")),
                }
            }
            Opcode::BAnd
            | Opcode::BOr
            | Opcode::BXor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Shru => {
                let right = frame.pop();
                let left = frame.pop();
                let op = match opcode {
                    Opcode::BAnd => BitOp::And,
                    Opcode::BOr => BitOp::Or,
                    Opcode::BXor => BitOp::Xor,
                    Opcode::Shl => BitOp::Shl,
                    Opcode::Shr => BitOp::Shr,
                    _ => BitOp::ShrUnsigned,
                };
                match value::bitwise(op, left, right) {
                    Some(value) => frame.push(value),
                    None => throw!(throw_new(rt, "bitwise operation on non-integers")),
                }
            }

            // === Unary operators ===
            Opcode::USub => {
                let operand = frame.pop();
                if operand.is_int() {
                    frame.push(Value::int_wrapping(operand.as_int().wrapping_neg()));
                } else if operand.is_float() {
                    frame.push(Value::float(-operand.as_float()));
                } else {
                    throw!(throw_new(rt, "unary minus on non-numeric value"));
                }
            }
            Opcode::UNot => {
                let operand = frame.pop();
                frame.push(Value::bool_value(!object::value_truthy(operand)));
            }
            Opcode::UBNot => {
                let operand = frame.pop();
                if operand.is_int() {
                    frame.push(Value::int_wrapping(!operand.as_int()));
                } else {
                    throw!(throw_new(rt, "bitwise not on non-integer value"));
                }
            }
        }
    }
}

/// Take a branch. Backward branches are loop back-edges and therefore
/// safepoints.
#[inline]
fn branch(rt: &Runtime, thread: &Thread, frame: &mut Frame, offset: i32) {
    if offset < 0 {
        thread.checkpoint(rt);
    }
    frame.ip = (frame.ip as i64 + offset as i64) as usize;
}

/// Walk the static-scope chain of frame contexts.
fn context_at_depth(context: Value, depth: u8) -> Option<Value> {
    let mut context = object::resolve(context);
    for _ in 0..depth {
        if !context.is_object() {
            return None;
        }
        context = unsafe { object::field(context, layout::frame_context::PARENT) };
        context = object::resolve(context);
    }
    if context.is_object() {
        Some(context)
    } else {
        None
    }
}

/// Allocate a Function instance closing over `context`.
pub(crate) fn make_function_value(
    rt: &Runtime,
    module: &CompiledModule,
    fdata: &CompiledFunction,
    context: Value,
) -> std::result::Result<Value, Unwind> {
    let context = rt.root(context);
    let function = alloc(rt, ShapeId::Function, layout::function::FIELD_COUNT)?;
    let gc = rt.gc();
    unsafe {
        object::set_field(gc, function, layout::function::NAME, Value::symbol(fdata.name));
        object::set_field(gc, function, layout::function::CONTEXT, context.get());
        object::set_field(
            gc,
            function,
            layout::function::CODE,
            Value::from_external_pointer(fdata as *const CompiledFunction as usize),
        );
        object::set_field(
            gc,
            function,
            layout::function::MODULE,
            Value::from_external_pointer(module as *const CompiledModule as usize),
        );
    }
    Ok(function)
}
