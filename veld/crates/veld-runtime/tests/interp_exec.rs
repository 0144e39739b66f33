//! Interpreter Execution Tests
//!
//! End-to-end runs of assembled modules: arithmetic, control flow, calls,
//! default arguments, closures, globals, collections, natives, and the
//! stack-overflow limit.

mod common;

use common::started_runtime;

use veld_runtime::bytecode::{ModuleBuilder, Opcode, CMP_GE};
use veld_runtime::heap::object::{self, layout};
use veld_runtime::{Runtime, Value};

#[test]
fn test_integer_addition() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let mut main_fn = module.function("main");
    main_fn.stacksize(2);
    main_fn.emit_smi(21);
    main_fn.emit_smi(21);
    main_fn.emit(Opcode::Add);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);
    let module = module.finish(entry).unwrap();

    let outcome = rt.run_module(module).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value().as_int(), 42);

    rt.shutdown();
}

#[test]
fn test_mixed_arithmetic_promotes_to_float() {
    let rt = started_runtime(2);

    // 2 ** -1 == 0.5 (float), then + 1 promotes the int side
    let mut module = ModuleBuilder::new();
    let mut main_fn = module.function("main");
    main_fn.stacksize(2);
    main_fn.emit_smi(2);
    main_fn.emit_smi(-1);
    main_fn.emit(Opcode::Pow);
    main_fn.emit_smi(1);
    main_fn.emit(Opcode::Add);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);
    let module = module.finish(entry).unwrap();

    let outcome = rt.run_module(module).unwrap();
    assert!(outcome.value().is_float());
    assert_eq!(outcome.value().as_float(), 1.5);

    rt.shutdown();
}

#[test]
fn test_loop_with_backward_branch() {
    let rt = started_runtime(2);

    // sum of 0..10 == 45, looping over a cmpjmp back-edge
    let mut module = ModuleBuilder::new();
    let mut f = module.function("main");
    f.stacksize(2).locals(2);

    f.emit_smi(0);
    f.emit_abb(Opcode::SetLocal, 0, 0);
    f.emit(Opcode::Pop);
    f.emit_smi(0);
    f.emit_abb(Opcode::SetLocal, 0, 1);
    f.emit(Opcode::Pop);

    let top = f.here();
    let end = f.label();
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_smi(10);
    f.emit_cmpjmp(CMP_GE, end);

    f.emit_abb(Opcode::LoadLocal, 0, 1);
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit(Opcode::Add);
    f.emit_abb(Opcode::SetLocal, 0, 1);
    f.emit(Opcode::Pop);

    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_smi(1);
    f.emit(Opcode::Add);
    f.emit_abb(Opcode::SetLocal, 0, 0);
    f.emit(Opcode::Pop);
    f.emit_jump(Opcode::Jmp, top);

    f.bind(end);
    f.emit_abb(Opcode::LoadLocal, 0, 1);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);

    let entry = f.finish(&mut module);
    let module = module.finish(entry).unwrap();

    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 45);

    rt.shutdown();
}

#[test]
fn test_function_call_and_return() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    let mut add_fn = module.function("add");
    add_fn.args(2, 2).stacksize(2);
    add_fn.emit_abb(Opcode::LoadLocal, 0, 0);
    add_fn.emit_abb(Opcode::LoadLocal, 0, 1);
    add_fn.emit(Opcode::Add);
    add_fn.emit(Opcode::SetReturn);
    add_fn.emit(Opcode::Ret);
    let add_index = add_fn.finish(&mut module);

    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(add_index);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_smi(20);
    main_fn.emit_smi(22);
    main_fn.emit_a(Opcode::Call, 2);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 42);

    rt.shutdown();
}

#[test]
fn test_default_argument_dispatch() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    // f(a, b = 5) => a + b
    let mut f = module.function("f");
    f.args(2, 1).stacksize(2);
    let init_b = f.label();
    let body = f.label();
    f.default_arg_table(&[init_b, body]);
    f.bind(init_b);
    f.emit_smi(5);
    f.emit_abb(Opcode::SetLocal, 0, 1);
    f.emit(Opcode::Pop);
    f.bind(body);
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_abb(Opcode::LoadLocal, 0, 1);
    f.emit(Opcode::Add);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let f_index = f.finish(&mut module);

    // main => f(10) + f(10, 1) == 15 + 11 == 26
    let mut main_fn = module.function("main");
    main_fn.stacksize(6);
    let child = main_fn.child(f_index);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_smi(10);
    main_fn.emit_a(Opcode::Call, 1);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_smi(10);
    main_fn.emit_smi(1);
    main_fn.emit_a(Opcode::Call, 2);
    main_fn.emit(Opcode::Add);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 26);

    rt.shutdown();
}

#[test]
fn test_argc_window_violation_throws() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    let mut f = module.function("two_args");
    f.args(2, 2).stacksize(2);
    f.emit(Opcode::Ret);
    let f_index = f.finish(&mut module);

    // call with a single argument: not enough
    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(f_index);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_smi(1);
    main_fn.emit_a(Opcode::Call, 1);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert!(!outcome.is_completed());

    rt.shutdown();
}

#[test]
fn test_constructor_returns_self() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    let mut ctor = module.function("ctor");
    ctor.constructor().stacksize(1);
    ctor.emit(Opcode::Ret);
    let ctor_index = ctor.finish(&mut module);

    let mut main_fn = module.function("main");
    main_fn.stacksize(4).locals(1);
    let child = main_fn.child(ctor_index);
    main_fn.emit_abb(Opcode::MakeTuple, 0, 0); // self
    main_fn.emit_abb(Opcode::SetLocal, 0, 0); // keep a reference
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit_abb(Opcode::LoadLocal, 0, 0);
    main_fn.emit(Opcode::Eq); // constructor returned the same object
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert!(outcome.value().as_bool());

    rt.shutdown();
}

#[test]
fn test_closure_captures_through_frame_context() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    // inner() reads the variable captured in outer's frame context
    let mut inner = module.function("inner");
    inner.stacksize(1);
    inner.emit_abb(Opcode::LoadFar, 0, 0);
    inner.emit(Opcode::SetReturn);
    inner.emit(Opcode::Ret);
    let inner_index = inner.finish(&mut module);

    let mut outer = module.function("outer");
    outer.heap_variables(1).stacksize(4);
    let child = outer.child(inner_index);
    outer.emit_smi(42);
    outer.emit_abb(Opcode::SetFar, 0, 0);
    outer.emit(Opcode::Pop);
    outer.emit_null();
    outer.emit_abb(Opcode::MakeFunc, 0, child);
    outer.emit_a(Opcode::Call, 0);
    outer.emit(Opcode::SetReturn);
    outer.emit(Opcode::Ret);
    let outer_index = outer.finish(&mut module);

    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(outer_index);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 42);

    rt.shutdown();
}

#[test]
fn test_globals_round_trip() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let counter = module.symbol_constant("counter");
    let mut main_fn = module.function("main");
    main_fn.stacksize(2);
    main_fn.emit_smi(7);
    main_fn.emit_abb(Opcode::SetGlobal, 0, counter);
    main_fn.emit(Opcode::Pop);
    main_fn.emit_abb(Opcode::LoadGlobal, 0, counter);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 7);

    let stored = rt.global_get(veld_util_symbol("counter")).unwrap();
    assert_eq!(stored.as_int(), 7);

    rt.shutdown();
}

fn veld_util_symbol(name: &str) -> veld_util::Symbol {
    veld_util::Symbol::intern(name)
}

fn native_add(_rt: &Runtime, _self: Value, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::int_wrapping(args[0].as_int() + args[1].as_int()))
}

#[test]
fn test_native_function_call() {
    let rt = started_runtime(2);

    let native = rt.register_native("native_add", 2, native_add).unwrap();
    rt.global_set(veld_util_symbol("native_add"), native);

    let mut module = ModuleBuilder::new();
    let sym = module.symbol_constant("native_add");
    let mut main_fn = module.function("main");
    main_fn.stacksize(5);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::LoadGlobal, 0, sym);
    main_fn.emit_smi(2);
    main_fn.emit_smi(3);
    main_fn.emit_a(Opcode::Call, 2);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 5);

    rt.shutdown();
}

#[test]
fn test_tuple_indexing() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    main_fn.emit_smi(1);
    main_fn.emit_smi(2);
    main_fn.emit_smi(3);
    main_fn.emit_abb(Opcode::MakeTuple, 0, 3);
    main_fn.emit_smi(1);
    main_fn.emit(Opcode::GetIndex);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 2);

    rt.shutdown();
}

#[test]
fn test_list_set_and_get() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let mut f = module.function("main");
    f.stacksize(4).locals(1);
    f.emit_smi(5);
    f.emit_smi(6);
    f.emit_abb(Opcode::MakeList, 0, 2);
    f.emit_abb(Opcode::SetLocal, 0, 0);
    f.emit(Opcode::Pop);
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_smi(0);
    f.emit_smi(9);
    f.emit(Opcode::SetIndex);
    f.emit(Opcode::Pop);
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_smi(0);
    f.emit(Opcode::GetIndex);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let entry = f.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 9);

    rt.shutdown();
}

#[test]
fn test_list_out_of_bounds_throws() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let mut f = module.function("main");
    f.stacksize(4);
    f.emit_smi(5);
    f.emit_abb(Opcode::MakeList, 0, 1);
    f.emit_smi(3);
    f.emit(Opcode::GetIndex);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let entry = f.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert!(!outcome.is_completed());

    rt.shutdown();
}

#[test]
fn test_dict_insert_and_lookup() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let key = module.symbol_constant("k");
    let missing = module.symbol_constant("missing");

    let mut f = module.function("main");
    f.stacksize(4).locals(1);
    f.emit_symbol(key);
    f.emit_smi(1);
    f.emit_abb(Opcode::MakeDict, 0, 1);
    f.emit_abb(Opcode::SetLocal, 0, 0);
    f.emit(Opcode::Pop);
    // missing key reads as null (falsy); present key reads back its value
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_symbol(missing);
    f.emit(Opcode::GetIndex);
    f.emit(Opcode::UNot); // true iff the miss produced null
    f.emit(Opcode::Pop);
    f.emit_abb(Opcode::LoadLocal, 0, 0);
    f.emit_symbol(key);
    f.emit(Opcode::GetIndex);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let entry = f.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert_eq!(outcome.value().as_int(), 1);

    rt.shutdown();
}

#[test]
fn test_large_string_constant_and_indexing() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let text = module.string_constant("hello world, a long string");
    let mut f = module.function("main");
    f.stacksize(3);
    f.emit_string(text);
    f.emit_smi(4);
    f.emit(Opcode::GetIndex);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let entry = f.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    let value = outcome.value();
    assert!(value.is_small_string());
    assert_eq!(value.small_payload().as_str(), "o");

    rt.shutdown();
}

#[test]
fn test_stack_overflow_raises() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let f_sym = module.symbol_constant("f");

    // f() = f(): unbounded recursion trips the headroom check
    let mut f = module.function("f");
    f.stacksize(4);
    f.emit_null();
    f.emit_abb(Opcode::LoadGlobal, 0, f_sym);
    f.emit_a(Opcode::Call, 0);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let f_index = f.finish(&mut module);

    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(f_index);
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_abb(Opcode::SetGlobal, 0, f_sym);
    main_fn.emit(Opcode::Pop);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::LoadGlobal, 0, f_sym);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();
    assert!(!outcome.is_completed());

    // the thrown value is an exception whose message names the condition
    match outcome {
        veld_runtime::FiberOutcome::Failed(exception) => {
            let message = unsafe { object::field(exception, layout::exception::MESSAGE) };
            let text = object::with_string(message, |s| s.to_string()).unwrap();
            assert_eq!(text, "stack overflow");
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    rt.shutdown();
}
