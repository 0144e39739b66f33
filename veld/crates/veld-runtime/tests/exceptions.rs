//! Exception Handling Tests
//!
//! Catch-table dispatch, cross-frame unwinding, try/finally interception
//! of non-local transfers, and fiber isolation of uncaught exceptions.

mod common;

use common::started_runtime;

use veld_runtime::bytecode::{
    ModuleBuilder, Opcode, INTERCEPT_RETURN, INTERCEPT_THROW,
};
use veld_util::Symbol;

#[test]
fn test_catch_in_same_frame() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let mut f = module.function("main");
    f.stacksize(2);

    let begin = f.here();
    f.emit_smi(7);
    f.emit(Opcode::ThrowEx);
    let end = f.here();
    f.emit_smi(0);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    let handler = f.here();
    f.emit(Opcode::GetException);
    f.emit(Opcode::SetReturn);
    f.emit(Opcode::Ret);
    f.catch_range(begin, end, handler, 0);

    let entry = f.finish(&mut module);
    let module = module.finish(entry).unwrap();

    let outcome = rt.run_module(module).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value().as_int(), 7);

    rt.shutdown();
}

#[test]
fn test_innermost_handler_receives_nested_throw() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    // thrower(): throw 99
    let mut thrower = module.function("thrower");
    thrower.stacksize(2);
    thrower.emit_smi(99);
    thrower.emit(Opcode::ThrowEx);
    thrower.emit(Opcode::Ret);
    let thrower_index = thrower.finish(&mut module);

    // middle(): thrower() with no handler of its own
    let mut middle = module.function("middle");
    middle.stacksize(4);
    let child = middle.child(thrower_index);
    middle.emit_null();
    middle.emit_abb(Opcode::MakeFunc, 0, child);
    middle.emit_a(Opcode::Call, 0);
    middle.emit(Opcode::SetReturn);
    middle.emit(Opcode::Ret);
    let middle_index = middle.finish(&mut module);

    // main: try { middle() } catch -> return the exception
    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(middle_index);
    let begin = main_fn.here();
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit(Opcode::Pop);
    let end = main_fn.here();
    main_fn.emit_smi(0);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let handler = main_fn.here();
    // the thrower's value arrives on an otherwise empty operand stack
    main_fn.emit(Opcode::GetException);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    main_fn.catch_range(begin, end, handler, 0);

    let entry = main_fn.finish(&mut module);
    let module = module.finish(entry).unwrap();

    let outcome = rt.run_module(module).unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.value().as_int(), 99);

    rt.shutdown();
}

#[test]
fn test_finally_intercepts_return() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let ran = module.symbol_constant("finally_ran");

    // g(): try { return 1 } finally { finally_ran = 1 }
    let mut g = module.function("g");
    g.stacksize(2);
    g.emit_smi(1);
    let next = g.label();
    g.emit_intercept(INTERCEPT_RETURN, next);
    g.bind(next);
    // finally body
    g.emit_smi(1);
    g.emit_abb(Opcode::SetGlobal, 0, ran);
    g.emit(Opcode::Pop);
    g.emit(Opcode::FinallyEnd);
    // unreachable fallthrough
    g.emit_null();
    g.emit(Opcode::SetReturn);
    g.emit(Opcode::Ret);
    let g_index = g.finish(&mut module);

    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(g_index);
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();

    // the intercepted return completed with its original value
    assert_eq!(outcome.value().as_int(), 1);
    // and the finally body ran on the way out
    assert_eq!(rt.global_get(Symbol::intern("finally_ran")).unwrap().as_int(), 1);

    rt.shutdown();
}

#[test]
fn test_finally_reraises_exception() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();
    let ran = module.symbol_constant("cleanup_ran");

    // h(): try { throw 5 } finally { cleanup_ran = 1 }  (rethrows)
    let mut h = module.function("h");
    h.stacksize(2);
    let begin = h.here();
    h.emit_smi(5);
    h.emit(Opcode::ThrowEx);
    let end = h.here();
    h.emit(Opcode::Ret);
    let finally = h.here();
    let next = h.label();
    h.emit_intercept(INTERCEPT_THROW, next); // stash the in-flight exception
    h.bind(next);
    h.emit_smi(1);
    h.emit_abb(Opcode::SetGlobal, 0, ran);
    h.emit(Opcode::Pop);
    h.emit(Opcode::FinallyEnd); // re-raises; no handler left in h
    h.emit(Opcode::Ret);
    h.catch_range(begin, end, finally, 0);
    let h_index = h.finish(&mut module);

    // main: try { h() } catch -> return exception
    let mut main_fn = module.function("main");
    main_fn.stacksize(4);
    let child = main_fn.child(h_index);
    let begin = main_fn.here();
    main_fn.emit_null();
    main_fn.emit_abb(Opcode::MakeFunc, 0, child);
    main_fn.emit_a(Opcode::Call, 0);
    main_fn.emit(Opcode::Pop);
    let end = main_fn.here();
    main_fn.emit_smi(0);
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    let handler = main_fn.here();
    main_fn.emit(Opcode::SetReturn);
    main_fn.emit(Opcode::Ret);
    main_fn.catch_range(begin, end, handler, 0);
    let entry = main_fn.finish(&mut module);

    let module = module.finish(entry).unwrap();
    let outcome = rt.run_module(module).unwrap();

    assert_eq!(outcome.value().as_int(), 5);
    assert_eq!(rt.global_get(Symbol::intern("cleanup_ran")).unwrap().as_int(), 1);

    rt.shutdown();
}

#[test]
fn test_uncaught_exception_terminates_only_its_fiber() {
    let rt = started_runtime(2);

    let mut module = ModuleBuilder::new();

    let mut bad = module.function("bad");
    bad.stacksize(2);
    bad.emit_smi(1);
    bad.emit(Opcode::ThrowEx);
    bad.emit(Opcode::Ret);
    let bad_index = bad.finish(&mut module);

    let mut good = module.function("good");
    good.stacksize(2);
    good.emit_smi(8);
    good.emit(Opcode::SetReturn);
    good.emit(Opcode::Ret);
    let good_index = good.finish(&mut module);

    let module = rt.load_module(module.finish(good_index).unwrap()).unwrap();

    let bad_fn = rt.make_function(&module, bad_index).unwrap();
    let bad_handle = rt.spawn(bad_fn, Vec::new()).unwrap();
    let good_fn = rt.make_function(&module, good_index).unwrap();
    let good_handle = rt.spawn(good_fn, Vec::new()).unwrap();

    let bad_outcome = bad_handle.join();
    let good_outcome = good_handle.join();

    assert!(!bad_outcome.is_completed());
    assert!(good_outcome.is_completed());
    assert_eq!(good_outcome.value().as_int(), 8);

    rt.shutdown();
}
