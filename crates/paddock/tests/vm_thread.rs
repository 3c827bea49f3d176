//! Tests for single-thread execution: rescue frames, stack traces, classes, loops and slicing.
//!
//! These drive a `VmThread` directly with `start_call` + `run`, without the worker pool.

use std::sync::Arc;

use paddock::{
    BinOpKind, BuiltinClass, CallFlags, CodeBuilder, Constant, FuncId, GlobalId, GlobalKind, Instruction, LimitedTracker,
    MAX_ERROR_STACK_FRAMES, NoLimitTracker, NoopTracer, Object, Opcode, Program, RecordingTracer, RescueMode, ThreadExit, ThreadStatus, TraceEvent,
    ResourceLimits, VarAttrFlags, VmThread,
};
use pretty_assertions::assert_eq;

fn returned(exit: ThreadExit) -> Object {
    match exit {
        ThreadExit::Returned(obj) => obj,
        other => panic!("expected a return, got {other:?}"),
    }
}

fn errored(exit: ThreadExit) -> paddock::ScriptError {
    match exit {
        ThreadExit::Errored(err) => err,
        other => panic!("expected an error, got {other:?}"),
    }
}

fn call(return_to: u16, callee: u16, args_start: u16, posargs: u16) -> Instruction {
    Instruction::Call {
        return_to,
        callee,
        args_start,
        posargs,
        flags: CallFlags::NONE,
    }
}

// =============================================================================
// 1. Rescue frames
// =============================================================================

/// `do { raise ValueError("boom") } rescue ValueError as e { caught += 1 } finally { finals += 1 }`
///
/// The catch block runs once, the finally block runs once (entered from the end of the catch
/// block), and the caught error is returned.
#[test]
fn rescue_catches_once_and_runs_finally_once() {
    let mut program = Program::new();
    let caught = program.add_global("caught", Constant::Int(0), GlobalKind::Mutable);
    let finals = program.add_global("finals", Constant::Int(0), GlobalKind::Mutable);
    let main = program.register_script_function("main", 0, 4);

    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    let boom = code.add_const(Constant::str("boom"));
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_RESCUE | RescueMode::JUMP_ON_FINALLY,
        error_slot: Some(1),
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    code.emit(Instruction::AddRescueType {
        class: BuiltinClass::ValueError.class_id(),
        frame_id: 0,
    });
    code.emit(Instruction::SetConst { slot: 0, constant: boom });
    let raise_at = code.emit(Instruction::Raise {
        class: BuiltinClass::ValueError.class_id(),
        msg_slot: 0,
    });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    // rescue
    code.patch_jump_operand(push, 0);
    code.emit(Instruction::SetConst { slot: 3, constant: one });
    code.emit(Instruction::GetGlobal { slot_to: 2, global: caught });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 2, lhs: 2, rhs: 3 });
    code.emit(Instruction::SetGlobal { global: caught, slot_from: 2 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    // finally
    code.patch_jump_operand(push, 1);
    code.emit(Instruction::SetConst { slot: 3, constant: one });
    code.emit(Instruction::GetGlobal { slot_to: 2, global: finals });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 2, lhs: 2, rhs: 3 });
    code.emit(Instruction::SetGlobal { global: finals, slot_from: 2 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, RecordingTracer::new());
    thread.start_call(main, vec![]).unwrap();
    let result = returned(thread.run());

    let Object::Error(err) = result else {
        panic!("expected the caught error, got {result}");
    };
    assert!(err.is(BuiltinClass::ValueError));
    assert_eq!(err.message(), "boom");
    assert_eq!(err.trace().len(), 1);
    assert_eq!(err.trace()[0].func, main);
    assert_eq!(err.trace()[0].offset, raise_at);

    assert_eq!(thread.read_global(caught), Some(Object::Int(1)));
    assert_eq!(thread.read_global(finals), Some(Object::Int(1)));
    assert_eq!(thread.status(), ThreadStatus::Returned);

    let rescue_events: Vec<_> = thread
        .tracer()
        .events()
        .iter()
        .filter(|e| !matches!(e, TraceEvent::Instruction { .. } | TraceEvent::Call { .. }))
        .cloned()
        .collect();
    assert_eq!(
        rescue_events,
        vec![
            TraceEvent::RescuePush { frame_id: 0 },
            TraceEvent::Raise {
                class: BuiltinClass::ValueError.class_id(),
                caught: true,
            },
            TraceEvent::RescuePop { frame_id: 0 },
            TraceEvent::Return { depth: 0 },
        ]
    );
}

/// A frame with only a finally block runs it, then lets the error continue to the caller.
#[test]
fn finally_runs_then_error_propagates() {
    let mut program = Program::new();
    let finals = program.add_global("finals", Constant::Int(0), GlobalKind::Mutable);
    let main = program.register_script_function("main", 0, 2);

    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_FINALLY,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 7,
    });
    code.emit(Instruction::Raise {
        class: BuiltinClass::TypeError.class_id(),
        msg_slot: 0,
    });
    code.emit(Instruction::PopRescueFrame { frame_id: 7 });
    code.patch_jump_operand(push, 1);
    code.emit(Instruction::SetConst { slot: 1, constant: one });
    code.emit(Instruction::SetGlobal { global: finals, slot_from: 1 });
    code.emit(Instruction::PopRescueFrame { frame_id: 7 });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    let err = errored(thread.run());

    assert!(err.is(BuiltinClass::TypeError));
    assert_eq!(err.message(), "");
    // located once at the raise, not again at the re-raise after finally
    assert_eq!(err.trace().len(), 1);
    assert_eq!(thread.read_global(finals), Some(Object::Int(1)));
    assert_eq!(thread.status(), ThreadStatus::Errored);
}

/// An error raised inside the rescue block is not caught by the same frame; the finally block
/// still runs exactly once before it propagates.
#[test]
fn error_inside_rescue_block_goes_through_finally() {
    let mut program = Program::new();
    let finals = program.add_global("finals", Constant::Int(0), GlobalKind::Mutable);
    let main = program.register_script_function("main", 0, 3);

    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_RESCUE | RescueMode::JUMP_ON_FINALLY,
        error_slot: Some(1),
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    code.emit(Instruction::AddRescueType {
        class: BuiltinClass::Error.class_id(),
        frame_id: 0,
    });
    code.emit(Instruction::Raise {
        class: BuiltinClass::IndexError.class_id(),
        msg_slot: 0,
    });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.patch_jump_operand(push, 0);
    code.emit(Instruction::Raise {
        class: BuiltinClass::MathError.class_id(),
        msg_slot: 0,
    });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.patch_jump_operand(push, 1);
    code.emit(Instruction::GetGlobal { slot_to: 2, global: finals });
    code.emit(Instruction::SetConst { slot: 0, constant: one });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 2, lhs: 2, rhs: 0 });
    code.emit(Instruction::SetGlobal { global: finals, slot_from: 2 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.emit(Instruction::ReturnValue { slot: 2 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    let err = errored(thread.run());

    assert!(err.is(BuiltinClass::MathError));
    assert_eq!(thread.read_global(finals), Some(Object::Int(1)));
}

/// Emits `finals = finals * 10 + digit`, clobbering slots 0..=2.
fn record_digit(code: &mut CodeBuilder, finals: GlobalId, digit: i64) {
    let ten = code.add_const(Constant::Int(10));
    let digit = code.add_const(Constant::Int(digit));
    code.emit(Instruction::GetGlobal { slot_to: 1, global: finals });
    code.emit(Instruction::SetConst { slot: 2, constant: ten });
    code.emit(Instruction::BinOp { op: BinOpKind::Mul, slot_to: 1, lhs: 1, rhs: 2 });
    code.emit(Instruction::SetConst { slot: 2, constant: digit });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 1, lhs: 1, rhs: 2 });
    code.emit(Instruction::SetGlobal { global: finals, slot_from: 1 });
    code.emit(Instruction::SetConst { slot: 0, constant: digit });
}

/// `do { do { return 5 } finally { A } } finally { B }`
///
/// Both finally blocks run once, innermost first, and the value held at the `return` is what
/// leaves the function even though the finally blocks overwrite its slot.
#[test]
fn return_inside_try_runs_every_pending_finally() {
    let mut program = Program::new();
    let finals = program.add_global("finals", Constant::Int(0), GlobalKind::Mutable);
    let main = program.register_script_function("main", 0, 3);

    let mut code = CodeBuilder::new();
    let five = code.add_const(Constant::Int(5));
    let outer = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_FINALLY,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    let inner = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_FINALLY,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 1,
    });
    code.emit(Instruction::SetConst { slot: 0, constant: five });
    code.emit(Instruction::ReturnValue { slot: 0 });
    code.emit(Instruction::PopRescueFrame { frame_id: 1 });
    code.patch_jump_operand(inner, 1);
    record_digit(&mut code, finals, 1);
    code.emit(Instruction::PopRescueFrame { frame_id: 1 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.patch_jump_operand(outer, 1);
    record_digit(&mut code, finals, 2);
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.emit(Instruction::ReturnValue { slot: 0 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, RecordingTracer::new());
    thread.start_call(main, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Int(5));
    assert_eq!(thread.read_global(finals), Some(Object::Int(12)));

    let rescue_events: Vec<_> = thread
        .tracer()
        .events()
        .iter()
        .filter(|e| !matches!(e, TraceEvent::Instruction { .. } | TraceEvent::Call { .. }))
        .cloned()
        .collect();
    assert_eq!(
        rescue_events,
        vec![
            TraceEvent::RescuePush { frame_id: 0 },
            TraceEvent::RescuePush { frame_id: 1 },
            TraceEvent::RescuePop { frame_id: 1 },
            TraceEvent::RescuePop { frame_id: 0 },
            TraceEvent::Return { depth: 0 },
        ]
    );
}

/// An error raised inside the finally block replaces the return that was waiting for it.
#[test]
fn error_in_finally_discards_the_held_return() {
    let mut program = Program::new();
    let main = program.register_script_function("main", 0, 2);

    let mut code = CodeBuilder::new();
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_FINALLY,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    code.emit(Instruction::NewList { slot_to: 0 });
    code.emit(Instruction::ReturnValue { slot: 0 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.patch_jump_operand(push, 1);
    code.emit(Instruction::Raise {
        class: BuiltinClass::ValueError.class_id(),
        msg_slot: 1,
    });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.emit(Instruction::ReturnValue { slot: 0 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::ValueError));
    assert_eq!(thread.status(), ThreadStatus::Errored);
    assert_eq!(thread.heap_stats().live_objects, 0);
}

/// Resource errors skip catch blocks but not finally blocks: every frame that hit the recursion
/// limit on its way down runs its finally block while the error unwinds.
#[test]
fn recursion_limit_unwinds_through_finally_blocks() {
    const LIMIT: usize = 4;
    let mut program = Program::new();
    let finals = program.add_global("finals", Constant::Int(0), GlobalKind::Mutable);
    let caught = program.add_global("caught", Constant::Int(0), GlobalKind::Mutable);
    let recurse = program.register_script_function("recurse", 0, 3);

    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_RESCUE | RescueMode::JUMP_ON_FINALLY,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    code.emit(Instruction::AddRescueType {
        class: BuiltinClass::Error.class_id(),
        frame_id: 0,
    });
    code.emit(Instruction::GetFunc { slot_to: 0, func: recurse });
    code.emit(call(1, 0, 0, 0));
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    // rescue
    code.patch_jump_operand(push, 0);
    code.emit(Instruction::SetConst { slot: 2, constant: one });
    code.emit(Instruction::SetGlobal { global: caught, slot_from: 2 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    // finally
    code.patch_jump_operand(push, 1);
    code.emit(Instruction::SetConst { slot: 2, constant: one });
    code.emit(Instruction::GetGlobal { slot_to: 1, global: finals });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 1, lhs: 1, rhs: 2 });
    code.emit(Instruction::SetGlobal { global: finals, slot_from: 1 });
    code.emit(Instruction::PopRescueFrame { frame_id: 0 });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(recurse, code.build().unwrap()).unwrap();

    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(Some(LIMIT)));
    let mut thread = VmThread::new_main(Arc::new(program), tracker, NoopTracer);
    thread.start_call(recurse, vec![]).unwrap();
    let err = errored(thread.run());

    assert!(err.is(BuiltinClass::RecursionError));
    assert_eq!(err.trace().len(), LIMIT);
    assert_eq!(thread.read_global(finals), Some(Object::Int(4)));
    assert_eq!(thread.read_global(caught), Some(Object::Int(0)));
}

/// Listing a class that is not an error class is a type error, not a silent no-op.
#[test]
fn rescuing_a_non_error_class_is_rejected() {
    let mut program = Program::new();
    let plain = program.add_class("Plain");
    let main = program.register_script_function("main", 0, 1);

    let mut code = CodeBuilder::new();
    let push = code.emit_jump(Instruction::PushRescueFrame {
        mode: RescueMode::JUMP_ON_RESCUE,
        error_slot: None,
        catch_offset: 0,
        finally_offset: 0,
        frame_id: 0,
    });
    code.emit(Instruction::AddRescueType { class: plain, frame_id: 0 });
    code.patch_jump_operand(push, 0);
    code.emit(Instruction::ReturnValue { slot: 0 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::TypeError));
}

// =============================================================================
// 2. Stack traces
// =============================================================================

/// An error raised twelve calls deep keeps only the innermost ten trace entries.
#[test]
fn uncaught_error_trace_is_capped() {
    const DEPTH: usize = 12;
    let mut program = Program::new();
    let funcs: Vec<FuncId> = (0..DEPTH)
        .map(|i| program.register_script_function(&format!("f{i}"), 0, 2))
        .collect();
    for (i, &func) in funcs.iter().enumerate() {
        let mut code = CodeBuilder::new();
        if let Some(&next) = funcs.get(i + 1) {
            code.emit(Instruction::GetFunc { slot_to: 0, func: next });
            code.emit(call(1, 0, 0, 0));
            code.emit(Instruction::ReturnValue { slot: 1 });
        } else {
            code.emit(Instruction::Raise {
                class: BuiltinClass::RuntimeError.class_id(),
                msg_slot: 0,
            });
        }
        program.set_function_code(func, code.build().unwrap()).unwrap();
    }

    let program = Arc::new(program);
    let mut thread = VmThread::new_main(Arc::clone(&program), NoLimitTracker, NoopTracer);
    thread.start_call(funcs[0], vec![]).unwrap();
    let err = errored(thread.run());

    assert_eq!(err.trace().len(), MAX_ERROR_STACK_FRAMES);
    let traced: Vec<FuncId> = err.trace().iter().map(|entry| entry.func).collect();
    let expected: Vec<FuncId> = funcs.iter().rev().take(MAX_ERROR_STACK_FRAMES).copied().collect();
    assert_eq!(traced, expected);
    // every caller is recorded at its call instruction, right after the GetFunc
    let call_at = Opcode::GetFunc.encoded_size();
    assert!(err.trace()[1..].iter().all(|entry| entry.offset == call_at));

    let formatted = program.format_error(&err);
    assert!(formatted.starts_with(&format!(
        "RuntimeError: \n  in f11 at offset 0\n  in f10 at offset {call_at}"
    )));
}

// =============================================================================
// 3. Values, classes and loops
// =============================================================================

/// Sums a list argument with `NewIterator`/`Iterate` and a backward jump.
fn sum_program() -> (Program, FuncId) {
    let mut program = Program::new();
    let sum = program.register_script_function("sum", 1, 3);
    let mut code = CodeBuilder::new();
    let zero = code.add_const(Constant::Int(0));
    code.emit(Instruction::SetConst { slot: 3, constant: zero });
    code.emit(Instruction::NewIterator {
        slot_to: 1,
        container_slot: 0,
    });
    let loop_start = code.current_offset();
    let next = code.emit_jump(Instruction::Iterate {
        value_to: 2,
        iter_slot: 1,
        jump_on_end: 0,
    });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 3, lhs: 3, rhs: 2 });
    let back = code.offset_to(loop_start);
    code.emit(Instruction::Jump { offset: back });
    code.patch_jump(next);
    code.emit(Instruction::ReturnValue { slot: 3 });
    program.set_function_code(sum, code.build().unwrap()).unwrap();
    (program, sum)
}

#[test]
fn iterating_a_list_argument_frees_everything_afterwards() {
    let (program, sum) = sum_program();
    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    let items = Object::List((1..=5).map(Object::Int).collect());
    thread.start_call(sum, vec![items]).unwrap();
    assert_eq!(returned(thread.run()), Object::Int(15));
    assert_eq!(thread.heap_stats().live_objects, 0);
}

/// With a slice budget the loop yields at its backward jump and picks up where it left off.
#[test]
fn slice_budget_yields_at_backward_jumps() {
    let (program, sum) = sum_program();
    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer).with_slice_budget(4);
    let items = Object::List((1..=10).map(Object::Int).collect());
    thread.start_call(sum, vec![items]).unwrap();

    let mut yields = 0;
    let result = loop {
        match thread.run() {
            ThreadExit::Yielded => {
                yields += 1;
                assert_eq!(thread.status(), ThreadStatus::Idle);
            }
            other => break returned(other),
        }
    };
    assert_eq!(result, Object::Int(55));
    assert!(yields >= 5, "expected several yields, got {yields}");
}

/// Wrong argument counts are rejected before anything runs.
#[test]
fn start_call_checks_arity() {
    let (program, sum) = sum_program();
    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    let err = thread.start_call(sum, vec![]).unwrap_err();
    assert!(err.is(BuiltinClass::TypeError));
    assert_eq!(err.message(), "`sum` takes 1 positional argument(s) but 0 were given");
}

/// A class with a variable initializer and a method that reads and writes its attribute.
#[test]
fn instance_methods_see_initialized_attributes() {
    let mut program = Program::new();
    let counter = program.add_class("Counter");
    let count = program
        .register_class_variable(counter, "count", VarAttrFlags::NONE)
        .unwrap();
    let varinit = program.register_script_function("Counter.$varinit", 1, 1);
    let bump = program.register_script_function("Counter.bump", 1, 2);
    program.set_class_varinit(counter, varinit).unwrap();
    program.register_class_method(counter, "bump", bump).unwrap();
    let bump_name = program.intern("bump");
    let main = program.register_script_function("main", 0, 3);

    let mut code = CodeBuilder::new();
    let ten = code.add_const(Constant::Int(10));
    code.emit(Instruction::SetConst { slot: 1, constant: ten });
    code.emit(Instruction::SetByAttributeIdx {
        obj_slot: 0,
        attr: count,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(varinit, code.build().unwrap()).unwrap();

    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    code.emit(Instruction::GetAttributeByIdx {
        slot_to: 1,
        obj_slot: 0,
        attr: count,
    });
    code.emit(Instruction::SetConst { slot: 2, constant: one });
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 1, lhs: 1, rhs: 2 });
    code.emit(Instruction::SetByAttributeIdx {
        obj_slot: 0,
        attr: count,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(bump, code.build().unwrap()).unwrap();

    let mut code = CodeBuilder::new();
    code.emit(Instruction::NewInstance { slot_to: 0, class: counter });
    code.emit(Instruction::GetAttributeByName {
        slot_to: 1,
        obj_slot: 0,
        name: bump_name,
    });
    code.emit(call(2, 1, 3, 0));
    code.emit(call(2, 1, 3, 0));
    code.emit(Instruction::ReturnValue { slot: 2 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Int(12));
    assert_eq!(thread.heap_stats().live_objects, 0);
}

/// Const attributes may only be assigned by the class's own variable initializer.
#[test]
fn const_attributes_reject_assignment_outside_varinit() {
    let mut program = Program::new();
    let point = program.add_class("Point");
    let x = program.register_class_variable(point, "x", VarAttrFlags::CONST).unwrap();
    let main = program.register_script_function("main", 0, 2);

    let mut code = CodeBuilder::new();
    code.emit(Instruction::NewInstance { slot_to: 0, class: point });
    code.emit(Instruction::SetByAttributeIdx {
        obj_slot: 0,
        attr: x,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::AttributeError));
    assert_eq!(err.message(), "attribute `x` of `Point` is const");
}

/// Protected attributes are assignable from the class's methods, including methods inherited from
/// a base class, but not from outside code.
#[test]
fn protected_attributes_reject_assignment_from_outside_the_class() {
    let mut program = Program::new();
    let account = program.add_class("Account");
    let balance = program
        .register_class_variable(account, "balance", VarAttrFlags::PROTECT)
        .unwrap();
    let deposit = program.register_script_function("Account.deposit", 1, 1);
    program.register_class_method(account, "deposit", deposit).unwrap();
    let savings = program.add_class("Savings");
    program.set_base_class(savings, account).unwrap();
    let deposit_name = program.intern("deposit");

    let mut code = CodeBuilder::new();
    let five = code.add_const(Constant::Int(5));
    code.emit(Instruction::SetConst { slot: 1, constant: five });
    code.emit(Instruction::SetByAttributeIdx {
        obj_slot: 0,
        attr: balance,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(deposit, code.build().unwrap()).unwrap();

    let via_method = program.register_script_function("via_method", 0, 3);
    let mut code = CodeBuilder::new();
    code.emit(Instruction::NewInstance { slot_to: 0, class: savings });
    code.emit(Instruction::GetAttributeByName {
        slot_to: 1,
        obj_slot: 0,
        name: deposit_name,
    });
    code.emit(call(2, 1, 3, 0));
    code.emit(Instruction::GetAttributeByIdx {
        slot_to: 2,
        obj_slot: 0,
        attr: balance,
    });
    code.emit(Instruction::ReturnValue { slot: 2 });
    program.set_function_code(via_method, code.build().unwrap()).unwrap();

    let direct = program.register_script_function("direct", 0, 2);
    let mut code = CodeBuilder::new();
    code.emit(Instruction::NewInstance { slot_to: 0, class: account });
    code.emit(Instruction::SetByAttributeIdx {
        obj_slot: 0,
        attr: balance,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(direct, code.build().unwrap()).unwrap();

    let program = Arc::new(program);
    let mut thread = VmThread::new_main(Arc::clone(&program), NoLimitTracker, NoopTracer);
    thread.start_call(via_method, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Int(5));

    let mut thread = VmThread::new_main(program, NoLimitTracker, NoopTracer);
    thread.start_call(direct, vec![]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::AttributeError));
    assert_eq!(err.message(), "attribute `balance` of `Account` is protected");
}

/// Lists are indexed from 1 and index errors are catchable script errors.
#[test]
fn list_indexing_is_one_based() {
    let mut program = Program::new();
    let at = program.register_script_function("at", 2, 1);
    let mut code = CodeBuilder::new();
    code.emit(Instruction::BinOp {
        op: BinOpKind::Index,
        slot_to: 2,
        lhs: 0,
        rhs: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 2 });
    program.set_function_code(at, code.build().unwrap()).unwrap();
    let program = Arc::new(program);

    let list = || Object::List(vec![Object::from("a"), Object::from("b")]);
    let mut thread = VmThread::new_main(Arc::clone(&program), NoLimitTracker, NoopTracer);
    thread.start_call(at, vec![list(), Object::Int(1)]).unwrap();
    assert_eq!(returned(thread.run()), Object::from("a"));

    thread.start_call(at, vec![list(), Object::Int(0)]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::IndexError));
}

/// Integer arithmetic is checked; division always produces a float.
#[test]
fn arithmetic_overflow_and_division() {
    let mut program = Program::new();
    let mul = program.register_script_function("mul", 2, 1);
    let div = program.register_script_function("div", 2, 1);
    for (func, op) in [(mul, BinOpKind::Mul), (div, BinOpKind::Div)] {
        let mut code = CodeBuilder::new();
        code.emit(Instruction::BinOp {
            op,
            slot_to: 2,
            lhs: 0,
            rhs: 1,
        });
        code.emit(Instruction::ReturnValue { slot: 2 });
        program.set_function_code(func, code.build().unwrap()).unwrap();
    }
    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);

    thread.start_call(div, vec![Object::Int(7), Object::Int(2)]).unwrap();
    assert_eq!(returned(thread.run()), Object::Float(3.5));

    thread.start_call(div, vec![Object::Int(1), Object::Int(0)]).unwrap();
    assert!(errored(thread.run()).is(BuiltinClass::MathError));

    thread
        .start_call(mul, vec![Object::Int(i64::MAX), Object::Int(2)])
        .unwrap();
    assert!(errored(thread.run()).is(BuiltinClass::MathError));
}

/// Assigning `yes`/`no` to a set member adds or removes it; indexing tests membership.
#[test]
fn set_members_are_added_removed_and_tested() {
    let mut program = Program::new();
    let found = program.add_global("found", Constant::None, GlobalKind::Mutable);
    let main = program.register_script_function("main", 0, 4);

    let mut code = CodeBuilder::new();
    let a = code.add_const(Constant::str("a"));
    let three = code.add_const(Constant::Int(3));
    let yes = code.add_const(Constant::Bool(true));
    let no = code.add_const(Constant::Bool(false));
    let assign = |code: &mut CodeBuilder, member, present| {
        code.emit(Instruction::SetConst { slot: 1, constant: member });
        code.emit(Instruction::SetConst { slot: 2, constant: present });
        code.emit(Instruction::SetByIndexExpr {
            obj_slot: 0,
            index_slot: 1,
            value_slot: 2,
        });
    };
    code.emit(Instruction::NewSet { slot_to: 0 });
    assign(&mut code, a, yes);
    assign(&mut code, three, yes);
    assign(&mut code, three, yes);
    assign(&mut code, a, no);
    code.emit(Instruction::SetConst { slot: 1, constant: three });
    code.emit(Instruction::BinOp {
        op: BinOpKind::Index,
        slot_to: 3,
        lhs: 0,
        rhs: 1,
    });
    code.emit(Instruction::SetGlobal { global: found, slot_from: 3 });
    code.emit(Instruction::ReturnValue { slot: 0 });
    program.set_function_code(main, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(main, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Set(vec![Object::Int(3)]));
    assert_eq!(thread.read_global(found), Some(Object::Bool(true)));
    assert_eq!(thread.heap_stats().live_objects, 0);
}

/// Vectors grow by assigning one past the end, add and subtract component-wise and scale by a
/// number.
#[test]
fn vector_components_and_arithmetic() {
    let mut program = Program::new();
    let build = program.register_script_function("build", 0, 5);
    let mut code = CodeBuilder::new();
    let one = code.add_const(Constant::Int(1));
    let two = code.add_const(Constant::Int(2));
    let half = code.add_const(Constant::Float(1.5));
    code.emit(Instruction::NewVector { slot_to: 0 });
    code.emit(Instruction::SetConst { slot: 1, constant: one });
    code.emit(Instruction::SetConst { slot: 2, constant: half });
    code.emit(Instruction::SetByIndexExpr {
        obj_slot: 0,
        index_slot: 1,
        value_slot: 2,
    });
    code.emit(Instruction::SetConst { slot: 1, constant: two });
    code.emit(Instruction::SetConst { slot: 2, constant: two });
    code.emit(Instruction::SetByIndexExpr {
        obj_slot: 0,
        index_slot: 1,
        value_slot: 2,
    });
    // (v + v) * 2 - v
    code.emit(Instruction::BinOp { op: BinOpKind::Add, slot_to: 3, lhs: 0, rhs: 0 });
    code.emit(Instruction::SetConst { slot: 4, constant: two });
    code.emit(Instruction::BinOp { op: BinOpKind::Mul, slot_to: 3, lhs: 3, rhs: 4 });
    code.emit(Instruction::BinOp { op: BinOpKind::Sub, slot_to: 3, lhs: 3, rhs: 0 });
    code.emit(Instruction::ReturnValue { slot: 3 });
    program.set_function_code(build, code.build().unwrap()).unwrap();

    let past_end = program.register_script_function("past_end", 0, 3);
    let mut code = CodeBuilder::new();
    let three = code.add_const(Constant::Int(3));
    code.emit(Instruction::NewVector { slot_to: 0 });
    code.emit(Instruction::SetConst { slot: 1, constant: three });
    code.emit(Instruction::SetByIndexExpr {
        obj_slot: 0,
        index_slot: 1,
        value_slot: 1,
    });
    code.emit(Instruction::ReturnValue { slot: 0 });
    program.set_function_code(past_end, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(build, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Vector(vec![4.5, 6.0]));
    assert_eq!(thread.heap_stats().live_objects, 0);

    thread.start_call(past_end, vec![]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::IndexError));
    assert_eq!(err.message(), "index 3 out of range for vector of length 0");
}

/// `GetConstructor` yields the class an instance was created from; plain values have none.
#[test]
fn constructor_of_instances_and_errors() {
    let mut program = Program::new();
    let point = program.add_class("Point");
    let of_instance = program.register_script_function("of_instance", 0, 2);
    let mut code = CodeBuilder::new();
    code.emit(Instruction::NewInstance { slot_to: 0, class: point });
    code.emit(Instruction::GetConstructor { slot_to: 1, obj_slot: 0 });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(of_instance, code.build().unwrap()).unwrap();

    let of_arg = program.register_script_function("of_arg", 1, 1);
    let mut code = CodeBuilder::new();
    code.emit(Instruction::GetConstructor { slot_to: 1, obj_slot: 0 });
    code.emit(Instruction::ReturnValue { slot: 1 });
    program.set_function_code(of_arg, code.build().unwrap()).unwrap();

    let mut thread = VmThread::new_main(Arc::new(program), NoLimitTracker, NoopTracer);
    thread.start_call(of_instance, vec![]).unwrap();
    assert_eq!(returned(thread.run()), Object::Class(point));

    let error = paddock::ScriptError::builtin(BuiltinClass::ValueError, "bad");
    thread.start_call(of_arg, vec![Object::Error(Arc::new(error))]).unwrap();
    assert_eq!(returned(thread.run()), Object::Class(BuiltinClass::ValueError.class_id()));

    thread.start_call(of_arg, vec![Object::Int(4)]).unwrap();
    let err = errored(thread.run());
    assert!(err.is(BuiltinClass::TypeError));
    assert_eq!(err.message(), "int has no constructor");
}
