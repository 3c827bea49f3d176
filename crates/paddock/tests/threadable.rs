//! Tests for the whole-program threadability analysis.
//!
//! Builds small call graphs by hand (the analyzer only needs resolved identifier references, not
//! bytecode) and checks which functions end up threadable and which diagnostics are reported.

use paddock::{
    CompileReport, Constant, FuncId, GlobalId, GlobalKind, IdentifierRef, Program, ResolvedUnit, Severity, SourcePos,
    StorageRef, ThreadabilityAnalyzer,
};
use pretty_assertions::assert_eq;

const GLOBAL_MSG: &str = "func marked as \"canasync\" cannot access global variable that isn't a simple constant";
const CALL_MSG: &str = "func marked as \"canasync\" cannot access this func that is not \"canasync\" itself";

fn call(callee: FuncId, line: u32, column: u32) -> IdentifierRef {
    IdentifierRef {
        storage: Some(StorageRef::GlobalFunc(callee)),
        pos: SourcePos::new(line, column),
        resolved_to: None,
    }
}

fn global(global: GlobalId, line: u32, column: u32, declared: SourcePos) -> IdentifierRef {
    IdentifierRef {
        storage: Some(StorageRef::GlobalVar(global)),
        pos: SourcePos::new(line, column),
        resolved_to: Some(declared),
    }
}

fn threadable(program: &Program, func: FuncId) -> bool {
    program.function(func).unwrap().is_threadable()
}

// =============================================================================
// 1. Direct global access
// =============================================================================

/// Reading a mutable global clears the flag; reading a literal constant does not.
#[test]
fn mutable_global_access_clears_only_the_accessing_function() {
    let mut program = Program::new();
    let counter = program.add_global("counter", Constant::Int(0), GlobalKind::Mutable);
    let limit = program.add_global("LIMIT", Constant::Int(10), GlobalKind::SimpleConstant);
    let computed = program.add_global("TABLE", Constant::None, GlobalKind::Const);
    let touch = program.register_script_function("touch", 0, 1);
    let read_limit = program.register_script_function("read_limit", 0, 1);
    let read_table = program.register_script_function("read_table", 0, 1);

    let decl = SourcePos::new(1, 1);
    let mut units = vec![
        ResolvedUnit::new(Some("main.h64"))
            .with_function(touch, vec![global(counter, 3, 5, decl)])
            .with_function(read_limit, vec![global(limit, 6, 12, decl)])
            .with_function(read_table, vec![global(computed, 9, 12, decl)]),
    ];
    let mut report = CompileReport::new();
    ThreadabilityAnalyzer::analyze(&mut program, &mut units, &mut report).unwrap();

    assert!(!threadable(&program, touch));
    assert!(threadable(&program, read_limit));
    // computed consts are not literals, so they are as off-limits as mutable globals
    assert!(!threadable(&program, read_table));
    // nothing was marked canasync, so nothing is reported
    assert!(report.success());
    assert!(report.messages().is_empty());
    assert!(units[0].is_analyzed());
}

/// A canasync function touching a mutable global is reported at the global's declaration.
#[test]
fn canasync_global_access_reports_declaration_position() {
    let mut program = Program::new();
    let state = program.add_global("state", Constant::Int(0), GlobalKind::Mutable);
    let worker = program.register_script_function("worker", 0, 1);
    program.set_canasync(worker, true).unwrap();

    let declared = SourcePos::new(2, 5);
    let mut units = vec![ResolvedUnit::new(Some("jobs.h64")).with_function(worker, vec![global(state, 7, 9, declared)])];
    let mut report = CompileReport::new();
    ThreadabilityAnalyzer::analyze(&mut program, &mut units, &mut report).unwrap();

    assert!(!report.success());
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, Severity::Error);
    assert_eq!(errors[0].message, GLOBAL_MSG);
    assert_eq!(errors[0].file.as_deref(), Some("jobs.h64"));
    assert_eq!(errors[0].pos, Some(declared));
    assert_eq!(
        errors[0].to_string(),
        format!("jobs.h64:2:5: error: {GLOBAL_MSG}")
    );
}

// =============================================================================
// 2. Propagation over the call graph
// =============================================================================

/// `h` calls `g` calls `f`, and `f` touches a mutable global. Ids are assigned so that every
/// caller is visited before its callee, which forces one extra pass per level.
#[test]
fn propagation_runs_to_a_fixpoint() {
    let mut program = Program::new();
    let shared = program.add_global("shared", Constant::Int(0), GlobalKind::Mutable);
    let h = program.register_script_function("h", 0, 1);
    let g = program.register_script_function("g", 0, 1);
    let f = program.register_script_function("f", 0, 1);
    let pure = program.register_script_function("pure", 0, 1);

    let mut units = vec![
        ResolvedUnit::new(Some("a.h64"))
            .with_function(h, vec![call(g, 10, 5)])
            .with_function(g, vec![call(f, 20, 5)]),
        ResolvedUnit::new(Some("b.h64"))
            .with_function(f, vec![global(shared, 30, 5, SourcePos::new(1, 1))])
            .with_function(pure, vec![call(pure, 40, 5)]),
    ];
    let mut report = CompileReport::new();
    let summary = ThreadabilityAnalyzer::analyze(&mut program, &mut units, &mut report).unwrap();

    assert!(!threadable(&program, f));
    assert!(!threadable(&program, g));
    assert!(!threadable(&program, h));
    // self-recursion alone does not clear the flag
    assert!(threadable(&program, pure));
    assert_eq!(summary.cleared, vec![g, h]);
    assert_eq!(summary.passes, 3);
    assert!(report.success());
}

/// Flags only ever go from threadable to not threadable: running the propagation again over the
/// same graph changes nothing.
#[test]
fn propagation_is_monotonic_and_idempotent() {
    let mut program = Program::new();
    let shared = program.add_global("shared", Constant::Int(0), GlobalKind::Mutable);
    let f = program.register_script_function("f", 0, 1);
    let g = program.register_script_function("g", 0, 1);
    let other = program.register_script_function("other", 0, 1);

    let mut unit = ResolvedUnit::new(None)
        .with_function(f, vec![global(shared, 1, 1, SourcePos::new(1, 1))])
        .with_function(g, vec![call(f, 2, 1)])
        .with_function(other, vec![]);
    let mut report = CompileReport::new();
    let mut analyzer = ThreadabilityAnalyzer::new();
    analyzer.register_unit(&mut program, &mut unit, &mut report).unwrap();
    // registering the same unit again is a no-op
    analyzer.register_unit(&mut program, &mut unit, &mut report).unwrap();

    let first = analyzer.iterate_final_graph(&mut program, &mut report).unwrap();
    assert_eq!(first.cleared, vec![g]);
    let before: Vec<bool> = program.functions().iter().map(|f| f.is_threadable()).collect();

    let second = analyzer.iterate_final_graph(&mut program, &mut report).unwrap();
    assert_eq!(second.passes, 1);
    assert!(second.cleared.is_empty());
    let after: Vec<bool> = program.functions().iter().map(|f| f.is_threadable()).collect();
    assert_eq!(before, after);
    assert_eq!(after, vec![false, false, true]);
    analyzer.finish();
}

/// Each call from a canasync function to a non-threadable one is reported at the call site, in
/// the caller's file.
#[test]
fn canasync_call_reports_every_offending_call_site() {
    let mut program = Program::new();
    let shared = program.add_global("shared", Constant::Int(0), GlobalKind::Mutable);
    let unsafe_fn = program.register_script_function("unsafe", 0, 1);
    let safe = program.register_script_function("safe", 0, 1);
    let entry = program.register_script_function("entry", 0, 1);
    program.set_canasync(entry, true).unwrap();

    let mut units = vec![
        ResolvedUnit::new(Some("lib.h64")).with_function(unsafe_fn, vec![global(shared, 4, 3, SourcePos::new(1, 1))]),
        ResolvedUnit::new(Some("app.h64")).with_function(
            entry,
            vec![call(safe, 12, 9), call(unsafe_fn, 13, 9), call(unsafe_fn, 15, 17)],
        ),
        ResolvedUnit::new(Some("lib2.h64")).with_function(safe, vec![]),
    ];
    let mut report = CompileReport::new();
    ThreadabilityAnalyzer::analyze(&mut program, &mut units, &mut report).unwrap();

    assert!(!threadable(&program, entry));
    assert!(threadable(&program, safe));
    let positions: Vec<_> = report
        .errors()
        .map(|d| (d.message.as_str(), d.file.as_deref(), d.pos))
        .collect();
    assert_eq!(
        positions,
        vec![
            (CALL_MSG, Some("app.h64"), Some(SourcePos::new(13, 9))),
            (CALL_MSG, Some("app.h64"), Some(SourcePos::new(15, 17))),
        ]
    );
}

/// Natives declare their own threadability; calling a non-threadable native is enough to clear
/// the caller.
#[test]
fn non_threadable_native_clears_callers() {
    fn noop(_call: &mut paddock::NativeCall<'_>) -> Result<paddock::NativeReturn, paddock::NativeError> {
        Ok(paddock::Object::None.into())
    }

    let mut program = Program::new();
    let print = program.register_native_function("print", "io.print", noop, 1, false);
    let sqrt = program.register_native_function("sqrt", "math.sqrt", noop, 1, true);
    let logs = program.register_script_function("logs", 0, 2);
    let maths = program.register_script_function("maths", 0, 2);

    let mut units = vec![
        ResolvedUnit::new(None)
            .with_function(logs, vec![call(print, 1, 1)])
            .with_function(maths, vec![call(sqrt, 2, 1)]),
    ];
    let mut report = CompileReport::new();
    ThreadabilityAnalyzer::analyze(&mut program, &mut units, &mut report).unwrap();

    assert!(!threadable(&program, logs));
    assert!(threadable(&program, maths));
}
