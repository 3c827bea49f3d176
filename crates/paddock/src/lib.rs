#![doc = include_str!("../../../README.md")]
mod heap;

pub mod bytecode;
mod diagnostic;
mod exception;
mod exec;
mod intern;
mod native;
mod object;
mod program;
mod resource;
pub mod threadable;
pub mod tracer;
mod value;
mod vm;
mod worker;

pub use crate::{
    bytecode::{
        BinOpKind, CallFlags, Code, CodeBuilder, CodeError, CondJumpFlags, Constant, DecodeError, Instruction,
        JumpLabel, Opcode, RescueMode, UnOpKind,
    },
    diagnostic::{CompileReport, Diagnostic, Severity, SourcePos},
    exception::{BuiltinClass, MAX_ERROR_STACK_FRAMES, ScriptError, TraceEntry},
    exec::{ExecConfig, ExecError, ExecOutcome, ExecStats, StopHandle, VmExec},
    heap::HeapStats,
    intern::{BuiltinName, ClassId, FuncId, GlobalId, Interns, NameId},
    native::{NativeCall, NativeError, NativeFn, NativeRegistry, NativeReturn},
    object::Object,
    program::{
        AttrIdx, BytecodeStats, Class, Function, FunctionKind, GlobalKind, GlobalVar, METHOD_OFFSET, MethodAttr,
        Program, ProgramError, VarAttr, VarAttrFlags, WellKnownFuncs,
    },
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, MAX_DATA_RECURSION_DEPTH, NoLimitTracker, ResourceError,
        ResourceLimits, ResourceTracker,
    },
    threadable::{
        AnalysisAborted, FixpointSummary, FunctionNode, IdentifierRef, ResolvedUnit, StorageRef,
        ThreadabilityAnalyzer,
    },
    tracer::{NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    vm::{
        AsyncWork, JobCompletion, PipeHandle, ResumeInfo, SpawnedJob, SuspendRequest, SuspendState, ThreadExit,
        ThreadId, ThreadStatus, VmThread, Waker,
    },
};
