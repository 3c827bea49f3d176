//! The bytecode interpreter.
//!
//! A [`VmThread`] is one logical execution context: a value stack, function frames, rescue frames
//! and at most one outstanding suspension. It runs in slices: [`VmThread::run`] executes until the
//! thread returns, errors, suspends or yields, and hands a [`ThreadExit`] back to whoever drives it
//! (normally the [`VmExec`](crate::VmExec) supervisor, through a worker).
//!
//! # Module Structure
//!
//! - `frame` - function and rescue frames
//! - `suspend` - suspension/resume descriptors, async work and pipes
//! - `call` - calls, returns, natives and instance creation
//! - `exceptions` - raising, rescue frames and unwinding
//! - `binary` - binary and unary operators
//! - `attr` - attributes, indexing, containers and iterators

use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

pub use suspend::{
    AsyncWork, JobCompletion, PipeHandle, ResumeInfo, SpawnedJob, SuspendRequest, SuspendState, ThreadExit, Waker,
};
pub(crate) use suspend::{JobResume, SuspendInfo};

use self::{
    call::NativeReentry,
    frame::{FunctionFrame, ReturnTarget, RescueFrame},
};
use crate::{
    bytecode::{Instruction, jump_target},
    exception::{BuiltinClass, RunError, RunResult, ScriptError},
    exec::ExecCounters,
    heap::{Heap, HeapData, HeapStats},
    intern::{FuncId, GlobalId},
    object::Object,
    program::Program,
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

mod attr;
mod binary;
mod call;
mod exceptions;
mod frame;
mod suspend;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a VM thread within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum ThreadStatus {
    /// Nothing started, or runnable again after a yield or resume.
    Idle,
    Running,
    Suspended,
    Returned,
    Errored,
}

/// What a single dispatch step asks the run loop to do next.
#[derive(Debug)]
enum Step {
    Continue,
    /// A call pushed a frame or a loop jumped backwards; a yield may happen here.
    Boundary,
    Exit(ThreadExit),
}

/// One script-level execution context.
///
/// Only the main thread owns the program's global variables. Other threads may read globals that
/// are simple constants (their value is the compile-time literal) and may only call threadable
/// functions.
pub struct VmThread<T: ResourceTracker = NoLimitTracker, Tr: VmTracer = NoopTracer> {
    id: ThreadId,
    program: Arc<Program>,
    heap: Heap<T>,
    stack: Vec<Value>,
    frames: Vec<FunctionFrame>,
    rescue_frames: Vec<RescueFrame>,
    globals: Option<Vec<Value>>,
    status: ThreadStatus,
    suspend: SuspendInfo,
    resume: Option<ResumeInfo>,
    /// Async work a native handed off, kept until it completes so it can be aborted.
    foreground_work: Option<Box<dyn AsyncWork>>,
    pending_native: Option<NativeReentry>,
    /// Instructions per slice before yielding at a call boundary. 0 = never yield.
    slice_budget: usize,
    stop: Option<Arc<AtomicBool>>,
    counters: Arc<ExecCounters>,
    tracer: Tr,
}

impl<T: ResourceTracker, Tr: VmTracer> VmThread<T, Tr> {
    /// Creates the main thread, which owns the program's globals.
    pub fn new_main(program: Arc<Program>, tracker: T, tracer: Tr) -> Self {
        let globals = program
            .globals()
            .iter()
            .map(|global| Value::from_constant(global.initial()))
            .collect();
        let mut thread = Self::new(program, tracker, tracer);
        thread.globals = Some(globals);
        thread
    }

    /// Creates a thread without globals, for running threadable functions.
    pub fn new(program: Arc<Program>, tracker: T, tracer: Tr) -> Self {
        Self {
            id: ThreadId::next(),
            program,
            heap: Heap::new(tracker),
            stack: Vec::new(),
            frames: Vec::new(),
            rescue_frames: Vec::new(),
            globals: None,
            status: ThreadStatus::Idle,
            suspend: SuspendInfo::None,
            resume: None,
            foreground_work: None,
            pending_native: None,
            slice_budget: 0,
            stop: None,
            counters: Arc::default(),
            tracer,
        }
    }

    /// Yields after `budget` instructions, at the next call boundary. 0 disables yielding.
    #[must_use]
    pub fn with_slice_budget(mut self, budget: usize) -> Self {
        self.slice_budget = budget;
        self
    }

    /// Yields at the next boundary once `stop` is set.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub(crate) fn with_counters(mut self, counters: Arc<ExecCounters>) -> Self {
        self.counters = counters;
        self
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.globals.is_some()
    }

    #[must_use]
    pub fn suspend_state(&self) -> SuspendState {
        self.suspend.state()
    }

    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Current content of a global. Only the main thread holds globals.
    #[must_use]
    pub fn read_global(&self, global: GlobalId) -> Option<Object> {
        let value = self.globals.as_ref()?.get(global.index())?;
        value.export(&self.heap).ok()
    }

    /// Sets up a top-level call of `func`. The call runs on the next [`run`](Self::run).
    pub fn start_call(&mut self, func: FuncId, args: Vec<Object>) -> Result<(), ScriptError> {
        if !self.frames.is_empty() || self.pending_native.is_some() || self.status == ThreadStatus::Suspended {
            return Err(ScriptError::builtin(BuiltinClass::RuntimeError, "thread is busy"));
        }
        let program = Arc::clone(&self.program);
        let function = program
            .function(func)
            .ok_or_else(|| ScriptError::builtin(BuiltinClass::RuntimeError, format!("no function with id {func}")))?;
        if args.len() != usize::from(function.arg_count()) {
            return Err(call::arity_error(function, args.len()).into_script_error());
        }
        if !self.is_main() && !function.is_threadable() {
            return Err(call::not_threadable_error(function).into_script_error());
        }
        self.suspend = SuspendInfo::None;
        self.resume = None;
        self.status = ThreadStatus::Idle;
        if function.is_native() {
            self.pending_native = Some(NativeReentry {
                func,
                args,
                progress: vec![0; function.async_progress_size()],
                target: ReturnTarget::Root,
                resumed: None,
            });
            return Ok(());
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            match Value::import(arg, &mut self.heap) {
                Ok(value) => values.push(value),
                Err(err) => {
                    for value in &values {
                        self.heap.drop_temp(value);
                    }
                    return Err(err.into_script_error());
                }
            }
        }
        self.push_frame(func, values, ReturnTarget::Root)
            .map_err(RunError::into_script_error)
    }

    /// Runs one slice.
    pub fn run(&mut self) -> ThreadExit {
        if self.status == ThreadStatus::Suspended && self.resume.is_none() {
            return ThreadExit::Errored(ScriptError::builtin(
                BuiltinClass::RuntimeError,
                "thread is suspended and has nothing to resume with",
            ));
        }
        self.status = ThreadStatus::Running;
        let exit = self.run_slice();
        self.status = match &exit {
            ThreadExit::Returned(_) => ThreadStatus::Returned,
            ThreadExit::Errored(_) => ThreadStatus::Errored,
            ThreadExit::Suspended(_) => ThreadStatus::Suspended,
            ThreadExit::Yielded => ThreadStatus::Idle,
        };
        if matches!(exit, ThreadExit::Returned(_) | ThreadExit::Errored(_)) {
            self.wipe_frames();
        }
        exit
    }

    fn run_slice(&mut self) -> ThreadExit {
        if let Some(resume) = self.resume.take() {
            match self.apply_resume(resume) {
                Ok(Some(exit)) => return exit,
                Ok(None) => {}
                Err(err) => {
                    if let Some(exit) = self.handle_error(err) {
                        return exit;
                    }
                }
            }
        }
        if let Some(reentry) = self.pending_native.take() {
            match self.call_native(reentry) {
                Ok(Some(exit)) => return exit,
                Ok(None) => {}
                Err(err) => {
                    if let Some(exit) = self.handle_error(err) {
                        return exit;
                    }
                }
            }
        }
        if self.frames.is_empty() {
            return ThreadExit::Errored(ScriptError::builtin(BuiltinClass::RuntimeError, "thread has no call to run"));
        }

        let mut executed = 0usize;
        loop {
            executed += 1;
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Boundary) => {
                    if self.stop.as_ref().is_some_and(|stop| stop.load(Ordering::Relaxed)) {
                        return ThreadExit::Yielded;
                    }
                    if self.slice_budget > 0 && executed >= self.slice_budget {
                        self.counters.yields.fetch_add(1, Ordering::Relaxed);
                        return ThreadExit::Yielded;
                    }
                }
                Ok(Step::Exit(exit)) => return exit,
                Err(err) => {
                    if let Some(exit) = self.handle_error(err) {
                        return exit;
                    }
                }
            }
        }
    }

    /// Fetches, decodes and executes one instruction of the current frame.
    fn step(&mut self) -> RunResult<Step> {
        let depth = self.frames.len();
        let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("no frame to execute"))?;
        let func = frame.func;
        let offset = frame.ip;
        let (inst, size) = {
            let code = self
                .program
                .function(func)
                .and_then(|f| f.code())
                .ok_or_else(|| RunError::internal("frame function has no code"))?;
            if offset >= code.len() {
                return Err(RunError::runtime_error("execution ran past the end of the function"));
            }
            code.decode_at(offset)
                .map_err(|err| RunError::internal(format!("bad bytecode: {err}")))?
        };
        frame.current = Some(offset);
        frame.ip = offset + size;
        self.tracer.on_instruction(func, offset, inst.opcode(), depth);
        self.heap.tracker_mut().check_time()?;
        self.execute(inst)
    }

    fn execute(&mut self, inst: Instruction) -> RunResult<Step> {
        match inst {
            Instruction::SetConst { slot, constant } => {
                let value = {
                    let func = self.frame()?.func;
                    let constant = self
                        .program
                        .function(func)
                        .and_then(|f| f.code())
                        .and_then(|code| code.constant(constant))
                        .ok_or_else(|| RunError::internal("constant index out of range"))?;
                    Value::from_constant(constant)
                };
                self.set_slot(slot, value)?;
            }
            Instruction::SetGlobal { global, slot_from } => {
                let value = self.slot(slot_from)?.clone();
                self.set_global(global, value)?;
            }
            Instruction::GetGlobal { slot_to, global } => {
                let value = self.get_global(global)?;
                self.set_slot(slot_to, value)?;
            }
            Instruction::SetByIndexExpr {
                obj_slot,
                index_slot,
                value_slot,
            } => self.set_by_index(obj_slot, index_slot, value_slot)?,
            Instruction::SetByAttributeName {
                obj_slot,
                name,
                value_slot,
            } => self.set_attribute_by_name(obj_slot, name, value_slot)?,
            Instruction::SetByAttributeIdx {
                obj_slot,
                attr,
                value_slot,
            } => self.set_attribute_by_idx(obj_slot, attr, value_slot)?,
            Instruction::GetFunc { slot_to, func } => self.set_slot(slot_to, Value::Func(func))?,
            Instruction::GetClass { slot_to, class } => self.set_slot(slot_to, Value::Class(class))?,
            Instruction::ValueCopy { slot_to, slot_from } => {
                let value = self.slot(slot_from)?.clone();
                self.set_slot(slot_to, value)?;
            }
            Instruction::BinOp { op, slot_to, lhs, rhs } => {
                let value = self.binary_op(op, lhs, rhs)?;
                self.set_slot(slot_to, value)?;
            }
            Instruction::UnOp { op, slot_to, operand } => {
                let value = self.unary_op(op, operand)?;
                self.set_slot(slot_to, value)?;
            }
            Instruction::Call {
                return_to,
                callee,
                args_start,
                posargs,
                flags,
            } => return self.exec_call(return_to, callee, args_start, posargs, flags, false),
            Instruction::CallIgnoreIfNone {
                return_to,
                callee,
                args_start,
                posargs,
                flags,
            } => return self.exec_call(return_to, callee, args_start, posargs, flags, true),
            Instruction::ReturnValue { slot } => return self.exec_return(slot),
            Instruction::CondJump { offset, cond_slot } => {
                if !self.condition(cond_slot, false)? {
                    return self.jump(offset);
                }
            }
            Instruction::CondJumpEx {
                flags,
                offset,
                cond_slot,
            } => {
                let no_type_error = flags.contains(crate::bytecode::CondJumpFlags::NO_TYPE_ERROR);
                let jump_on = flags.contains(crate::bytecode::CondJumpFlags::JUMP_ON_TRUE);
                if self.condition(cond_slot, no_type_error)? == jump_on {
                    return self.jump(offset);
                }
            }
            Instruction::Jump { offset } => return self.jump(offset),
            Instruction::NewIterator { slot_to, container_slot } => self.new_iterator(slot_to, container_slot)?,
            Instruction::Iterate {
                value_to,
                iter_slot,
                jump_on_end,
            } => {
                if !self.iterate(value_to, iter_slot)? {
                    return self.jump(jump_on_end);
                }
            }
            Instruction::PushRescueFrame {
                mode,
                error_slot,
                catch_offset,
                finally_offset,
                frame_id,
            } => self.push_rescue_frame(mode, error_slot, catch_offset, finally_offset, frame_id)?,
            Instruction::AddRescueTypeByRef { slot, frame_id } => self.add_rescue_type_by_ref(slot, frame_id)?,
            Instruction::AddRescueType { class, frame_id } => self.add_rescue_type(class, frame_id)?,
            Instruction::PopRescueFrame { frame_id } => return self.pop_rescue_frame(frame_id),
            Instruction::JumpToFinally { frame_id } => self.jump_to_finally(frame_id)?,
            Instruction::GetAttributeByName { slot_to, obj_slot, name } => {
                let obj = self.slot(obj_slot)?.clone();
                let value = self.get_attribute_by_name(&obj, name)?;
                self.set_slot(slot_to, value)?;
            }
            Instruction::GetAttributeByIdx { slot_to, obj_slot, attr } => {
                let obj = self.slot(obj_slot)?.clone();
                let value = self.get_attribute_by_idx(&obj, attr)?;
                self.set_slot(slot_to, value)?;
            }
            Instruction::NewList { slot_to } => {
                let id = self.heap.allocate(HeapData::List(Vec::new()))?;
                self.set_slot(slot_to, Value::Ref(id))?;
            }
            Instruction::NewSet { slot_to } => {
                let id = self.heap.allocate(HeapData::Set(crate::heap::ValueSet::default()))?;
                self.set_slot(slot_to, Value::Ref(id))?;
            }
            Instruction::NewMap { slot_to } => {
                let id = self.heap.allocate(HeapData::Map(crate::heap::ValueMap::default()))?;
                self.set_slot(slot_to, Value::Ref(id))?;
            }
            Instruction::NewVector { slot_to } => {
                let id = self.heap.allocate(HeapData::Vector(Vec::new()))?;
                self.set_slot(slot_to, Value::Ref(id))?;
            }
            Instruction::NewInstance { slot_to, class } => return self.new_instance(slot_to, class),
            Instruction::NewInstanceByRef { slot_to, class_slot } => {
                let Value::Class(class) = *self.slot(class_slot)? else {
                    return Err(RunError::type_error("new instance needs a class"));
                };
                return self.new_instance(slot_to, class);
            }
            Instruction::GetConstructor { slot_to, obj_slot } => {
                let obj = self.slot(obj_slot)?.clone();
                let class = self.get_constructor(&obj)?;
                self.set_slot(slot_to, class)?;
            }
            Instruction::AwaitItem { slot_to, pipe_slot } => return self.await_item(slot_to, pipe_slot),
            Instruction::CreatePipe { slot_to } => self.set_slot(slot_to, Value::Pipe(PipeHandle::new()))?,
            Instruction::HasAttrJump {
                offset,
                value_slot,
                name,
            } => {
                let value = self.slot(value_slot)?.clone();
                if !self.has_attribute(&value, name) {
                    return self.jump(offset);
                }
            }
            Instruction::Raise { class, msg_slot } => return Err(self.raise(class, msg_slot)),
            Instruction::RaiseByRef { class_slot, msg_slot } => {
                let class = self.slot(class_slot)?.clone();
                return Err(match class {
                    Value::Class(class) => self.raise(class, msg_slot),
                    Value::Error(err) => RunError::Exc(Box::new((*err).clone())),
                    other => RunError::type_error(format!(
                        "can only raise an error class or error, not {}",
                        other.type_name(&self.heap)
                    )),
                });
            }
        }
        Ok(Step::Continue)
    }

    // ---- slots, globals, jumps ----

    fn frame(&self) -> RunResult<&FunctionFrame> {
        self.frames.last().ok_or_else(|| RunError::internal("no current frame"))
    }

    fn frame_mut(&mut self) -> RunResult<&mut FunctionFrame> {
        self.frames.last_mut().ok_or_else(|| RunError::internal("no current frame"))
    }

    fn slot_index(&self, slot: u16) -> RunResult<usize> {
        let frame = self.frame()?;
        if usize::from(slot) < frame.slot_count {
            Ok(frame.stack_floor + usize::from(slot))
        } else {
            Err(RunError::internal(format!("slot {slot} out of range")))
        }
    }

    fn slot(&self, slot: u16) -> RunResult<&Value> {
        let index = self.slot_index(slot)?;
        Ok(&self.stack[index])
    }

    /// Stores `value` into a slot of the current frame, counting the new reference first.
    fn set_slot(&mut self, slot: u16, value: Value) -> RunResult<()> {
        let index = self.slot_index(slot)?;
        self.heap.retain(&value);
        let old = mem::replace(&mut self.stack[index], value);
        self.heap.release(&old);
        Ok(())
    }

    fn set_global(&mut self, global: GlobalId, value: Value) -> RunResult<()> {
        let Some(globals) = self.globals.as_mut() else {
            return Err(RunError::runtime_error("global variables can only be assigned on the main thread"));
        };
        let slot = globals
            .get_mut(global.index())
            .ok_or_else(|| RunError::internal("global index out of range"))?;
        self.heap.retain(&value);
        let old = mem::replace(slot, value);
        self.heap.release(&old);
        Ok(())
    }

    fn get_global(&self, global: GlobalId) -> RunResult<Value> {
        if let Some(globals) = &self.globals {
            return globals
                .get(global.index())
                .cloned()
                .ok_or_else(|| RunError::internal("global index out of range"));
        }
        let var = self
            .program
            .global(global)
            .ok_or_else(|| RunError::internal("global index out of range"))?;
        if var.is_thread_safe() {
            Ok(Value::from_constant(var.initial()))
        } else {
            Err(RunError::runtime_error(format!(
                "global `{}` is not a simple constant and cannot be read off the main thread",
                var.name()
            )))
        }
    }

    fn condition(&self, slot: u16, no_type_error: bool) -> RunResult<bool> {
        match self.slot(slot)? {
            Value::Bool(b) => Ok(*b),
            _ if no_type_error => Ok(false),
            other => Err(RunError::type_error(format!(
                "condition must be a bool, not {}",
                other.type_name(&self.heap)
            ))),
        }
    }

    /// Resolves a jump operand of the current instruction to an absolute offset.
    fn resolve_jump(&self, offset: i16) -> RunResult<usize> {
        let frame = self.frame()?;
        let len = self
            .program
            .function(frame.func)
            .and_then(|f| f.code())
            .map_or(0, crate::bytecode::Code::len);
        let at = frame.current.unwrap_or(frame.ip);
        jump_target(at, offset, len).ok_or_else(|| RunError::internal("jump out of range"))
    }

    /// Jumps relative to the start of the current instruction.
    fn jump(&mut self, offset: i16) -> RunResult<Step> {
        let target = self.resolve_jump(offset)?;
        self.frame_mut()?.ip = target;
        Ok(if offset < 0 { Step::Boundary } else { Step::Continue })
    }

    /// Pops the current function frame and releases its slots and rescue frames.
    fn pop_frame(&mut self) -> Option<FunctionFrame> {
        let frame = self.frames.pop()?;
        for value in self.stack.split_off(frame.stack_floor) {
            self.heap.release(&value);
        }
        for rescue in self.rescue_frames.split_off(frame.rescue_floor) {
            self.discard_rescue_frame(rescue);
        }
        Some(frame)
    }

    fn wipe_frames(&mut self) {
        while self.pop_frame().is_some() {}
        self.rescue_frames.clear();
    }

    // ---- suspension ----

    pub(crate) fn set_suspend_state(&mut self, info: SuspendInfo) {
        self.tracer.on_suspend(info.state());
        self.suspend = info;
    }

    /// Hands a suspended thread what it waited for. Returns `false` if the thread is not waiting
    /// for that kind of resume or already has resume information pending.
    pub fn resume_with(&mut self, info: ResumeInfo) -> bool {
        let accepted = self.resume.is_none()
            && matches!(
                (&self.suspend, &info),
                (SuspendInfo::AwaitingItem { .. }, ResumeInfo::ItemReady)
                    | (SuspendInfo::AwaitingJob { .. }, ResumeInfo::JobDone(_))
            );
        if !accepted {
            return false;
        }
        if matches!(info, ResumeInfo::JobDone(_)) {
            self.foreground_work = None;
        }
        self.resume = Some(info);
        self.status = ThreadStatus::Idle;
        true
    }

    fn apply_resume(&mut self, resume: ResumeInfo) -> RunResult<Option<ThreadExit>> {
        match (mem::take(&mut self.suspend), resume) {
            (SuspendInfo::AwaitingJob { target, resume }, ResumeInfo::JobDone(result)) => match resume {
                JobResume::StoreResult => match result {
                    Ok(obj) => self.deliver_object(target, obj),
                    Err(mut err) => {
                        // the trace continues at the await site of this thread
                        err.located = false;
                        Err(RunError::Exc(Box::new(err)))
                    }
                },
                JobResume::ReenterNative { func, args, progress } => {
                    self.pending_native = Some(NativeReentry {
                        func,
                        args,
                        progress,
                        target,
                        resumed: Some(result),
                    });
                    Ok(None)
                }
            },
            // the await instruction runs again and re-checks the pipe
            (SuspendInfo::AwaitingItem { .. } | SuspendInfo::None, _) => Ok(None),
            (SuspendInfo::AwaitingJob { .. }, ResumeInfo::ItemReady) => Err(RunError::internal("item resume for a job wait")),
        }
    }

    /// Starts the async work a native suspended on. `done` fires once it completes.
    ///
    /// Returns `false` if there is no pending work.
    pub fn start_foreground_work(&mut self, done: JobCompletion) -> bool {
        match self.foreground_work.as_mut() {
            Some(work) => {
                work.start(done);
                true
            }
            None => false,
        }
    }

    /// Aborts pending async work. A thread waiting on it resumes with an `AbortedError`.
    ///
    /// Returns `false` if there was nothing to abort.
    pub fn abort_async_foreground_work(&mut self) -> bool {
        let Some(mut work) = self.foreground_work.take() else {
            return false;
        };
        work.abort();
        tracing::warn!(thread = %self.id, "aborted pending async work");
        if matches!(self.suspend, SuspendInfo::AwaitingJob { .. }) && self.resume.is_none() {
            self.resume = Some(ResumeInfo::JobDone(Err(ScriptError::builtin(
                BuiltinClass::AbortedError,
                "async work was aborted",
            ))));
            self.status = ThreadStatus::Idle;
        }
        true
    }

    /// Drops every frame and any suspension, aborting pending async work first.
    pub fn wipe_func_stack(&mut self) {
        self.abort_async_foreground_work();
        self.wipe_frames();
        self.pending_native = None;
        self.suspend = SuspendInfo::None;
        self.resume = None;
        self.status = ThreadStatus::Idle;
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Drop for VmThread<T, Tr> {
    fn drop(&mut self) {
        self.abort_async_foreground_work();
    }
}

impl<T: ResourceTracker, Tr: VmTracer> fmt::Debug for VmThread<T, Tr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("suspend", &self.suspend.state())
            .field("frames", &self.frames.len())
            .field("rescue_frames", &self.rescue_frames.len())
            .field("stack", &self.stack.len())
            .field("main", &self.is_main())
            .finish_non_exhaustive()
    }
}
