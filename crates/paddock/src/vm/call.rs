//! Call helpers for the VM.
//!
//! Entry points are `exec_call` and `exec_return`, called from the dispatch loop, and
//! `call_native`, which the run loop also uses to re-enter a native after its async work finished.

use std::sync::{Arc, atomic::Ordering};

use super::{
    JobResume, Step, SuspendInfo, SuspendRequest, ThreadExit, VmThread,
    frame::{FunctionFrame, ReturnTarget},
};
use crate::{
    bytecode::CallFlags,
    exception::{RunError, RunResult, ScriptError},
    heap::HeapData,
    intern::{BuiltinName, ClassId, FuncId},
    native::{NativeCall, NativeReturn},
    object::Object,
    program::Function,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// A native call that has not run yet, or is waiting to be re-entered after its async work.
#[derive(Debug)]
pub(super) struct NativeReentry {
    pub func: FuncId,
    pub args: Vec<Object>,
    pub progress: Vec<u8>,
    pub target: ReturnTarget,
    pub resumed: Option<Result<Object, ScriptError>>,
}

pub(super) fn arity_error(function: &Function, given: usize) -> RunError {
    RunError::type_error(format!(
        "`{}` takes {} positional argument(s) but {given} were given",
        function.name(),
        function.arg_count()
    ))
}

pub(super) fn not_threadable_error(function: &Function) -> RunError {
    RunError::runtime_error(format!(
        "`{}` is not threadable and can only run on the main thread",
        function.name()
    ))
}

impl<T: ResourceTracker, Tr: VmTracer> VmThread<T, Tr> {
    /// Executes `Call` and `CallIgnoreIfNone`.
    ///
    /// Arguments are retained for the duration of the call setup, since storing the result of a
    /// class instantiation may overwrite the slots they came from.
    pub(super) fn exec_call(
        &mut self,
        return_to: u16,
        callee: u16,
        args_start: u16,
        posargs: u16,
        flags: CallFlags,
        ignore_none: bool,
    ) -> RunResult<Step> {
        let callee = self.slot(callee)?.clone();
        if ignore_none && matches!(callee, Value::None) {
            self.set_slot(return_to, Value::None)?;
            return Ok(Step::Continue);
        }

        let mut args = Vec::with_capacity(usize::from(posargs));
        for i in 0..posargs {
            let slot = args_start
                .checked_add(i)
                .ok_or_else(|| RunError::internal("argument slot overflow"))?;
            args.push(self.slot(slot)?.clone());
        }
        if flags.contains(CallFlags::UNPACK_LAST_POSARG) {
            let last = args
                .pop()
                .ok_or_else(|| RunError::type_error("nothing to unpack into the call"))?;
            let items = match &last {
                Value::Ref(id) => match self.heap.get(*id) {
                    HeapData::List(items) => Some(items),
                    _ => None,
                },
                _ => None,
            };
            let Some(items) = items else {
                return Err(RunError::type_error(format!(
                    "can only unpack a list into call arguments, not {}",
                    last.type_name(&self.heap)
                )));
            };
            args.extend(items.iter().cloned());
        }

        for arg in &args {
            self.heap.retain(arg);
        }
        let is_async = flags.contains(CallFlags::ASYNC);
        let result = self.dispatch_call(&callee, &args, return_to, is_async);
        for arg in &args {
            self.heap.release(arg);
        }
        result
    }

    fn dispatch_call(&mut self, callee: &Value, args: &[Value], return_to: u16, is_async: bool) -> RunResult<Step> {
        match callee {
            Value::Func(func) => self.call_function(*func, args, ReturnTarget::Slot(return_to), is_async),
            Value::Class(class) => self.instantiate(*class, Some(args), return_to),
            Value::Ref(id) => {
                let HeapData::BoundMethod { func, receiver } = self.heap.get(*id) else {
                    return Err(RunError::type_error(format!(
                        "{} is not callable",
                        callee.type_name(&self.heap)
                    )));
                };
                let func = *func;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver.clone());
                full.extend_from_slice(args);
                self.call_function(func, &full, ReturnTarget::Slot(return_to), is_async)
            }
            other => Err(RunError::type_error(format!(
                "{} is not callable",
                other.type_name(&self.heap)
            ))),
        }
    }

    /// Calls a function with arguments that are alive for the duration of the call.
    fn call_function(&mut self, func: FuncId, args: &[Value], target: ReturnTarget, is_async: bool) -> RunResult<Step> {
        let program = Arc::clone(&self.program);
        let function = program
            .function(func)
            .ok_or_else(|| RunError::internal(format!("no function with id {func}")))?;
        if args.len() != usize::from(function.arg_count()) {
            return Err(arity_error(function, args.len()));
        }

        if is_async {
            if function.is_threadable() {
                let args = self.export_args(args)?;
                self.set_suspend_state(SuspendInfo::AwaitingJob {
                    target,
                    resume: JobResume::StoreResult,
                });
                return Ok(Step::Exit(ThreadExit::Suspended(SuspendRequest::AsyncCall { func, args })));
            }
            // non-threadable code never leaves the calling thread
            self.counters.inline_async_calls.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(thread = %self.id, function = function.name(), "async call to non-threadable function runs inline");
        }
        if !self.is_main() && !function.is_threadable() {
            return Err(not_threadable_error(function));
        }

        if function.is_native() {
            let reentry = NativeReentry {
                func,
                args: self.export_args(args)?,
                progress: vec![0; function.async_progress_size()],
                target,
                resumed: None,
            };
            return Ok(match self.call_native(reentry)? {
                Some(exit) => Step::Exit(exit),
                None => Step::Continue,
            });
        }
        self.push_frame(func, args.to_vec(), target)?;
        Ok(Step::Boundary)
    }

    fn export_args(&self, args: &[Value]) -> RunResult<Vec<Object>> {
        args.iter().map(|arg| arg.export(&self.heap)).collect()
    }

    /// Pushes a frame for a script function. `args` become its first slots.
    pub(super) fn push_frame(&mut self, func: FuncId, args: Vec<Value>, target: ReturnTarget) -> RunResult<()> {
        let program = Arc::clone(&self.program);
        let function = program
            .function(func)
            .ok_or_else(|| RunError::internal(format!("no function with id {func}")))?;
        if function.code().is_none() {
            return Err(RunError::runtime_error(format!("function `{}` has no code", function.name())));
        }
        self.heap.tracker().check_recursion_depth(self.frames.len())?;
        let slot_count = function.slot_count();
        let stack_floor = self.stack.len();
        self.heap.tracker().check_stack_slots(stack_floor + slot_count)?;

        self.stack.resize(stack_floor + slot_count, Value::None);
        for (i, arg) in args.into_iter().enumerate() {
            self.heap.retain(&arg);
            self.stack[stack_floor + i] = arg;
        }
        self.frames.push(FunctionFrame {
            func,
            stack_floor,
            slot_count,
            return_target: target,
            rescue_floor: self.rescue_frames.len(),
            ip: 0,
            current: None,
        });
        self.tracer.on_call(func, function.name(), self.frames.len());
        Ok(())
    }

    /// Runs a native, or re-enters it with the result of its async work.
    pub(super) fn call_native(&mut self, reentry: NativeReentry) -> RunResult<Option<ThreadExit>> {
        let NativeReentry {
            func,
            args,
            mut progress,
            target,
            resumed,
        } = reentry;
        let program = Arc::clone(&self.program);
        let function = program
            .function(func)
            .ok_or_else(|| RunError::internal(format!("no function with id {func}")))?;
        let entry = function
            .native_entry()
            .ok_or_else(|| RunError::runtime_error(format!("native `{}` has no entry point", function.name())))?;

        let outcome = {
            let mut call = NativeCall::new(&program, &args, &mut progress, resumed);
            entry(&mut call)
        };
        match outcome {
            Ok(NativeReturn::Value(obj)) => self.deliver_object(target, obj),
            Ok(NativeReturn::Suspend(work)) => {
                self.foreground_work = Some(work);
                self.set_suspend_state(SuspendInfo::AwaitingJob {
                    target,
                    resume: JobResume::ReenterNative { func, args, progress },
                });
                Ok(Some(ThreadExit::Suspended(SuspendRequest::AsyncWork)))
            }
            Err(err) => Err(RunError::Exc(Box::new(err.into()))),
        }
    }

    /// Executes `ReturnValue`.
    pub(super) fn exec_return(&mut self, slot: u16) -> RunResult<Step> {
        let value = self.slot(slot)?.clone();
        // keep the value alive across finally blocks and the frame pop
        self.heap.retain(&value);
        self.return_counted(value)
    }

    /// Returns a counted `value` from the current frame, unless a finally block has to run first.
    pub(super) fn return_counted(&mut self, value: Value) -> RunResult<Step> {
        let Some(value) = self.defer_return_to_finally(value)? else {
            return Ok(Step::Continue);
        };
        let frame = self.pop_frame().ok_or_else(|| RunError::internal("return without a frame"))?;
        self.tracer.on_return(self.frames.len());
        let delivered = self.deliver(frame.return_target, value.clone());
        self.heap.release(&value);
        Ok(match delivered? {
            Some(exit) => Step::Exit(exit),
            None => Step::Boundary,
        })
    }

    /// Hands a call result to its target. `value` may be uncounted.
    fn deliver(&mut self, target: ReturnTarget, value: Value) -> RunResult<Option<ThreadExit>> {
        match target {
            ReturnTarget::Slot(slot) => {
                self.set_slot(slot, value)?;
                Ok(None)
            }
            ReturnTarget::Root => {
                let result = value.export(&self.heap);
                self.heap.drop_temp(&value);
                Ok(Some(ThreadExit::Returned(result?)))
            }
            ReturnTarget::Discard => {
                self.heap.drop_temp(&value);
                Ok(None)
            }
        }
    }

    /// Hands a result that arrived from outside the thread to its target.
    pub(super) fn deliver_object(&mut self, target: ReturnTarget, obj: Object) -> RunResult<Option<ThreadExit>> {
        match target {
            ReturnTarget::Root => Ok(Some(ThreadExit::Returned(obj))),
            ReturnTarget::Discard => Ok(None),
            ReturnTarget::Slot(slot) => {
                let value = Value::import(&obj, &mut self.heap)?;
                self.set_slot(slot, value)?;
                Ok(None)
            }
        }
    }

    /// Executes `NewInstance` and `NewInstanceByRef`: allocation plus variable initializer.
    pub(super) fn new_instance(&mut self, slot_to: u16, class: ClassId) -> RunResult<Step> {
        self.instantiate(class, None, slot_to)
    }

    /// Creates an instance of `class` in `slot_to`.
    ///
    /// With `init_args`, the class's `init` method is called with them afterwards. The variable
    /// initializer frame is pushed last so it runs before `init`.
    fn instantiate(&mut self, class: ClassId, init_args: Option<&[Value]>, slot_to: u16) -> RunResult<Step> {
        let program = Arc::clone(&self.program);
        let class_def = program
            .class(class)
            .ok_or_else(|| RunError::internal(format!("no class with id {class}")))?;
        let init = init_args.and(
            program
                .class_attribute(class, BuiltinName::Init.name_id())
                .and_then(|attr| class_def.method(attr)),
        );
        if let Some(args) = init_args
            && init.is_none()
            && !args.is_empty()
        {
            return Err(RunError::type_error(format!(
                "`{}` takes no arguments without an init method",
                class_def.name()
            )));
        }

        let id = self.heap.allocate(HeapData::Instance {
            class,
            attrs: vec![Value::None; class_def.var_attrs().len()],
        })?;
        let instance = Value::Ref(id);
        self.set_slot(slot_to, instance.clone())?;

        let mut step = Step::Continue;
        if let (Some(init), Some(args)) = (init, init_args) {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(instance.clone());
            full.extend_from_slice(args);
            step = self.call_function(init, &full, ReturnTarget::Discard, false)?;
            if let Step::Exit(_) = step {
                return Ok(step);
            }
        }
        if let Some(varinit) = class_def.varinit() {
            self.push_frame(varinit, vec![instance], ReturnTarget::Discard)?;
            step = Step::Boundary;
        }
        Ok(step)
    }
}
