//! Error handling helpers for the VM.

use std::sync::Arc;

use super::{
    Step, ThreadExit, VmThread,
    frame::{RescueFrame, ReturnTarget},
};
use crate::{
    bytecode::RescueMode,
    exception::{RunError, RunResult, ScriptError, TraceEntry},
    intern::ClassId,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> VmThread<T, Tr> {
    /// Routes an error to the innermost rescue frame that takes it, unwinding function frames
    /// until one does.
    ///
    /// Returns `None` when execution continues at a catch or finally target, or the exit of the
    /// thread when the error left the top-level call. Uncatchable errors skip catch blocks but
    /// still run pending finally blocks; internal errors skip every handler.
    pub(super) fn handle_error(&mut self, err: RunError) -> Option<ThreadExit> {
        let (mut error, handling) = match err {
            RunError::Exc(error) => (*error, Some(true)),
            RunError::UncatchableExc(error) => (*error, Some(false)),
            internal @ RunError::Internal(_) => {
                tracing::error!(thread = %self.id, error = ?internal, "internal VM error");
                (internal.into_script_error(), None)
            }
        };
        if !error.located {
            if let Some(frame) = self.frames.last() {
                error.push_trace(TraceEntry {
                    func: frame.func,
                    offset: frame.current.unwrap_or(0),
                });
            }
            error.located = true;
        }

        loop {
            let Some(rescue_floor) = self.frames.last().map(|frame| frame.rescue_floor) else {
                return Some(ThreadExit::Errored(error));
            };
            if let Some(catchable) = handling {
                match self.rescue_in_frame(error, rescue_floor, catchable) {
                    Ok(()) => return None,
                    Err(unhandled) => error = unhandled,
                }
            }

            let Some(frame) = self.pop_frame() else {
                return Some(ThreadExit::Errored(error));
            };
            if frame.return_target == ReturnTarget::Root {
                return Some(ThreadExit::Errored(error));
            }
            let Some(caller) = self.frames.last() else {
                return Some(ThreadExit::Errored(error));
            };
            error.push_trace(TraceEntry {
                func: caller.func,
                offset: caller.current.unwrap_or(0),
            });
        }
    }

    /// Offers `error` to the rescue frames of the current function frame, innermost first.
    ///
    /// Frames that neither catch it nor have a pending finally are popped. Hands the error back
    /// if no frame took it. An error that is not `catchable` only stops at finally blocks.
    fn rescue_in_frame(&mut self, error: ScriptError, rescue_floor: usize, catchable: bool) -> Result<(), ScriptError> {
        let class = error.class();
        while self.rescue_frames.len() > rescue_floor {
            let program = Arc::clone(&self.program);
            let Some(rescue) = self.rescue_frames.last_mut() else {
                break;
            };
            if catchable
                && rescue.can_catch(&program, class)
                && let Some(target) = rescue.catch_target
            {
                rescue.triggered_catch = true;
                let error_slot = rescue.error_slot;
                self.tracer.on_raise(class, true);
                if let Some(slot) = error_slot
                    && let Err(err) = self.set_slot(slot, Value::Error(Arc::new(error.clone())))
                {
                    return Err(err.into_script_error());
                }
                return self.set_ip(target).map_err(|_| error);
            }
            if rescue.finally_pending()
                && let Some(target) = rescue.finally_target
            {
                rescue.triggered_finally = true;
                let delayed = Box::new(error.clone());
                rescue.delayed_error = Some(if catchable {
                    RunError::Exc(delayed)
                } else {
                    RunError::UncatchableExc(delayed)
                });
                self.tracer.on_raise(class, false);
                return self.set_ip(target).map_err(|_| error);
            }
            if let Some(popped) = self.rescue_frames.pop() {
                self.tracer.on_rescue_pop(popped.frame_id, self.frames.len());
                self.discard_rescue_frame(popped);
            }
        }
        Err(error)
    }

    /// Releases what a rescue frame that is being dropped still holds.
    pub(super) fn discard_rescue_frame(&mut self, rescue: RescueFrame) {
        if let Some(value) = rescue.pending_return {
            self.heap.release(&value);
        }
    }

    /// Holds a return back for the innermost pending finally block of the current function frame.
    ///
    /// `value` must be counted. Rescue frames inside that one are dropped. Hands the value back
    /// if no finally block is pending, in which case the return goes ahead.
    pub(super) fn defer_return_to_finally(&mut self, value: Value) -> RunResult<Option<Value>> {
        let floor = self.frame()?.rescue_floor;
        let Some(index) = self
            .rescue_frames
            .get(floor..)
            .and_then(|frames| frames.iter().rposition(RescueFrame::finally_pending))
            .map(|index| floor + index)
        else {
            return Ok(Some(value));
        };
        for inner in self.rescue_frames.split_off(index + 1).into_iter().rev() {
            self.tracer.on_rescue_pop(inner.frame_id, self.frames.len());
            self.discard_rescue_frame(inner);
        }
        let rescue = &mut self.rescue_frames[index];
        let Some(target) = rescue.finally_target else {
            return Ok(Some(value));
        };
        rescue.triggered_finally = true;
        rescue.pending_return = Some(value);
        self.set_ip(target)?;
        Ok(None)
    }

    fn set_ip(&mut self, target: usize) -> RunResult<()> {
        self.frame_mut()?.ip = target;
        Ok(())
    }

    /// The innermost rescue frame of the current function frame, which must have id `frame_id`.
    fn rescue_frame_mut(&mut self, frame_id: u16) -> RunResult<&mut RescueFrame> {
        let floor = self.frame()?.rescue_floor;
        if self.rescue_frames.len() <= floor {
            return Err(RunError::internal(format!("no rescue frame {frame_id} in this function")));
        }
        match self.rescue_frames.last_mut() {
            Some(rescue) if rescue.frame_id == frame_id => Ok(rescue),
            Some(rescue) => Err(RunError::internal(format!(
                "rescue frame mismatch: expected {frame_id}, innermost is {}",
                rescue.frame_id
            ))),
            None => Err(RunError::internal("no rescue frame")),
        }
    }

    pub(super) fn push_rescue_frame(
        &mut self,
        mode: RescueMode,
        error_slot: Option<u16>,
        catch_offset: i16,
        finally_offset: i16,
        frame_id: u16,
    ) -> RunResult<()> {
        let catch_target = if mode.contains(RescueMode::JUMP_ON_RESCUE) {
            Some(self.resolve_jump(catch_offset)?)
        } else {
            None
        };
        let finally_target = if mode.contains(RescueMode::JUMP_ON_FINALLY) {
            Some(self.resolve_jump(finally_offset)?)
        } else {
            None
        };
        if let Some(slot) = error_slot {
            self.slot_index(slot)?;
        }
        self.rescue_frames
            .push(RescueFrame::new(frame_id, catch_target, finally_target, error_slot));
        self.tracer.on_rescue_push(frame_id, self.frames.len());
        Ok(())
    }

    pub(super) fn add_rescue_type(&mut self, class: ClassId, frame_id: u16) -> RunResult<()> {
        if !self.program.is_error_class(class) {
            return Err(RunError::type_error(format!("class {class} is not an error class")));
        }
        self.rescue_frame_mut(frame_id)?.add_type(class);
        Ok(())
    }

    pub(super) fn add_rescue_type_by_ref(&mut self, slot: u16, frame_id: u16) -> RunResult<()> {
        match self.slot(slot)?.clone() {
            Value::Class(class) => self.add_rescue_type(class, frame_id),
            other => Err(RunError::type_error(format!(
                "can only rescue error classes, not {}",
                other.type_name(&self.heap)
            ))),
        }
    }

    /// Ends a protected region: runs a pending finally block first, then drops the frame and
    /// re-raises an error or completes a return that was held back for the finally block.
    pub(super) fn pop_rescue_frame(&mut self, frame_id: u16) -> RunResult<Step> {
        let rescue = self.rescue_frame_mut(frame_id)?;
        if rescue.finally_pending()
            && let Some(target) = rescue.finally_target
        {
            rescue.triggered_finally = true;
            self.set_ip(target)?;
            return Ok(Step::Continue);
        }
        let Some(mut rescue) = self.rescue_frames.pop() else {
            return Err(RunError::internal("no rescue frame to pop"));
        };
        self.tracer.on_rescue_pop(frame_id, self.frames.len());
        if let Some(error) = rescue.delayed_error.take() {
            self.discard_rescue_frame(rescue);
            return Err(error);
        }
        match rescue.pending_return {
            Some(value) => self.return_counted(value),
            None => Ok(Step::Continue),
        }
    }

    /// Leaves a catch block early: jumps to the finally block if it did not run yet.
    pub(super) fn jump_to_finally(&mut self, frame_id: u16) -> RunResult<()> {
        let rescue = self.rescue_frame_mut(frame_id)?;
        if rescue.finally_pending()
            && let Some(target) = rescue.finally_target
        {
            rescue.triggered_finally = true;
            self.set_ip(target)?;
        }
        Ok(())
    }

    /// Builds the error for `Raise`: an instance of `class` with the slot's value as message.
    pub(super) fn raise(&self, class: ClassId, msg_slot: u16) -> RunError {
        if !self.program.is_error_class(class) {
            return RunError::type_error(format!("class {class} is not an error class and cannot be raised"));
        }
        let message = match self.slot(msg_slot) {
            Ok(Value::None) => String::new(),
            Ok(value) => value.to_string(),
            Err(err) => return err,
        };
        RunError::Exc(Box::new(ScriptError::new(class, message)))
    }
}
