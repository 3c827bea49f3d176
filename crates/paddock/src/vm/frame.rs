//! Function and rescue frames of a VM thread.

use smallvec::SmallVec;

use crate::{
    exception::RunError,
    intern::{ClassId, FuncId},
    program::Program,
    value::Value,
};

/// Where the result of a call goes once its frame returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReturnTarget {
    /// A slot of the caller's frame.
    Slot(u16),
    /// The thread's top-level call: the result leaves the thread.
    Root,
    /// Initializers run on instance creation; their result is dropped.
    Discard,
}

#[derive(Debug)]
pub(crate) struct FunctionFrame {
    pub func: FuncId,
    /// Index of slot 0 on the value stack.
    pub stack_floor: usize,
    pub slot_count: usize,
    pub return_target: ReturnTarget,
    /// Rescue frames below this index belong to callers.
    pub rescue_floor: usize,
    /// Offset of the next instruction to execute.
    pub ip: usize,
    /// Offset of the instruction currently executing; `None` before the first one.
    pub current: Option<usize>,
}

/// A try/rescue/finally region that is currently active.
#[derive(Debug)]
pub(crate) struct RescueFrame {
    pub frame_id: u16,
    pub catch_target: Option<usize>,
    pub finally_target: Option<usize>,
    pub error_slot: Option<u16>,
    caught: SmallVec<[ClassId; 5]>,
    pub triggered_catch: bool,
    pub triggered_finally: bool,
    /// Error that was routed to the finally block and continues propagating once it ends.
    pub delayed_error: Option<RunError>,
    /// Counted return value held while the finally block runs; the return completes once it ends.
    pub pending_return: Option<Value>,
}

impl RescueFrame {
    pub fn new(frame_id: u16, catch_target: Option<usize>, finally_target: Option<usize>, error_slot: Option<u16>) -> Self {
        Self {
            frame_id,
            catch_target,
            finally_target,
            error_slot,
            caught: SmallVec::new(),
            triggered_catch: false,
            triggered_finally: false,
            delayed_error: None,
            pending_return: None,
        }
    }

    pub fn add_type(&mut self, class: ClassId) {
        if !self.caught.contains(&class) {
            self.caught.push(class);
        }
    }

    /// Whether an error of `class` is caught here. Subclasses of a listed class match too.
    pub fn catches(&self, program: &Program, class: ClassId) -> bool {
        self.caught.iter().any(|&listed| program.is_subclass(class, listed))
    }

    /// Whether an error arriving now should jump to the catch block.
    pub fn can_catch(&self, program: &Program, class: ClassId) -> bool {
        self.catch_target.is_some() && !self.triggered_catch && !self.triggered_finally && self.catches(program, class)
    }

    /// Whether the finally block still has to run.
    pub fn finally_pending(&self) -> bool {
        self.finally_target.is_some() && !self.triggered_finally
    }
}
