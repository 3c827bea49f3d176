//! VM execution tracing.
//!
//! [`VmThread`](crate::VmThread) carries its tracer as a type parameter, so with [`NoopTracer`]
//! every hook is inlined away, the same way [`NoLimitTracker`](crate::NoLimitTracker) removes
//! resource checks.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency, call depth and rescue counters |
//! | [`RecordingTracer`] | Full event log for post-mortem comparison |

use std::{collections::HashMap, fmt};

use crate::{
    bytecode::Opcode,
    intern::{ClassId, FuncId},
    vm::SuspendState,
};

/// Event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Instruction {
        func: FuncId,
        /// Byte offset of the instruction in the function's code.
        offset: usize,
        opcode: Opcode,
        /// Function frames on the thread.
        depth: usize,
    },
    Call {
        func: FuncId,
        /// Depth after the push.
        depth: usize,
    },
    Return {
        /// Depth after the pop.
        depth: usize,
    },
    RescuePush {
        frame_id: u16,
    },
    RescuePop {
        frame_id: u16,
    },
    Raise {
        class: ClassId,
        /// `true` when a rescue frame of the current function frame took the error.
        caught: bool,
    },
    Suspend {
        state: SuspendState,
    },
}

/// Hooks called by the dispatch loop. Every hook defaults to a no-op.
///
/// Tracers move between worker threads together with their VM thread, hence `Send`.
pub trait VmTracer: fmt::Debug + Send + 'static {
    /// Called before each instruction executes. The hottest hook by far.
    #[inline(always)]
    fn on_instruction(&mut self, _func: FuncId, _offset: usize, _opcode: Opcode, _depth: usize) {}

    /// Called after a script function frame was pushed.
    #[inline(always)]
    fn on_call(&mut self, _func: FuncId, _name: &str, _depth: usize) {}

    /// Called after a function frame was popped by a return.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_rescue_push(&mut self, _frame_id: u16, _depth: usize) {}

    #[inline(always)]
    fn on_rescue_pop(&mut self, _frame_id: u16, _depth: usize) {}

    /// Called each time an error reaches a rescue frame that either catches it or routes it to finally.
    #[inline(always)]
    fn on_raise(&mut self, _class: ClassId, _caught: bool) {}

    #[inline(always)]
    fn on_suspend(&mut self, _state: SuspendState) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints one line per event to stderr.
///
/// ```text
/// [f3    12] call                 depth=1
///   >>> CALL fib                  depth=2
///   <<< RETURN                    depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Instructions to print before going quiet. `None` = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops printing after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, func: FuncId, offset: usize, opcode: Opcode, depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[f{func} {offset:>5}] {opcode:<20} depth={depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, _func: FuncId, name: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {name:<20} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN                    depth={depth}");
        }
    }

    fn on_raise(&mut self, class: ClassId, caught: bool) {
        if !self.stopped {
            let outcome = if caught { "caught" } else { "to finally" };
            eprintln!("  !!! RAISE class {class} ({outcome})");
        }
    }

    fn on_suspend(&mut self, state: SuspendState) {
        if !self.stopped {
            let state: &'static str = state.into();
            eprintln!("  ... SUSPEND {state}");
        }
    }
}

/// Counts what executed. Read the result with [`ProfilingTracer::report`].
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: HashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    rescue_frames: u64,
    raises: u64,
    suspensions: u64,
}

#[derive(Debug)]
pub struct ProfilingReport {
    /// Sorted by frequency, most executed first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    pub total_calls: u64,
    pub rescue_frames: u64,
    pub raises: u64,
    pub suspensions: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.name().cmp(b.0.name())));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            rescue_frames: self.rescue_frames,
            raises: self.raises,
            suspensions: self.suspensions,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _func: FuncId, _offset: usize, opcode: Opcode, depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_call(&mut self, _func: FuncId, _name: &str, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_rescue_push(&mut self, _frame_id: u16, _depth: usize) {
        self.rescue_frames += 1;
    }

    fn on_raise(&mut self, _class: ClassId, _caught: bool) {
        self.raises += 1;
    }

    fn on_suspend(&mut self, _state: SuspendState) {
        self.suspensions += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Rescue frames:      {}", self.rescue_frames)?;
        writeln!(f, "Raises handled:     {}", self.raises)?;
        writeln!(f, "Suspensions:        {}", self.suspensions)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions.max(1) as f64) * 100.0;
            writeln!(f, "  {opcode:<20} {count:>10}  ({pct:>5.1}%)")?;
        }
        Ok(())
    }
}

/// Records every event. Allocates per event, so keep it to short runs.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|l| self.events.len() < l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    #[inline]
    fn on_instruction(&mut self, func: FuncId, offset: usize, opcode: Opcode, depth: usize) {
        self.record(TraceEvent::Instruction {
            func,
            offset,
            opcode,
            depth,
        });
    }

    fn on_call(&mut self, func: FuncId, _name: &str, depth: usize) {
        self.record(TraceEvent::Call { func, depth });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_rescue_push(&mut self, frame_id: u16, _depth: usize) {
        self.record(TraceEvent::RescuePush { frame_id });
    }

    fn on_rescue_pop(&mut self, frame_id: u16, _depth: usize) {
        self.record(TraceEvent::RescuePop { frame_id });
    }

    fn on_raise(&mut self, class: ClassId, caught: bool) {
        self.record(TraceEvent::Raise { class, caught });
    }

    fn on_suspend(&mut self, state: SuspendState) {
        self.record(TraceEvent::Suspend { state });
    }
}
