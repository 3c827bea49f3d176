//! Whole-program threadability analysis.
//!
//! A function is threadable when it never touches a global that isn't a simple constant and only
//! calls threadable functions. Every script function starts out threadable; registering a unit
//! clears the flag on direct global access and records call edges, then [`iterate_final_graph`]
//! propagates the cleared flags backwards over the call graph until nothing changes. Flags only
//! ever go from threadable to not threadable, so the loop terminates.
//!
//! [`iterate_final_graph`]: ThreadabilityAnalyzer::iterate_final_graph

use std::{collections::TryReserveError, fmt};

use crate::{
    diagnostic::{CompileReport, SourcePos},
    intern::{ClassId, FuncId, GlobalId},
    program::{AttrIdx, Program},
};

const GLOBAL_ACCESS_MSG: &str = "func marked as \"canasync\" cannot access global variable that isn't a simple constant";
const CALL_MSG: &str = "func marked as \"canasync\" cannot access this func that is not \"canasync\" itself";
const OOM_MSG: &str = "out of memory during threadable check";

/// Where a resolved identifier lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageRef {
    StackSlot(u16),
    GlobalFunc(FuncId),
    GlobalClass(ClassId),
    GlobalVar(GlobalId),
    VarAttr(AttrIdx),
}

/// One identifier reference inside a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierRef {
    /// `None` for identifiers that name no storage, such as attribute names after a dot.
    pub storage: Option<StorageRef>,
    pub pos: SourcePos,
    /// Position of the declaration the identifier resolved to, if known.
    pub resolved_to: Option<SourcePos>,
}

/// A function definition (named or inline) and every identifier its body references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionNode {
    pub func: FuncId,
    pub references: Vec<IdentifierRef>,
}

/// Resolved output of compiling one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUnit {
    pub file: Option<String>,
    pub functions: Vec<FunctionNode>,
    analyzed: bool,
}

impl ResolvedUnit {
    #[must_use]
    pub fn new(file: Option<&str>) -> Self {
        Self {
            file: file.map(str::to_owned),
            functions: Vec::new(),
            analyzed: false,
        }
    }

    #[must_use]
    pub fn with_function(mut self, func: FuncId, references: Vec<IdentifierRef>) -> Self {
        self.functions.push(FunctionNode { func, references });
        self
    }

    /// `true` once the unit has been registered with an analyzer.
    #[must_use]
    pub fn is_analyzed(&self) -> bool {
        self.analyzed
    }
}

/// The analysis ran out of memory; the report carries the fatal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisAborted;

impl fmt::Display for AnalysisAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(OOM_MSG)
    }
}

impl std::error::Error for AnalysisAborted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallEdge {
    callee: FuncId,
    pos: SourcePos,
}

#[derive(Debug, Default)]
struct GraphNode {
    calls: Vec<CallEdge>,
    touches_mutable_global: bool,
    /// Index into the analyzer's file list.
    file: Option<usize>,
}

/// Result of running the propagation to its fixpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixpointSummary {
    /// Full passes made, including the final one that changed nothing.
    pub passes: usize,
    /// Functions whose flag propagation cleared, in the order it cleared them.
    pub cleared: Vec<FuncId>,
}

/// Call graph over function ids, kept only for the duration of the analysis.
#[derive(Debug, Default)]
pub struct ThreadabilityAnalyzer {
    /// Dense by function id.
    nodes: Vec<Option<GraphNode>>,
    files: Vec<String>,
}

impl ThreadabilityAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every function of `unit`: records call edges and clears the flag of any function
    /// that touches a global which isn't a simple constant.
    ///
    /// A unit is only registered once; later calls are no-ops.
    pub fn register_unit(
        &mut self,
        program: &mut Program,
        unit: &mut ResolvedUnit,
        report: &mut CompileReport,
    ) -> Result<(), AnalysisAborted> {
        if unit.analyzed {
            return Ok(());
        }
        let file = match &unit.file {
            Some(name) => {
                self.files.try_reserve(1).map_err(|e| out_of_memory(report, e))?;
                self.files.push(name.clone());
                Some(self.files.len() - 1)
            }
            None => None,
        };

        for function in &unit.functions {
            let func = function.func;
            let Some(canasync) = program.function(func).map(crate::program::Function::user_set_canasync) else {
                debug_assert!(false, "unresolved function {func} in threadability input");
                continue;
            };
            let node = self.node_mut(func).map_err(|e| out_of_memory(report, e))?;
            node.file = file;
            for reference in &function.references {
                match reference.storage {
                    Some(StorageRef::GlobalFunc(callee)) => {
                        node.calls.try_reserve(1).map_err(|e| out_of_memory(report, e))?;
                        node.calls.push(CallEdge {
                            callee,
                            pos: reference.pos,
                        });
                    }
                    Some(StorageRef::GlobalVar(global)) => {
                        let thread_safe = program.global(global).is_some_and(crate::program::GlobalVar::is_thread_safe);
                        if thread_safe {
                            continue;
                        }
                        node.touches_mutable_global = true;
                        if let Some(f) = program.function_mut(func) {
                            f.set_threadable(false);
                        }
                        if canasync {
                            report
                                .error(GLOBAL_ACCESS_MSG, unit.file.as_deref(), reference.resolved_to)
                                .map_err(|e| out_of_memory(report, e))?;
                        }
                    }
                    _ => {}
                }
            }
        }
        unit.analyzed = true;
        Ok(())
    }

    /// Propagates cleared flags over the call graph until a full pass changes nothing.
    pub fn iterate_final_graph(
        &mut self,
        program: &mut Program,
        report: &mut CompileReport,
    ) -> Result<FixpointSummary, AnalysisAborted> {
        let mut summary = FixpointSummary::default();
        loop {
            summary.passes += 1;
            let mut changed = false;
            for index in 0..program.functions().len() {
                let func = FuncId::from_index(index);
                let Some(function) = program.function(func) else { continue };
                if !function.is_threadable() {
                    continue;
                }
                let Some(Some(node)) = self.nodes.get(index) else { continue };
                let canasync = function.user_set_canasync();
                let file = node.file.and_then(|i| self.files.get(i)).map(String::as_str);

                let mut clear = false;
                for edge in &node.calls {
                    if edge.callee == func {
                        continue;
                    }
                    if program.function(edge.callee).is_none_or(crate::program::Function::is_threadable) {
                        continue;
                    }
                    clear = true;
                    if canasync {
                        report
                            .error(CALL_MSG, file, Some(edge.pos))
                            .map_err(|e| out_of_memory(report, e))?;
                    }
                }
                if clear {
                    if let Some(f) = program.function_mut(func) {
                        f.set_threadable(false);
                    }
                    summary.cleared.try_reserve(1).map_err(|e| out_of_memory(report, e))?;
                    summary.cleared.push(func);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        tracing::debug!(
            passes = summary.passes,
            cleared = summary.cleared.len(),
            "threadability fixpoint reached"
        );
        Ok(summary)
    }

    /// Drops the call graph. The flags already live on the program's functions.
    pub fn finish(self) {
        let direct = self.nodes.iter().flatten().filter(|n| n.touches_mutable_global).count();
        tracing::trace!(nodes = self.nodes.len(), direct_global_access = direct, "threadability graph discarded");
    }

    /// Registers all units, runs the propagation and discards the graph.
    pub fn analyze(
        program: &mut Program,
        units: &mut [ResolvedUnit],
        report: &mut CompileReport,
    ) -> Result<FixpointSummary, AnalysisAborted> {
        let mut analyzer = Self::new();
        for unit in units.iter_mut() {
            analyzer.register_unit(program, unit, report)?;
        }
        let summary = analyzer.iterate_final_graph(program, report)?;
        analyzer.finish();
        Ok(summary)
    }

    fn node_mut(&mut self, func: FuncId) -> Result<&mut GraphNode, TryReserveError> {
        let index = func.index();
        if index >= self.nodes.len() {
            self.nodes.try_reserve(index + 1 - self.nodes.len())?;
            self.nodes.resize_with(index + 1, || None);
        }
        Ok(self.nodes[index].get_or_insert_with(GraphNode::default))
    }
}

fn out_of_memory(report: &mut CompileReport, err: TryReserveError) -> AnalysisAborted {
    tracing::error!(%err, "threadability analysis aborted");
    report.fatal_out_of_memory(OOM_MSG);
    AnalysisAborted
}
