//! Script-level errors, their stack traces, and the VM's internal error channel.

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::intern::{ClassId, FuncId};

/// How many trace entries an error keeps. Entries are recorded innermost first, so the outermost
/// frames of a deep unwind are the ones that get dropped.
pub const MAX_ERROR_STACK_FRAMES: usize = 10;

/// Error classes every program starts with, registered in this order so their ids are fixed.
///
/// All of them derive from [`BuiltinClass::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum BuiltinClass {
    Error,
    RuntimeError,
    TypeError,
    ValueError,
    MathError,
    IndexError,
    AttributeError,
    OutOfMemoryError,
    RecursionError,
    /// Raised into a thread whose async work was torn down before it completed.
    AbortedError,
}

impl BuiltinClass {
    #[must_use]
    pub fn class_id(self) -> ClassId {
        ClassId::from_raw(self as u32)
    }

    #[must_use]
    pub fn from_class_id(id: ClassId) -> Option<Self> {
        u8::try_from(id.raw()).ok().and_then(Self::from_repr)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// One step of an error's stack trace: a function and the bytecode offset that was executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceEntry {
    pub func: FuncId,
    pub offset: usize,
}

/// An error raised by script code or by the runtime on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    class: ClassId,
    message: String,
    trace: Vec<TraceEntry>,
    /// Set once the raise site has been recorded, so re-raising a stored error doesn't add it twice.
    #[serde(default)]
    pub(crate) located: bool,
}

impl ScriptError {
    pub fn new(class: ClassId, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            trace: Vec::new(),
            located: false,
        }
    }

    pub fn builtin(class: BuiltinClass, message: impl Into<String>) -> Self {
        Self::new(class.class_id(), message)
    }

    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Trace entries, innermost first.
    #[must_use]
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    #[must_use]
    pub fn is(&self, class: BuiltinClass) -> bool {
        self.class == class.class_id()
    }

    /// Appends a trace entry unless the trace is already full.
    pub(crate) fn push_trace(&mut self, entry: TraceEntry) {
        if self.trace.len() < MAX_ERROR_STACK_FRAMES {
            self.trace.push(entry);
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match BuiltinClass::from_class_id(self.class) {
            Some(builtin) => write!(f, "{}: {}", builtin.name(), self.message),
            None => write!(f, "error of class {}: {}", self.class, self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Internal error channel of the VM.
#[derive(Debug, Clone)]
pub(crate) enum RunError {
    /// Broken VM invariant or malformed bytecode, never a script mistake.
    Internal(Cow<'static, str>),
    /// Error that rescue frames may catch.
    Exc(Box<ScriptError>),
    /// Resource exhaustion; unwinds straight past every handler.
    UncatchableExc(Box<ScriptError>),
}

pub(crate) type RunResult<T> = Result<T, RunError>;

impl RunError {
    pub(crate) fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn builtin(class: BuiltinClass, msg: impl Into<String>) -> Self {
        Self::Exc(Box::new(ScriptError::builtin(class, msg)))
    }

    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::TypeError, msg)
    }

    pub(crate) fn value_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::ValueError, msg)
    }

    pub(crate) fn index_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::IndexError, msg)
    }

    pub(crate) fn math_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::MathError, msg)
    }

    pub(crate) fn attribute_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::AttributeError, msg)
    }

    pub(crate) fn runtime_error(msg: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::RuntimeError, msg)
    }

    /// Flattens into the script-visible error; internal errors surface as `RuntimeError`.
    pub(crate) fn into_script_error(self) -> ScriptError {
        match self {
            Self::Internal(msg) => ScriptError::builtin(BuiltinClass::RuntimeError, format!("internal error: {msg}")),
            Self::Exc(err) | Self::UncatchableExc(err) => *err,
        }
    }
}

impl From<ScriptError> for RunError {
    fn from(err: ScriptError) -> Self {
        Self::Exc(Box::new(err))
    }
}
