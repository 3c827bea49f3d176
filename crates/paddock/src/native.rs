//! Host functions callable from bytecode.
//!
//! A native is registered on the [`Program`] under a lookup key. The function pointer itself is not
//! part of a program dump: [`Program::load`] re-binds every native by key from a [`NativeRegistry`].

use std::fmt;

use ahash::AHashMap;

use crate::{
    exception::{BuiltinClass, ScriptError},
    intern::ClassId,
    object::Object,
    program::Program,
    vm::AsyncWork,
};

/// Entry point of a native function.
pub type NativeFn = fn(&mut NativeCall<'_>) -> Result<NativeReturn, NativeError>;

/// What a native call produced.
pub enum NativeReturn {
    Value(Object),
    /// Suspend the calling thread until the work completes, then call the native again.
    ///
    /// On re-entry [`NativeCall::resumed`] holds the work's result and the progress buffer still
    /// holds whatever the first call wrote into it.
    Suspend(Box<dyn AsyncWork>),
}

impl fmt::Debug for NativeReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(obj) => f.debug_tuple("Value").field(obj).finish(),
            Self::Suspend(_) => f.write_str("Suspend(..)"),
        }
    }
}

impl From<Object> for NativeReturn {
    fn from(obj: Object) -> Self {
        Self::Value(obj)
    }
}

/// Error raised by a native; surfaces in script code as an error of `class`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub class: ClassId,
    pub message: String,
}

impl NativeError {
    pub fn new(class: ClassId, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn builtin(class: BuiltinClass, message: impl Into<String>) -> Self {
        Self::new(class.class_id(), message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::builtin(BuiltinClass::ValueError, message)
    }
}

impl From<NativeError> for ScriptError {
    fn from(err: NativeError) -> Self {
        Self::new(err.class, err.message)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ScriptError::new(self.class, self.message.clone()))
    }
}

impl std::error::Error for NativeError {}

/// Arguments and per-call state passed to a native.
pub struct NativeCall<'a> {
    program: &'a Program,
    args: &'a [Object],
    progress: &'a mut [u8],
    resumed: Option<Result<Object, ScriptError>>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(
        program: &'a Program,
        args: &'a [Object],
        progress: &'a mut [u8],
        resumed: Option<Result<Object, ScriptError>>,
    ) -> Self {
        Self {
            program,
            args,
            progress,
            resumed,
        }
    }

    #[must_use]
    pub fn program(&self) -> &Program {
        self.program
    }

    #[must_use]
    pub fn args(&self) -> &[Object] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Result<&Object, NativeError> {
        self.args
            .get(index)
            .ok_or_else(|| NativeError::type_error(format!("missing argument {index}")))
    }

    pub fn int_arg(&self, index: usize) -> Result<i64, NativeError> {
        let arg = self.arg(index)?;
        arg.as_int()
            .ok_or_else(|| NativeError::type_error(format!("argument {index} must be int, not {}", arg.type_name())))
    }

    /// Zeroed on the first call, preserved across suspension.
    pub fn progress(&mut self) -> &mut [u8] {
        self.progress
    }

    /// `true` when this call is the re-entry after async work finished.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed.is_some()
    }

    /// Takes the result of the async work this native suspended on.
    pub fn take_resumed(&mut self) -> Option<Result<Object, ScriptError>> {
        self.resumed.take()
    }
}

/// Native entry points by lookup key, used to re-bind a loaded program.
#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    entries: AHashMap<String, NativeFn>,
}

impl NativeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, entry: NativeFn) -> &mut Self {
        self.entries.insert(key.into(), entry);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<NativeFn> {
        self.entries.get(key).copied()
    }

    /// Collects every native already bound in `program`.
    #[must_use]
    pub fn from_program(program: &Program) -> Self {
        let mut registry = Self::new();
        for function in program.functions() {
            if let Some((key, entry)) = function.native_binding() {
                registry.register(key, entry);
            }
        }
        registry
    }
}
