//! The compiled program: classes, functions, globals and interned names.
//!
//! A `Program` is assembled by a code generator through the `add_*`/`register_*` operations, analysed
//! by the [`ThreadabilityAnalyzer`](crate::ThreadabilityAnalyzer), and then frozen behind an `Arc`
//! that every VM thread shares read-only.

use std::{collections::BTreeMap, fmt, fmt::Write as _};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    bytecode::{Code, CodeError, Constant, Instruction, Opcode},
    exception::{BuiltinClass, ScriptError},
    intern::{BuiltinName, ClassId, FuncId, GlobalId, Interns, NameId},
    native::{NativeFn, NativeRegistry},
};

/// Variable attributes use indexes below this offset, methods use indexes at and above it.
pub const METHOD_OFFSET: u32 = 1024;

/// Format tag written in front of every dump.
const DUMP_VERSION: u32 = 1;

/// Resolved attribute of a class.
///
/// A single integer that says both which kind of attribute it is and where it lives: variable
/// attributes are `0..METHOD_OFFSET`, methods are `METHOD_OFFSET..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrIdx(u32);

impl AttrIdx {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    fn var(index: usize) -> Option<Self> {
        u32::try_from(index).ok().filter(|&i| i < METHOD_OFFSET).map(Self)
    }

    fn method(index: usize) -> Option<Self> {
        u32::try_from(index).ok().and_then(|i| i.checked_add(METHOD_OFFSET)).map(Self)
    }

    #[must_use]
    pub const fn is_method(self) -> bool {
        self.0 >= METHOD_OFFSET
    }

    #[must_use]
    pub fn var_index(self) -> Option<usize> {
        (!self.is_method()).then_some(self.0 as usize)
    }

    #[must_use]
    pub fn method_index(self) -> Option<usize> {
        self.is_method().then(|| (self.0 - METHOD_OFFSET) as usize)
    }
}

/// Flags of a variable attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VarAttrFlags(u8);

impl VarAttrFlags {
    pub const NONE: Self = Self(0);
    /// Assignable only from the class's variable initializer.
    pub const CONST: Self = Self(0x1);
    /// Assignable only from methods and initializers of the class or one of its bases.
    pub const PROTECT: Self = Self(0x2);
    /// The class defines a custom `equals`. Kept for the compiler; the VM compares instances by
    /// identity regardless.
    pub const EQUALS: Self = Self(0x4);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for VarAttrFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarAttr {
    pub name: NameId,
    pub flags: VarAttrFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAttr {
    pub name: NameId,
    pub func: FuncId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    name: String,
    base: Option<ClassId>,
    var_attrs: Vec<VarAttr>,
    methods: Vec<MethodAttr>,
    varinit: Option<FuncId>,
    /// Name → attribute index, rebuilt whenever the attribute lists change and after loading.
    #[serde(skip)]
    attributes: AHashMap<NameId, AttrIdx>,
}

impl Class {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            base: None,
            var_attrs: Vec::new(),
            methods: Vec::new(),
            varinit: None,
            attributes: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base(&self) -> Option<ClassId> {
        self.base
    }

    #[must_use]
    pub fn var_attrs(&self) -> &[VarAttr] {
        &self.var_attrs
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodAttr] {
        &self.methods
    }

    /// Generated function that fills in variable attribute defaults on a new instance.
    #[must_use]
    pub fn varinit(&self) -> Option<FuncId> {
        self.varinit
    }

    #[must_use]
    pub fn var_attr(&self, idx: AttrIdx) -> Option<&VarAttr> {
        self.var_attrs.get(idx.var_index()?)
    }

    #[must_use]
    pub fn method(&self, idx: AttrIdx) -> Option<FuncId> {
        self.methods.get(idx.method_index()?).map(|m| m.func)
    }

    fn rebuild_attributes(&mut self) {
        let mut table = AHashMap::with_capacity(self.var_attrs.len() + self.methods.len());
        for (index, attr) in self.var_attrs.iter().enumerate() {
            if let Some(idx) = AttrIdx::var(index) {
                table.insert(attr.name, idx);
            }
        }
        for (index, method) in self.methods.iter().enumerate() {
            if let Some(idx) = AttrIdx::method(index) {
                table.insert(method.name, idx);
            }
        }
        self.attributes = table;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FunctionKind {
    Script {
        /// `None` until the code generator has emitted the body.
        code: Option<Code>,
        inner_stack: u16,
    },
    Native {
        /// Stable key a loaded program re-binds the entry point by.
        key: String,
        #[serde(skip)]
        entry: Option<NativeFn>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    name: String,
    arg_count: u16,
    kind: FunctionKind,
    is_threadable: bool,
    user_set_canasync: bool,
    async_progress_size: usize,
    class: Option<ClassId>,
}

impl Function {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of positional arguments, which is also the number of input slots.
    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.arg_count
    }

    #[must_use]
    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native { .. })
    }

    #[must_use]
    pub fn code(&self) -> Option<&Code> {
        match &self.kind {
            FunctionKind::Script { code, .. } => code.as_ref(),
            FunctionKind::Native { .. } => None,
        }
    }

    /// Input plus inner slots a call reserves on the value stack.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        match self.kind {
            FunctionKind::Script { inner_stack, .. } => usize::from(self.arg_count) + usize::from(inner_stack),
            FunctionKind::Native { .. } => 0,
        }
    }

    #[must_use]
    pub fn is_threadable(&self) -> bool {
        self.is_threadable
    }

    #[must_use]
    pub fn user_set_canasync(&self) -> bool {
        self.user_set_canasync
    }

    #[must_use]
    pub fn async_progress_size(&self) -> usize {
        self.async_progress_size
    }

    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        self.class
    }

    #[must_use]
    pub fn native_entry(&self) -> Option<NativeFn> {
        match self.kind {
            FunctionKind::Native { entry, .. } => entry,
            FunctionKind::Script { .. } => None,
        }
    }

    #[must_use]
    pub fn native_binding(&self) -> Option<(&str, NativeFn)> {
        match &self.kind {
            FunctionKind::Native { key, entry: Some(entry) } => Some((key, *entry)),
            _ => None,
        }
    }

    pub(crate) fn set_threadable(&mut self, threadable: bool) {
        self.is_threadable = threadable;
    }
}

/// How a global may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalKind {
    /// Const whose value is a compile-time literal; the only kind threadable code may read.
    SimpleConstant,
    /// Const computed by the global initializer.
    Const,
    Mutable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVar {
    name: String,
    initial: Constant,
    is_const: bool,
    is_simple_constant: bool,
}

impl GlobalVar {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content before any initializer runs.
    #[must_use]
    pub fn initial(&self) -> &Constant {
        &self.initial
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.is_const
    }

    #[must_use]
    pub fn is_simple_constant(&self) -> bool {
        self.is_simple_constant
    }

    /// Readable from threadable code: both const and a compile-time literal.
    #[must_use]
    pub fn is_thread_safe(&self) -> bool {
        self.is_const && self.is_simple_constant
    }
}

/// Function ids the runtime looks up by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WellKnownFuncs {
    pub main: Option<FuncId>,
    /// Assigns literal globals; runs before `global_init`.
    pub global_init_simple: Option<FuncId>,
    pub global_init: Option<FuncId>,
    pub has_attr: Option<FuncId>,
    pub is_a: Option<FuncId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    classes: Vec<Class>,
    functions: Vec<Function>,
    globals: Vec<GlobalVar>,
    interns: Interns,
    well_known: WellKnownFuncs,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    /// Creates a program holding only the builtin error classes.
    #[must_use]
    pub fn new() -> Self {
        let mut program = Self {
            classes: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            interns: Interns::new(),
            well_known: WellKnownFuncs::default(),
        };
        for builtin in BuiltinClass::iter() {
            let id = program.add_class(builtin.name());
            debug_assert_eq!(id, builtin.class_id());
            if builtin != BuiltinClass::Error {
                program.classes[id.index()].base = Some(BuiltinClass::Error.class_id());
            }
        }
        program
    }

    pub fn intern(&mut self, name: &str) -> NameId {
        self.interns.intern(name)
    }

    #[must_use]
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    #[must_use]
    pub fn well_known(&self) -> &WellKnownFuncs {
        &self.well_known
    }

    pub fn well_known_mut(&mut self) -> &mut WellKnownFuncs {
        &mut self.well_known
    }

    // ---- classes ----

    pub fn add_class(&mut self, name: &str) -> ClassId {
        let id = ClassId::from_index(self.classes.len());
        self.classes.push(Class::new(name));
        id
    }

    /// Makes `class` inherit from `base`.
    ///
    /// Must be called before `class` gets attributes of its own: the base's attributes are copied
    /// in at the same indexes, so early-bound attribute indexes of the base stay valid on subclass
    /// instances. The base's variable initializer is inherited unless the class sets its own later.
    pub fn set_base_class(&mut self, class: ClassId, base: ClassId) -> Result<(), ProgramError> {
        self.check_class(class)?;
        self.check_class(base)?;
        if class == base || self.is_subclass(base, class) {
            return Err(ProgramError::InheritanceCycle { class });
        }
        let target = &self.classes[class.index()];
        if !target.var_attrs.is_empty() || !target.methods.is_empty() {
            return Err(ProgramError::BaseAfterAttributes { class });
        }
        let parent = self.classes[base.index()].clone();
        let target = &mut self.classes[class.index()];
        target.base = Some(base);
        target.var_attrs = parent.var_attrs;
        target.methods = parent.methods;
        target.varinit = parent.varinit;
        target.rebuild_attributes();
        Ok(())
    }

    /// Adds a variable attribute, returning its index.
    pub fn register_class_variable(
        &mut self,
        class: ClassId,
        name: &str,
        flags: VarAttrFlags,
    ) -> Result<AttrIdx, ProgramError> {
        self.check_class(class)?;
        let name_id = self.interns.intern(name);
        let target = &mut self.classes[class.index()];
        if target.attributes.contains_key(&name_id) {
            return Err(ProgramError::DuplicateAttribute {
                class,
                name: name.to_owned(),
            });
        }
        let idx = AttrIdx::var(target.var_attrs.len()).ok_or(ProgramError::TooManyAttributes { class })?;
        target.var_attrs.push(VarAttr { name: name_id, flags });
        target.rebuild_attributes();
        Ok(idx)
    }

    /// Adds a method, or overrides an inherited method of the same name in place.
    pub fn register_class_method(&mut self, class: ClassId, name: &str, func: FuncId) -> Result<AttrIdx, ProgramError> {
        self.check_class(class)?;
        self.check_func(func)?;
        let name_id = self.interns.intern(name);
        let target = &mut self.classes[class.index()];
        let idx = match target.attributes.get(&name_id) {
            Some(&existing) if existing.is_method() => {
                let index = existing.method_index().unwrap_or_default();
                target.methods[index].func = func;
                existing
            }
            Some(_) => {
                return Err(ProgramError::DuplicateAttribute {
                    class,
                    name: name.to_owned(),
                });
            }
            None => {
                let idx = AttrIdx::method(target.methods.len()).ok_or(ProgramError::TooManyAttributes { class })?;
                target.methods.push(MethodAttr { name: name_id, func });
                idx
            }
        };
        target.rebuild_attributes();
        self.functions[func.index()].class = Some(class);
        Ok(idx)
    }

    pub fn set_class_varinit(&mut self, class: ClassId, func: FuncId) -> Result<(), ProgramError> {
        self.check_class(class)?;
        self.check_func(func)?;
        self.classes[class.index()].varinit = Some(func);
        self.functions[func.index()].class = Some(class);
        Ok(())
    }

    /// Rebuilds the name → attribute table of `class` from its attribute lists.
    pub fn rebuild_class_attribute_table(&mut self, class: ClassId) -> Result<(), ProgramError> {
        self.check_class(class)?;
        self.classes[class.index()].rebuild_attributes();
        Ok(())
    }

    /// O(1) attribute resolution by interned name.
    pub fn lookup_class_attribute(&self, class: ClassId, name: NameId) -> Result<AttrIdx, ProgramError> {
        self.class_attribute(class, name)
            .ok_or_else(|| ProgramError::AttributeNotFound {
                class,
                name: self.interns.try_name(name).unwrap_or("?").to_owned(),
            })
    }

    pub fn lookup_class_attribute_by_name(&self, class: ClassId, name: &str) -> Result<AttrIdx, ProgramError> {
        self.interns
            .get(name)
            .and_then(|id| self.class_attribute(class, id))
            .ok_or_else(|| ProgramError::AttributeNotFound {
                class,
                name: name.to_owned(),
            })
    }

    #[inline]
    pub(crate) fn class_attribute(&self, class: ClassId, name: NameId) -> Option<AttrIdx> {
        self.classes.get(class.index())?.attributes.get(&name).copied()
    }

    /// `true` when `class` is `ancestor` or inherits from it.
    #[must_use]
    pub fn is_subclass(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        // bounded by the class count so a corrupt chain cannot spin
        for _ in 0..=self.classes.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.classes.get(id.index()).and_then(|c| c.base),
                None => return false,
            }
        }
        false
    }

    #[must_use]
    pub fn is_error_class(&self, class: ClassId) -> bool {
        self.is_subclass(class, BuiltinClass::Error.class_id())
    }

    // ---- functions ----

    /// Registers a script function whose body is supplied later with [`set_function_code`](Self::set_function_code).
    ///
    /// Script functions start out threadable; the threadability analysis clears the flag.
    pub fn register_script_function(&mut self, name: &str, arg_count: u16, inner_stack: u16) -> FuncId {
        self.push_function(Function {
            name: name.to_owned(),
            arg_count,
            kind: FunctionKind::Script { code: None, inner_stack },
            is_threadable: true,
            user_set_canasync: false,
            async_progress_size: 0,
            class: None,
        })
    }

    pub fn set_function_code(&mut self, func: FuncId, code: Code) -> Result<(), ProgramError> {
        self.check_func(func)?;
        match &mut self.functions[func.index()].kind {
            FunctionKind::Script { code: slot, .. } => {
                *slot = Some(code);
                Ok(())
            }
            FunctionKind::Native { .. } => Err(ProgramError::NotAScriptFunction { func }),
        }
    }

    /// Registers a native. `threadable` declares that it touches no state shared with other threads.
    pub fn register_native_function(
        &mut self,
        name: &str,
        key: &str,
        entry: NativeFn,
        arg_count: u16,
        threadable: bool,
    ) -> FuncId {
        self.push_function(Function {
            name: name.to_owned(),
            arg_count,
            kind: FunctionKind::Native {
                key: key.to_owned(),
                entry: Some(entry),
            },
            is_threadable: threadable,
            user_set_canasync: false,
            async_progress_size: 0,
            class: None,
        })
    }

    /// Marks a function as explicitly allowed to run asynchronously (`canasync`).
    pub fn set_canasync(&mut self, func: FuncId, canasync: bool) -> Result<(), ProgramError> {
        self.check_func(func)?;
        self.functions[func.index()].user_set_canasync = canasync;
        Ok(())
    }

    /// Bytes of per-call state that survive a native's suspension.
    pub fn set_async_progress_size(&mut self, func: FuncId, size: usize) -> Result<(), ProgramError> {
        self.check_func(func)?;
        self.functions[func.index()].async_progress_size = size;
        Ok(())
    }

    fn push_function(&mut self, function: Function) -> FuncId {
        let id = FuncId::from_index(self.functions.len());
        self.functions.push(function);
        id
    }

    // ---- globals ----

    pub fn add_global(&mut self, name: &str, initial: Constant, kind: GlobalKind) -> GlobalId {
        let id = GlobalId::from_index(self.globals.len());
        self.globals.push(GlobalVar {
            name: name.to_owned(),
            initial,
            is_const: kind != GlobalKind::Mutable,
            is_simple_constant: kind == GlobalKind::SimpleConstant,
        });
        id
    }

    // ---- lookups ----

    #[must_use]
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    pub(crate) fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.index())
    }

    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    #[must_use]
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(FuncId::from_index)
    }

    #[must_use]
    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.index())
    }

    #[must_use]
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    #[must_use]
    pub fn global(&self, id: GlobalId) -> Option<&GlobalVar> {
        self.globals.get(id.index())
    }

    #[must_use]
    pub fn globals(&self) -> &[GlobalVar] {
        &self.globals
    }

    fn check_class(&self, class: ClassId) -> Result<(), ProgramError> {
        if class.index() < self.classes.len() {
            Ok(())
        } else {
            Err(ProgramError::InvalidId {
                kind: "class",
                id: class.raw(),
            })
        }
    }

    fn check_func(&self, func: FuncId) -> Result<(), ProgramError> {
        if func.index() < self.functions.len() {
            Ok(())
        } else {
            Err(ProgramError::InvalidId {
                kind: "function",
                id: func.raw(),
            })
        }
    }

    /// Formats an error with its class name and a named stack trace.
    #[must_use]
    pub fn format_error(&self, err: &ScriptError) -> String {
        let class = self.class(err.class()).map_or("<unknown class>", Class::name);
        let mut out = format!("{class}: {}", err.message());
        for entry in err.trace() {
            let func = self.function(entry.func).map_or("<unknown func>", Function::name);
            let _ = write!(out, "\n  in {func} at offset {}", entry.offset);
        }
        out
    }

    // ---- persistence ----

    /// Serializes the program. Native entry points are stored by key only.
    pub fn dump(&self) -> Result<Vec<u8>, ProgramError> {
        postcard::to_allocvec(&(DUMP_VERSION, self)).map_err(ProgramError::Serialization)
    }

    /// Restores a dumped program, re-binding natives from `natives` and re-validating all code.
    pub fn load(bytes: &[u8], natives: &NativeRegistry) -> Result<Self, ProgramError> {
        let (version, mut program): (u32, Self) = postcard::from_bytes(bytes).map_err(ProgramError::Serialization)?;
        if version != DUMP_VERSION {
            return Err(ProgramError::IncompatibleDump { version });
        }
        program.interns.rebuild_lookup();
        for builtin in BuiltinName::iter() {
            if program.interns.try_name(builtin.name_id()) != Some(builtin.as_str()) {
                return Err(ProgramError::IncompatibleDump { version });
            }
        }
        for class in &mut program.classes {
            class.rebuild_attributes();
        }
        for function in &mut program.functions {
            if let FunctionKind::Native { key, entry } = &mut function.kind {
                *entry = Some(natives.get(key).ok_or_else(|| ProgramError::MissingNative(key.clone()))?);
            }
        }
        program.validate()?;
        Ok(program)
    }

    /// Checks every body and every id an instruction, class or well-known slot refers to.
    pub fn validate(&self) -> Result<(), ProgramError> {
        let class_ok = |id: ClassId| id.index() < self.classes.len();
        let func_ok = |id: FuncId| id.index() < self.functions.len();
        let bad = |kind: &'static str, id: u32| ProgramError::InvalidId { kind, id };

        for class in &self.classes {
            if let Some(base) = class.base
                && !class_ok(base)
            {
                return Err(bad("class", base.raw()));
            }
            for method in &class.methods {
                if !func_ok(method.func) {
                    return Err(bad("function", method.func.raw()));
                }
            }
            if let Some(varinit) = class.varinit
                && !func_ok(varinit)
            {
                return Err(bad("function", varinit.raw()));
            }
        }
        let well_known = &self.well_known;
        for id in [
            well_known.main,
            well_known.global_init_simple,
            well_known.global_init,
            well_known.has_attr,
            well_known.is_a,
        ]
        .into_iter()
        .flatten()
        {
            if !func_ok(id) {
                return Err(bad("function", id.raw()));
            }
        }

        for (index, function) in self.functions.iter().enumerate() {
            let Some(code) = function.code() else { continue };
            let func = FuncId::from_index(index);
            code.validate().map_err(|error| ProgramError::InvalidCode { func, error })?;
            for (_, inst) in code.instructions() {
                match inst {
                    Instruction::GetFunc { func, .. } if !func_ok(func) => return Err(bad("function", func.raw())),
                    Instruction::GetClass { class, .. }
                    | Instruction::AddRescueType { class, .. }
                    | Instruction::NewInstance { class, .. }
                    | Instruction::Raise { class, .. }
                        if !class_ok(class) =>
                    {
                        return Err(bad("class", class.raw()));
                    }
                    Instruction::GetGlobal { global, .. } | Instruction::SetGlobal { global, .. }
                        if global.index() >= self.globals.len() =>
                    {
                        return Err(bad("global", global.raw()));
                    }
                    Instruction::GetAttributeByName { name, .. }
                    | Instruction::SetByAttributeName { name, .. }
                    | Instruction::HasAttrJump { name, .. }
                        if self.interns.try_name(name).is_none() =>
                    {
                        return Err(bad("name", name.raw()));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Instruction counts per opcode across all script functions.
    #[must_use]
    pub fn bytecode_stats(&self) -> BytecodeStats {
        let mut stats = BytecodeStats::default();
        for function in &self.functions {
            match function.code() {
                Some(code) => {
                    stats.script_functions += 1;
                    stats.total_bytes += code.len();
                    for (_, inst) in code.instructions() {
                        *stats.per_opcode.entry(inst.opcode().name()).or_default() += 1;
                        stats.total_instructions += 1;
                    }
                }
                None if function.is_native() => stats.native_functions += 1,
                None => stats.script_functions += 1,
            }
        }
        stats.classes = self.classes.len();
        stats.globals = self.globals.len();
        stats
    }
}

/// Summary of a program's bytecode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytecodeStats {
    pub per_opcode: BTreeMap<&'static str, usize>,
    pub total_instructions: usize,
    pub total_bytes: usize,
    pub script_functions: usize,
    pub native_functions: usize,
    pub classes: usize,
    pub globals: usize,
}

impl BytecodeStats {
    #[must_use]
    pub fn count(&self, opcode: Opcode) -> usize {
        self.per_opcode.get(opcode.name()).copied().unwrap_or(0)
    }
}

impl fmt::Display for BytecodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} instructions ({} bytes) in {} script funcs, {} native funcs, {} classes, {} globals",
            self.total_instructions,
            self.total_bytes,
            self.script_functions,
            self.native_functions,
            self.classes,
            self.globals
        )?;
        let mut rows: Vec<_> = self.per_opcode.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (name, count) in rows {
            writeln!(f, "  {name:<22} {count:>8}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ProgramError {
    AttributeNotFound { class: ClassId, name: String },
    InvalidId { kind: &'static str, id: u32 },
    /// A function body failed validation, e.g. a jump that misses an instruction boundary.
    InvalidCode { func: FuncId, error: CodeError },
    Serialization(postcard::Error),
    IncompatibleDump { version: u32 },
    MissingNative(String),
    TooManyAttributes { class: ClassId },
    DuplicateAttribute { class: ClassId, name: String },
    InheritanceCycle { class: ClassId },
    BaseAfterAttributes { class: ClassId },
    NotAScriptFunction { func: FuncId },
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttributeNotFound { class, name } => write!(f, "class {class} has no attribute `{name}`"),
            Self::InvalidId { kind, id } => write!(f, "{kind} id {id} does not exist"),
            Self::InvalidCode { func, error } => write!(f, "function {func}: {error}"),
            Self::Serialization(err) => write!(f, "serialization failed: {err}"),
            Self::IncompatibleDump { version } => write!(f, "incompatible program dump (version {version})"),
            Self::MissingNative(key) => write!(f, "no native registered for `{key}`"),
            Self::TooManyAttributes { class } => write!(f, "class {class} has too many attributes"),
            Self::DuplicateAttribute { class, name } => write!(f, "class {class} already has attribute `{name}`"),
            Self::InheritanceCycle { class } => write!(f, "class {class} would inherit from itself"),
            Self::BaseAfterAttributes { class } => {
                write!(f, "base class of class {class} must be set before its attributes")
            }
            Self::NotAScriptFunction { func } => write!(f, "function {func} is native and has no bytecode"),
        }
    }
}

impl std::error::Error for ProgramError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidCode { error, .. } => Some(error),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_error_classes_are_registered_in_order() {
        let program = Program::new();
        assert_eq!(program.class(BuiltinClass::TypeError.class_id()).unwrap().name(), "TypeError");
        assert!(program.is_error_class(BuiltinClass::AbortedError.class_id()));
        assert!(!program.is_subclass(BuiltinClass::Error.class_id(), BuiltinClass::TypeError.class_id()));
    }

    #[test]
    fn attribute_indexes_split_at_method_offset() {
        let mut program = Program::new();
        let class = program.add_class("Point");
        let func = program.register_script_function("Point.norm", 1, 0);
        let x = program.register_class_variable(class, "x", VarAttrFlags::NONE).unwrap();
        let norm = program.register_class_method(class, "norm", func).unwrap();
        assert_eq!(x.var_index(), Some(0));
        assert!(!x.is_method());
        assert_eq!(norm.raw(), METHOD_OFFSET);
        assert_eq!(norm.method_index(), Some(0));
        assert_eq!(program.lookup_class_attribute_by_name(class, "norm").unwrap(), norm);
        assert!(matches!(
            program.lookup_class_attribute_by_name(class, "y"),
            Err(ProgramError::AttributeNotFound { .. })
        ));
        assert_eq!(program.function(func).unwrap().class(), Some(class));
    }

    #[test]
    fn subclass_inherits_attribute_indexes_and_overrides_methods() {
        let mut program = Program::new();
        let base = program.add_class("Shape");
        let area = program.register_script_function("Shape.area", 1, 0);
        let sq_area = program.register_script_function("Square.area", 1, 0);
        let side = program.register_class_variable(base, "side", VarAttrFlags::NONE).unwrap();
        let base_area = program.register_class_method(base, "area", area).unwrap();

        let square = program.add_class("Square");
        program.set_base_class(square, base).unwrap();
        let overridden = program.register_class_method(square, "area", sq_area).unwrap();
        assert_eq!(overridden, base_area);
        assert_eq!(program.lookup_class_attribute_by_name(square, "side").unwrap(), side);
        assert_eq!(program.class(square).unwrap().method(overridden), Some(sq_area));
        assert_eq!(program.class(base).unwrap().method(base_area), Some(area));
        assert!(program.is_subclass(square, base));
        assert!(matches!(
            program.set_base_class(base, square),
            Err(ProgramError::InheritanceCycle { .. })
        ));
    }

    #[test]
    fn duplicate_variable_is_rejected() {
        let mut program = Program::new();
        let class = program.add_class("A");
        program.register_class_variable(class, "v", VarAttrFlags::CONST).unwrap();
        assert!(matches!(
            program.register_class_variable(class, "v", VarAttrFlags::NONE),
            Err(ProgramError::DuplicateAttribute { .. })
        ));
    }

    #[test]
    fn too_many_variables() {
        let mut program = Program::new();
        let class = program.add_class("Wide");
        for i in 0..METHOD_OFFSET {
            program
                .register_class_variable(class, &format!("v{i}"), VarAttrFlags::NONE)
                .unwrap();
        }
        assert!(matches!(
            program.register_class_variable(class, "overflow", VarAttrFlags::NONE),
            Err(ProgramError::TooManyAttributes { .. })
        ));
    }

    #[test]
    fn global_kinds_map_to_flags() {
        let mut program = Program::new();
        let a = program.add_global("A", Constant::Int(1), GlobalKind::SimpleConstant);
        let b = program.add_global("B", Constant::None, GlobalKind::Const);
        let c = program.add_global("C", Constant::Int(0), GlobalKind::Mutable);
        assert!(program.global(a).unwrap().is_thread_safe());
        assert!(program.global(b).unwrap().is_const());
        assert!(!program.global(b).unwrap().is_thread_safe());
        assert!(!program.global(c).unwrap().is_const());
    }
}
