//! Dense ids for program entities and interning of attribute names.
//!
//! Every class, function, global and attribute name in a [`Program`](crate::Program) is addressed by
//! a `u32` newtype so bytecode operands stay small and lookups are plain vector indexing.
//!
//! Names are laid out as follows:
//! * 0 to count(BuiltinName) - the builtin attribute names, in declaration order
//! * everything after - names interned while the program is being built

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator, IntoStaticStr};

macro_rules! dense_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            /// Creates the id from a raw operand value.
            ///
            /// The caller is responsible for ensuring the index is valid for the program it is used with.
            #[inline]
            #[must_use]
            pub const fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            pub(crate) fn from_index(index: usize) -> Self {
                Self(u32::try_from(index).expect(concat!(stringify!($name), " overflow")))
            }

            /// Returns the raw operand value.
            #[inline]
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Returns the id as a vector index.
            #[inline]
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

dense_id!(
    /// Index of a function in the program's function table.
    FuncId
);
dense_id!(
    /// Index of a class in the program's class table.
    ClassId
);
dense_id!(
    /// Index of a global variable in the program's global table.
    GlobalId
);
dense_id!(
    /// Index of an interned attribute or identifier name.
    NameId
);

/// Attribute names the runtime itself looks up on classes and builtin values.
///
/// These are interned first by every [`Interns`], so `BuiltinName::Init.name_id()` is the same in
/// every program and can be baked into bytecode and native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum BuiltinName {
    AsBytes,
    Join,
    AsStr,
    Len,
    Init,
    OnCloned,
    OnDestroy,
    Add,
    Del,
    Contains,
    IsA,
}

impl BuiltinName {
    #[must_use]
    pub fn name_id(self) -> NameId {
        NameId(self as u32)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Maps an interned name back to the builtin it stands for, if any.
    #[must_use]
    pub fn from_name_id(id: NameId) -> Option<Self> {
        u8::try_from(id.0).ok().and_then(Self::from_repr)
    }
}

/// Name interner owned by a [`Program`](crate::Program).
///
/// Only the ordered name list is serialized; the reverse lookup is rebuilt after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interns {
    names: Vec<String>,
    #[serde(skip)]
    lookup: AHashMap<String, NameId>,
}

impl Default for Interns {
    fn default() -> Self {
        Self::new()
    }
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Self {
            names: Vec::with_capacity(BuiltinName::COUNT),
            lookup: AHashMap::with_capacity(BuiltinName::COUNT),
        };
        for builtin in BuiltinName::iter() {
            let id = interns.intern(builtin.as_str());
            debug_assert_eq!(id, builtin.name_id());
        }
        interns
    }

    /// Returns the id for `name`, interning it on first use.
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = NameId::from_index(self.names.len());
        self.names.push(name.to_owned());
        self.lookup.insert(name.to_owned(), id);
        id
    }

    /// Looks a name up without interning it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<NameId> {
        self.lookup.get(name).copied()
    }

    /// Returns the text of an interned name.
    ///
    /// # Panics
    /// Panics if `id` was not produced by this interner.
    #[must_use]
    pub fn name(&self, id: NameId) -> &str {
        self.names.get(id.index()).expect("Interns::name: unknown NameId")
    }

    #[must_use]
    pub fn try_name(&self, id: NameId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn rebuild_lookup(&mut self) {
        self.lookup = self
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), NameId::from_index(index)))
            .collect();
    }
}
