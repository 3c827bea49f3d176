//! Owned, heap-independent values exchanged with the host and between VM threads.
//!
//! Every VM thread has its own heap, so anything that crosses a thread boundary (call arguments for
//! an async dispatch, return values, pipe items, native call arguments) is deep-copied into an
//! [`Object`] on the way out and re-allocated on the way in.

use std::{fmt, sync::Arc};

use crate::{
    exception::ScriptError,
    intern::{ClassId, FuncId},
    vm::PipeHandle,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Vec<Object>),
    /// Key/value pairs in insertion order. Keys are `none`, bools, ints or strings.
    Map(Vec<(Object, Object)>),
    /// Members in insertion order, with the same restrictions as map keys.
    Set(Vec<Object>),
    Vector(Vec<f64>),
    Func(FuncId),
    Class(ClassId),
    Instance {
        class: ClassId,
        attrs: Vec<Object>,
    },
    BoundMethod {
        func: FuncId,
        receiver: Box<Object>,
    },
    Error(Arc<ScriptError>),
    Pipe(PipeHandle),
}

impl Object {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Vector(_) => "vector",
            Self::Func(_) | Self::BoundMethod { .. } => "func",
            Self::Class(_) => "class",
            Self::Instance { .. } => "instance",
            Self::Error(_) => "error",
            Self::Pipe(_) => "pipe",
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Object {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Object {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Object {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Object {
    fn from(value: &str) -> Self {
        Self::str(value)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Bool(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key} -> {value}")?;
                }
                f.write_str("}")
            }
            Self::Set(members) => {
                f.write_str("{")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{member}")?;
                }
                f.write_str("}")
            }
            Self::Vector(components) => {
                f.write_str("vec(")?;
                for (i, component) in components.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{component:?}")?;
                }
                f.write_str(")")
            }
            Self::Func(id) => write!(f, "<func {id}>"),
            Self::Class(id) => write!(f, "<class {id}>"),
            Self::Instance { class, .. } => write!(f, "<instance of class {class}>"),
            Self::BoundMethod { func, .. } => write!(f, "<bound func {func}>"),
            Self::Error(err) => write!(f, "<{err}>"),
            Self::Pipe(_) => f.write_str("<pipe>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_nested() {
        let obj = Object::List(vec![
            Object::Int(1),
            Object::Map(vec![(Object::from("k"), Object::Bool(false))]),
        ]);
        assert_eq!(obj.to_string(), r#"[1, {"k" -> no}]"#);
    }

    #[test]
    fn display_sets_and_vectors() {
        let set = Object::Set(vec![Object::Int(3), Object::from("x")]);
        assert_eq!(set.to_string(), r#"{3, "x"}"#);
        assert_eq!(Object::Vector(vec![1.0, -0.5]).to_string(), "vec(1.0, -0.5)");
        assert_eq!(Object::Vector(vec![]).type_name(), "vector");
    }
}
