//! Values as the VM holds them: immediates inline, containers and instances on the thread's heap.

use std::{fmt, sync::Arc};

use crate::{
    bytecode::Constant,
    exception::{RunError, RunResult, ScriptError},
    heap::{Heap, HeapData, HeapId, ValueMap, ValueSet},
    intern::{ClassId, FuncId},
    object::Object,
    resource::{MAX_DATA_RECURSION_DEPTH, ResourceTracker},
    vm::PipeHandle,
};

/// A stack slot, global, or container element.
///
/// `Ref` values are counted: whoever stores one outside the heap graph holds an external reference
/// on it, and containers hold heap references on their elements.
#[derive(Debug, Clone, Default)]
pub(crate) enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Func(FuncId),
    Class(ClassId),
    Error(Arc<ScriptError>),
    Pipe(PipeHandle),
    Ref(HeapId),
}

/// Hashable subset of values usable as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MapKey {
    None,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
}

impl MapKey {
    pub fn from_value(value: &Value) -> RunResult<Self> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Str(s) => Ok(Self::Str(Arc::clone(s))),
            _ => Err(RunError::type_error("map keys must be none, bool, int or str")),
        }
    }

    fn from_object(obj: &Object) -> RunResult<Self> {
        match obj {
            Object::None => Ok(Self::None),
            Object::Bool(b) => Ok(Self::Bool(*b)),
            Object::Int(i) => Ok(Self::Int(*i)),
            Object::Str(s) => Ok(Self::Str(Arc::clone(s))),
            other => Err(RunError::type_error(format!("{} cannot be a map key", other.type_name()))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Str(s) => Value::Str(Arc::clone(s)),
        }
    }

    fn to_object(&self) -> Object {
        match self {
            Self::None => Object::None,
            Self::Bool(b) => Object::Bool(*b),
            Self::Int(i) => Object::Int(*i),
            Self::Str(s) => Object::Str(Arc::clone(s)),
        }
    }
}

impl Value {
    pub fn from_constant(constant: &Constant) -> Self {
        match constant {
            Constant::None => Self::None,
            Constant::Bool(b) => Self::Bool(*b),
            Constant::Int(i) => Self::Int(*i),
            Constant::Float(x) => Self::Float(*x),
            Constant::Str(s) => Self::Str(Arc::clone(s)),
        }
    }

    pub fn type_name<T: ResourceTracker>(&self, heap: &Heap<T>) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Func(_) => "func",
            Self::Class(_) => "class",
            Self::Error(_) => "error",
            Self::Pipe(_) => "pipe",
            Self::Ref(id) => heap.get(*id).type_name(),
        }
    }

    /// Identity for heap values, content for immediates. Ints and floats compare numerically.
    #[expect(clippy::float_cmp, reason = "script equality is exact")]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Func(a), Self::Func(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => Arc::ptr_eq(a, b),
            (Self::Pipe(a), Self::Pipe(b)) => a.ptr_eq(b),
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Deep-copies a value out of `heap`.
    ///
    /// Iterators and values nested deeper than [`MAX_DATA_RECURSION_DEPTH`] (which includes any
    /// cyclic structure) cannot be transferred.
    pub fn export<T: ResourceTracker>(&self, heap: &Heap<T>) -> RunResult<Object> {
        self.export_at(heap, 0)
    }

    fn export_at<T: ResourceTracker>(&self, heap: &Heap<T>, depth: usize) -> RunResult<Object> {
        if depth > MAX_DATA_RECURSION_DEPTH {
            return Err(RunError::value_error("value is nested too deeply to transfer"));
        }
        Ok(match self {
            Self::None => Object::None,
            Self::Bool(b) => Object::Bool(*b),
            Self::Int(i) => Object::Int(*i),
            Self::Float(x) => Object::Float(*x),
            Self::Str(s) => Object::Str(Arc::clone(s)),
            Self::Func(f) => Object::Func(*f),
            Self::Class(c) => Object::Class(*c),
            Self::Error(e) => Object::Error(Arc::clone(e)),
            Self::Pipe(p) => Object::Pipe(p.clone()),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::List(items) => Object::List(
                    items
                        .iter()
                        .map(|item| item.export_at(heap, depth + 1))
                        .collect::<RunResult<_>>()?,
                ),
                HeapData::Map(map) => Object::Map(
                    map.iter()
                        .map(|(k, v)| Ok((k.to_object(), v.export_at(heap, depth + 1)?)))
                        .collect::<RunResult<_>>()?,
                ),
                HeapData::Set(members) => Object::Set(members.iter().map(MapKey::to_object).collect()),
                HeapData::Vector(components) => Object::Vector(components.clone()),
                HeapData::Instance { class, attrs } => Object::Instance {
                    class: *class,
                    attrs: attrs
                        .iter()
                        .map(|a| a.export_at(heap, depth + 1))
                        .collect::<RunResult<_>>()?,
                },
                HeapData::BoundMethod { func, receiver } => Object::BoundMethod {
                    func: *func,
                    receiver: Box::new(receiver.export_at(heap, depth + 1)?),
                },
                HeapData::Iterator { .. } => return Err(RunError::type_error("an iterator cannot be transferred")),
            },
        })
    }

    /// Allocates `obj` into `heap`. The result is uncounted, like a fresh allocation.
    pub fn import<T: ResourceTracker>(obj: &Object, heap: &mut Heap<T>) -> RunResult<Self> {
        Self::import_at(obj, heap, 0)
    }

    fn import_at<T: ResourceTracker>(obj: &Object, heap: &mut Heap<T>, depth: usize) -> RunResult<Self> {
        if depth > MAX_DATA_RECURSION_DEPTH {
            return Err(RunError::value_error("value is nested too deeply to transfer"));
        }
        let data = match obj {
            Object::None => return Ok(Self::None),
            Object::Bool(b) => return Ok(Self::Bool(*b)),
            Object::Int(i) => return Ok(Self::Int(*i)),
            Object::Float(x) => return Ok(Self::Float(*x)),
            Object::Str(s) => return Ok(Self::Str(Arc::clone(s))),
            Object::Func(f) => return Ok(Self::Func(*f)),
            Object::Class(c) => return Ok(Self::Class(*c)),
            Object::Error(e) => return Ok(Self::Error(Arc::clone(e))),
            Object::Pipe(p) => return Ok(Self::Pipe(p.clone())),
            Object::List(items) => HeapData::List(import_all(items.iter(), heap, depth)?),
            Object::Set(members) => {
                let mut set = ValueSet::with_capacity_and_hasher(members.len(), ahash::RandomState::new());
                for member in members {
                    set.insert(MapKey::from_object(member)?);
                }
                HeapData::Set(set)
            }
            Object::Vector(components) => HeapData::Vector(components.clone()),
            Object::Instance { class, attrs } => HeapData::Instance {
                class: *class,
                attrs: import_all(attrs.iter(), heap, depth)?,
            },
            Object::BoundMethod { func, receiver } => HeapData::BoundMethod {
                func: *func,
                receiver: Self::import_at(receiver, heap, depth + 1)?,
            },
            Object::Map(entries) => {
                let keys = entries
                    .iter()
                    .map(|(k, _)| MapKey::from_object(k))
                    .collect::<RunResult<Vec<_>>>()?;
                let values = import_all(entries.iter().map(|(_, v)| v), heap, depth)?;
                let mut map = ValueMap::with_capacity_and_hasher(keys.len(), ahash::RandomState::new());
                for (key, value) in keys.into_iter().zip(values) {
                    if let Some(replaced) = map.insert(key, value) {
                        heap.drop_temp(&replaced);
                    }
                }
                HeapData::Map(map)
            }
        };
        let mut children = Vec::new();
        data_children(&data, &mut children);
        match heap.allocate(data) {
            Ok(id) => Ok(Self::Ref(id)),
            Err(err) => {
                for child in &children {
                    heap.drop_temp(child);
                }
                Err(err.into())
            }
        }
    }
}

fn import_all<'a, T: ResourceTracker>(
    objects: impl Iterator<Item = &'a Object>,
    heap: &mut Heap<T>,
    depth: usize,
) -> RunResult<Vec<Value>> {
    let mut out = Vec::new();
    for obj in objects {
        match Value::import_at(obj, heap, depth + 1) {
            Ok(value) => out.push(value),
            Err(err) => {
                for value in &out {
                    heap.drop_temp(value);
                }
                return Err(err);
            }
        }
    }
    Ok(out)
}

fn data_children(data: &HeapData, out: &mut Vec<Value>) {
    match data {
        HeapData::List(items) | HeapData::Instance { attrs: items, .. } => out.extend(items.iter().cloned()),
        HeapData::Map(map) => out.extend(map.values().cloned()),
        HeapData::Set(_) | HeapData::Vector(_) => {}
        HeapData::BoundMethod { receiver, .. } => out.push(receiver.clone()),
        HeapData::Iterator { source, .. } => out.push(source.clone()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Bool(b) => f.write_str(if *b { "yes" } else { "no" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => f.write_str(s),
            Self::Func(id) => write!(f, "<func {id}>"),
            Self::Class(id) => write!(f, "<class {id}>"),
            Self::Error(e) => write!(f, "<{e}>"),
            Self::Pipe(_) => f.write_str("<pipe>"),
            Self::Ref(id) => write!(f, "<object {id}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resource::{LimitedTracker, NoLimitTracker, ResourceLimits};

    #[test]
    fn import_then_export_preserves_nesting() {
        let mut heap = Heap::new(NoLimitTracker);
        let obj = Object::List(vec![
            Object::Int(1),
            Object::Map(vec![(Object::from("a"), Object::List(vec![Object::Bool(true)]))]),
        ]);
        let value = Value::import(&obj, &mut heap).unwrap();
        heap.retain(&value);
        assert_eq!(heap.stats().live_objects, 3);
        assert_eq!(value.export(&heap).unwrap(), obj);
        heap.release(&value);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn failed_import_leaves_nothing_behind() {
        let mut heap = Heap::new(LimitedTracker::new(ResourceLimits::new().max_allocations(2)));
        let obj = Object::List(vec![Object::List(vec![]), Object::List(vec![]), Object::List(vec![])]);
        let err = Value::import(&obj, &mut heap).unwrap_err();
        assert!(matches!(err, RunError::UncatchableExc(_)));
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn cyclic_values_cannot_be_exported() {
        let mut heap = Heap::new(NoLimitTracker);
        let list = heap.allocate(HeapData::List(Vec::new())).unwrap();
        heap.add_external(list);
        heap.list_push(list, Value::Ref(list));
        assert!(matches!(Value::Ref(list).export(&heap), Err(RunError::Exc(_))));
    }

    #[test]
    fn sets_and_vectors_round_trip_without_children() {
        let mut heap = Heap::new(NoLimitTracker);
        let obj = Object::List(vec![
            Object::Set(vec![Object::from("b"), Object::Int(1)]),
            Object::Vector(vec![0.5, 2.0]),
        ]);
        let value = Value::import(&obj, &mut heap).unwrap();
        heap.retain(&value);
        assert_eq!(heap.stats().live_objects, 3);
        assert_eq!(value.export(&heap).unwrap(), obj);
        heap.release(&value);
        assert_eq!(heap.stats().live_objects, 0);

        let bad = Object::Set(vec![Object::Float(1.5)]);
        assert!(Value::import(&bad, &mut heap).is_err());
    }

    #[test]
    fn float_keys_are_rejected() {
        assert!(MapKey::from_value(&Value::Float(1.0)).is_err());
        assert!(MapKey::from_value(&Value::Int(4)).unwrap().to_value().equals(&Value::Int(4)));
    }
}
