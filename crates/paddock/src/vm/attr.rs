//! Attribute, container and iterator helpers for the VM.

use std::sync::Arc;

use super::{
    Step, SuspendInfo, SuspendRequest, ThreadExit, VmThread,
    binary::{as_float, one_based},
};
use crate::{
    exception::{RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::{BuiltinName, ClassId, NameId},
    program::{AttrIdx, Function, VarAttrFlags},
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{MapKey, Value},
};

impl<T: ResourceTracker, Tr: VmTracer> VmThread<T, Tr> {
    fn attr_name(&self, name: NameId) -> &str {
        self.program.interns().try_name(name).unwrap_or("<unknown>")
    }

    fn missing_attribute(&self, obj: &Value, name: NameId) -> RunError {
        RunError::attribute_error(format!(
            "{} has no attribute `{}`",
            obj.type_name(&self.heap),
            self.attr_name(name)
        ))
    }

    /// The instance behind `obj`, if it is one.
    fn instance_class(&self, obj: &Value) -> Option<(HeapId, ClassId)> {
        match obj {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Instance { class, .. } => Some((*id, *class)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Late-bound attribute read. Besides instance attributes, strings and containers have `len`.
    pub(super) fn get_attribute_by_name(&mut self, obj: &Value, name: NameId) -> RunResult<Value> {
        if let Some((_, class)) = self.instance_class(obj) {
            let attr = self
                .program
                .class_attribute(class, name)
                .ok_or_else(|| self.missing_attribute(obj, name))?;
            return self.get_attribute_by_idx(obj, attr);
        }
        if name == BuiltinName::Len.name_id()
            && let Some(len) = self.builtin_len(obj)
        {
            let len = i64::try_from(len).map_err(|_| RunError::math_error("length does not fit an int"))?;
            return Ok(Value::Int(len));
        }
        Err(self.missing_attribute(obj, name))
    }

    fn builtin_len(&self, obj: &Value) -> Option<usize> {
        match obj {
            Value::Str(s) => Some(s.chars().count()),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) => Some(items.len()),
                HeapData::Map(map) => Some(map.len()),
                HeapData::Set(members) => Some(members.len()),
                HeapData::Vector(components) => Some(components.len()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Early-bound attribute read. Reading a method creates a bound method.
    pub(super) fn get_attribute_by_idx(&mut self, obj: &Value, attr: AttrIdx) -> RunResult<Value> {
        let Some((id, class)) = self.instance_class(obj) else {
            return Err(RunError::attribute_error(format!(
                "{} has no attributes",
                obj.type_name(&self.heap)
            )));
        };
        if let Some(index) = attr.var_index() {
            let HeapData::Instance { attrs, .. } = self.heap.get(id) else {
                return Err(RunError::internal("instance changed kind"));
            };
            return attrs
                .get(index)
                .cloned()
                .ok_or_else(|| RunError::attribute_error(format!("attribute index {} out of range", attr.raw())));
        }
        let func = self
            .program
            .class(class)
            .and_then(|class| class.method(attr))
            .ok_or_else(|| RunError::attribute_error(format!("method index {} out of range", attr.raw())))?;
        let bound = self.heap.allocate(HeapData::BoundMethod {
            func,
            receiver: obj.clone(),
        })?;
        Ok(Value::Ref(bound))
    }

    /// The class an instance or error was created from.
    pub(super) fn get_constructor(&self, obj: &Value) -> RunResult<Value> {
        if let Some((_, class)) = self.instance_class(obj) {
            return Ok(Value::Class(class));
        }
        match obj {
            Value::Error(err) => Ok(Value::Class(err.class())),
            other => Err(RunError::type_error(format!(
                "{} has no constructor",
                other.type_name(&self.heap)
            ))),
        }
    }

    pub(super) fn has_attribute(&self, obj: &Value, name: NameId) -> bool {
        match self.instance_class(obj) {
            Some((_, class)) => self.program.class_attribute(class, name).is_some(),
            None => name == BuiltinName::Len.name_id() && self.builtin_len(obj).is_some(),
        }
    }

    pub(super) fn set_attribute_by_name(&mut self, obj_slot: u16, name: NameId, value_slot: u16) -> RunResult<()> {
        let obj = self.slot(obj_slot)?.clone();
        let Some((_, class)) = self.instance_class(&obj) else {
            return Err(RunError::attribute_error(format!(
                "cannot set attribute `{}` on {}",
                self.attr_name(name),
                obj.type_name(&self.heap)
            )));
        };
        let attr = self
            .program
            .class_attribute(class, name)
            .ok_or_else(|| self.missing_attribute(&obj, name))?;
        self.set_attribute_by_idx(obj_slot, attr, value_slot)
    }

    /// Assigns a variable attribute. Const attributes are only assignable from the class's
    /// variable initializer, protected ones only from code of the class or one of its bases.
    pub(super) fn set_attribute_by_idx(&mut self, obj_slot: u16, attr: AttrIdx, value_slot: u16) -> RunResult<()> {
        let obj = self.slot(obj_slot)?.clone();
        let value = self.slot(value_slot)?.clone();
        let Some((id, class)) = self.instance_class(&obj) else {
            return Err(RunError::attribute_error(format!(
                "cannot set attributes on {}",
                obj.type_name(&self.heap)
            )));
        };
        let program = Arc::clone(&self.program);
        let class_def = program
            .class(class)
            .ok_or_else(|| RunError::internal(format!("no class with id {class}")))?;
        let Some(index) = attr.var_index() else {
            return Err(RunError::attribute_error(format!(
                "cannot assign to a method of `{}`",
                class_def.name()
            )));
        };
        let var = class_def
            .var_attr(attr)
            .ok_or_else(|| RunError::attribute_error(format!("attribute index {} out of range", attr.raw())))?;
        let func = self.frame()?.func;
        if var.flags.contains(VarAttrFlags::CONST) && class_def.varinit() != Some(func) {
            return Err(RunError::attribute_error(format!(
                "attribute `{}` of `{}` is const",
                self.attr_name(var.name),
                class_def.name()
            )));
        }
        if var.flags.contains(VarAttrFlags::PROTECT)
            && !program
                .function(func)
                .and_then(Function::class)
                .is_some_and(|owner| program.is_subclass(class, owner))
        {
            return Err(RunError::attribute_error(format!(
                "attribute `{}` of `{}` is protected",
                self.attr_name(var.name),
                class_def.name()
            )));
        }
        if self.heap.set_instance_attr(id, index, value) {
            Ok(())
        } else {
            Err(RunError::attribute_error(format!("attribute index {} out of range", attr.raw())))
        }
    }

    /// `container[key] = value`. Lists and vectors are indexed from 1, maps take any hashable key.
    ///
    /// A vector grows by assigning one past its end. Assigning a bool to a set member adds (`yes`) or
    /// removes (`no`) it.
    pub(super) fn set_by_index(&mut self, obj_slot: u16, index_slot: u16, value_slot: u16) -> RunResult<()> {
        let obj = self.slot(obj_slot)?.clone();
        let key = self.slot(index_slot)?.clone();
        let value = self.slot(value_slot)?.clone();
        let Value::Ref(id) = obj else {
            return Err(RunError::type_error(format!(
                "{} does not support item assignment",
                obj.type_name(&self.heap)
            )));
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let len = items.len();
                let position = one_based(&key, len)?;
                if !self.heap.set_list_item(id, position, value) {
                    return Err(RunError::index_error(format!("index out of range for length {len}")));
                }
            }
            HeapData::Map(_) => {
                let key = MapKey::from_value(&key)?;
                self.heap.map_insert(id, key, value);
            }
            HeapData::Set(_) => {
                let member = MapKey::from_value(&key)?;
                let Value::Bool(present) = value else {
                    return Err(RunError::type_error("set membership must be assigned a bool"));
                };
                if let HeapData::Set(members) = self.heap.get_mut(id) {
                    if present {
                        members.insert(member);
                    } else {
                        members.shift_remove(&member);
                    }
                }
            }
            HeapData::Vector(components) => {
                let len = components.len();
                let Some(component) = as_float(&value) else {
                    return Err(RunError::type_error(format!(
                        "vector components must be numbers, not {}",
                        value.type_name(&self.heap)
                    )));
                };
                let position = one_based(&key, len + 1).map_err(|err| match key {
                    Value::Int(index) => {
                        RunError::index_error(format!("index {index} out of range for vector of length {len}"))
                    }
                    _ => err,
                })?;
                if let HeapData::Vector(components) = self.heap.get_mut(id) {
                    if position == len {
                        components.push(component);
                    } else {
                        components[position] = component;
                    }
                }
            }
            other => {
                return Err(RunError::type_error(format!(
                    "{} does not support item assignment",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    pub(super) fn new_iterator(&mut self, slot_to: u16, container_slot: u16) -> RunResult<()> {
        let container = self.slot(container_slot)?.clone();
        let iterable = match &container {
            Value::Str(_) => true,
            Value::Ref(id) => matches!(
                self.heap.get(*id),
                HeapData::List(_) | HeapData::Map(_) | HeapData::Set(_) | HeapData::Vector(_)
            ),
            _ => false,
        };
        if !iterable {
            return Err(RunError::type_error(format!(
                "{} is not iterable",
                container.type_name(&self.heap)
            )));
        }
        let iter = self.heap.allocate(HeapData::Iterator {
            source: container,
            position: 0,
        })?;
        self.set_slot(slot_to, Value::Ref(iter))
    }

    /// Advances an iterator into `value_to`. Returns `false` once it is exhausted.
    ///
    /// Lists yield their items, maps their keys and sets their members in insertion order, vectors
    /// their components and strings their characters.
    pub(super) fn iterate(&mut self, value_to: u16, iter_slot: u16) -> RunResult<bool> {
        let iter_value = self.slot(iter_slot)?.clone();
        let iter = match iter_value {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Iterator { .. }) => id,
            ref other => {
                return Err(RunError::type_error(format!(
                    "{} is not an iterator",
                    other.type_name(&self.heap)
                )));
            }
        };
        let HeapData::Iterator { source, position } = self.heap.get(iter) else {
            return Err(RunError::internal("iterator changed kind"));
        };
        let position = *position;
        let next = match source {
            Value::Str(s) => s
                .get(position..)
                .and_then(|rest| rest.chars().next())
                .map(|ch| (Value::Str(ch.to_string().into()), position + ch.len_utf8())),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) => items.get(position).map(|item| (item.clone(), position + 1)),
                HeapData::Map(map) => map.get_index(position).map(|(key, _)| (key.to_value(), position + 1)),
                HeapData::Set(members) => members.get_index(position).map(|member| (member.to_value(), position + 1)),
                HeapData::Vector(components) => components
                    .get(position)
                    .map(|component| (Value::Float(*component), position + 1)),
                _ => return Err(RunError::internal("iterator over a non-iterable")),
            },
            _ => return Err(RunError::internal("iterator over a non-iterable")),
        };
        let Some((value, next_position)) = next else {
            return Ok(false);
        };
        if let HeapData::Iterator { position, .. } = self.heap.get_mut(iter) {
            *position = next_position;
        }
        self.set_slot(value_to, value)?;
        Ok(true)
    }

    /// Takes the next item from a pipe, or suspends until one arrives.
    ///
    /// On suspension the instruction is rewound, so it runs again after the resume.
    pub(super) fn await_item(&mut self, slot_to: u16, pipe_slot: u16) -> RunResult<Step> {
        let Value::Pipe(pipe) = self.slot(pipe_slot)?.clone() else {
            let value = self.slot(pipe_slot)?;
            return Err(RunError::type_error(format!(
                "can only await items from a pipe, not {}",
                value.type_name(&self.heap)
            )));
        };
        if let Some(item) = pipe.try_recv() {
            let value = Value::import(&item, &mut self.heap)?;
            self.set_slot(slot_to, value)?;
            return Ok(Step::Continue);
        }
        let frame = self.frame_mut()?;
        frame.ip = frame.current.unwrap_or(frame.ip);
        self.set_suspend_state(SuspendInfo::AwaitingItem { pipe: pipe.clone() });
        Ok(Step::Exit(ThreadExit::Suspended(SuspendRequest::AwaitItem(pipe))))
    }
}
