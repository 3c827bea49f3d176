//! Binary and unary operator helpers for the VM.
//!
//! Numbers follow one rule: int with int stays int (checked, overflow is a `MathError`) except for
//! division, which always produces a float; any float operand makes the result a float.

use super::VmThread;
use crate::{
    bytecode::{BinOpKind, UnOpKind},
    exception::{RunError, RunResult},
    heap::HeapData,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{MapKey, Value},
};

impl<T: ResourceTracker, Tr: VmTracer> VmThread<T, Tr> {
    pub(super) fn binary_op(&mut self, op: BinOpKind, lhs: u16, rhs: u16) -> RunResult<Value> {
        let lhs = self.slot(lhs)?.clone();
        let rhs = self.slot(rhs)?.clone();
        if matches!(op, BinOpKind::Add | BinOpKind::Sub | BinOpKind::Mul)
            && let Some(result) = self.vector_arithmetic(op, &lhs, &rhs)?
        {
            return Ok(result);
        }
        match op {
            BinOpKind::Add => self.add(&lhs, &rhs),
            BinOpKind::Sub | BinOpKind::Mul | BinOpKind::Mod => self.arithmetic(op, &lhs, &rhs),
            BinOpKind::Div => self.divide(&lhs, &rhs),
            BinOpKind::Eq => Ok(Value::Bool(lhs.equals(&rhs))),
            BinOpKind::NotEq => Ok(Value::Bool(!lhs.equals(&rhs))),
            BinOpKind::Lt | BinOpKind::LtEq | BinOpKind::Gt | BinOpKind::GtEq => self.compare(op, &lhs, &rhs),
            BinOpKind::BitAnd
            | BinOpKind::BitOr
            | BinOpKind::BitXor
            | BinOpKind::ShiftLeft
            | BinOpKind::ShiftRight => self.bitwise(op, &lhs, &rhs),
            BinOpKind::And | BinOpKind::Or => match (&lhs, &rhs) {
                (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinOpKind::And { *a && *b } else { *a || *b })),
                _ => Err(self.operand_error(op, &lhs, &rhs)),
            },
            BinOpKind::Index => self.index(&lhs, &rhs),
        }
    }

    pub(super) fn unary_op(&self, op: UnOpKind, operand: u16) -> RunResult<Value> {
        let value = self.slot(operand)?.clone();
        match (op, &value) {
            (UnOpKind::Neg, Value::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| RunError::math_error("integer overflow")),
            (UnOpKind::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnOpKind::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnOpKind::BitNot, Value::Int(i)) => Ok(Value::Int(!i)),
            _ => {
                let name: &'static str = op.into();
                Err(RunError::type_error(format!(
                    "unsupported operand type for {name}: {}",
                    value.type_name(&self.heap)
                )))
            }
        }
    }

    fn operand_error(&self, op: BinOpKind, lhs: &Value, rhs: &Value) -> RunError {
        let name: &'static str = op.into();
        RunError::type_error(format!(
            "unsupported operand types for {name}: {} and {}",
            lhs.type_name(&self.heap),
            rhs.type_name(&self.heap)
        ))
    }

    fn vector(&self, value: &Value) -> Option<&[f64]> {
        match value {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Vector(components) => Some(components),
                _ => None,
            },
            _ => None,
        }
    }

    /// Component-wise `+` and `-` of vectors of the same length, `*` scales a vector by a number.
    ///
    /// Returns `None` when neither operand is a vector.
    fn vector_arithmetic(&mut self, op: BinOpKind, lhs: &Value, rhs: &Value) -> RunResult<Option<Value>> {
        let components: Vec<f64> = match (op, self.vector(lhs), self.vector(rhs)) {
            (_, None, None) => return Ok(None),
            (BinOpKind::Add | BinOpKind::Sub, Some(a), Some(b)) => {
                if a.len() != b.len() {
                    return Err(RunError::value_error(format!(
                        "vector lengths differ: {} and {}",
                        a.len(),
                        b.len()
                    )));
                }
                a.iter()
                    .zip(b)
                    .map(|(x, y)| if op == BinOpKind::Add { x + y } else { x - y })
                    .collect()
            }
            (BinOpKind::Mul, Some(v), None) | (BinOpKind::Mul, None, Some(v)) => {
                let scalar = if self.vector(lhs).is_some() { rhs } else { lhs };
                let Some(factor) = as_float(scalar) else {
                    return Err(self.operand_error(op, lhs, rhs));
                };
                v.iter().map(|x| x * factor).collect()
            }
            _ => return Err(self.operand_error(op, lhs, rhs)),
        };
        Ok(Some(Value::Ref(self.heap.allocate(HeapData::Vector(components))?)))
    }

    fn add(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => {
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                Ok(Value::Str(joined.into()))
            }
            (Value::Ref(a), Value::Ref(b)) => {
                let (HeapData::List(a), HeapData::List(b)) = (self.heap.get(*a), self.heap.get(*b)) else {
                    return Err(self.operand_error(BinOpKind::Add, lhs, rhs));
                };
                let items: Vec<Value> = a.iter().chain(b).cloned().collect();
                Ok(Value::Ref(self.heap.allocate(HeapData::List(items))?))
            }
            _ => self.arithmetic(BinOpKind::Add, lhs, rhs),
        }
    }

    fn arithmetic(&self, op: BinOpKind, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
            let result = match op {
                BinOpKind::Add => a.checked_add(*b),
                BinOpKind::Sub => a.checked_sub(*b),
                BinOpKind::Mul => a.checked_mul(*b),
                BinOpKind::Mod => {
                    if *b == 0 {
                        return Err(RunError::math_error("modulo by zero"));
                    }
                    a.checked_rem_euclid(*b)
                }
                _ => return Err(RunError::internal("not an arithmetic operator")),
            };
            return result
                .map(Value::Int)
                .ok_or_else(|| RunError::math_error("integer overflow"));
        }
        let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
            return Err(self.operand_error(op, lhs, rhs));
        };
        let result = match op {
            BinOpKind::Add => a + b,
            BinOpKind::Sub => a - b,
            BinOpKind::Mul => a * b,
            BinOpKind::Mod => {
                if b == 0.0 {
                    return Err(RunError::math_error("modulo by zero"));
                }
                a.rem_euclid(b)
            }
            _ => return Err(RunError::internal("not an arithmetic operator")),
        };
        Ok(Value::Float(result))
    }

    fn divide(&self, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
            return Err(self.operand_error(BinOpKind::Div, lhs, rhs));
        };
        if b == 0.0 {
            return Err(RunError::math_error("division by zero"));
        }
        Ok(Value::Float(a / b))
    }

    fn compare(&self, op: BinOpKind, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let ordering = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            _ => match (as_float(lhs), as_float(rhs)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => return Err(self.operand_error(op, lhs, rhs)),
            },
        };
        // NaN compares false both ways
        let Some(ordering) = ordering else {
            return Ok(Value::Bool(false));
        };
        Ok(Value::Bool(match op {
            BinOpKind::Lt => ordering.is_lt(),
            BinOpKind::LtEq => ordering.is_le(),
            BinOpKind::Gt => ordering.is_gt(),
            _ => ordering.is_ge(),
        }))
    }

    fn bitwise(&self, op: BinOpKind, lhs: &Value, rhs: &Value) -> RunResult<Value> {
        let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
            return Err(self.operand_error(op, lhs, rhs));
        };
        let (a, b) = (*a, *b);
        let result = match op {
            BinOpKind::BitAnd => a & b,
            BinOpKind::BitOr => a | b,
            BinOpKind::BitXor => a ^ b,
            BinOpKind::ShiftLeft | BinOpKind::ShiftRight => {
                let shift = u32::try_from(b)
                    .ok()
                    .filter(|&s| s < i64::BITS)
                    .ok_or_else(|| RunError::value_error(format!("invalid shift amount {b}")))?;
                if op == BinOpKind::ShiftLeft { a << shift } else { a >> shift }
            }
            _ => return Err(RunError::internal("not a bitwise operator")),
        };
        Ok(Value::Int(result))
    }

    /// `container[key]`. Lists, vectors and strings are indexed from 1; indexing a set tests
    /// membership.
    fn index(&self, container: &Value, key: &Value) -> RunResult<Value> {
        match container {
            Value::Str(s) => {
                let position = one_based(key, s.chars().count())?;
                let ch = s.chars().nth(position).map(String::from).unwrap_or_default();
                Ok(Value::Str(ch.into()))
            }
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) => {
                    let position = one_based(key, items.len())?;
                    Ok(items[position].clone())
                }
                HeapData::Map(map) => {
                    let key = MapKey::from_value(key)?;
                    map.get(&key)
                        .cloned()
                        .ok_or_else(|| RunError::index_error("key not found in map"))
                }
                HeapData::Set(members) => Ok(Value::Bool(members.contains(&MapKey::from_value(key)?))),
                HeapData::Vector(components) => {
                    let position = one_based(key, components.len())?;
                    Ok(Value::Float(components[position]))
                }
                other => Err(RunError::type_error(format!("{} cannot be indexed", other.type_name()))),
            },
            other => Err(RunError::type_error(format!(
                "{} cannot be indexed",
                other.type_name(&self.heap)
            ))),
        }
    }
}

pub(super) fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Converts a 1-based script index to a position in a sequence of `len` items.
pub(super) fn one_based(key: &Value, len: usize) -> RunResult<usize> {
    let Value::Int(index) = *key else {
        return Err(RunError::type_error("sequence index must be an int"));
    };
    usize::try_from(index)
        .ok()
        .filter(|i| (1..=len).contains(i))
        .map(|i| i - 1)
        .ok_or_else(|| RunError::index_error(format!("index {index} out of range for length {len}")))
}
