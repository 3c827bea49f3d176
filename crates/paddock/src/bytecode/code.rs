//! Encoded function bodies and their constant pools.

use std::{fmt, sync::Arc};

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use super::op::{DecodeError, Instruction};

/// Literal referenced by [`Instruction::SetConst`] and used as the initial content of globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

impl Constant {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

/// The encoded bytecode of one script function plus its constant pool.
///
/// A `Code` only exists in validated form: every instruction decodes, every jump lands on an
/// instruction boundary inside the body, and every constant operand indexes the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    bytes: Vec<u8>,
    constants: Vec<Constant>,
    instruction_count: usize,
}

impl Code {
    /// Validates an encoded body.
    pub fn new(bytes: Vec<u8>, constants: Vec<Constant>) -> Result<Self, CodeError> {
        let instruction_count = check_body(&bytes, &constants)?;
        Ok(Self {
            bytes,
            constants,
            instruction_count,
        })
    }

    /// Re-runs validation on a body that came from an untrusted source such as a snapshot.
    pub fn validate(&self) -> Result<(), CodeError> {
        let count = check_body(&self.bytes, &self.constants)?;
        debug_assert_eq!(count, self.instruction_count);
        Ok(())
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[must_use]
    pub fn constant(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// Decodes the instruction at `offset`, returning it with its encoded size.
    pub fn decode_at(&self, offset: usize) -> Result<(Instruction, usize), DecodeError> {
        Instruction::decode(&self.bytes, offset)
    }

    /// Iterates `(offset, instruction)` pairs in order.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, Instruction)> + '_ {
        let mut offset = 0;
        std::iter::from_fn(move || {
            if offset >= self.bytes.len() {
                return None;
            }
            // validated at construction
            let (inst, size) = Instruction::decode(&self.bytes, offset).ok()?;
            let at = offset;
            offset += size;
            Some((at, inst))
        })
    }
}

/// Resolves a relative jump to an absolute offset, if it stays in `0..len`.
pub(crate) fn jump_target(at: usize, offset: i16, len: usize) -> Option<usize> {
    let target = at.checked_add_signed(isize::from(offset))?;
    (target < len).then_some(target)
}

fn check_body(bytes: &[u8], constants: &[Constant]) -> Result<usize, CodeError> {
    let mut boundaries = AHashSet::new();
    let mut jumps = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (inst, size) = Instruction::decode(bytes, offset).map_err(CodeError::Decode)?;
        boundaries.insert(offset);
        if let Instruction::SetConst { constant, .. } = inst
            && constant as usize >= constants.len()
        {
            return Err(CodeError::BadConstant { offset, index: constant });
        }
        for rel in inst.jump_offsets() {
            jumps.push((offset, rel));
        }
        offset += size;
    }
    for (at, rel) in jumps {
        match jump_target(at, rel, bytes.len()) {
            Some(target) if boundaries.contains(&target) => {}
            _ => return Err(CodeError::InvalidJump { offset: at, relative: rel }),
        }
    }
    Ok(boundaries.len())
}

/// Why an encoded body was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    Decode(DecodeError),
    /// A jump leaves the body or lands inside another instruction's operands.
    InvalidJump { offset: usize, relative: i16 },
    BadConstant { offset: usize, index: u32 },
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "{err}"),
            Self::InvalidJump { offset, relative } => {
                write!(f, "jump at offset {offset} by {relative} does not land on an instruction")
            }
            Self::BadConstant { offset, index } => write!(f, "constant {index} referenced at offset {offset} does not exist"),
        }
    }
}

impl std::error::Error for CodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode;

    fn encode(insts: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::new();
        for inst in insts {
            inst.encode(&mut out);
        }
        out
    }

    #[test]
    fn accepts_jump_to_boundary() {
        let bytes = encode(&[
            Instruction::Jump { offset: 3 },
            Instruction::ReturnValue { slot: 0 },
        ]);
        let code = Code::new(bytes, vec![]).unwrap();
        assert_eq!(code.instruction_count(), 2);
        let ops: Vec<_> = code.instructions().map(|(at, inst)| (at, inst.opcode())).collect();
        assert_eq!(ops, vec![(0, Opcode::Jump), (3, Opcode::ReturnValue)]);
    }

    #[test]
    fn rejects_jump_into_operands() {
        let bytes = encode(&[
            Instruction::Jump { offset: 4 },
            Instruction::ReturnValue { slot: 0 },
        ]);
        assert_eq!(
            Code::new(bytes, vec![]),
            Err(CodeError::InvalidJump { offset: 0, relative: 4 })
        );
    }

    #[test]
    fn rejects_jump_before_start() {
        let bytes = encode(&[Instruction::ReturnValue { slot: 0 }, Instruction::Jump { offset: -4 }]);
        assert_eq!(
            Code::new(bytes, vec![]),
            Err(CodeError::InvalidJump { offset: 3, relative: -4 })
        );
    }

    #[test]
    fn rejects_missing_constant() {
        let bytes = encode(&[Instruction::SetConst { slot: 0, constant: 1 }]);
        assert_eq!(
            Code::new(bytes, vec![Constant::Int(1)]),
            Err(CodeError::BadConstant { offset: 0, index: 1 })
        );
    }
}
