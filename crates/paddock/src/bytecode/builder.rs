//! Builder for emitting bytecode during code generation.
//!
//! `CodeBuilder` encodes instructions into raw bytes, collects the constant pool and
//! patches forward jumps once their targets are known.

use super::{
    code::{Code, CodeError, Constant},
    op::Instruction,
};

/// Builder for emitting bytecode during code generation.
///
/// # Usage
///
/// ```ignore
/// let mut builder = CodeBuilder::new();
/// let skip = builder.emit_jump(Instruction::CondJump { offset: 0, cond_slot: 0 });
/// builder.emit(Instruction::ReturnValue { slot: 1 });
/// builder.patch_jump(skip);
/// builder.emit(Instruction::ReturnValue { slot: 2 });
/// let code = builder.build()?;
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    /// The bytecode being built.
    bytecode: Vec<u8>,

    /// Constants collected during code generation.
    constants: Vec<Constant>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits an instruction and returns its offset.
    pub fn emit(&mut self, inst: Instruction) -> usize {
        let at = self.bytecode.len();
        inst.encode(&mut self.bytecode);
        at
    }

    /// Emits an instruction whose jump operands will be patched later.
    ///
    /// Whatever offsets `inst` carries are placeholders; patch each one with
    /// [`patch_jump`](Self::patch_jump) or [`patch_jump_operand`](Self::patch_jump_operand).
    #[must_use]
    pub fn emit_jump(&mut self, inst: Instruction) -> JumpLabel {
        debug_assert!(
            !inst.opcode().jump_operands().is_empty(),
            "{} has no jump operand",
            inst.opcode()
        );
        JumpLabel(self.emit(inst))
    }

    /// Patches the first jump operand of `label` to the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        self.patch_jump_operand(label, 0);
    }

    /// Patches jump operand number `operand` of `label` to the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the offset exceeds the i16 range, which means the function is too large, or if the
    /// instruction has no such operand.
    pub fn patch_jump_operand(&mut self, label: JumpLabel, operand: usize) {
        let target = self.bytecode.len();
        let offset = relative(label.0, target);
        let opcode = super::op::Opcode::from_repr(self.bytecode[label.0]).expect("JumpLabel points at an opcode");
        let pos = label.0 + opcode.jump_operands()[operand];
        self.bytecode[pos..pos + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Offset from the instruction about to be emitted to an earlier `target`.
    ///
    /// Use this for backward jumps, whose target is known at emit time.
    #[must_use]
    pub fn offset_to(&self, target: usize) -> i16 {
        relative(self.bytecode.len(), target)
    }

    /// Returns the current bytecode offset.
    ///
    /// Use this to record loop start positions for backward jumps.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool and returns its index.
    pub fn add_const(&mut self, constant: Constant) -> u32 {
        let index = u32::try_from(self.constants.len()).expect("too many constants");
        self.constants.push(constant);
        index
    }

    /// Finishes the body, validating every jump and constant reference.
    pub fn build(self) -> Result<Code, CodeError> {
        Code::new(self.bytecode, self.constants)
    }
}

fn relative(from: usize, target: usize) -> i16 {
    let from = i64::try_from(from).expect("bytecode offset exceeds i64");
    let target = i64::try_from(target).expect("bytecode target exceeds i64");
    i16::try_from(target - from).expect("jump offset exceeds i16 range (-32768..32767); function too large")
}

/// Label for a forward jump that needs patching.
///
/// Pass this to `patch_jump()` once the target location is known.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{Opcode, RescueMode};

    #[test]
    fn test_emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Instruction::NewList { slot_to: 2 });
        builder.emit(Instruction::ReturnValue { slot: 2 });

        let code = builder.build().unwrap();
        assert_eq!(
            code.bytes(),
            &[Opcode::NewList as u8, 2, 0, Opcode::ReturnValue as u8, 2, 0]
        );
    }

    #[test]
    fn test_add_const() {
        let mut builder = CodeBuilder::new();
        let idx = builder.add_const(Constant::Int(42));
        builder.emit(Instruction::SetConst { slot: 0, constant: idx });

        let code = builder.build().unwrap();
        assert_eq!(code.bytes(), &[Opcode::SetConst as u8, 0, 0, 0, 0, 0, 0]);
        assert_eq!(code.constants(), &[Constant::Int(42)]);
    }

    #[test]
    fn test_forward_jump() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Instruction::Jump { offset: 0 });
        builder.emit(Instruction::NewList { slot_to: 0 }); // 3 bytes, skipped by jump
        builder.patch_jump(jump);
        builder.emit(Instruction::ReturnValue { slot: 0 });

        let code = builder.build().unwrap();
        // Jump at offset 0, target at offset 6, offset = 6 - 0
        assert_eq!(
            code.bytes(),
            &[
                Opcode::Jump as u8,
                6,
                0,
                Opcode::NewList as u8,
                0,
                0,
                Opcode::ReturnValue as u8,
                0,
                0,
            ]
        );
    }

    #[test]
    fn test_backward_jump() {
        let mut builder = CodeBuilder::new();
        let loop_start = builder.current_offset();
        builder.emit(Instruction::NewMap { slot_to: 1 }); // offset 0, 3 bytes
        let offset = builder.offset_to(loop_start);
        builder.emit(Instruction::Jump { offset }); // offset 3, target 0

        let code = builder.build().unwrap();
        let expected_offset = (-3i16).to_le_bytes();
        assert_eq!(
            code.bytes(),
            &[
                Opcode::NewMap as u8,
                1,
                0,
                Opcode::Jump as u8,
                expected_offset[0],
                expected_offset[1],
            ]
        );
    }

    #[test]
    fn test_rescue_frame_two_targets() {
        let mut builder = CodeBuilder::new();
        let push = builder.emit_jump(Instruction::PushRescueFrame {
            mode: RescueMode::JUMP_ON_RESCUE | RescueMode::JUMP_ON_FINALLY,
            error_slot: Some(0),
            catch_offset: 0,
            finally_offset: 0,
            frame_id: 1,
        });
        builder.emit(Instruction::JumpToFinally { frame_id: 1 }); // offset 10
        builder.patch_jump_operand(push, 0); // catch at 13
        builder.emit(Instruction::JumpToFinally { frame_id: 1 });
        builder.patch_jump_operand(push, 1); // finally at 16
        builder.emit(Instruction::PopRescueFrame { frame_id: 1 });

        let code = builder.build().unwrap();
        let (inst, _) = code.decode_at(0).unwrap();
        assert_eq!(
            inst,
            Instruction::PushRescueFrame {
                mode: RescueMode::JUMP_ON_RESCUE | RescueMode::JUMP_ON_FINALLY,
                error_slot: Some(0),
                catch_offset: 13,
                finally_offset: 16,
                frame_id: 1,
            }
        );
    }

    #[test]
    fn test_build_rejects_unpatched_backward_garbage() {
        let mut builder = CodeBuilder::new();
        builder.emit(Instruction::Jump { offset: -1 });
        assert!(matches!(builder.build(), Err(CodeError::InvalidJump { offset: 0, relative: -1 })));
    }
}
