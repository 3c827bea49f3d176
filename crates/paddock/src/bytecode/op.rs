//! Opcode tags, decoded instructions and their byte encoding.
//!
//! Every instruction starts with a one-byte [`Opcode`] tag followed by fixed-width little-endian
//! operands, so the encoded size of an instruction depends only on its tag. Stack slots are `u16`,
//! program ids are `u32` and jump offsets are `i16` measured from the start of the jump instruction.

use std::fmt;

use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::intern::{ClassId, FuncId, GlobalId, NameId};
use crate::program::AttrIdx;

/// Sentinel encoding of "no error slot" in [`Instruction::PushRescueFrame`].
const NO_SLOT: u16 = u16::MAX;

/// One-byte instruction tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, EnumCount, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Opcode {
    SetConst,
    SetGlobal,
    GetGlobal,
    SetByIndexExpr,
    SetByAttributeName,
    SetByAttributeIdx,
    GetFunc,
    GetClass,
    ValueCopy,
    BinOp,
    UnOp,
    Call,
    CallIgnoreIfNone,
    ReturnValue,
    CondJump,
    CondJumpEx,
    Jump,
    NewIterator,
    Iterate,
    PushRescueFrame,
    AddRescueTypeByRef,
    AddRescueType,
    PopRescueFrame,
    GetAttributeByName,
    GetAttributeByIdx,
    JumpToFinally,
    NewList,
    NewSet,
    NewMap,
    NewVector,
    NewInstance,
    NewInstanceByRef,
    GetConstructor,
    AwaitItem,
    CreatePipe,
    HasAttrJump,
    Raise,
    RaiseByRef,
}

impl Opcode {
    /// Total encoded size of an instruction with this tag, tag byte included.
    #[must_use]
    pub const fn encoded_size(self) -> usize {
        1 + match self {
            Self::ReturnValue
            | Self::Jump
            | Self::PopRescueFrame
            | Self::JumpToFinally
            | Self::NewList
            | Self::NewSet
            | Self::NewMap
            | Self::NewVector
            | Self::CreatePipe => 2,
            Self::ValueCopy
            | Self::CondJump
            | Self::NewIterator
            | Self::AddRescueTypeByRef
            | Self::NewInstanceByRef
            | Self::GetConstructor
            | Self::AwaitItem
            | Self::RaiseByRef => 4,
            Self::UnOp | Self::CondJumpEx => 5,
            Self::SetConst
            | Self::SetGlobal
            | Self::GetGlobal
            | Self::SetByIndexExpr
            | Self::GetFunc
            | Self::GetClass
            | Self::Iterate
            | Self::AddRescueType
            | Self::NewInstance
            | Self::Raise => 6,
            Self::BinOp => 7,
            Self::SetByAttributeName
            | Self::SetByAttributeIdx
            | Self::GetAttributeByName
            | Self::GetAttributeByIdx
            | Self::HasAttrJump
            | Self::PushRescueFrame
            | Self::Call
            | Self::CallIgnoreIfNone => 8,
        } + match self {
            Self::PushRescueFrame | Self::Call | Self::CallIgnoreIfNone => 1,
            _ => 0,
        }
    }

    /// Byte positions (relative to the tag) of the `i16` jump operands of this instruction.
    #[must_use]
    pub const fn jump_operands(self) -> &'static [usize] {
        match self {
            Self::Jump => &[1],
            Self::CondJump => &[1],
            Self::CondJumpEx => &[2],
            Self::Iterate => &[5],
            Self::HasAttrJump => &[1],
            Self::PushRescueFrame => &[4, 6],
            _ => &[],
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Binary operators understood by [`Instruction::BinOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
    Index,
}

/// Unary operators understood by [`Instruction::UnOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum UnOpKind {
    Neg,
    Not,
    BitNot,
}

macro_rules! flag_byte {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u8);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)+
            pub const NONE: Self = Self(0);

            #[must_use]
            pub const fn bits(self) -> u8 {
                self.0
            }

            #[must_use]
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_byte!(
    /// Flags carried by [`Instruction::Call`].
    CallFlags {
        /// The last positional argument is a list whose items are spread into the call.
        UNPACK_LAST_POSARG = 1,
        /// Dispatch the call asynchronously instead of running it in the caller.
        ASYNC = 2,
    }
);

flag_byte!(
    /// Flags carried by [`Instruction::CondJumpEx`].
    CondJumpFlags {
        /// Jump when the condition is true instead of when it is false.
        JUMP_ON_TRUE = 0x1,
        /// Treat a non-boolean condition as false instead of raising a type error.
        NO_TYPE_ERROR = 0x2,
    }
);

flag_byte!(
    /// Which handler targets a [`Instruction::PushRescueFrame`] carries.
    RescueMode {
        JUMP_ON_RESCUE = 1,
        JUMP_ON_FINALLY = 2,
    }
);

/// A decoded instruction.
///
/// Jump offsets are relative to the offset of the instruction that carries them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    SetConst { slot: u16, constant: u32 },
    SetGlobal { global: GlobalId, slot_from: u16 },
    GetGlobal { slot_to: u16, global: GlobalId },
    SetByIndexExpr { obj_slot: u16, index_slot: u16, value_slot: u16 },
    SetByAttributeName { obj_slot: u16, name: NameId, value_slot: u16 },
    SetByAttributeIdx { obj_slot: u16, attr: AttrIdx, value_slot: u16 },
    GetFunc { slot_to: u16, func: FuncId },
    GetClass { slot_to: u16, class: ClassId },
    ValueCopy { slot_to: u16, slot_from: u16 },
    BinOp { op: BinOpKind, slot_to: u16, lhs: u16, rhs: u16 },
    UnOp { op: UnOpKind, slot_to: u16, operand: u16 },
    Call { return_to: u16, callee: u16, args_start: u16, posargs: u16, flags: CallFlags },
    /// Like `Call`, but a `none` callee stores `none` into `return_to` instead of failing.
    CallIgnoreIfNone { return_to: u16, callee: u16, args_start: u16, posargs: u16, flags: CallFlags },
    ReturnValue { slot: u16 },
    /// Jumps when the boolean in `cond_slot` is false.
    CondJump { offset: i16, cond_slot: u16 },
    CondJumpEx { flags: CondJumpFlags, offset: i16, cond_slot: u16 },
    Jump { offset: i16 },
    NewIterator { slot_to: u16, container_slot: u16 },
    Iterate { value_to: u16, iter_slot: u16, jump_on_end: i16 },
    PushRescueFrame { mode: RescueMode, error_slot: Option<u16>, catch_offset: i16, finally_offset: i16, frame_id: u16 },
    AddRescueTypeByRef { slot: u16, frame_id: u16 },
    AddRescueType { class: ClassId, frame_id: u16 },
    PopRescueFrame { frame_id: u16 },
    GetAttributeByName { slot_to: u16, obj_slot: u16, name: NameId },
    GetAttributeByIdx { slot_to: u16, obj_slot: u16, attr: AttrIdx },
    JumpToFinally { frame_id: u16 },
    NewList { slot_to: u16 },
    NewSet { slot_to: u16 },
    NewMap { slot_to: u16 },
    NewVector { slot_to: u16 },
    NewInstance { slot_to: u16, class: ClassId },
    NewInstanceByRef { slot_to: u16, class_slot: u16 },
    /// Stores the class of the instance or error in `obj_slot`.
    GetConstructor { slot_to: u16, obj_slot: u16 },
    AwaitItem { slot_to: u16, pipe_slot: u16 },
    CreatePipe { slot_to: u16 },
    /// Jumps when the value in `value_slot` does not have attribute `name`.
    HasAttrJump { offset: i16, value_slot: u16, name: NameId },
    Raise { class: ClassId, msg_slot: u16 },
    RaiseByRef { class_slot: u16, msg_slot: u16 },
}

impl Instruction {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::SetConst { .. } => Opcode::SetConst,
            Self::SetGlobal { .. } => Opcode::SetGlobal,
            Self::GetGlobal { .. } => Opcode::GetGlobal,
            Self::SetByIndexExpr { .. } => Opcode::SetByIndexExpr,
            Self::SetByAttributeName { .. } => Opcode::SetByAttributeName,
            Self::SetByAttributeIdx { .. } => Opcode::SetByAttributeIdx,
            Self::GetFunc { .. } => Opcode::GetFunc,
            Self::GetClass { .. } => Opcode::GetClass,
            Self::ValueCopy { .. } => Opcode::ValueCopy,
            Self::BinOp { .. } => Opcode::BinOp,
            Self::UnOp { .. } => Opcode::UnOp,
            Self::Call { .. } => Opcode::Call,
            Self::CallIgnoreIfNone { .. } => Opcode::CallIgnoreIfNone,
            Self::ReturnValue { .. } => Opcode::ReturnValue,
            Self::CondJump { .. } => Opcode::CondJump,
            Self::CondJumpEx { .. } => Opcode::CondJumpEx,
            Self::Jump { .. } => Opcode::Jump,
            Self::NewIterator { .. } => Opcode::NewIterator,
            Self::Iterate { .. } => Opcode::Iterate,
            Self::PushRescueFrame { .. } => Opcode::PushRescueFrame,
            Self::AddRescueTypeByRef { .. } => Opcode::AddRescueTypeByRef,
            Self::AddRescueType { .. } => Opcode::AddRescueType,
            Self::PopRescueFrame { .. } => Opcode::PopRescueFrame,
            Self::GetAttributeByName { .. } => Opcode::GetAttributeByName,
            Self::GetAttributeByIdx { .. } => Opcode::GetAttributeByIdx,
            Self::JumpToFinally { .. } => Opcode::JumpToFinally,
            Self::NewList { .. } => Opcode::NewList,
            Self::NewSet { .. } => Opcode::NewSet,
            Self::NewMap { .. } => Opcode::NewMap,
            Self::NewVector { .. } => Opcode::NewVector,
            Self::NewInstance { .. } => Opcode::NewInstance,
            Self::NewInstanceByRef { .. } => Opcode::NewInstanceByRef,
            Self::GetConstructor { .. } => Opcode::GetConstructor,
            Self::AwaitItem { .. } => Opcode::AwaitItem,
            Self::CreatePipe { .. } => Opcode::CreatePipe,
            Self::HasAttrJump { .. } => Opcode::HasAttrJump,
            Self::Raise { .. } => Opcode::Raise,
            Self::RaiseByRef { .. } => Opcode::RaiseByRef,
        }
    }

    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.opcode().encoded_size()
    }

    /// Jump offsets carried by this instruction, in operand order.
    #[must_use]
    pub fn jump_offsets(&self) -> smallvec::SmallVec<[i16; 2]> {
        let mut offsets = smallvec::SmallVec::new();
        match *self {
            Self::Jump { offset } | Self::CondJump { offset, .. } | Self::CondJumpEx { offset, .. } => offsets.push(offset),
            Self::HasAttrJump { offset, .. } => offsets.push(offset),
            Self::Iterate { jump_on_end, .. } => offsets.push(jump_on_end),
            Self::PushRescueFrame { mode, catch_offset, finally_offset, .. } => {
                if mode.contains(RescueMode::JUMP_ON_RESCUE) {
                    offsets.push(catch_offset);
                }
                if mode.contains(RescueMode::JUMP_ON_FINALLY) {
                    offsets.push(finally_offset);
                }
            }
            _ => {}
        }
        offsets
    }

    /// Appends the encoded instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer { out };
        w.u8(self.opcode() as u8);
        match *self {
            Self::SetConst { slot, constant } => {
                w.u16(slot);
                w.u32(constant);
            }
            Self::SetGlobal { global, slot_from } => {
                w.u32(global.raw());
                w.u16(slot_from);
            }
            Self::GetGlobal { slot_to, global } => {
                w.u16(slot_to);
                w.u32(global.raw());
            }
            Self::SetByIndexExpr { obj_slot, index_slot, value_slot } => {
                w.u16(obj_slot);
                w.u16(index_slot);
                w.u16(value_slot);
            }
            Self::SetByAttributeName { obj_slot, name, value_slot } => {
                w.u16(obj_slot);
                w.u32(name.raw());
                w.u16(value_slot);
            }
            Self::SetByAttributeIdx { obj_slot, attr, value_slot } => {
                w.u16(obj_slot);
                w.u32(attr.raw());
                w.u16(value_slot);
            }
            Self::GetFunc { slot_to, func } => {
                w.u16(slot_to);
                w.u32(func.raw());
            }
            Self::GetClass { slot_to, class } => {
                w.u16(slot_to);
                w.u32(class.raw());
            }
            Self::ValueCopy { slot_to, slot_from } => {
                w.u16(slot_to);
                w.u16(slot_from);
            }
            Self::BinOp { op, slot_to, lhs, rhs } => {
                w.u8(op as u8);
                w.u16(slot_to);
                w.u16(lhs);
                w.u16(rhs);
            }
            Self::UnOp { op, slot_to, operand } => {
                w.u8(op as u8);
                w.u16(slot_to);
                w.u16(operand);
            }
            Self::Call { return_to, callee, args_start, posargs, flags }
            | Self::CallIgnoreIfNone { return_to, callee, args_start, posargs, flags } => {
                w.u16(return_to);
                w.u16(callee);
                w.u16(args_start);
                w.u16(posargs);
                w.u8(flags.bits());
            }
            Self::ReturnValue { slot } => w.u16(slot),
            Self::CondJump { offset, cond_slot } => {
                w.i16(offset);
                w.u16(cond_slot);
            }
            Self::CondJumpEx { flags, offset, cond_slot } => {
                w.u8(flags.bits());
                w.i16(offset);
                w.u16(cond_slot);
            }
            Self::Jump { offset } => w.i16(offset),
            Self::NewIterator { slot_to, container_slot } => {
                w.u16(slot_to);
                w.u16(container_slot);
            }
            Self::Iterate { value_to, iter_slot, jump_on_end } => {
                w.u16(value_to);
                w.u16(iter_slot);
                w.i16(jump_on_end);
            }
            Self::PushRescueFrame { mode, error_slot, catch_offset, finally_offset, frame_id } => {
                w.u8(mode.bits());
                w.u16(error_slot.unwrap_or(NO_SLOT));
                w.i16(catch_offset);
                w.i16(finally_offset);
                w.u16(frame_id);
            }
            Self::AddRescueTypeByRef { slot, frame_id } => {
                w.u16(slot);
                w.u16(frame_id);
            }
            Self::AddRescueType { class, frame_id } => {
                w.u32(class.raw());
                w.u16(frame_id);
            }
            Self::PopRescueFrame { frame_id } | Self::JumpToFinally { frame_id } => w.u16(frame_id),
            Self::GetAttributeByName { slot_to, obj_slot, name } => {
                w.u16(slot_to);
                w.u16(obj_slot);
                w.u32(name.raw());
            }
            Self::GetAttributeByIdx { slot_to, obj_slot, attr } => {
                w.u16(slot_to);
                w.u16(obj_slot);
                w.u32(attr.raw());
            }
            Self::NewList { slot_to }
            | Self::NewSet { slot_to }
            | Self::NewMap { slot_to }
            | Self::NewVector { slot_to }
            | Self::CreatePipe { slot_to } => w.u16(slot_to),
            Self::NewInstance { slot_to, class } => {
                w.u16(slot_to);
                w.u32(class.raw());
            }
            Self::NewInstanceByRef { slot_to, class_slot } => {
                w.u16(slot_to);
                w.u16(class_slot);
            }
            Self::GetConstructor { slot_to, obj_slot } => {
                w.u16(slot_to);
                w.u16(obj_slot);
            }
            Self::AwaitItem { slot_to, pipe_slot } => {
                w.u16(slot_to);
                w.u16(pipe_slot);
            }
            Self::HasAttrJump { offset, value_slot, name } => {
                w.i16(offset);
                w.u16(value_slot);
                w.u32(name.raw());
            }
            Self::Raise { class, msg_slot } => {
                w.u32(class.raw());
                w.u16(msg_slot);
            }
            Self::RaiseByRef { class_slot, msg_slot } => {
                w.u16(class_slot);
                w.u16(msg_slot);
            }
        }
    }

    /// Decodes the instruction starting at `offset`.
    ///
    /// Returns the instruction and its encoded size.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<(Self, usize), DecodeError> {
        let tag = *bytes.get(offset).ok_or(DecodeError::Truncated { offset })?;
        let opcode = Opcode::from_repr(tag).ok_or(DecodeError::UnknownOpcode { offset, tag })?;
        let size = opcode.encoded_size();
        let operands = bytes
            .get(offset + 1..offset + size)
            .ok_or(DecodeError::Truncated { offset })?;
        let mut r = Reader { bytes: operands, pos: 0 };
        let inst = match opcode {
            Opcode::SetConst => Self::SetConst { slot: r.u16(), constant: r.u32() },
            Opcode::SetGlobal => Self::SetGlobal { global: GlobalId::from_raw(r.u32()), slot_from: r.u16() },
            Opcode::GetGlobal => Self::GetGlobal { slot_to: r.u16(), global: GlobalId::from_raw(r.u32()) },
            Opcode::SetByIndexExpr => Self::SetByIndexExpr { obj_slot: r.u16(), index_slot: r.u16(), value_slot: r.u16() },
            Opcode::SetByAttributeName => Self::SetByAttributeName {
                obj_slot: r.u16(),
                name: NameId::from_raw(r.u32()),
                value_slot: r.u16(),
            },
            Opcode::SetByAttributeIdx => Self::SetByAttributeIdx {
                obj_slot: r.u16(),
                attr: AttrIdx::from_raw(r.u32()),
                value_slot: r.u16(),
            },
            Opcode::GetFunc => Self::GetFunc { slot_to: r.u16(), func: FuncId::from_raw(r.u32()) },
            Opcode::GetClass => Self::GetClass { slot_to: r.u16(), class: ClassId::from_raw(r.u32()) },
            Opcode::ValueCopy => Self::ValueCopy { slot_to: r.u16(), slot_from: r.u16() },
            Opcode::BinOp => {
                let raw = r.u8();
                let op = BinOpKind::from_repr(raw).ok_or(DecodeError::BadOperand { offset, opcode })?;
                Self::BinOp { op, slot_to: r.u16(), lhs: r.u16(), rhs: r.u16() }
            }
            Opcode::UnOp => {
                let raw = r.u8();
                let op = UnOpKind::from_repr(raw).ok_or(DecodeError::BadOperand { offset, opcode })?;
                Self::UnOp { op, slot_to: r.u16(), operand: r.u16() }
            }
            Opcode::Call => Self::Call {
                return_to: r.u16(),
                callee: r.u16(),
                args_start: r.u16(),
                posargs: r.u16(),
                flags: CallFlags::from_bits(r.u8()),
            },
            Opcode::CallIgnoreIfNone => Self::CallIgnoreIfNone {
                return_to: r.u16(),
                callee: r.u16(),
                args_start: r.u16(),
                posargs: r.u16(),
                flags: CallFlags::from_bits(r.u8()),
            },
            Opcode::ReturnValue => Self::ReturnValue { slot: r.u16() },
            Opcode::CondJump => Self::CondJump { offset: r.i16(), cond_slot: r.u16() },
            Opcode::CondJumpEx => Self::CondJumpEx {
                flags: CondJumpFlags::from_bits(r.u8()),
                offset: r.i16(),
                cond_slot: r.u16(),
            },
            Opcode::Jump => Self::Jump { offset: r.i16() },
            Opcode::NewIterator => Self::NewIterator { slot_to: r.u16(), container_slot: r.u16() },
            Opcode::Iterate => Self::Iterate { value_to: r.u16(), iter_slot: r.u16(), jump_on_end: r.i16() },
            Opcode::PushRescueFrame => {
                let mode = RescueMode::from_bits(r.u8());
                let error_slot = Some(r.u16()).filter(|&slot| slot != NO_SLOT);
                Self::PushRescueFrame {
                    mode,
                    error_slot,
                    catch_offset: r.i16(),
                    finally_offset: r.i16(),
                    frame_id: r.u16(),
                }
            }
            Opcode::AddRescueTypeByRef => Self::AddRescueTypeByRef { slot: r.u16(), frame_id: r.u16() },
            Opcode::AddRescueType => Self::AddRescueType { class: ClassId::from_raw(r.u32()), frame_id: r.u16() },
            Opcode::PopRescueFrame => Self::PopRescueFrame { frame_id: r.u16() },
            Opcode::GetAttributeByName => Self::GetAttributeByName {
                slot_to: r.u16(),
                obj_slot: r.u16(),
                name: NameId::from_raw(r.u32()),
            },
            Opcode::GetAttributeByIdx => Self::GetAttributeByIdx {
                slot_to: r.u16(),
                obj_slot: r.u16(),
                attr: AttrIdx::from_raw(r.u32()),
            },
            Opcode::JumpToFinally => Self::JumpToFinally { frame_id: r.u16() },
            Opcode::NewList => Self::NewList { slot_to: r.u16() },
            Opcode::NewSet => Self::NewSet { slot_to: r.u16() },
            Opcode::NewMap => Self::NewMap { slot_to: r.u16() },
            Opcode::NewVector => Self::NewVector { slot_to: r.u16() },
            Opcode::NewInstance => Self::NewInstance { slot_to: r.u16(), class: ClassId::from_raw(r.u32()) },
            Opcode::NewInstanceByRef => Self::NewInstanceByRef { slot_to: r.u16(), class_slot: r.u16() },
            Opcode::GetConstructor => Self::GetConstructor { slot_to: r.u16(), obj_slot: r.u16() },
            Opcode::AwaitItem => Self::AwaitItem { slot_to: r.u16(), pipe_slot: r.u16() },
            Opcode::CreatePipe => Self::CreatePipe { slot_to: r.u16() },
            Opcode::HasAttrJump => Self::HasAttrJump {
                offset: r.i16(),
                value_slot: r.u16(),
                name: NameId::from_raw(r.u32()),
            },
            Opcode::Raise => Self::Raise { class: ClassId::from_raw(r.u32()), msg_slot: r.u16() },
            Opcode::RaiseByRef => Self::RaiseByRef { class_slot: r.u16(), msg_slot: r.u16() },
        };
        debug_assert_eq!(r.pos, size - 1, "operand layout of {opcode} disagrees with encoded_size");
        Ok((inst, size))
    }
}

/// Failure to decode an instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { offset: usize },
    UnknownOpcode { offset: usize, tag: u8 },
    BadOperand { offset: usize, opcode: Opcode },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "instruction at offset {offset} is truncated"),
            Self::UnknownOpcode { offset, tag } => write!(f, "unknown opcode {tag:#04x} at offset {offset}"),
            Self::BadOperand { offset, opcode } => write!(f, "invalid operand for {opcode} at offset {offset}"),
        }
    }
}

impl std::error::Error for DecodeError {}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Operand reader over a slice already checked to have the full operand width.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        buf
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn call_layout() {
        let mut out = Vec::new();
        Instruction::Call {
            return_to: 3,
            callee: 1,
            args_start: 4,
            posargs: 2,
            flags: CallFlags::ASYNC,
        }
        .encode(&mut out);
        assert_eq!(out, [Opcode::Call as u8, 3, 0, 1, 0, 4, 0, 2, 0, 2]);
        assert_eq!(out.len(), Opcode::Call.encoded_size());
    }

    #[test]
    fn rescue_frame_without_error_slot() {
        let inst = Instruction::PushRescueFrame {
            mode: RescueMode::JUMP_ON_FINALLY,
            error_slot: None,
            catch_offset: 0,
            finally_offset: -4,
            frame_id: 7,
        };
        let mut out = Vec::new();
        inst.encode(&mut out);
        assert_eq!(&out[2..4], &[0xff, 0xff]);
        assert_eq!(Instruction::decode(&out, 0), Ok((inst, 10)));
        assert_eq!(inst.jump_offsets().as_slice(), &[-4]);
    }

    #[test]
    fn jump_operand_positions_hold_the_offset() {
        let samples = [
            Instruction::Jump { offset: 0x1234 },
            Instruction::CondJump { offset: 0x1234, cond_slot: 9 },
            Instruction::CondJumpEx { flags: CondJumpFlags::JUMP_ON_TRUE, offset: 0x1234, cond_slot: 9 },
            Instruction::Iterate { value_to: 1, iter_slot: 2, jump_on_end: 0x1234 },
            Instruction::HasAttrJump { offset: 0x1234, value_slot: 1, name: NameId::from_raw(5) },
        ];
        for inst in samples {
            let mut out = Vec::new();
            inst.encode(&mut out);
            let pos = inst.opcode().jump_operands()[0];
            assert_eq!(&out[pos..pos + 2], &[0x34, 0x12], "{}", inst.opcode());
        }
    }

    #[test]
    fn every_opcode_tag_decodes_to_itself() {
        for opcode in Opcode::iter() {
            let mut bytes = vec![0u8; opcode.encoded_size()];
            bytes[0] = opcode as u8;
            let (inst, size) = Instruction::decode(&bytes, 0).unwrap();
            assert_eq!(inst.opcode(), opcode);
            assert_eq!(size, opcode.encoded_size());
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(
            Instruction::decode(&[0xee], 0),
            Err(DecodeError::UnknownOpcode { offset: 0, tag: 0xee })
        );
        assert_eq!(
            Instruction::decode(&[Opcode::Jump as u8, 1], 0),
            Err(DecodeError::Truncated { offset: 0 })
        );
        let bad_binop = [Opcode::BinOp as u8, 200, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Instruction::decode(&bad_binop, 0),
            Err(DecodeError::BadOperand { offset: 0, opcode: Opcode::BinOp })
        );
    }
}
