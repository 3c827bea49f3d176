//! Bytecode representation for script functions.
//!
//! # Module Structure
//!
//! - `op` - Opcode tags, decoded instructions and their byte encoding
//! - `code` - Validated function bodies with their constant pools
//! - `builder` - CodeBuilder for emitting bytecode during code generation

pub use builder::{CodeBuilder, JumpLabel};
pub use code::{Code, CodeError, Constant};
pub(crate) use code::jump_target;
pub use op::{BinOpKind, CallFlags, CondJumpFlags, DecodeError, Instruction, Opcode, RescueMode, UnOpKind};

mod builder;
mod code;
mod op;
