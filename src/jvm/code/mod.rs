//! Instruction streams
//!
//! Method bodies are kept as flat, mutable vectors of [`Insn`] nodes with symbolic operands and
//! label markers, which is the shape patches get spliced into. Byte offsets only come into
//! existence when a class is written out.

mod insn;
mod label;
mod opcode;

pub use insn::*;
pub use label::*;
pub use opcode::*;
