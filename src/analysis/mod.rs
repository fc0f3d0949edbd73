//! Static analyses over instruction streams
//!
//! The only analysis needed for patching is stack depth tracking: after instructions have been
//! spliced into a method, every label must still be entered with one consistent stack depth.

mod stack;

pub use stack::{compute_gates, fixed_stack_delta, stack_delta, StackAnalysis, StackEmulator};

use crate::jvm::code::{Label, Opcode};
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// `JSR`/`RET` subroutines are not supported (index into the instruction stream)
    UnsupportedInstruction(Opcode, usize),

    /// Two control-flow edges enter a label with different stack depths
    InconsistentStack {
        label: Label,
        recorded: i32,
        found: i32,
    },

    /// Instruction at this index pops more than is on the stack
    StackUnderflow(usize),

    /// Descriptor string that does not parse (descriptor, reason)
    BadDescriptor(String, String),

    /// Jump target that is never placed
    UnknownLabel(Label),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedInstruction(op, idx) => {
                write!(f, "unsupported instruction {} at index {}", op.mnemonic(), idx)
            }
            Error::InconsistentStack {
                label,
                recorded,
                found,
            } => write!(
                f,
                "label {} entered with stack depth {} but was recorded at {}",
                label, found, recorded
            ),
            Error::StackUnderflow(idx) => write!(f, "stack underflow at index {}", idx),
            Error::BadDescriptor(desc, reason) => write!(f, "bad descriptor {}: {}", desc, reason),
            Error::UnknownLabel(label) => write!(f, "label {} is never placed", label),
        }
    }
}

impl std::error::Error for Error {}
