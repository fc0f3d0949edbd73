use crate::jvm::{self, BinaryName};
use crate::{analysis, registry};
use std::fmt;

#[derive(Debug)]
pub enum Error {
    ClassNotFound(BinaryName),
    MemberNotFound(String),

    /// Member a patch declares is not on the target class (or its supertypes)
    TargetMemberMissing {
        target: BinaryName,
        member: String,
    },

    /// Injection pattern did not match
    AnchorNotFound {
        method: String,
        pattern: String,

        /// Disassembly of the method the pattern was matched against
        disassembly: Vec<String>,
    },

    /// `JSR`/`RET` encountered in a method being patched
    UnsupportedInstruction(String),

    /// Patching mode does not allow the requested edit, or two patches disagree on the mode
    InvalidPatchMode(String),

    /// Anchor resolved to a position outside the target method
    InvalidInjectionPoint {
        method: String,
        index: i64,
        len: usize,
    },

    /// Patch descriptor is inconsistent with the classes it refers to
    InvalidPatch(String),

    /// Write to an accessor declared as immutable
    ImmutableAccessor(String),

    /// Host runtime could not answer a query
    Runtime(String),

    /// Spliced code does not have a consistent stack
    Stack(analysis::Error),

    Registry(registry::Error),
    Jvm(jvm::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClassNotFound(name) => write!(f, "class {} not found", name),
            Error::MemberNotFound(member) => write!(f, "member {} not found", member),
            Error::TargetMemberMissing { target, member } => {
                write!(f, "member {} is missing from target {}", member, target)
            }
            Error::AnchorNotFound {
                method,
                pattern,
                disassembly,
            } => {
                writeln!(f, "could not find a match in {}", method)?;
                writeln!(f, "searched for:")?;
                for line in pattern.lines() {
                    writeln!(f, "    {}", line.trim())?;
                }
                writeln!(f, "instructions:")?;
                for line in disassembly {
                    writeln!(f, "    {}", line)?;
                }
                Ok(())
            }
            Error::UnsupportedInstruction(insn) => write!(f, "unsupported instruction {}", insn),
            Error::InvalidPatchMode(msg) => write!(f, "invalid patch mode: {}", msg),
            Error::InvalidInjectionPoint { method, index, len } => write!(
                f,
                "injection point {} is outside of {} ({} instructions)",
                index, method, len
            ),
            Error::InvalidPatch(msg) => write!(f, "invalid patch: {}", msg),
            Error::ImmutableAccessor(name) => write!(f, "accessor {} is immutable", name),
            Error::Runtime(msg) => write!(f, "host runtime: {}", msg),
            Error::Stack(err) => write!(f, "{}", err),
            Error::Registry(err) => write!(f, "{}", err),
            Error::Jvm(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<registry::Error> for Error {
    fn from(err: registry::Error) -> Error {
        match err {
            registry::Error::ClassNotFound(name) => Error::ClassNotFound(name),
            registry::Error::MemberNotFound {
                class,
                name,
                descriptor,
            } => Error::MemberNotFound(format!(
                "{}.{}{}",
                class,
                name,
                descriptor.unwrap_or_default()
            )),
            other => Error::Registry(other),
        }
    }
}

impl From<analysis::Error> for Error {
    fn from(err: analysis::Error) -> Error {
        match err {
            analysis::Error::UnsupportedInstruction(op, idx) => {
                Error::UnsupportedInstruction(format!("{} at index {}", op.mnemonic(), idx))
            }
            other => Error::Stack(other),
        }
    }
}

impl From<jvm::Error> for Error {
    fn from(err: jvm::Error) -> Error {
        Error::Jvm(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Jvm(jvm::Error::IoError(err))
    }
}
