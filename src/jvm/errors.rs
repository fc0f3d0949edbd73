use super::code::Label;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// Class file bytes could not be decoded
    MalformedClass(String),

    /// Descriptor string that does not parse (descriptor, reason)
    BadDescriptor(String, String),

    /// String that is not a valid class/member name
    InvalidName(String),

    ConstantPoolOverflow { offset: u16 },

    /// Constant pool index does not point at a constant of the expected kind
    MissingConstant(u16),

    /// Encoded method body exceeds 65535 bytes
    MethodCodeOverflow(String),

    /// Jump offset does not fit in the 16-bit branch encoding
    JumpOutOfRange { method: String, target: Label },

    /// A label is referenced but never placed in the instruction stream
    UndefinedLabel { method: String, label: Label },

    /// Instruction that can't be encoded as given (eg. a `Pooled` constant without a pool)
    UnencodableInstruction { method: String, instruction: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::MalformedClass(msg) => write!(f, "malformed class file: {}", msg),
            Error::BadDescriptor(desc, msg) => write!(f, "bad descriptor '{}': {}", desc, msg),
            Error::InvalidName(msg) => write!(f, "invalid name: {}", msg),
            Error::ConstantPoolOverflow { offset } => {
                write!(f, "constant pool overflow at offset {}", offset)
            }
            Error::MissingConstant(idx) => write!(f, "missing constant #{}", idx),
            Error::MethodCodeOverflow(method) => write!(f, "code of '{}' is too large", method),
            Error::JumpOutOfRange { method, target } => {
                write!(f, "jump to {} in '{}' is out of range", target, method)
            }
            Error::UndefinedLabel { method, label } => {
                write!(f, "label {} in '{}' is never placed", label, method)
            }
            Error::UnencodableInstruction {
                method,
                instruction,
            } => write!(f, "cannot encode '{}' in '{}'", instruction, method),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
