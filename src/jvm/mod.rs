//! Model of JVM classes, just rich enough to patch them
//!
//! Classes are read into a [`ClassDescriptor`] tree whose method bodies are flat instruction
//! streams with symbolic operands (see [`code`]). After patches are applied, the tree is written
//! back out through a [`class_file::ClassAssembler`].
//!
//! ### Example
//!
//! ```
//! use bytepatch::jvm::*;
//! use bytepatch::jvm::code::{Insn, Opcode};
//! use bytepatch::jvm::class_file::{ClassAssembler, ClassWriter};
//!
//! # fn build() -> Result<(), Error> {
//! let mut class = ClassDescriptor::new(
//!     BinaryName::from_str("me/Point").unwrap(),
//!     Some(BinaryName::OBJECT),
//!     ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
//! );
//! let mut method = MethodNode::new(
//!     MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
//!     UnqualifiedName::from_str("add").unwrap(),
//!     "(II)I",
//! );
//! method.instructions = vec![
//!     Insn::Var(Opcode::ILOAD, 0),
//!     Insn::Var(Opcode::ILOAD, 1),
//!     Insn::Simple(Opcode::IADD),
//!     Insn::Simple(Opcode::IRETURN),
//! ];
//! class.methods.push(method);
//!
//! let bytes = ClassWriter::new().assemble(&class)?;
//! assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
//! # Ok(())
//! # }
//! # build().unwrap();
//! ```

mod access_flags;
pub mod class_file;
pub mod code;
pub mod descriptors;
mod errors;
mod model;
mod names;

pub use access_flags::*;
pub use errors::*;
pub use model::*;
pub use names::*;
