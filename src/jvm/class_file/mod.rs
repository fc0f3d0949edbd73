//! Binary class file format
//!
//! Only the parts of the format that patching touches are modelled structurally: the constant
//! pool, members, and the `Code` attribute. Everything else round-trips as raw attributes.

mod binary_format;
mod constants;
mod reader;
mod version;
mod writer;

pub use binary_format::*;
pub use constants::{
    decode_modified_utf8, encode_modified_utf8, read_constant, Constant, ConstantsPool, PoolView,
};
pub use reader::ClassReader;
pub use version::Version;
pub use writer::{ClassAssembler, ClassWriter};
