//! Runtime support for patched code
//!
//! Fields that a patch adds to an already-loaded class cannot physically exist on that class.
//! Their values live out of band in a [`ProxyStore`], keyed by the identity of the owning
//! object. The generated holder classes (see `patch::access`) call into a host implementation
//! of exactly this contract; this module is the Rust implementation of it.

mod proxy_store;

pub use proxy_store::{Identity, ObjectStore, ObjectValue, ProxyStore, StoreKind};

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Field index past the arity of the store
    IndexOutOfRange { index: usize, arity: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IndexOutOfRange { index, arity } => {
                write!(f, "field index {} out of range for store of arity {}", index, arity)
            }
        }
    }
}

impl std::error::Error for Error {}
