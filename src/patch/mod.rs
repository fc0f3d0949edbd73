//! Declarative patching of class files
//!
//! A [`PatchDescriptor`] says which target class it applies to, which members of its source class
//! stand for members of the target, and where code from the source class goes. The [`Patcher`]
//! orders patches per target, decides whether each target is patched before it is loaded or
//! redefined live, and produces fresh class file bytes for every target (plus any helper classes
//! the patched code needs).

mod access;
pub mod descriptor;
mod errors;
pub mod locator;
mod logging;
mod method_patcher;
mod runtime;
mod scheduler;
mod settings;

pub use access::{AccessEngine, AccessMapping, AccessStrategy, AccessorPlan};
pub use descriptor::{
    Anchor, InjectDeclaration, MemberDeclaration, PatchDescriptor, PatchMode, Position,
    ReplaceDeclaration, ResolvedMode,
};
pub use errors::*;
pub use logging::{LogFacade, NoopLogger, PatchLogger};
pub use method_patcher::{validate_stack, MethodPatcher};
pub use runtime::{HostRuntime, RuntimeSnapshot};
pub use scheduler::{PatchRun, PatchedClass, Patcher, PostProcessor};
pub use settings::*;
