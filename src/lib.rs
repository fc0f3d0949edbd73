//! Runtime bytecode patching for JVM classes
//!
//! Patches are declared as data ([`patch::PatchDescriptor`]) against classes looked up through a
//! [`registry::ClassRegistry`]. Code from a patch's source class gets spliced into methods of the
//! target class, with uses of stand-in members rewritten into whatever access the target allows
//! (plain field instructions, widened fields, raw offsets, or out-of-band storage for fields that
//! cannot be added). Results come back as class file bytes, tagged with whether they are meant
//! for a class loader or for live redefinition.
//!
//! ```no_run
//! use bytepatch::patch::{Patcher, PatchDescriptor, RuntimeSnapshot, Settings};
//! use bytepatch::registry::{ClassRegistry, DirectorySource};
//!
//! # fn run() -> Result<(), bytepatch::patch::Error> {
//! let registry = ClassRegistry::new().with_source(DirectorySource::new("build/classes"));
//! let runtime = RuntimeSnapshot::detached();
//! let mut patcher = Patcher::new(&registry, &runtime, Settings::new())?;
//!
//! let patches = std::fs::read_to_string("patches.json")?;
//! for patch in PatchDescriptor::list_from_json(&patches).map_err(|err| {
//!     bytepatch::patch::Error::InvalidPatch(err.to_string())
//! })? {
//!     patcher.register(patch)?;
//! }
//! for (name, class) in patcher.run().classes {
//!     println!("{} ({} bytes, {})", name, class.bytes.len(), class.mode);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod jvm;
pub mod patch;
pub mod registry;
pub mod runtime;
mod util;
