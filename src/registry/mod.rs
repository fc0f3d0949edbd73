//! Lazy, shared store of parsed classes
//!
//! Classes are loaded on first request from a list of [`ClassSource`]s and kept for the lifetime
//! of the registry. Descriptors live in an append-only arena and are addressed by [`ClassId`];
//! inheritance information (see [`InheritanceTree`]) is expressed as sets of those ids, so the
//! class graph never holds references into itself.

mod inheritance;
mod source;

pub use inheritance::{InheritanceTree, ResolvedMember};
pub use source::{Archive, ClassSource, DirectorySource};

use crate::jvm::{self, BinaryName, ClassDescriptor};
use parking_lot::RwLock;
use source::BootstrapSource;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a class in the registry arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

#[derive(Debug)]
pub enum Error {
    ClassNotFound(BinaryName),

    /// Member not found on the class or any of its supertypes
    MemberNotFound {
        class: BinaryName,
        name: String,
        descriptor: Option<String>,
    },

    /// Class is (transitively) its own supertype
    CyclicInheritance(BinaryName),

    /// A source found the class but could not load it
    Load(jvm::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClassNotFound(name) => write!(f, "class {} not found", name),
            Error::MemberNotFound {
                class,
                name,
                descriptor,
            } => write!(
                f,
                "member {}{} not found in {} or its supertypes",
                name,
                descriptor.as_deref().unwrap_or(""),
                class
            ),
            Error::CyclicInheritance(name) => write!(f, "cyclic inheritance involving {}", name),
            Error::Load(err) => write!(f, "failed to load class: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<jvm::Error> for Error {
    fn from(err: jvm::Error) -> Error {
        Error::Load(err)
    }
}

#[derive(Default)]
struct Arena {
    classes: Vec<Arc<ClassDescriptor>>,
    ids: HashMap<BinaryName, ClassId>,
    trees: HashMap<ClassId, InheritanceTree>,
}

/// Process-wide class cache
///
/// Safe to share between threads: lookups take a read lock, and loading happens outside of the
/// lock (if two threads race to load the same class, the first to insert it wins).
pub struct ClassRegistry {
    /// Consulted in order, before the bootstrap source
    sources: Vec<Box<dyn ClassSource>>,
    bootstrap: BootstrapSource,
    arena: RwLock<Arena>,
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry {
            sources: vec![],
            bootstrap: BootstrapSource,
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Add a source to consult after the sources already registered
    pub fn add_source(&mut self, source: impl ClassSource + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn with_source(mut self, source: impl ClassSource + 'static) -> ClassRegistry {
        self.add_source(source);
        self
    }

    /// Number of classes loaded so far
    pub fn len(&self) -> usize {
        self.arena.read().classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a class, loading it if this is the first request for it
    pub fn resolve(&self, name: &BinaryName) -> Result<Arc<ClassDescriptor>, Error> {
        let id = self.resolve_id(name)?;
        Ok(self.get(id))
    }

    pub fn resolve_id(&self, name: &BinaryName) -> Result<ClassId, Error> {
        if let Some(id) = self.arena.read().ids.get(name) {
            return Ok(*id);
        }

        let class = self.load(name)?;
        let mut arena = self.arena.write();
        if let Some(id) = arena.ids.get(name) {
            return Ok(*id);
        }
        let id = ClassId(arena.classes.len() as u32);
        log::debug!("Registered class {} as {:?}", name, id);
        arena.classes.push(Arc::new(class));
        arena.ids.insert(name.clone(), id);
        Ok(id)
    }

    /// Is the class already in the registry? (never loads anything)
    pub fn contains(&self, name: &BinaryName) -> bool {
        self.arena.read().ids.contains_key(name)
    }

    /// Class for an id handed out by this registry
    pub fn get(&self, id: ClassId) -> Arc<ClassDescriptor> {
        self.arena.read().classes[id.0 as usize].clone()
    }

    pub fn name_of(&self, id: ClassId) -> BinaryName {
        self.get(id).name.clone()
    }

    fn load(&self, name: &BinaryName) -> Result<ClassDescriptor, Error> {
        let sources = self
            .sources
            .iter()
            .map(|source| source.as_ref())
            .chain(std::iter::once(&self.bootstrap as &dyn ClassSource));
        for source in sources {
            if let Some(class) = source.load(name)? {
                if class.name != *name {
                    return Err(Error::Load(jvm::Error::MalformedClass(format!(
                        "expected class {} but found {}",
                        name, class.name
                    ))));
                }
                return Ok(class);
            }
        }
        Err(Error::ClassNotFound(name.clone()))
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        ClassRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::{
        ClassAccessFlags, FieldAccessFlags, FieldNode, MemberKind, MemberReference, Name,
        UnqualifiedName, Visibility,
    };

    fn class(name: &str, super_name: &str, interfaces: &[&str]) -> ClassDescriptor {
        let mut class = ClassDescriptor::new(
            BinaryName::from_str(name).unwrap(),
            Some(BinaryName::from_str(super_name).unwrap()),
            ClassAccessFlags::PUBLIC,
        );
        class.interfaces = interfaces
            .iter()
            .map(|iface| BinaryName::from_str(iface).unwrap())
            .collect();
        class
    }

    fn field(class: &mut ClassDescriptor, access: FieldAccessFlags, name: &str, desc: &str) {
        class.fields.push(FieldNode::new(
            access,
            UnqualifiedName::from_str(name).unwrap(),
            desc,
        ));
    }

    fn name(name: &str) -> BinaryName {
        BinaryName::from_str(name).unwrap()
    }

    /// `a/Grand <- a/Parent <- b/Child`, with `b/Child` also implementing `b/Marker`
    fn family() -> ClassRegistry {
        let mut grand = class("a/Grand", "java/lang/Object", &[]);
        field(&mut grand, FieldAccessFlags::PROTECTED, "counter", "I");
        field(&mut grand, FieldAccessFlags::PRIVATE, "secret", "J");
        field(&mut grand, FieldAccessFlags::empty(), "shared", "I");
        let parent = class("a/Parent", "a/Grand", &[]);
        let child = class("b/Child", "a/Parent", &["b/Marker"]);
        let mut marker = class("b/Marker", "java/lang/Object", &[]);
        marker.access |= ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT;
        let stranger = class("b/Stranger", "java/lang/Object", &[]);

        let mut archive = Archive::new();
        for class in [grand, parent, child, marker, stranger] {
            archive.insert(class);
        }
        ClassRegistry::new().with_source(archive)
    }

    #[test]
    fn resolve_is_cached() {
        let registry = family();
        let first = registry.resolve(&name("a/Parent")).unwrap();
        let second = registry.resolve(&name("a/Parent")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_class() {
        let registry = family();
        assert!(matches!(
            registry.resolve(&name("a/Nope")),
            Err(Error::ClassNotFound(n)) if n == name("a/Nope")
        ));
    }

    #[test]
    fn bootstrap_object() {
        let registry = ClassRegistry::new();
        let object = registry.resolve(&BinaryName::OBJECT).unwrap();
        assert_eq!(object.super_name, None);
        assert!(registry.tree(&BinaryName::OBJECT).unwrap().super_types.is_empty());
    }

    #[test]
    fn grandparent_field_owner() {
        let registry = family();
        let reference = MemberReference::new("b/Child", "counter", "I", MemberKind::Field);
        let resolved = registry.resolve_member_ref(&reference).unwrap();
        assert_eq!(resolved.reference.owner, "a/Grand");
        assert_eq!(resolved.visibility, Visibility::Protected);
        assert_eq!(resolved.owner_id, registry.resolve_id(&name("a/Grand")).unwrap());

        let missing = MemberReference::new("b/Child", "counter", "J", MemberKind::Field);
        assert!(matches!(
            registry.resolve_member_ref(&missing),
            Err(Error::MemberNotFound { .. })
        ));
    }

    #[test]
    fn method_by_name_only() {
        let registry = family();
        let found = registry
            .resolve_method(&name("b/Child"), "<init>", None)
            .unwrap();
        assert_eq!(found.reference.owner, "java/lang/Object");
        assert_eq!(found.reference.descriptor, "()V");
    }

    #[test]
    fn subtypes_reach_every_ancestor() {
        let registry = family();
        let child = registry.tree(&name("b/Child")).unwrap();
        let child_id = registry.resolve_id(&name("b/Child")).unwrap();

        for ancestor in ["a/Parent", "a/Grand", "b/Marker", "java/lang/Object"] {
            let ancestor_id = registry.resolve_id(&name(ancestor)).unwrap();
            assert!(child.super_types.contains(&ancestor_id), "{}", ancestor);
            let tree = registry.tree(&name(ancestor)).unwrap();
            assert!(tree.sub_types.contains(&child_id), "{}", ancestor);
        }

        assert!(registry.is_subtype_of(&name("b/Child"), &name("a/Grand")).unwrap());
        assert!(registry.is_subtype_of(&name("b/Child"), &name("b/Child")).unwrap());
        assert!(!registry.is_subtype_of(&name("a/Grand"), &name("b/Child")).unwrap());
    }

    #[test]
    fn cyclic_hierarchy() {
        let mut archive = Archive::new();
        archive.insert(class("c/A", "c/B", &[]));
        archive.insert(class("c/B", "c/A", &[]));
        let registry = ClassRegistry::new().with_source(archive);
        assert!(matches!(
            registry.tree(&name("c/A")),
            Err(Error::CyclicInheritance(_))
        ));
    }

    #[test]
    fn visibility_rules() {
        let registry = family();
        let resolve = |owner: &str, field: &str| {
            registry.resolve_field(&name(owner), field, None).unwrap()
        };

        let counter = resolve("a/Grand", "counter");
        let secret = resolve("a/Grand", "secret");
        let shared = resolve("a/Grand", "shared");

        // protected: subclasses, even in another package
        assert!(registry.can_access(&name("b/Child"), &counter).unwrap());
        assert!(!registry.can_access(&name("b/Stranger"), &counter).unwrap());

        // private: only the owner
        assert!(registry.can_access(&name("a/Grand"), &secret).unwrap());
        assert!(!registry.can_access(&name("a/Parent"), &secret).unwrap());

        // package-private: same package only
        assert!(registry.can_access(&name("a/Parent"), &shared).unwrap());
        assert!(!registry.can_access(&name("b/Child"), &shared).unwrap());
    }
}
