use crate::jvm::class_file::ClassReader;
use crate::jvm::code::{Insn, Opcode};
use crate::jvm::{
    self, BinaryName, ClassAccessFlags, ClassDescriptor, MethodAccessFlags, MethodNode, Name,
    UnqualifiedName,
};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Somewhere class descriptors can be loaded from
pub trait ClassSource: Send + Sync {
    /// Load a class, or `None` if this source does not know the class
    fn load(&self, name: &BinaryName) -> Result<Option<ClassDescriptor>, jvm::Error>;
}

/// In-memory collection of classes
#[derive(Default)]
pub struct Archive {
    classes: HashMap<BinaryName, ClassDescriptor>,
}

impl Archive {
    pub fn new() -> Archive {
        Archive {
            classes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, class: ClassDescriptor) {
        self.classes.insert(class.name.clone(), class);
    }

    /// Parse and add a class file, returning the name of the class
    pub fn insert_bytes(&mut self, bytes: &[u8]) -> Result<BinaryName, jvm::Error> {
        let class = ClassReader::read(bytes)?;
        let name = class.name.clone();
        self.insert(class);
        Ok(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassSource for Archive {
    fn load(&self, name: &BinaryName) -> Result<Option<ClassDescriptor>, jvm::Error> {
        Ok(self.classes.get(name).cloned())
    }
}

/// Directory of `.class` files laid out by package
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> DirectorySource {
        DirectorySource { root: root.into() }
    }
}

impl ClassSource for DirectorySource {
    fn load(&self, name: &BinaryName) -> Result<Option<ClassDescriptor>, jvm::Error> {
        let path = self.root.join(format!("{}.class", name.as_str()));
        if !path.is_file() {
            return Ok(None);
        }
        log::debug!("Reading {}", path.display());
        let bytes = fs::read(&path)?;
        ClassReader::read(&bytes).map(Some)
    }
}

/// Supplies `java/lang/Object` when nothing else does, so that every hierarchy has a root
pub(super) struct BootstrapSource;

impl ClassSource for BootstrapSource {
    fn load(&self, name: &BinaryName) -> Result<Option<ClassDescriptor>, jvm::Error> {
        if *name != BinaryName::OBJECT {
            return Ok(None);
        }
        let mut object = ClassDescriptor::new(
            BinaryName::OBJECT,
            None,
            ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        );
        let mut init = MethodNode::new(MethodAccessFlags::PUBLIC, UnqualifiedName::INIT, "()V");
        init.instructions = vec![Insn::Simple(Opcode::RETURN)];
        object.methods.push(init);
        Ok(Some(object))
    }
}
