use super::class_file::{Constant, Version};
use super::code::{Insn, Label, LabelGenerator};
use super::descriptors::{JavaMethodDescriptor, ParseDescriptor};
use super::{
    BinaryName, ClassAccessFlags, Error, FieldAccessFlags, MethodAccessFlags, Name,
    UnqualifiedName,
};
use std::fmt;
use std::sync::Arc;

/// Whether a member reference points at a field or a method
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Field,
    Method,
}

/// Symbolic reference to a field or method
///
/// This is just a pointer into the class registry: nothing guarantees that the member exists
/// until it is resolved, and it must be resolved again every time it is used.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberReference {
    /// Internal name of the owning class (array types are possible, eg. `[I.clone()`)
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: MemberKind,
}

impl MemberReference {
    pub fn new(owner: &str, name: &str, descriptor: &str, kind: MemberKind) -> MemberReference {
        MemberReference {
            owner: owner.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            kind,
        }
    }

    /// Owner as a class name
    pub fn owner_name(&self) -> Result<BinaryName, String> {
        BinaryName::from_str(&self.owner)
    }
}

impl fmt::Display for MemberReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MemberKind::Field => write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor),
            MemberKind::Method => write!(f, "{}.{}{}", self.owner, self.name, self.descriptor),
        }
    }
}

/// Attribute carried through untouched
///
/// Its contents may refer to constant pool indices, so it is only valid alongside the constant
/// pool of the class it was read from.
#[derive(Clone, Debug, PartialEq)]
pub struct RawAttribute {
    pub name: String,
    pub info: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct FieldNode {
    pub access: FieldAccessFlags,
    pub name: UnqualifiedName,
    pub descriptor: String,
    pub attributes: Vec<RawAttribute>,
}

impl FieldNode {
    pub fn new(access: FieldAccessFlags, name: UnqualifiedName, descriptor: &str) -> FieldNode {
        FieldNode {
            access,
            name,
            descriptor: descriptor.to_owned(),
            attributes: vec![],
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(FieldAccessFlags::STATIC)
    }

    /// Is the initial value a compile-time constant (and so possibly inlined by `javac`)?
    pub fn has_constant_value(&self) -> bool {
        self.attributes.iter().any(|attr| attr.name == "ConstantValue")
    }
}

/// Exception handler covering `[start, end)`
#[derive(Clone, Debug, PartialEq)]
pub struct TryCatchBlock {
    pub start: Label,
    pub end: Label,
    pub handler: Label,

    /// Internal name of the caught class (`None` catches everything)
    pub catch_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MethodNode {
    pub access: MethodAccessFlags,
    pub name: UnqualifiedName,
    pub descriptor: String,
    pub instructions: Vec<Insn>,
    pub try_catch: Vec<TryCatchBlock>,
    pub attributes: Vec<RawAttribute>,

    /// Source of fresh labels for this method body
    pub labels: LabelGenerator,
}

impl MethodNode {
    pub fn new(access: MethodAccessFlags, name: UnqualifiedName, descriptor: &str) -> MethodNode {
        MethodNode {
            access,
            name,
            descriptor: descriptor.to_owned(),
            instructions: vec![],
            try_catch: vec![],
            attributes: vec![],
            labels: LabelGenerator::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccessFlags::STATIC)
    }

    /// Abstract and native methods have no `Code` attribute
    pub fn has_code(&self) -> bool {
        !self
            .access
            .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE)
    }

    pub fn parsed_descriptor(&self) -> Result<JavaMethodDescriptor, Error> {
        JavaMethodDescriptor::parse(&self.descriptor)
            .map_err(|err| Error::BadDescriptor(self.descriptor.clone(), err.to_string()))
    }

    /// Does this method match a `name` or `name(desc)ret` signature?
    pub fn matches_signature(&self, signature: &str) -> bool {
        match signature.find('(') {
            Some(idx) => {
                self.name.as_str() == &signature[..idx] && self.descriptor == signature[idx..]
            }
            None => self.name.as_str() == signature,
        }
    }

    /// Local slots touched by the body, and at least `parameter_slots`
    pub fn max_locals(&self, parameter_slots: usize) -> usize {
        let mut max = parameter_slots;
        for insn in &self.instructions {
            let used = match insn {
                Insn::Var(op, var) => *var as usize + op.local_width() as usize,
                Insn::IInc { var, .. } => *var as usize + 1,
                _ => 0,
            };
            max = max.max(used);
        }
        max
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh_label()
    }

    /// Replace the body, making sure the label generator stays ahead of the new labels
    pub fn set_instructions(&mut self, instructions: Vec<Insn>) {
        for insn in &instructions {
            if let Insn::Label(label) = insn {
                self.labels.reserve_through(*label);
            }
        }
        self.instructions = instructions;
    }
}

/// Structural representation of a class
///
/// Descriptors in the registry are shared and never mutated. Patching happens on a working copy
/// that is then handed to a [`ClassAssembler`](super::class_file::ClassAssembler).
#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    pub version: Version,
    pub access: ClassAccessFlags,
    pub name: BinaryName,
    pub super_name: Option<BinaryName>,
    pub interfaces: Vec<BinaryName>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
    pub attributes: Vec<RawAttribute>,

    /// Constant pool the class was read from
    ///
    /// Raw attributes and pooled `LDC` operands index into this, so it seeds the pool when the
    /// class gets written back out.
    pub constant_pool: Option<Arc<Vec<Constant>>>,
}

impl ClassDescriptor {
    pub fn new(
        name: BinaryName,
        super_name: Option<BinaryName>,
        access: ClassAccessFlags,
    ) -> ClassDescriptor {
        ClassDescriptor {
            version: Version::JAVA8,
            access,
            name,
            super_name,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
            constant_pool: None,
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccessFlags::INTERFACE)
    }

    /// Direct supertypes: the superclass followed by interfaces
    pub fn direct_supertypes(&self) -> impl Iterator<Item = &BinaryName> {
        self.super_name.iter().chain(self.interfaces.iter())
    }

    pub fn field(&self, name: &str, descriptor: Option<&str>) -> Option<&FieldNode> {
        self.fields.iter().find(|field| {
            field.name.as_str() == name && descriptor.map_or(true, |d| d == field.descriptor)
        })
    }

    pub fn field_mut(&mut self, name: &str, descriptor: &str) -> Option<&mut FieldNode> {
        self.fields
            .iter_mut()
            .find(|field| field.name.as_str() == name && field.descriptor == descriptor)
    }

    pub fn method(&self, name: &str, descriptor: Option<&str>) -> Option<&MethodNode> {
        self.methods.iter().find(|method| {
            method.name.as_str() == name && descriptor.map_or(true, |d| d == method.descriptor)
        })
    }

    /// Find a method by `name` or `name(desc)ret` signature
    pub fn method_by_signature_mut(&mut self, signature: &str) -> Option<&mut MethodNode> {
        self.methods
            .iter_mut()
            .find(|method| method.matches_signature(signature))
    }

    pub fn method_by_signature(&self, signature: &str) -> Option<&MethodNode> {
        self.methods
            .iter()
            .find(|method| method.matches_signature(signature))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn method_signatures() {
        let method = MethodNode::new(
            MethodAccessFlags::PUBLIC,
            UnqualifiedName::from_str("add").unwrap(),
            "(II)I",
        );
        assert!(method.matches_signature("add"));
        assert!(method.matches_signature("add(II)I"));
        assert!(!method.matches_signature("add(JJ)J"));
        assert!(!method.matches_signature("sub"));
    }

    #[test]
    fn labels_stay_fresh() {
        let mut generator = LabelGenerator::new();
        let first = generator.fresh_label();
        let second = generator.fresh_label();

        let mut method = MethodNode::new(
            MethodAccessFlags::STATIC,
            UnqualifiedName::from_str("f").unwrap(),
            "()V",
        );
        method.set_instructions(vec![Insn::Label(first), Insn::Label(second)]);
        let fresh = method.fresh_label();
        assert_ne!(fresh, first);
        assert_ne!(fresh, second);
    }
}
