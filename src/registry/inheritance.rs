use super::{ClassId, ClassRegistry, Error};
use crate::jvm::{
    self, BinaryName, ClassDescriptor, FieldAccessFlags, MemberKind, MemberReference,
    MethodAccessFlags, Name, Visibility,
};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

/// Where a class sits in the hierarchy
///
/// `super_types` is transitive. `sub_types` only contains classes whose own tree has been
/// computed, since subclasses are discovered from below. Whenever A is in the `sub_types` of B,
/// B is in the `super_types` of A.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InheritanceTree {
    pub super_types: BTreeSet<ClassId>,
    pub sub_types: BTreeSet<ClassId>,
}

/// Member found through the hierarchy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMember {
    /// Reference whose owner is the declaring class
    pub reference: MemberReference,
    pub owner_id: ClassId,
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_final: bool,
}

impl ClassRegistry {
    /// Inheritance tree of a class, computing (and caching) it and its ancestors' trees
    pub fn tree(&self, name: &BinaryName) -> Result<InheritanceTree, Error> {
        let id = self.resolve_id(name)?;
        self.tree_of(id, &mut HashSet::new())
    }

    fn tree_of(
        &self,
        id: ClassId,
        in_progress: &mut HashSet<ClassId>,
    ) -> Result<InheritanceTree, Error> {
        if let Some(tree) = self.arena.read().trees.get(&id) {
            return Ok(tree.clone());
        }
        if !in_progress.insert(id) {
            return Err(Error::CyclicInheritance(self.name_of(id)));
        }

        let class = self.get(id);
        let mut super_types = BTreeSet::new();
        for parent in class.direct_supertypes() {
            let parent_id = self.resolve_id(parent)?;
            let parent_tree = self.tree_of(parent_id, in_progress)?;
            super_types.insert(parent_id);
            super_types.extend(parent_tree.super_types);
        }
        in_progress.remove(&id);

        let mut arena = self.arena.write();
        if let Some(tree) = arena.trees.get(&id) {
            return Ok(tree.clone());
        }
        for ancestor in &super_types {
            if let Some(tree) = arena.trees.get_mut(ancestor) {
                tree.sub_types.insert(id);
            }
        }
        let tree = InheritanceTree {
            super_types,
            sub_types: BTreeSet::new(),
        };
        arena.trees.insert(id, tree.clone());
        Ok(tree)
    }

    /// Is `sub` the same as, or a subtype of, `sup`?
    pub fn is_subtype_of(&self, sub: &BinaryName, sup: &BinaryName) -> Result<bool, Error> {
        if sub == sup {
            return Ok(true);
        }
        let sup_id = self.resolve_id(sup)?;
        Ok(self.tree(sub)?.super_types.contains(&sup_id))
    }

    /// The class, then its superclass chain, then all interfaces reachable from those
    fn lineage(&self, name: &BinaryName) -> Result<Vec<(ClassId, Arc<ClassDescriptor>)>, Error> {
        let mut lineage = vec![];
        let mut seen = HashSet::new();

        let mut next = Some(name.clone());
        while let Some(name) = next {
            let id = self.resolve_id(&name)?;
            if !seen.insert(id) {
                return Err(Error::CyclicInheritance(name));
            }
            let class = self.get(id);
            next = class.super_name.clone();
            lineage.push((id, class));
        }

        let mut interfaces: VecDeque<BinaryName> = lineage
            .iter()
            .flat_map(|(_, class)| class.interfaces.iter().cloned())
            .collect();
        while let Some(name) = interfaces.pop_front() {
            let id = self.resolve_id(&name)?;
            if seen.insert(id) {
                let class = self.get(id);
                interfaces.extend(class.interfaces.iter().cloned());
                lineage.push((id, class));
            }
        }
        Ok(lineage)
    }

    /// Find a field on a class or its supertypes
    pub fn resolve_field(
        &self,
        class: &BinaryName,
        name: &str,
        descriptor: Option<&str>,
    ) -> Result<ResolvedMember, Error> {
        for (owner_id, owner) in self.lineage(class)? {
            if let Some(field) = owner.field(name, descriptor) {
                return Ok(ResolvedMember {
                    reference: MemberReference::new(
                        owner.name.as_str(),
                        name,
                        &field.descriptor,
                        MemberKind::Field,
                    ),
                    owner_id,
                    visibility: field.access.visibility(),
                    is_static: field.is_static(),
                    is_final: field.access.contains(FieldAccessFlags::FINAL),
                });
            }
        }
        Err(Error::MemberNotFound {
            class: class.clone(),
            name: name.to_owned(),
            descriptor: descriptor.map(str::to_owned),
        })
    }

    /// Find a method on a class or its supertypes (by name only if `descriptor` is `None`)
    pub fn resolve_method(
        &self,
        class: &BinaryName,
        name: &str,
        descriptor: Option<&str>,
    ) -> Result<ResolvedMember, Error> {
        for (owner_id, owner) in self.lineage(class)? {
            if let Some(method) = owner.method(name, descriptor) {
                return Ok(ResolvedMember {
                    reference: MemberReference::new(
                        owner.name.as_str(),
                        name,
                        &method.descriptor,
                        MemberKind::Method,
                    ),
                    owner_id,
                    visibility: method.access.visibility(),
                    is_static: method.is_static(),
                    is_final: method.access.contains(MethodAccessFlags::FINAL),
                });
            }
        }
        Err(Error::MemberNotFound {
            class: class.clone(),
            name: name.to_owned(),
            descriptor: descriptor.map(str::to_owned),
        })
    }

    /// Resolve a symbolic reference to the member it designates
    ///
    /// Nothing is cached: the reference is looked up again on every call.
    pub fn resolve_member_ref(&self, reference: &MemberReference) -> Result<ResolvedMember, Error> {
        // Array types inherit their members from `Object`
        let owner = if reference.owner.starts_with('[') {
            BinaryName::OBJECT
        } else {
            reference
                .owner_name()
                .map_err(|err| Error::Load(jvm::Error::InvalidName(err)))?
        };
        let descriptor = Some(reference.descriptor.as_str()).filter(|desc| !desc.is_empty());
        match reference.kind {
            MemberKind::Field => self.resolve_field(&owner, &reference.name, descriptor),
            MemberKind::Method => self.resolve_method(&owner, &reference.name, descriptor),
        }
    }

    /// Can code in `context` access the member?
    pub fn can_access(&self, context: &BinaryName, member: &ResolvedMember) -> Result<bool, Error> {
        let owner = self.name_of(member.owner_id);
        if owner == *context {
            return Ok(true);
        }
        Ok(match member.visibility {
            Visibility::Private => false,
            Visibility::Public => true,
            Visibility::Protected => {
                self.is_subtype_of(context, &owner)? || owner.package() == context.package()
            }
            Visibility::Package => owner.package() == context.package(),
        })
    }
}
