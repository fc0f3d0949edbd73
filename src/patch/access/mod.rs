//! Remapping of patch-side member uses onto the target
//!
//! Code in a patch source class talks about the target through stand-in members: fields (or
//! getter/setter methods) declared on the source class. For every declared member, the engine
//! works out how the target member can actually be reached from code running inside the target,
//! builds a getter and a setter fragment for it, and then rewrites every use of the stand-in in
//! injected code into the matching fragment.
//!
//! Fragments have a canonical stack shape: `[receiver?] -> [value]` for getters and
//! `[receiver?, value] -> []` for setters, where the receiver is present exactly when the target
//! member is an instance member.

mod offset;
mod proxy;
mod support;

use super::descriptor::{MemberDeclaration, PatchDescriptor, ResolvedMode};
use super::{Error, HostRuntime, PatchLogger, Settings};
use crate::jvm::class_file::Version;
use crate::jvm::code::{Insn, Opcode};
use crate::jvm::descriptors::{field_width, JavaFieldType, ParseDescriptor};
use crate::jvm::{
    BinaryName, ClassAccessFlags, ClassDescriptor, FieldAccessFlags, FieldNode, MethodAccessFlags,
    MethodNode, Name, UnqualifiedName,
};
use crate::registry::{self, ClassRegistry};
use crate::runtime::StoreKind;
use offset::BaseHolder;
use proxy::ProxyHolder;
use std::ops::Range;

/// How a target member is reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessStrategy {
    /// Plain field instructions
    Direct,

    /// Plain field instructions, after making the field public and non-final
    AccessWidened,

    /// Raw memory access at the field's offset
    LowLevelOffset {
        offset: i64,

        /// Class caching the static base object (static fields only)
        base_holder: Option<BinaryName>,
    },

    /// Out-of-band storage for a field the target does not have
    ProxyStorage {
        holder: BinaryName,
        group: StoreKind,
        index: usize,
    },
}

/// Everything needed to rewrite uses of one stand-in member
#[derive(Clone, Debug)]
pub struct AccessorPlan {
    /// Stand-in field on the source class
    pub name: String,
    pub descriptor: String,

    /// Stand-in accessor methods on the source class
    pub getter_method: Option<String>,
    pub setter_method: Option<String>,

    /// Is the target member static (and so the fragments receiver-less)?
    pub is_static: bool,
    pub mutable: bool,
    pub strategy: AccessStrategy,

    pub getter: Vec<Insn>,

    /// Empty when the member is immutable
    pub setter: Vec<Insn>,
}

impl AccessorPlan {
    fn is_wide(&self) -> bool {
        matches!(self.descriptor.as_bytes().first(), Some(b'J' | b'D'))
    }
}

/// Stand-ins for the patched instance itself
#[derive(Clone, Debug)]
struct SelfReference {
    field: Option<String>,
    getter: Option<String>,
}

/// Result of planning the members of one patch
#[derive(Debug, Default)]
pub struct AccessMapping {
    /// Class whose members are stand-ins (nothing is remapped without one)
    source: Option<BinaryName>,
    pub plans: Vec<AccessorPlan>,
    self_references: Vec<SelfReference>,

    /// Helper classes the fragments depend on
    pub synthetic: Vec<ClassDescriptor>,

    /// Names of fields physically added to the target
    pub added_fields: Vec<String>,
}

/// A use of a stand-in member
enum Site<'p> {
    Get { plan: &'p AccessorPlan, receiver: bool },
    Set { plan: &'p AccessorPlan, receiver: bool },
    This { receiver: bool },
}

impl AccessMapping {
    fn site(&self, source: &BinaryName, insn: &Insn) -> Option<Site<'_>> {
        let (member, receiver, is_field_write, is_field) = match insn {
            Insn::Field(op, member) => (
                member,
                matches!(op, Opcode::GETFIELD | Opcode::PUTFIELD),
                matches!(op, Opcode::PUTFIELD | Opcode::PUTSTATIC),
                true,
            ),
            Insn::Method { opcode, member, .. } => {
                (member, *opcode != Opcode::INVOKESTATIC, false, false)
            }
            _ => return None,
        };
        if member.owner != source.as_str() {
            return None;
        }

        if is_field {
            for self_ref in &self.self_references {
                if self_ref.field.as_deref() == Some(member.name.as_str()) && !is_field_write {
                    return Some(Site::This { receiver });
                }
            }
            let plan = self
                .plans
                .iter()
                .find(|plan| plan.name == member.name && plan.descriptor == member.descriptor)?;
            return Some(if is_field_write {
                Site::Set { plan, receiver }
            } else {
                Site::Get { plan, receiver }
            });
        }

        for self_ref in &self.self_references {
            if self_ref.getter.as_deref() == Some(member.name.as_str())
                && member.descriptor.starts_with("()L")
            {
                return Some(Site::This { receiver });
            }
        }
        for plan in &self.plans {
            if plan.getter_method.as_deref() == Some(member.name.as_str())
                && member.descriptor == format!("(){}", plan.descriptor)
            {
                return Some(Site::Get { plan, receiver });
            }
            if plan.setter_method.as_deref() == Some(member.name.as_str())
                && member.descriptor == format!("({})V", plan.descriptor)
            {
                return Some(Site::Set { plan, receiver });
            }
        }
        None
    }

    /// Rewrite every use of a stand-in member in a method body
    pub fn remap(&self, method: &mut MethodNode) -> Result<(), Error> {
        let len = method.instructions.len();
        self.remap_range(method, 0..len)
    }

    /// Rewrite uses of stand-in members among the instructions in `range`, leaving the rest of
    /// the body alone
    pub fn remap_range(&self, method: &mut MethodNode, range: Range<usize>) -> Result<(), Error> {
        let source = match &self.source {
            Some(source) => source,
            None => return Ok(()),
        };
        let method_name = format!("{}{}", method.name, method.descriptor);
        let needs_this = |what: &str| -> Result<Insn, Error> {
            if method.is_static() {
                Err(Error::InvalidPatch(format!(
                    "{} needs an instance, but {} is static",
                    what, method_name
                )))
            } else {
                Ok(Insn::Var(Opcode::ALOAD, 0))
            }
        };

        let mut remapped = Vec::with_capacity(method.instructions.len());
        for (idx, insn) in method.instructions.iter().enumerate() {
            if !range.contains(&idx) {
                remapped.push(insn.clone());
                continue;
            }
            match self.site(source, insn) {
                None => remapped.push(insn.clone()),
                Some(Site::This { receiver }) => {
                    if !receiver {
                        remapped.push(needs_this("self reference")?);
                    } else if method.is_static() {
                        return Err(Error::InvalidPatch(format!(
                            "self reference in static method {}",
                            method_name
                        )));
                    }
                }
                Some(Site::Get { plan, receiver }) => {
                    if receiver && plan.is_static {
                        remapped.push(Insn::Simple(Opcode::POP));
                    } else if !receiver && !plan.is_static {
                        remapped.push(needs_this(&plan.name)?);
                    }
                    remapped.extend(plan.getter.iter().cloned());
                }
                Some(Site::Set { plan, receiver }) => {
                    if !plan.mutable {
                        return Err(Error::ImmutableAccessor(plan.name.clone()));
                    }
                    let wide = plan.is_wide();
                    if receiver && plan.is_static {
                        if wide {
                            remapped.push(Insn::Simple(Opcode::DUP2_X1));
                            remapped.push(Insn::Simple(Opcode::POP2));
                        } else {
                            remapped.push(Insn::Simple(Opcode::SWAP));
                        }
                        remapped.push(Insn::Simple(Opcode::POP));
                    } else if !receiver && !plan.is_static {
                        remapped.push(needs_this(&plan.name)?);
                        if wide {
                            remapped.push(Insn::Simple(Opcode::DUP_X2));
                            remapped.push(Insn::Simple(Opcode::POP));
                        } else {
                            remapped.push(Insn::Simple(Opcode::SWAP));
                        }
                    }
                    remapped.extend(plan.setter.iter().cloned());
                }
            }
        }
        method.instructions = remapped;
        Ok(())
    }
}

/// Target field a stand-in resolved to
#[derive(Debug)]
struct TargetField {
    owner: BinaryName,
    name: String,
    descriptor: String,
    is_static: bool,
    is_final: bool,
    accessible: bool,

    /// Declared on the target itself, rather than on a supertype
    on_target: bool,
    constant: bool,
}

/// Picks access strategies and generates fragments for the members of a patch
pub struct AccessEngine<'a> {
    pub registry: &'a ClassRegistry,
    pub runtime: &'a dyn HostRuntime,
    pub settings: &'a Settings,
    pub logger: &'a dyn PatchLogger,
}

impl<'a> AccessEngine<'a> {
    /// Plan every member declared by a patch
    ///
    /// Widened and added fields are applied to `working` straight away.
    pub fn plan(
        &self,
        patch: &PatchDescriptor,
        mode: ResolvedMode,
        working: &mut ClassDescriptor,
    ) -> Result<AccessMapping, Error> {
        let mut mapping = AccessMapping {
            source: patch.source_name()?,
            ..AccessMapping::default()
        };
        let mut base_holder: Option<BaseHolder> = None;
        let mut proxy_holder: Option<ProxyHolder> = None;

        for member in &patch.members {
            match member {
                MemberDeclaration::FieldAccessor {
                    name,
                    descriptor,
                    target_name,
                    target_descriptor,
                    mutable,
                    getter,
                    setter,
                    widen,
                } => {
                    field_width(descriptor).map_err(|err| {
                        Error::InvalidPatch(format!("descriptor of {}: {}", name, err))
                    })?;
                    let field = self.resolve_field(
                        working,
                        target_name.as_deref().unwrap_or(name),
                        target_descriptor.as_deref().unwrap_or(descriptor),
                    )?;
                    if field_width(&field.descriptor).ok() != field_width(descriptor).ok() {
                        return Err(Error::InvalidPatch(format!(
                            "{}:{} cannot stand for {}.{}:{}",
                            name, descriptor, field.owner, field.name, field.descriptor
                        )));
                    }
                    let strategy = self.choose(&field, *mutable, *widen, mode)?;
                    self.logger.debug(&format!(
                        "{}.{} reaches {}.{} through {:?}",
                        patch.name, name, field.owner, field.name, strategy
                    ));

                    let (strategy, getter_code, setter_code) = match strategy {
                        AccessStrategy::AccessWidened => {
                            self.widen(working, &field);
                            let (get, set) = direct_fragments(&field, descriptor);
                            (AccessStrategy::AccessWidened, get, set)
                        }
                        AccessStrategy::Direct => {
                            let (get, set) = direct_fragments(&field, descriptor);
                            (AccessStrategy::Direct, get, set)
                        }
                        _ if field.is_static => {
                            let offset =
                                self.runtime.static_field_offset(&field.owner, &field.name)?;
                            let mut holder = match base_holder.take() {
                                Some(holder) => holder,
                                None => BaseHolder::new(
                                    holder_name(
                                        &working.name,
                                        &self.settings.base_holder_suffix,
                                        &patch.name,
                                    )?,
                                    self.settings.unsafe_access().map_err(Error::InvalidPatch)?,
                                    working.version,
                                ),
                            };
                            let (get, set) = holder.add_field(
                                &field.owner,
                                &field.name,
                                &field.descriptor,
                                offset,
                            )?;
                            let strategy = AccessStrategy::LowLevelOffset {
                                offset,
                                base_holder: Some(holder.name().clone()),
                            };
                            base_holder = Some(holder);
                            (strategy, get, set)
                        }
                        _ => {
                            let offset = self.runtime.field_offset(&field.owner, &field.name)?;
                            let unsafe_access =
                                self.settings.unsafe_access().map_err(Error::InvalidPatch)?;
                            let get =
                                offset::instance_getter(&unsafe_access, offset, &field.descriptor)?;
                            let set =
                                offset::instance_setter(&unsafe_access, offset, &field.descriptor)?;
                            let strategy = AccessStrategy::LowLevelOffset {
                                offset,
                                base_holder: None,
                            };
                            (strategy, get, set)
                        }
                    };

                    mapping.plans.push(AccessorPlan {
                        name: name.clone(),
                        descriptor: descriptor.clone(),
                        getter_method: getter.clone(),
                        setter_method: setter.clone(),
                        is_static: field.is_static,
                        mutable: *mutable,
                        strategy,
                        getter: getter_code,
                        setter: if *mutable { setter_code } else { vec![] },
                    });
                }

                MemberDeclaration::SelfReference { name, getter } => {
                    mapping.self_references.push(SelfReference {
                        field: name.clone(),
                        getter: getter.clone(),
                    });
                }

                MemberDeclaration::NewField {
                    name,
                    descriptor,
                    mutable,
                    is_static,
                    getter,
                    setter,
                } => {
                    field_width(descriptor).map_err(|err| {
                        Error::InvalidPatch(format!("descriptor of {}: {}", name, err))
                    })?;

                    let (strategy, getter_code, setter_code) = match mode {
                        ResolvedMode::ClassLoaderTime => {
                            let field =
                                self.add_field(working, name, descriptor, *mutable, *is_static)?;
                            mapping.added_fields.push(field.name.clone());
                            let (get, set) = direct_fragments(&field, descriptor);
                            (AccessStrategy::Direct, get, set)
                        }
                        ResolvedMode::LiveRedefine => {
                            let mut holder = match proxy_holder.take() {
                                Some(holder) => holder,
                                None => ProxyHolder::new(
                                    holder_name(
                                        &working.name,
                                        &self.settings.proxy_holder_suffix,
                                        &patch.name,
                                    )?,
                                    self.settings.proxy_store().map_err(Error::InvalidPatch)?,
                                    working.name.clone(),
                                    working.version,
                                ),
                            };
                            let slot = holder.add_field(descriptor, *is_static)?;
                            let strategy = AccessStrategy::ProxyStorage {
                                holder: holder.name().clone(),
                                group: slot.group,
                                index: slot.index,
                            };
                            proxy_holder = Some(holder);
                            (strategy, slot.getter, slot.setter)
                        }
                    };
                    self.logger.debug(&format!(
                        "{}.{} is new state, stored through {:?}",
                        patch.name, name, strategy
                    ));

                    mapping.plans.push(AccessorPlan {
                        name: name.clone(),
                        descriptor: descriptor.clone(),
                        getter_method: getter.clone(),
                        setter_method: setter.clone(),
                        is_static: *is_static,
                        mutable: *mutable,
                        strategy,
                        getter: getter_code,
                        setter: if *mutable { setter_code } else { vec![] },
                    });
                }
            }
        }

        let uses_offsets = mapping
            .plans
            .iter()
            .any(|plan| matches!(plan.strategy, AccessStrategy::LowLevelOffset { .. }));
        if let Some(holder) = base_holder {
            mapping.synthetic.push(holder.finish());
        }
        if uses_offsets {
            let name = self.settings.unsafe_access().map_err(Error::InvalidPatch)?;
            if self.needs_support(&name) {
                mapping.synthetic.push(support::unsafe_access(name)?);
            }
        }
        if let Some(holder) = proxy_holder {
            mapping.synthetic.push(holder.finish()?);
            let name = self.settings.proxy_store().map_err(Error::InvalidPatch)?;
            if self.needs_support(&name) {
                mapping.synthetic.push(support::proxy_store(name)?);
            }
        }
        Ok(mapping)
    }

    /// Is a runtime support class missing from the class path?
    fn needs_support(&self, name: &BinaryName) -> bool {
        if self.registry.resolve(name).is_ok() {
            self.logger
                .debug(&format!("Using {} from the class path", name));
            return false;
        }
        true
    }

    fn resolve_field(
        &self,
        working: &ClassDescriptor,
        name: &str,
        descriptor: &str,
    ) -> Result<TargetField, Error> {
        if let Some(field) = working.field(name, Some(descriptor)) {
            return Ok(TargetField {
                owner: working.name.clone(),
                name: name.to_owned(),
                descriptor: descriptor.to_owned(),
                is_static: field.is_static(),
                is_final: field.access.contains(FieldAccessFlags::FINAL),
                accessible: true,
                on_target: true,
                constant: field.has_constant_value(),
            });
        }

        let resolved = match self.registry.resolve_field(&working.name, name, Some(descriptor)) {
            Ok(resolved) => resolved,
            Err(registry::Error::MemberNotFound { .. }) => {
                return Err(Error::TargetMemberMissing {
                    target: working.name.clone(),
                    member: format!("{}:{}", name, descriptor),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let owner = resolved.reference.owner_name().map_err(Error::InvalidPatch)?;
        Ok(TargetField {
            accessible: self.registry.can_access(&working.name, &resolved)?,
            on_target: owner == working.name,
            owner,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            is_static: resolved.is_static,
            is_final: resolved.is_final,
            constant: false,
        })
    }

    /// Strategy for an existing target field (offset access stands for both low-level cases)
    fn choose(
        &self,
        field: &TargetField,
        mutable: bool,
        widen: bool,
        mode: ResolvedMode,
    ) -> Result<AccessStrategy, Error> {
        let can_widen = mode == ResolvedMode::ClassLoaderTime && field.on_target;
        if widen {
            if mode == ResolvedMode::LiveRedefine {
                return Err(Error::InvalidPatchMode(format!(
                    "{}.{} cannot be widened while redefining a live class",
                    field.owner, field.name
                )));
            }
            if !can_widen {
                return Err(Error::InvalidPatch(format!(
                    "{}.{} is not declared on the target and cannot be widened",
                    field.owner, field.name
                )));
            }
            return Ok(AccessStrategy::AccessWidened);
        }

        Ok(if field.accessible && !(mutable && field.is_final) {
            AccessStrategy::Direct
        } else if can_widen {
            AccessStrategy::AccessWidened
        } else {
            AccessStrategy::LowLevelOffset {
                offset: 0,
                base_holder: None,
            }
        })
    }

    fn widen(&self, working: &mut ClassDescriptor, field: &TargetField) {
        if field.is_static && field.is_final && field.constant {
            self.logger.warn(&format!(
                "{}.{} is a compile-time constant: widening it does not affect code that inlined it",
                field.owner, field.name
            ));
        }
        if let Some(node) = working.field_mut(&field.name, &field.descriptor) {
            node.access = node.access.widened(true);
        }
    }

    /// Physically add a field, renaming it if the name is taken
    fn add_field(
        &self,
        working: &mut ClassDescriptor,
        name: &str,
        descriptor: &str,
        mutable: bool,
        is_static: bool,
    ) -> Result<TargetField, Error> {
        let mut actual = name.to_owned();
        while working.field(&actual, None).is_some() {
            actual.push('$');
        }
        if actual != name {
            self.logger.warn(&format!(
                "{} already has a field {}, adding it as {}",
                working.name, name, actual
            ));
        }

        let mut access = FieldAccessFlags::PUBLIC;
        if is_static {
            access |= FieldAccessFlags::STATIC;
        }
        if !mutable {
            access |= FieldAccessFlags::FINAL;
        }
        let field_name = UnqualifiedName::from_str(&actual).map_err(Error::InvalidPatch)?;
        working.fields.push(FieldNode::new(access, field_name, descriptor));

        Ok(TargetField {
            owner: working.name.clone(),
            name: actual,
            descriptor: descriptor.to_owned(),
            is_static,
            is_final: !mutable,
            accessible: true,
            on_target: true,
            constant: false,
        })
    }
}

/// Plain field access, casting values written through a more general stand-in type
fn direct_fragments(field: &TargetField, stand_in: &str) -> (Vec<Insn>, Vec<Insn>) {
    let (get_op, put_op) = if field.is_static {
        (Opcode::GETSTATIC, Opcode::PUTSTATIC)
    } else {
        (Opcode::GETFIELD, Opcode::PUTFIELD)
    };
    let getter = vec![Insn::field(get_op, &field.owner, &field.name, &field.descriptor)];
    let mut setter = vec![];
    if stand_in != field.descriptor {
        setter.extend(cast_to(&field.descriptor));
    }
    setter.push(Insn::field(put_op, &field.owner, &field.name, &field.descriptor));
    (getter, setter)
}

/// `CHECKCAST` needed after a value was read as a plain `Object`
fn cast_to(descriptor: &str) -> Option<Insn> {
    if descriptor == "Ljava/lang/Object;" {
        return None;
    }
    if let Some(class) = descriptor.strip_prefix('L') {
        let class = class.strip_suffix(';').unwrap_or(class);
        return Some(Insn::Type(Opcode::CHECKCAST, class.to_owned()));
    }
    if descriptor.starts_with('[') {
        return Some(Insn::Type(Opcode::CHECKCAST, descriptor.to_owned()));
    }
    None
}

fn kind_of(descriptor: &str) -> Result<StoreKind, Error> {
    StoreKind::of_descriptor(descriptor)
        .ok_or_else(|| Error::InvalidPatch(format!("{} is not a field type", descriptor)))
}

fn field_type(descriptor: &str) -> Result<JavaFieldType, Error> {
    JavaFieldType::parse(descriptor)
        .map_err(|err| Error::InvalidPatch(format!("bad field descriptor {}: {}", descriptor, err)))
}

/// Name of a helper class nested in the target, unique per patch
fn holder_name(target: &BinaryName, suffix: &str, patch: &str) -> Result<BinaryName, Error> {
    let patch: String = patch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let name = target.nested(&format!("{}_{}", suffix, patch));
    BinaryName::check_valid(&name).map_err(Error::InvalidPatch)?;
    Ok(name)
}

/// Empty final class to hang generated helpers on
fn synthetic_class(name: BinaryName, version: Version) -> ClassDescriptor {
    let mut class = ClassDescriptor::new(
        name,
        Some(BinaryName::OBJECT),
        ClassAccessFlags::PUBLIC
            | ClassAccessFlags::FINAL
            | ClassAccessFlags::SUPER
            | ClassAccessFlags::SYNTHETIC,
    );
    class.version = version;
    class
}

fn static_method(name: &str, descriptor: &str, instructions: Vec<Insn>) -> Result<MethodNode, Error> {
    let name = UnqualifiedName::from_str(name).map_err(Error::InvalidPatch)?;
    let mut method = MethodNode::new(
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC | MethodAccessFlags::SYNTHETIC,
        name,
        descriptor,
    );
    method.set_instructions(instructions);
    Ok(method)
}
