//! Out-of-band storage for fields added to live classes
//!
//! Live redefinition cannot add fields, so new state is kept in identity-keyed proxy stores. A
//! generated holder class owns one store per storage kind (see [`StoreKind`]), sized to the number
//! of fields of that kind, and exposes static bridges the fragments call:
//!
//! ```text
//! get<Kind>(Ljava/lang/Object;I)T      put<Kind>(Ljava/lang/Object;IT)V
//! ```
//!
//! The first argument is the owner (the instance, or the target's `Class` for static fields) and
//! the second the index of the field within its kind.

use super::{cast_to, field_type, kind_of, static_method, synthetic_class, Error};
use crate::jvm::class_file::Version;
use crate::jvm::code::{Insn, LdcConstant, Opcode};
use crate::jvm::{
    BinaryName, ClassDescriptor, FieldAccessFlags, FieldNode, MethodAccessFlags, MethodNode, Name,
    UnqualifiedName,
};
use crate::runtime::StoreKind;
use std::collections::BTreeMap;

/// Where a new field ended up, along with its fragments
pub(super) struct ProxySlot {
    pub group: StoreKind,
    pub index: usize,
    pub getter: Vec<Insn>,
    pub setter: Vec<Insn>,
}

pub(super) struct ProxyHolder {
    name: BinaryName,
    store_class: BinaryName,
    target: BinaryName,
    version: Version,

    /// Number of fields in each group
    groups: BTreeMap<StoreKind, usize>,
}

fn store_field(kind: StoreKind) -> String {
    format!("STORE_{}", kind.name().to_ascii_uppercase())
}

fn bridge_descriptors(kind: StoreKind) -> (String, String) {
    (
        format!("(Ljava/lang/Object;I){}", kind.descriptor()),
        format!("(Ljava/lang/Object;I{})V", kind.descriptor()),
    )
}

impl ProxyHolder {
    pub fn new(
        name: BinaryName,
        store_class: BinaryName,
        target: BinaryName,
        version: Version,
    ) -> ProxyHolder {
        ProxyHolder {
            name,
            store_class,
            target,
            version,
            groups: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &BinaryName {
        &self.name
    }

    /// Allocate the next index in the field's group
    pub fn add_field(&mut self, descriptor: &str, is_static: bool) -> Result<ProxySlot, Error> {
        let group = kind_of(descriptor)?;
        let count = self.groups.entry(group).or_insert(0);
        let index = *count;
        *count += 1;

        let index_insn = Insn::push_int(index as i32);
        let owner = Insn::Ldc(LdcConstant::Class(self.target.as_str().to_owned()));
        let (get_desc, put_desc) = bridge_descriptors(group);
        let get_name = format!("get{}", group.name());
        let put_name = format!("put{}", group.name());

        let mut getter = vec![];
        if is_static {
            getter.push(owner.clone());
        }
        getter.push(index_insn.clone());
        getter.push(Insn::invoke_static(&self.name, &get_name, &get_desc));
        getter.extend(cast_to(descriptor));

        // `[owner, value]` has to become `[owner, index, value]`
        let mut setter = vec![];
        if is_static {
            setter.push(owner);
            if group.is_wide() {
                setter.push(Insn::Simple(Opcode::DUP_X2));
                setter.push(Insn::Simple(Opcode::POP));
            } else {
                setter.push(Insn::Simple(Opcode::SWAP));
            }
        }
        setter.push(index_insn);
        if group.is_wide() {
            setter.push(Insn::Simple(Opcode::DUP_X2));
            setter.push(Insn::Simple(Opcode::POP));
        } else {
            setter.push(Insn::Simple(Opcode::SWAP));
        }
        setter.push(Insn::invoke_static(&self.name, &put_name, &put_desc));

        Ok(ProxySlot {
            group,
            index,
            getter,
            setter,
        })
    }

    pub fn finish(self) -> Result<ClassDescriptor, Error> {
        let store_desc = format!("L{};", self.store_class);
        let mut class = synthetic_class(self.name.clone(), self.version);
        let mut clinit = vec![];

        for (&kind, &arity) in &self.groups {
            let field = store_field(kind);
            let field_name = UnqualifiedName::from_str(&field).map_err(Error::InvalidPatch)?;
            class.fields.push(FieldNode::new(
                FieldAccessFlags::PRIVATE | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
                field_name,
                &store_desc,
            ));

            clinit.extend([
                Insn::Type(Opcode::NEW, self.store_class.as_str().to_owned()),
                Insn::Simple(Opcode::DUP),
                Insn::push_int(arity as i32),
                Insn::invoke_special(&self.store_class, UnqualifiedName::INIT.as_str(), "(I)V"),
                Insn::field(Opcode::PUTSTATIC, &self.name, &field, &store_desc),
            ]);

            let (get_desc, put_desc) = bridge_descriptors(kind);
            let value_type = field_type(kind.descriptor())?;
            let store = Insn::field(Opcode::GETSTATIC, &self.name, &field, &store_desc);

            let get_name = format!("get{}", kind.name());
            let get = vec![
                store.clone(),
                Insn::Var(Opcode::ALOAD, 0),
                Insn::Var(Opcode::ILOAD, 1),
                Insn::invoke_virtual(&self.store_class, &get_name, &get_desc),
                Insn::return_value(Some(&value_type)),
            ];
            class.methods.push(static_method(&get_name, &get_desc, get)?);

            let put_name = format!("put{}", kind.name());
            let put = vec![
                store,
                Insn::Var(Opcode::ALOAD, 0),
                Insn::Var(Opcode::ILOAD, 1),
                Insn::load(&value_type, 2),
                Insn::invoke_virtual(&self.store_class, &put_name, &put_desc),
                Insn::Simple(Opcode::RETURN),
            ];
            class.methods.push(static_method(&put_name, &put_desc, put)?);
        }

        clinit.push(Insn::Simple(Opcode::RETURN));
        let mut method = MethodNode::new(MethodAccessFlags::STATIC, UnqualifiedName::CLINIT, "()V");
        method.set_instructions(clinit);
        class.methods.push(method);
        Ok(class)
    }
}
