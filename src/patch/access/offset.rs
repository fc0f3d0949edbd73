//! Raw memory access to fields by offset
//!
//! The unsafe access helper class exposes `get<Kind>(Ljava/lang/Object;J)T` and
//! `put<Kind>(Ljava/lang/Object;TJ)V` for every storage kind, where `T` is the kind's erased
//! type. Instance fields are read relative to their object. Static fields are read relative to a
//! static base object, which a generated holder class looks up once in its `<clinit>`.

use super::{cast_to, field_type, kind_of, static_method, synthetic_class, Error};
use crate::jvm::class_file::Version;
use crate::jvm::code::{Insn, LdcConstant, Opcode};
use crate::jvm::{
    BinaryName, ClassDescriptor, FieldAccessFlags, FieldNode, MethodAccessFlags, MethodNode, Name,
    UnqualifiedName,
};

/// `[object] -> [value]`
pub(super) fn instance_getter(
    unsafe_access: &BinaryName,
    offset: i64,
    descriptor: &str,
) -> Result<Vec<Insn>, Error> {
    let kind = kind_of(descriptor)?;
    let mut code = vec![
        Insn::Ldc(LdcConstant::Long(offset)),
        Insn::invoke_static(
            unsafe_access,
            &format!("get{}", kind.name()),
            &format!("(Ljava/lang/Object;J){}", kind.descriptor()),
        ),
    ];
    code.extend(cast_to(descriptor));
    Ok(code)
}

/// `[object, value] -> []`
pub(super) fn instance_setter(
    unsafe_access: &BinaryName,
    offset: i64,
    descriptor: &str,
) -> Result<Vec<Insn>, Error> {
    let kind = kind_of(descriptor)?;
    Ok(vec![
        Insn::Ldc(LdcConstant::Long(offset)),
        Insn::invoke_static(
            unsafe_access,
            &format!("put{}", kind.name()),
            &format!("(Ljava/lang/Object;{}J)V", kind.descriptor()),
        ),
    ])
}

/// Generated class caching the static base of every static field a patch accesses by offset
///
/// For a field `count`, the holder has a `base_count` field, initialized in `<clinit>`, and
/// static `getStatic_count()T`/`setStatic_count(T)V` methods that fragments call.
pub(super) struct BaseHolder {
    class: ClassDescriptor,
    unsafe_access: BinaryName,
    clinit: Vec<Insn>,
}

impl BaseHolder {
    pub fn new(name: BinaryName, unsafe_access: BinaryName, version: Version) -> BaseHolder {
        BaseHolder {
            class: synthetic_class(name, version),
            unsafe_access,
            clinit: vec![],
        }
    }

    pub fn name(&self) -> &BinaryName {
        &self.class.name
    }

    /// Register a static field, returning its getter and setter fragments
    pub fn add_field(
        &mut self,
        owner: &BinaryName,
        name: &str,
        descriptor: &str,
        offset: i64,
    ) -> Result<(Vec<Insn>, Vec<Insn>), Error> {
        let kind = kind_of(descriptor)?;
        let typ = field_type(descriptor)?;
        let field_name =
            UnqualifiedName::from_str(&format!("base_{}", name)).map_err(Error::InvalidPatch)?;
        if self.class.field(field_name.as_str(), None).is_some() {
            return Err(Error::InvalidPatch(format!(
                "two static fields named {} accessed by offset",
                name
            )));
        }

        let holder = self.class.name.clone();
        let base = Insn::field(
            Opcode::GETSTATIC,
            &holder,
            field_name.as_str(),
            "Ljava/lang/Object;",
        );
        self.class.fields.push(FieldNode::new(
            FieldAccessFlags::PRIVATE | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
            field_name.clone(),
            "Ljava/lang/Object;",
        ));

        self.clinit.extend([
            Insn::Ldc(LdcConstant::Class(owner.as_str().to_owned())),
            Insn::Ldc(LdcConstant::String(name.to_owned())),
            Insn::invoke_static(
                &self.unsafe_access,
                UnqualifiedName::GETDECLAREDFIELD.as_str(),
                "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/reflect/Field;",
            ),
            Insn::invoke_static(
                &self.unsafe_access,
                UnqualifiedName::GETSTATICBASE.as_str(),
                "(Ljava/lang/reflect/Field;)Ljava/lang/Object;",
            ),
            Insn::field(
                Opcode::PUTSTATIC,
                &holder,
                field_name.as_str(),
                "Ljava/lang/Object;",
            ),
        ]);

        let getter_name = format!("getStatic_{}", name);
        let getter_desc = format!("(){}", descriptor);
        let mut getter = vec![base.clone()];
        getter.extend(instance_getter(&self.unsafe_access, offset, descriptor)?);
        getter.push(Insn::return_value(Some(&typ)));
        self.class
            .methods
            .push(static_method(&getter_name, &getter_desc, getter)?);

        let setter_name = format!("setStatic_{}", name);
        let setter_desc = format!("({})V", descriptor);
        let setter = vec![
            base,
            Insn::load(&typ, 0),
            Insn::Ldc(LdcConstant::Long(offset)),
            Insn::invoke_static(
                &self.unsafe_access,
                &format!("put{}", kind.name()),
                &format!("(Ljava/lang/Object;{}J)V", kind.descriptor()),
            ),
            Insn::Simple(Opcode::RETURN),
        ];
        self.class
            .methods
            .push(static_method(&setter_name, &setter_desc, setter)?);

        Ok((
            vec![Insn::invoke_static(&holder, &getter_name, &getter_desc)],
            vec![Insn::invoke_static(&holder, &setter_name, &setter_desc)],
        ))
    }

    pub fn finish(mut self) -> ClassDescriptor {
        self.clinit.push(Insn::Simple(Opcode::RETURN));
        let mut clinit = MethodNode::new(
            MethodAccessFlags::STATIC,
            UnqualifiedName::CLINIT,
            "()V",
        );
        clinit.set_instructions(self.clinit);
        self.class.methods.push(clinit);
        self.class
    }
}
