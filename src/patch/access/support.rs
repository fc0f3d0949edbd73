//! Runtime classes the generated fragments call into
//!
//! Offset access goes through an unsafe access class with static `get<Kind>(Ljava/lang/Object;J)T`
//! and `put<Kind>(Ljava/lang/Object;TJ)V` methods, plus the two lookups static field holders use
//! in their `<clinit>`. Proxied fields go through instances of a proxy store class: one row of
//! `arity` slots per owner, keyed by owner identity and dropped once the owner is collected.
//!
//! Both classes are emitted alongside the patched classes unless the class path already has them.

use super::{field_type, Error};
use crate::jvm::class_file::Version;
use crate::jvm::code::{Insn, LabelGenerator, LdcConstant, Opcode};
use crate::jvm::{
    BinaryName, ClassAccessFlags, ClassDescriptor, FieldAccessFlags, FieldNode, MethodAccessFlags,
    MethodNode, Name, UnqualifiedName,
};
use crate::runtime::StoreKind;

fn class(name: &str) -> Result<BinaryName, Error> {
    BinaryName::from_str(name).map_err(Error::InvalidPatch)
}

fn support_class(name: BinaryName) -> ClassDescriptor {
    let mut class = ClassDescriptor::new(
        name,
        Some(BinaryName::OBJECT),
        ClassAccessFlags::PUBLIC | ClassAccessFlags::FINAL | ClassAccessFlags::SUPER,
    );
    class.version = Version::JAVA5;
    class
}

fn method(
    access: MethodAccessFlags,
    name: &str,
    descriptor: &str,
    instructions: Vec<Insn>,
) -> Result<MethodNode, Error> {
    let name = UnqualifiedName::from_str(name).map_err(Error::InvalidPatch)?;
    let mut method = MethodNode::new(access, name, descriptor);
    method.set_instructions(instructions);
    Ok(method)
}

/// Wrapper class and unboxing method of a primitive kind
fn boxed(kind: StoreKind) -> Option<(&'static str, &'static str)> {
    Some(match kind {
        StoreKind::Boolean => ("java/lang/Boolean", "booleanValue"),
        StoreKind::Byte => ("java/lang/Byte", "byteValue"),
        StoreKind::Char => ("java/lang/Character", "charValue"),
        StoreKind::Short => ("java/lang/Short", "shortValue"),
        StoreKind::Int => ("java/lang/Integer", "intValue"),
        StoreKind::Long => ("java/lang/Long", "longValue"),
        StoreKind::Float => ("java/lang/Float", "floatValue"),
        StoreKind::Double => ("java/lang/Double", "doubleValue"),
        StoreKind::Object => return None,
    })
}

/// Default value of a field of this kind
fn zero(kind: StoreKind) -> Insn {
    Insn::Simple(match kind {
        StoreKind::Long => Opcode::LCONST_0,
        StoreKind::Float => Opcode::FCONST_0,
        StoreKind::Double => Opcode::DCONST_0,
        StoreKind::Object => Opcode::ACONST_NULL,
        _ => Opcode::ICONST_0,
    })
}

/// Static wrappers around `sun.misc.Unsafe`
pub(super) fn unsafe_access(name: BinaryName) -> Result<ClassDescriptor, Error> {
    let unsafe_class = class("sun/misc/Unsafe")?;
    let field_class = class("java/lang/reflect/Field")?;
    let unsafe_desc = "Lsun/misc/Unsafe;";
    let mut support = support_class(name.clone());
    support.fields.push(FieldNode::new(
        FieldAccessFlags::PRIVATE | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
        UnqualifiedName::from_str("UNSAFE").map_err(Error::InvalidPatch)?,
        unsafe_desc,
    ));
    let the_unsafe = Insn::field(Opcode::GETSTATIC, &name, "UNSAFE", unsafe_desc);
    let public_static = MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC;

    let clinit = vec![
        Insn::Ldc(LdcConstant::Class(unsafe_class.as_str().to_owned())),
        Insn::Ldc(LdcConstant::String(String::from("theUnsafe"))),
        Insn::invoke_virtual(
            &class("java/lang/Class")?,
            "getDeclaredField",
            "(Ljava/lang/String;)Ljava/lang/reflect/Field;",
        ),
        Insn::Simple(Opcode::DUP),
        Insn::Simple(Opcode::ICONST_1),
        Insn::invoke_virtual(&field_class, "setAccessible", "(Z)V"),
        Insn::Simple(Opcode::ACONST_NULL),
        Insn::invoke_virtual(&field_class, "get", "(Ljava/lang/Object;)Ljava/lang/Object;"),
        Insn::Type(Opcode::CHECKCAST, unsafe_class.as_str().to_owned()),
        Insn::field(Opcode::PUTSTATIC, &name, "UNSAFE", unsafe_desc),
        Insn::Simple(Opcode::RETURN),
    ];
    support.methods.push(method(
        MethodAccessFlags::STATIC,
        UnqualifiedName::CLINIT.as_str(),
        "()V",
        clinit,
    )?);

    support.methods.push(method(
        public_static,
        UnqualifiedName::GETDECLAREDFIELD.as_str(),
        "(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/reflect/Field;",
        vec![
            Insn::Var(Opcode::ALOAD, 0),
            Insn::Var(Opcode::ALOAD, 1),
            Insn::invoke_virtual(
                &class("java/lang/Class")?,
                "getDeclaredField",
                "(Ljava/lang/String;)Ljava/lang/reflect/Field;",
            ),
            Insn::Simple(Opcode::ARETURN),
        ],
    )?);
    support.methods.push(method(
        public_static,
        UnqualifiedName::GETSTATICBASE.as_str(),
        "(Ljava/lang/reflect/Field;)Ljava/lang/Object;",
        vec![
            the_unsafe.clone(),
            Insn::Var(Opcode::ALOAD, 0),
            Insn::invoke_virtual(
                &unsafe_class,
                "staticFieldBase",
                "(Ljava/lang/reflect/Field;)Ljava/lang/Object;",
            ),
            Insn::Simple(Opcode::ARETURN),
        ],
    )?);

    for kind in StoreKind::ALL {
        let value = field_type(kind.descriptor())?;
        let get_name = format!("get{}", kind.name());
        let get_desc = format!("(Ljava/lang/Object;J){}", kind.descriptor());
        let get = vec![
            the_unsafe.clone(),
            Insn::Var(Opcode::ALOAD, 0),
            Insn::Var(Opcode::LLOAD, 1),
            Insn::invoke_virtual(&unsafe_class, &get_name, &get_desc),
            Insn::return_value(Some(&value)),
        ];
        support.methods.push(method(public_static, &get_name, &get_desc, get)?);

        // The offset comes last here, but `Unsafe` takes it before the value
        let put_name = format!("put{}", kind.name());
        let offset_slot = if kind.is_wide() { 3 } else { 2 };
        let put = vec![
            the_unsafe.clone(),
            Insn::Var(Opcode::ALOAD, 0),
            Insn::Var(Opcode::LLOAD, offset_slot),
            Insn::load(&value, 1),
            Insn::invoke_virtual(
                &unsafe_class,
                &put_name,
                &format!("(Ljava/lang/Object;J{})V", kind.descriptor()),
            ),
            Insn::Simple(Opcode::RETURN),
        ];
        support.methods.push(method(
            public_static,
            &put_name,
            &format!("(Ljava/lang/Object;{}J)V", kind.descriptor()),
            put,
        )?);
    }

    Ok(support)
}

/// Identity-keyed storage for fields the target class could not get
///
/// `rows` maps an owner's identity hash code to a list of `{WeakReference(owner), Object[arity]}`
/// pairs. Entries whose owner was collected are swept out before a new row is created.
pub(super) fn proxy_store(name: BinaryName) -> Result<ClassDescriptor, Error> {
    let map = class("java/util/Map")?;
    let list = class("java/util/List")?;
    let iterator = class("java/util/Iterator")?;
    let reference = class("java/lang/ref/Reference")?;
    let queue_class = class("java/lang/ref/ReferenceQueue")?;
    let row_desc = "(Ljava/lang/Object;Z)[Ljava/lang/Object;";

    let mut store = support_class(name.clone());
    for (field, descriptor) in [
        ("arity", "I"),
        ("rows", "Ljava/util/Map;"),
        ("queue", "Ljava/lang/ref/ReferenceQueue;"),
    ] {
        store.fields.push(FieldNode::new(
            FieldAccessFlags::PRIVATE | FieldAccessFlags::FINAL,
            UnqualifiedName::from_str(field).map_err(Error::InvalidPatch)?,
            descriptor,
        ));
    }
    let this = Insn::Var(Opcode::ALOAD, 0);
    let arity = Insn::field(Opcode::GETFIELD, &name, "arity", "I");
    let rows = Insn::field(Opcode::GETFIELD, &name, "rows", "Ljava/util/Map;");
    let queue = Insn::field(
        Opcode::GETFIELD,
        &name,
        "queue",
        "Ljava/lang/ref/ReferenceQueue;",
    );
    let poll = Insn::invoke_virtual(&queue_class, "poll", "()Ljava/lang/ref/Reference;");
    let object_array = String::from("[Ljava/lang/Object;");
    let mut labels = LabelGenerator::new();

    let init = vec![
        this.clone(),
        Insn::invoke_special(&BinaryName::OBJECT, UnqualifiedName::INIT.as_str(), "()V"),
        this.clone(),
        Insn::Var(Opcode::ILOAD, 1),
        Insn::field(Opcode::PUTFIELD, &name, "arity", "I"),
        this.clone(),
        Insn::Type(Opcode::NEW, String::from("java/util/HashMap")),
        Insn::Simple(Opcode::DUP),
        Insn::invoke_special(&class("java/util/HashMap")?, UnqualifiedName::INIT.as_str(), "()V"),
        Insn::field(Opcode::PUTFIELD, &name, "rows", "Ljava/util/Map;"),
        this.clone(),
        Insn::Type(Opcode::NEW, queue_class.as_str().to_owned()),
        Insn::Simple(Opcode::DUP),
        Insn::invoke_special(&queue_class, UnqualifiedName::INIT.as_str(), "()V"),
        Insn::field(
            Opcode::PUTFIELD,
            &name,
            "queue",
            "Ljava/lang/ref/ReferenceQueue;",
        ),
        Insn::Simple(Opcode::RETURN),
    ];
    store.methods.push(method(
        MethodAccessFlags::PUBLIC,
        UnqualifiedName::INIT.as_str(),
        "(I)V",
        init,
    )?);

    // checkIndex(int)
    let fail = labels.fresh_label();
    let out_of_bounds = class("java/lang/IndexOutOfBoundsException")?;
    let check_index = vec![
        Insn::Var(Opcode::ILOAD, 1),
        Insn::Jump(Opcode::IFLT, fail),
        Insn::Var(Opcode::ILOAD, 1),
        this.clone(),
        arity.clone(),
        Insn::Jump(Opcode::IF_ICMPGE, fail),
        Insn::Simple(Opcode::RETURN),
        Insn::Label(fail),
        Insn::Type(Opcode::NEW, out_of_bounds.as_str().to_owned()),
        Insn::Simple(Opcode::DUP),
        Insn::Var(Opcode::ILOAD, 1),
        Insn::invoke_static(&class("java/lang/String")?, "valueOf", "(I)Ljava/lang/String;"),
        Insn::invoke_special(
            &out_of_bounds,
            UnqualifiedName::INIT.as_str(),
            "(Ljava/lang/String;)V",
        ),
        Insn::Simple(Opcode::ATHROW),
    ];
    store.methods.push(method(
        MethodAccessFlags::PRIVATE,
        "checkIndex",
        "(I)V",
        check_index,
    )?);

    // expunge(): once anything was collected, drop dead entries and empty buckets
    let drain = labels.fresh_label();
    let buckets = labels.fresh_label();
    let entries = labels.fresh_label();
    let swept = labels.fresh_label();
    let done = labels.fresh_label();
    let has_next = Insn::invoke_interface(&iterator, "hasNext", "()Z");
    let next = Insn::invoke_interface(&iterator, "next", "()Ljava/lang/Object;");
    let remove = Insn::invoke_interface(&iterator, "remove", "()V");
    let expunge = vec![
        this.clone(),
        queue.clone(),
        poll.clone(),
        Insn::Jump(Opcode::IFNONNULL, drain),
        Insn::Simple(Opcode::RETURN),
        Insn::Label(drain),
        this.clone(),
        queue.clone(),
        poll,
        Insn::Jump(Opcode::IFNONNULL, drain),
        this.clone(),
        rows.clone(),
        Insn::invoke_interface(&map, "values", "()Ljava/util/Collection;"),
        Insn::invoke_interface(
            &class("java/util/Collection")?,
            "iterator",
            "()Ljava/util/Iterator;",
        ),
        Insn::Var(Opcode::ASTORE, 1),
        Insn::Label(buckets),
        Insn::Var(Opcode::ALOAD, 1),
        has_next.clone(),
        Insn::Jump(Opcode::IFEQ, done),
        Insn::Var(Opcode::ALOAD, 1),
        next.clone(),
        Insn::Type(Opcode::CHECKCAST, list.as_str().to_owned()),
        Insn::Var(Opcode::ASTORE, 2),
        Insn::Var(Opcode::ALOAD, 2),
        Insn::invoke_interface(&list, "iterator", "()Ljava/util/Iterator;"),
        Insn::Var(Opcode::ASTORE, 3),
        Insn::Label(entries),
        Insn::Var(Opcode::ALOAD, 3),
        has_next,
        Insn::Jump(Opcode::IFEQ, swept),
        Insn::Var(Opcode::ALOAD, 3),
        next,
        Insn::Type(Opcode::CHECKCAST, object_array.clone()),
        Insn::Simple(Opcode::ICONST_0),
        Insn::Simple(Opcode::AALOAD),
        Insn::Type(Opcode::CHECKCAST, reference.as_str().to_owned()),
        Insn::invoke_virtual(&reference, "get", "()Ljava/lang/Object;"),
        Insn::Jump(Opcode::IFNONNULL, entries),
        Insn::Var(Opcode::ALOAD, 3),
        remove.clone(),
        Insn::Jump(Opcode::GOTO, entries),
        Insn::Label(swept),
        Insn::Var(Opcode::ALOAD, 2),
        Insn::invoke_interface(&list, "isEmpty", "()Z"),
        Insn::Jump(Opcode::IFEQ, buckets),
        Insn::Var(Opcode::ALOAD, 1),
        remove,
        Insn::Jump(Opcode::GOTO, buckets),
        Insn::Label(done),
        Insn::Simple(Opcode::RETURN),
    ];
    store
        .methods
        .push(method(MethodAccessFlags::PRIVATE, "expunge", "()V", expunge)?);

    // row(owner, create): locals are key(3), bucket(4), i(5), entry(6), row(7)
    let lookup = labels.fresh_label();
    let skip = labels.fresh_label();
    let missing = labels.fresh_label();
    let create = labels.fresh_label();
    let have_bucket = labels.fresh_label();
    let bucket = vec![
        this.clone(),
        rows.clone(),
        Insn::Var(Opcode::ALOAD, 3),
        Insn::invoke_interface(&map, "get", "(Ljava/lang/Object;)Ljava/lang/Object;"),
        Insn::Type(Opcode::CHECKCAST, list.as_str().to_owned()),
        Insn::Var(Opcode::ASTORE, 4),
    ];
    let mut row = vec![
        Insn::Var(Opcode::ALOAD, 1),
        Insn::invoke_static(&class("java/lang/System")?, "identityHashCode", "(Ljava/lang/Object;)I"),
        Insn::invoke_static(
            &class("java/lang/Integer")?,
            "valueOf",
            "(I)Ljava/lang/Integer;",
        ),
        Insn::Var(Opcode::ASTORE, 3),
    ];
    row.extend(bucket.iter().cloned());
    row.extend([
        Insn::Var(Opcode::ALOAD, 4),
        Insn::Jump(Opcode::IFNULL, missing),
        Insn::Simple(Opcode::ICONST_0),
        Insn::Var(Opcode::ISTORE, 5),
        Insn::Label(lookup),
        Insn::Var(Opcode::ILOAD, 5),
        Insn::Var(Opcode::ALOAD, 4),
        Insn::invoke_interface(&list, "size", "()I"),
        Insn::Jump(Opcode::IF_ICMPGE, missing),
        Insn::Var(Opcode::ALOAD, 4),
        Insn::Var(Opcode::ILOAD, 5),
        Insn::invoke_interface(&list, "get", "(I)Ljava/lang/Object;"),
        Insn::Type(Opcode::CHECKCAST, object_array.clone()),
        Insn::Var(Opcode::ASTORE, 6),
        Insn::Var(Opcode::ALOAD, 6),
        Insn::Simple(Opcode::ICONST_0),
        Insn::Simple(Opcode::AALOAD),
        Insn::Type(Opcode::CHECKCAST, reference.as_str().to_owned()),
        Insn::invoke_virtual(&reference, "get", "()Ljava/lang/Object;"),
        Insn::Var(Opcode::ALOAD, 1),
        Insn::Jump(Opcode::IF_ACMPNE, skip),
        Insn::Var(Opcode::ALOAD, 6),
        Insn::Simple(Opcode::ICONST_1),
        Insn::Simple(Opcode::AALOAD),
        Insn::Type(Opcode::CHECKCAST, object_array.clone()),
        Insn::Simple(Opcode::ARETURN),
        Insn::Label(skip),
        Insn::IInc { var: 5, delta: 1 },
        Insn::Jump(Opcode::GOTO, lookup),
        Insn::Label(missing),
        Insn::Var(Opcode::ILOAD, 2),
        Insn::Jump(Opcode::IFNE, create),
        Insn::Simple(Opcode::ACONST_NULL),
        Insn::Simple(Opcode::ARETURN),
        Insn::Label(create),
        this.clone(),
        Insn::invoke_special(&name, "expunge", "()V"),
    ]);
    // Sweeping may have dropped the bucket
    row.extend(bucket);
    row.extend([
        Insn::Var(Opcode::ALOAD, 4),
        Insn::Jump(Opcode::IFNONNULL, have_bucket),
        Insn::Type(Opcode::NEW, String::from("java/util/ArrayList")),
        Insn::Simple(Opcode::DUP),
        Insn::invoke_special(
            &class("java/util/ArrayList")?,
            UnqualifiedName::INIT.as_str(),
            "()V",
        ),
        Insn::Var(Opcode::ASTORE, 4),
        this.clone(),
        rows,
        Insn::Var(Opcode::ALOAD, 3),
        Insn::Var(Opcode::ALOAD, 4),
        Insn::invoke_interface(
            &map,
            "put",
            "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
        ),
        Insn::Simple(Opcode::POP),
        Insn::Label(have_bucket),
        this.clone(),
        arity,
        Insn::Type(Opcode::ANEWARRAY, BinaryName::OBJECT.as_str().to_owned()),
        Insn::Var(Opcode::ASTORE, 7),
        Insn::Simple(Opcode::ICONST_2),
        Insn::Type(Opcode::ANEWARRAY, BinaryName::OBJECT.as_str().to_owned()),
        Insn::Var(Opcode::ASTORE, 6),
        Insn::Var(Opcode::ALOAD, 6),
        Insn::Simple(Opcode::ICONST_0),
        Insn::Type(Opcode::NEW, String::from("java/lang/ref/WeakReference")),
        Insn::Simple(Opcode::DUP),
        Insn::Var(Opcode::ALOAD, 1),
        this.clone(),
        queue,
        Insn::invoke_special(
            &class("java/lang/ref/WeakReference")?,
            UnqualifiedName::INIT.as_str(),
            "(Ljava/lang/Object;Ljava/lang/ref/ReferenceQueue;)V",
        ),
        Insn::Simple(Opcode::AASTORE),
        Insn::Var(Opcode::ALOAD, 6),
        Insn::Simple(Opcode::ICONST_1),
        Insn::Var(Opcode::ALOAD, 7),
        Insn::Simple(Opcode::AASTORE),
        Insn::Var(Opcode::ALOAD, 4),
        Insn::Var(Opcode::ALOAD, 6),
        Insn::invoke_interface(&list, "add", "(Ljava/lang/Object;)Z"),
        Insn::Simple(Opcode::POP),
        Insn::Var(Opcode::ALOAD, 7),
        Insn::Simple(Opcode::ARETURN),
    ]);
    store
        .methods
        .push(method(MethodAccessFlags::PRIVATE, "row", row_desc, row)?);

    let bridge = MethodAccessFlags::PUBLIC | MethodAccessFlags::SYNCHRONIZED;
    for kind in StoreKind::ALL {
        let value = field_type(kind.descriptor())?;
        let check = [
            this.clone(),
            Insn::Var(Opcode::ILOAD, 2),
            Insn::invoke_special(&name, "checkIndex", "(I)V"),
        ];

        // get<Kind>(owner, index): locals are row(3), slot(4)
        let default = labels.fresh_label();
        let mut get = check.to_vec();
        get.extend([
            this.clone(),
            Insn::Var(Opcode::ALOAD, 1),
            Insn::Simple(Opcode::ICONST_0),
            Insn::invoke_special(&name, "row", row_desc),
            Insn::Var(Opcode::ASTORE, 3),
            Insn::Var(Opcode::ALOAD, 3),
            Insn::Jump(Opcode::IFNULL, default),
            Insn::Var(Opcode::ALOAD, 3),
            Insn::Var(Opcode::ILOAD, 2),
            Insn::Simple(Opcode::AALOAD),
            Insn::Var(Opcode::ASTORE, 4),
            Insn::Var(Opcode::ALOAD, 4),
            Insn::Jump(Opcode::IFNULL, default),
            Insn::Var(Opcode::ALOAD, 4),
        ]);
        if let Some((wrapper, unbox)) = boxed(kind) {
            get.push(Insn::Type(Opcode::CHECKCAST, wrapper.to_owned()));
            get.push(Insn::invoke_virtual(
                &class(wrapper)?,
                unbox,
                &format!("(){}", kind.descriptor()),
            ));
        }
        get.extend([
            Insn::return_value(Some(&value)),
            Insn::Label(default),
            zero(kind),
            Insn::return_value(Some(&value)),
        ]);
        store.methods.push(method(
            bridge,
            &format!("get{}", kind.name()),
            &format!("(Ljava/lang/Object;I){}", kind.descriptor()),
            get,
        )?);

        let mut put = check.to_vec();
        put.extend([
            this.clone(),
            Insn::Var(Opcode::ALOAD, 1),
            Insn::Simple(Opcode::ICONST_1),
            Insn::invoke_special(&name, "row", row_desc),
            Insn::Var(Opcode::ILOAD, 2),
            Insn::load(&value, 3),
        ]);
        if let Some((wrapper, _)) = boxed(kind) {
            put.push(Insn::invoke_static(
                &class(wrapper)?,
                "valueOf",
                &format!("({})L{};", kind.descriptor(), wrapper),
            ));
        }
        put.extend([Insn::Simple(Opcode::AASTORE), Insn::Simple(Opcode::RETURN)]);
        store.methods.push(method(
            bridge,
            &format!("put{}", kind.name()),
            &format!("(Ljava/lang/Object;I{})V", kind.descriptor()),
            put,
        )?);
    }

    Ok(store)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::StackEmulator;
    use crate::jvm::class_file::{ClassAssembler, ClassReader, ClassWriter};

    fn round_trip(class: &ClassDescriptor) -> ClassDescriptor {
        let bytes = ClassWriter::new().assemble(class).unwrap();
        ClassReader::read(&bytes).unwrap()
    }

    #[test]
    fn unsafe_access_methods() {
        let name = BinaryName::from_str("rt/UnsafeAccess").unwrap();
        let class = round_trip(&unsafe_access(name).unwrap());
        assert_eq!(class.version, Version::JAVA5);

        // Helpers the offset fragments and static base holders call
        for signature in [
            "<clinit>()V",
            "getDeclaredField(Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/reflect/Field;",
            "getStaticBase(Ljava/lang/reflect/Field;)Ljava/lang/Object;",
            "getInt(Ljava/lang/Object;J)I",
            "putInt(Ljava/lang/Object;IJ)V",
            "getObject(Ljava/lang/Object;J)Ljava/lang/Object;",
            "putObject(Ljava/lang/Object;Ljava/lang/Object;J)V",
        ] {
            assert!(
                class.method_by_signature(signature).is_some(),
                "missing {}",
                signature
            );
        }

        // Wide values push the offset from after the value's two slots
        let put_long = class
            .method_by_signature("putLong(Ljava/lang/Object;JJ)V")
            .unwrap();
        assert_eq!(put_long.instructions[2], Insn::Var(Opcode::LLOAD, 3));
        assert_eq!(put_long.instructions[3], Insn::Var(Opcode::LLOAD, 1));
        assert_eq!(
            put_long.instructions[4],
            Insn::invoke_virtual(
                &BinaryName::from_str("sun/misc/Unsafe").unwrap(),
                "putLong",
                "(Ljava/lang/Object;JJ)V"
            )
        );
    }

    #[test]
    fn proxy_store_methods() {
        let name = BinaryName::from_str("rt/ProxyStore").unwrap();
        let store = proxy_store(name).unwrap();
        for method in &store.methods {
            StackEmulator::for_method(method).run().unwrap();
        }

        let class = round_trip(&store);
        assert!(class.method_by_signature("<init>(I)V").is_some());
        for kind in StoreKind::ALL {
            let get = format!("get{}(Ljava/lang/Object;I){}", kind.name(), kind.descriptor());
            let put = format!("put{}(Ljava/lang/Object;I{})V", kind.name(), kind.descriptor());
            for signature in [get, put] {
                let method = class.method_by_signature(&signature).unwrap();
                assert!(method.access.contains(MethodAccessFlags::SYNCHRONIZED));
            }
        }

        let get_double = class
            .method_by_signature("getDouble(Ljava/lang/Object;I)D")
            .unwrap();
        let ops: Vec<_> = get_double
            .instructions
            .iter()
            .filter_map(Insn::opcode)
            .collect();
        assert_eq!(&ops[ops.len() - 2..], &[Opcode::DCONST_0, Opcode::DRETURN]);
    }
}
