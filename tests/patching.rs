use bytepatch::jvm::class_file::{ClassAssembler, ClassReader, ClassWriter};
use bytepatch::jvm::code::{disassemble, Insn, Opcode};
use bytepatch::jvm::{
    BinaryName, ClassAccessFlags, ClassDescriptor, FieldAccessFlags, FieldNode, MethodAccessFlags,
    MethodNode, Name, UnqualifiedName,
};
use bytepatch::patch::{
    Anchor, Error, InjectDeclaration, MemberDeclaration, PatchDescriptor, PatchRun, Patcher,
    Position, ResolvedMode, RuntimeSnapshot, Settings,
};
use bytepatch::registry::{Archive, ClassRegistry};

fn name(name: &str) -> BinaryName {
    BinaryName::from_str(name).unwrap()
}

fn method(access: MethodAccessFlags, name: &str, desc: &str, insns: Vec<Insn>) -> MethodNode {
    let mut method = MethodNode::new(access, UnqualifiedName::from_str(name).unwrap(), desc);
    method.set_instructions(insns);
    method
}

fn class(class_name: &str, methods: Vec<MethodNode>) -> ClassDescriptor {
    let mut class = ClassDescriptor::new(
        name(class_name),
        Some(BinaryName::OBJECT),
        ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
    );
    class.methods = methods;
    class
}

/// `app/Counter` with a private `count` and an `increment()V` bumping it
fn counter() -> ClassDescriptor {
    let owner = name("app/Counter");
    let mut counter = class(
        "app/Counter",
        vec![
            method(
                MethodAccessFlags::PUBLIC,
                "increment",
                "()V",
                vec![
                    Insn::Var(Opcode::ALOAD, 0),
                    Insn::Var(Opcode::ALOAD, 0),
                    Insn::field(Opcode::GETFIELD, &owner, "count", "I"),
                    Insn::Simple(Opcode::ICONST_1),
                    Insn::Simple(Opcode::IADD),
                    Insn::field(Opcode::PUTFIELD, &owner, "count", "I"),
                    Insn::Simple(Opcode::RETURN),
                ],
            ),
            method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "add",
                "(II)I",
                vec![
                    Insn::Var(Opcode::ILOAD, 0),
                    Insn::Var(Opcode::ILOAD, 1),
                    Insn::Simple(Opcode::IADD),
                    Insn::Var(Opcode::ISTORE, 2),
                    Insn::Var(Opcode::ILOAD, 2),
                    Insn::Simple(Opcode::IRETURN),
                ],
            ),
        ],
    );
    counter.fields.push(FieldNode::new(
        FieldAccessFlags::PRIVATE,
        UnqualifiedName::from_str("count").unwrap(),
        "I",
    ));
    counter
}

/// Every class goes through the writer and reader before the patcher sees it
fn registry(classes: Vec<ClassDescriptor>) -> ClassRegistry {
    let mut archive = Archive::new();
    for class in classes {
        let bytes = ClassWriter::new().assemble(&class).unwrap();
        archive.insert_bytes(&bytes).unwrap();
    }
    ClassRegistry::new().with_source(archive)
}

fn apply(
    classes: Vec<ClassDescriptor>,
    runtime: &RuntimeSnapshot,
    patches: Vec<PatchDescriptor>,
) -> PatchRun {
    let registry = registry(classes);
    let mut patcher = Patcher::new(&registry, runtime, Settings::new()).unwrap();
    for patch in patches {
        patcher.register(patch).unwrap();
    }
    patcher.run()
}

fn read_back(run: &PatchRun, class: &str) -> ClassDescriptor {
    ClassReader::read(&run.classes[class].bytes).unwrap()
}

fn body(class: &ClassDescriptor, signature: &str) -> Vec<String> {
    disassemble(&class.method_by_signature(signature).unwrap().instructions)
}

#[test]
fn inject_at_head_of_loadable_class() {
    let source = name("patches/CounterPatch");
    let patch_class = class(
        "patches/CounterPatch",
        vec![method(
            MethodAccessFlags::PUBLIC,
            "reset",
            "()V",
            vec![
                Insn::Var(Opcode::ALOAD, 0),
                Insn::Simple(Opcode::ICONST_5),
                Insn::field(Opcode::PUTFIELD, &source, "count", "I"),
                Insn::Simple(Opcode::RETURN),
            ],
        )],
    );
    let patch = PatchDescriptor::new("reset", "app/Counter")
        .with_source("patches/CounterPatch")
        .member(MemberDeclaration::field_accessor("count", "I", true))
        .inject(InjectDeclaration::new(
            "reset()V",
            "increment()V",
            Anchor::Head,
            Position::Before,
        ));

    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![patch],
    );
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    let patched = &run.classes["app/Counter"];
    assert_eq!(patched.mode, ResolvedMode::ClassLoaderTime);
    assert!(!patched.synthetic);

    assert_eq!(
        body(&read_back(&run, "app/Counter"), "increment()V"),
        vec![
            "ALOAD 0",
            "ICONST_5",
            "PUTFIELD app/Counter.count : I",
            "GOTO L0",
            "L0",
            "ALOAD 0",
            "ALOAD 0",
            "GETFIELD app/Counter.count : I",
            "ICONST_1",
            "IADD",
            "PUTFIELD app/Counter.count : I",
            "RETURN",
        ]
    );
}

#[test]
fn inject_after_pattern_shifts_locals() {
    let patch_class = class(
        "patches/AddPatch",
        vec![method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "square",
            "(II)V",
            vec![
                Insn::Var(Opcode::ILOAD, 0),
                Insn::Var(Opcode::ILOAD, 1),
                Insn::Simple(Opcode::IMUL),
                Insn::Var(Opcode::ISTORE, 2),
                Insn::Simple(Opcode::RETURN),
            ],
        )],
    );
    let patch = PatchDescriptor::new("square", "app/Counter")
        .with_source("patches/AddPatch")
        .inject(InjectDeclaration::new(
            "square(II)V",
            "add(II)I",
            Anchor::Pattern(String::from("ILOAD *\n  ILOAD *")),
            Position::After,
        ));

    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![patch],
    );
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(
        body(&read_back(&run, "app/Counter"), "add(II)I"),
        vec![
            "ILOAD 0", "ILOAD 1", "ILOAD 0", "ILOAD 1", "IMUL", "ISTORE 3", "GOTO L0", "L0",
            "IADD", "ISTORE 2", "ILOAD 2", "IRETURN",
        ]
    );
}

#[test]
fn lower_priority_is_applied_first() {
    let marker = |value: Opcode| {
        vec![
            Insn::Simple(value),
            Insn::Simple(Opcode::POP),
            Insn::Simple(Opcode::RETURN),
        ]
    };
    let patch_class = class(
        "patches/Markers",
        vec![
            method(MethodAccessFlags::PUBLIC, "one", "()V", marker(Opcode::ICONST_1)),
            method(MethodAccessFlags::PUBLIC, "two", "()V", marker(Opcode::ICONST_2)),
        ],
    );
    let at_head = |method: &str| {
        let mut injection =
            InjectDeclaration::new(method, "increment()V", Anchor::Head, Position::Before);
        injection.keep_fallthrough_return = true;
        injection
    };

    // Registered out of order on purpose
    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![
            PatchDescriptor::new("late", "app/Counter")
                .with_source("patches/Markers")
                .with_priority(100)
                .inject(at_head("two()V")),
            PatchDescriptor::new("early", "app/Counter")
                .with_source("patches/Markers")
                .with_priority(50)
                .inject(at_head("one()V")),
        ],
    );
    assert!(run.failures.is_empty(), "{:?}", run.failures);

    // Both go to the head, so the later patch ends up in front
    let body = body(&read_back(&run, "app/Counter"), "increment()V");
    assert_eq!(
        &body[..6],
        &["ICONST_2", "POP", "RETURN", "ICONST_1", "POP", "RETURN"]
    );
}

fn hits_patch() -> (ClassDescriptor, PatchDescriptor) {
    let source = name("patches/HitsPatch");
    let patch_class = class(
        "patches/HitsPatch",
        vec![method(
            MethodAccessFlags::PUBLIC,
            "hit",
            "()V",
            vec![
                Insn::Var(Opcode::ALOAD, 0),
                Insn::Var(Opcode::ALOAD, 0),
                Insn::field(Opcode::GETFIELD, &source, "hits", "I"),
                Insn::Simple(Opcode::ICONST_1),
                Insn::Simple(Opcode::IADD),
                Insn::field(Opcode::PUTFIELD, &source, "hits", "I"),
                Insn::Simple(Opcode::RETURN),
            ],
        )],
    );
    let patch = PatchDescriptor::new("hits", "app/Counter")
        .with_source("patches/HitsPatch")
        .member(MemberDeclaration::new_field("hits", "I", false))
        .inject(InjectDeclaration::new(
            "hit()V",
            "increment()V",
            Anchor::Head,
            Position::Before,
        ));
    (patch_class, patch)
}

#[test]
fn new_field_before_loading() {
    let (patch_class, patch) = hits_patch();
    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![patch],
    );
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.classes.len(), 1);

    let counter = read_back(&run, "app/Counter");
    let hits = counter.field("hits", Some("I")).unwrap();
    assert_eq!(hits.access, FieldAccessFlags::PUBLIC);
    assert!(body(&counter, "increment()V")
        .contains(&String::from("PUTFIELD app/Counter.hits : I")));
}

#[test]
fn new_field_in_live_class() {
    let (patch_class, patch) = hits_patch();
    let mut runtime = RuntimeSnapshot::detached();
    runtime.mark_loaded(&name("app/Counter"));
    let run = apply(vec![counter(), patch_class], &runtime, vec![patch]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);

    let holder_name = "app/Counter$ProxyFields_hits";
    assert_eq!(run.classes["app/Counter"].mode, ResolvedMode::LiveRedefine);
    let holder = &run.classes[holder_name];
    assert!(holder.synthetic);
    assert_eq!(holder.mode, ResolvedMode::ClassLoaderTime);

    let counter = read_back(&run, "app/Counter");
    assert!(counter.field("hits", None).is_none());
    let body = body(&counter, "increment()V");
    assert!(body.contains(&format!(
        "INVOKESTATIC {}.getInt (Ljava/lang/Object;I)I",
        holder_name
    )));
    assert!(body.contains(&format!(
        "INVOKESTATIC {}.putInt (Ljava/lang/Object;II)V",
        holder_name
    )));

    let holder = read_back(&run, holder_name);
    assert!(holder
        .field("STORE_INT", Some("Lbytepatch/runtime/ProxyStore;"))
        .is_some());
    assert!(holder.method("<clinit>", Some("()V")).is_some());

    let store = &run.classes["bytepatch/runtime/ProxyStore"];
    assert!(store.synthetic);
    let store = read_back(&run, "bytepatch/runtime/ProxyStore");
    assert!(store.method("<init>", Some("(I)V")).is_some());
    assert!(store
        .method("putInt", Some("(Ljava/lang/Object;II)V"))
        .is_some());
}

/// `app/Child` extending `app/Base`, whose `secret` is private, plus a patch reading it
fn secret_patch() -> (Vec<ClassDescriptor>, PatchDescriptor) {
    let mut base = class("app/Base", vec![]);
    base.fields.push(FieldNode::new(
        FieldAccessFlags::PRIVATE,
        UnqualifiedName::from_str("secret").unwrap(),
        "I",
    ));
    let mut child = class(
        "app/Child",
        vec![method(
            MethodAccessFlags::PUBLIC,
            "run",
            "()V",
            vec![Insn::Simple(Opcode::RETURN)],
        )],
    );
    child.super_name = Some(name("app/Base"));

    let source = name("patches/SecretPatch");
    let patch_class = class(
        "patches/SecretPatch",
        vec![method(
            MethodAccessFlags::PUBLIC,
            "peek",
            "()V",
            vec![
                Insn::Var(Opcode::ALOAD, 0),
                Insn::field(Opcode::GETFIELD, &source, "secret", "I"),
                Insn::Simple(Opcode::POP),
                Insn::Simple(Opcode::RETURN),
            ],
        )],
    );
    let patch = PatchDescriptor::new("secret", "app/Child")
        .with_source("patches/SecretPatch")
        .member(MemberDeclaration::field_accessor("secret", "I", false))
        .inject(InjectDeclaration::new(
            "peek()V",
            "run()V",
            Anchor::Head,
            Position::Before,
        ));
    (vec![base, child, patch_class], patch)
}

#[test]
fn private_ancestor_field_by_offset() {
    let (classes, patch) = secret_patch();
    let mut runtime = RuntimeSnapshot::detached();
    runtime.set_offset(&name("app/Base"), "secret", 12);
    let run = apply(classes, &runtime, vec![patch]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);

    let child = read_back(&run, "app/Child");
    assert!(body(&child, "run()V").contains(&String::from(
        "INVOKESTATIC bytepatch/runtime/UnsafeAccess.getInt (Ljava/lang/Object;J)I"
    )));

    assert!(run.classes["bytepatch/runtime/UnsafeAccess"].synthetic);
    let support = read_back(&run, "bytepatch/runtime/UnsafeAccess");
    for (method, descriptor) in [
        ("getInt", "(Ljava/lang/Object;J)I"),
        ("putInt", "(Ljava/lang/Object;IJ)V"),
        ("getStaticBase", "(Ljava/lang/reflect/Field;)Ljava/lang/Object;"),
    ] {
        assert!(support.method(method, Some(descriptor)).is_some());
    }
}

#[test]
fn support_class_on_class_path_is_not_emitted() {
    let (mut classes, patch) = secret_patch();
    classes.push(class("bytepatch/runtime/UnsafeAccess", vec![]));
    let mut runtime = RuntimeSnapshot::detached();
    runtime.set_offset(&name("app/Base"), "secret", 12);
    let run = apply(classes, &runtime, vec![patch]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);

    assert!(run.classes.contains_key("app/Child"));
    assert!(!run.classes.contains_key("bytepatch/runtime/UnsafeAccess"));
}

#[test]
fn failing_class_does_not_stop_others() {
    let (patch_class, hits) = hits_patch();
    let other = class(
        "app/Other",
        vec![method(
            MethodAccessFlags::PUBLIC,
            "run",
            "()V",
            vec![Insn::Simple(Opcode::RETURN)],
        )],
    );

    let broken = PatchDescriptor::new("broken", "app/Other")
        .with_source("patches/HitsPatch")
        .member(MemberDeclaration::new_field("hits", "I", false))
        .inject(InjectDeclaration::new(
            "hit()V",
            "run()V",
            Anchor::Pattern(String::from("INVOKEVIRTUAL app/Other.missing ()V")),
            Position::Before,
        ));

    let mut runtime = RuntimeSnapshot::detached();
    runtime.mark_loaded(&name("app/Other"));
    let run = apply(
        vec![counter(), other, patch_class],
        &runtime,
        vec![hits, broken],
    );

    assert!(run.classes.contains_key("app/Counter"));
    assert!(!run.classes.contains_key("app/Other"));
    assert!(!run.classes.contains_key("app/Other$ProxyFields_broken"));
    assert!(!run.classes.contains_key("bytepatch/runtime/ProxyStore"));
    match &run.failures["app/Other"] {
        Error::AnchorNotFound { disassembly, .. } => {
            assert_eq!(disassembly, &vec![String::from("RETURN")])
        }
        other => panic!("unexpected failure {}", other),
    }
}

#[test]
fn replace_method_body() {
    let patch_class = class(
        "patches/AddPatch",
        vec![method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "subtract",
            "(II)I",
            vec![
                Insn::Var(Opcode::ILOAD, 0),
                Insn::Var(Opcode::ILOAD, 1),
                Insn::Simple(Opcode::ISUB),
                Insn::Simple(Opcode::IRETURN),
            ],
        )],
    );
    let patch = PatchDescriptor::new("subtract", "app/Counter")
        .with_source("patches/AddPatch")
        .replace("subtract(II)I", "add(II)I");

    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![patch],
    );
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(
        body(&read_back(&run, "app/Counter"), "add(II)I"),
        vec!["ILOAD 0", "ILOAD 1", "ISUB", "IRETURN"]
    );
}

#[test]
fn missing_target_method() {
    let (patch_class, mut patch) = hits_patch();
    patch.injections[0].target = String::from("decrement()V");
    let run = apply(
        vec![counter(), patch_class],
        &RuntimeSnapshot::detached(),
        vec![patch],
    );
    assert!(matches!(
        run.failures.get("app/Counter"),
        Some(Error::MemberNotFound(_))
    ));
}
