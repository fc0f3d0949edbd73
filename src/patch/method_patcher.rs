use super::descriptor::{InjectDeclaration, ReplaceDeclaration};
use super::locator::{self, InjectionPoint};
use super::{Error, PatchLogger};
use crate::analysis::StackEmulator;
use crate::jvm::code::{Insn, Label, LabelGenerator, LdcConstant, Opcode};
use crate::jvm::{BinaryName, ClassDescriptor, MethodNode, TryCatchBlock};
use std::collections::HashMap;
use std::ops::Range;

/// Copies code out of the methods of a patch source class into target methods
pub struct MethodPatcher<'a> {
    pub source: &'a ClassDescriptor,
    pub target: &'a BinaryName,
    pub logger: &'a dyn PatchLogger,
}

/// How locals of a source method map onto the frame of a target method
#[derive(Debug)]
struct LocalMap {
    /// Slots of the source receiver and parameters
    source_params: usize,

    /// Added to source parameter slots (1 when only the target has a receiver)
    param_shift: usize,

    /// First target slot for the source's own locals
    base: usize,
}

impl LocalMap {
    fn new(source: &MethodNode, target: &MethodNode, beyond_body: bool) -> Result<LocalMap, Error> {
        let source_desc = source.parsed_descriptor()?;
        let target_desc = target.parsed_descriptor()?;

        if !source.is_static() && target.is_static() {
            return Err(Error::InvalidPatch(format!(
                "instance method {} cannot patch static method {}",
                source.name, target.name
            )));
        }
        if !source_desc.parameters.is_empty() && source_desc.parameters != target_desc.parameters {
            return Err(Error::InvalidPatch(format!(
                "parameters of {}{} do not match {}{}",
                source.name, source.descriptor, target.name, target.descriptor
            )));
        }

        let target_params = target_desc.parameter_length(!target.is_static());
        let base = if beyond_body {
            target.max_locals(target_params)
        } else {
            target_params
        };
        Ok(LocalMap {
            source_params: source_desc.parameter_length(!source.is_static()),
            param_shift: usize::from(source.is_static() && !target.is_static()),
            base,
        })
    }

    fn map(&self, var: u16) -> Result<u16, Error> {
        let var = var as usize;
        let mapped = if var < self.source_params {
            var + self.param_shift
        } else {
            self.base + (var - self.source_params)
        };
        u16::try_from(mapped)
            .map_err(|_| Error::InvalidPatch(format!("local variable {} out of range", mapped)))
    }
}

/// Source code ready to be placed into a target method
struct Prepared {
    instructions: Vec<Insn>,
    try_catch: Vec<TryCatchBlock>,
}

impl<'a> MethodPatcher<'a> {
    fn source_method(&self, signature: &str) -> Result<&'a MethodNode, Error> {
        self.source.method_by_signature(signature).ok_or_else(|| {
            Error::MemberNotFound(format!("{}.{}", self.source.name, signature))
        })
    }

    /// Copy of a source method body, relabelled with labels from `labels` and with locals mapped
    fn prepare(
        &self,
        source: &MethodNode,
        locals: &LocalMap,
        labels: &mut LabelGenerator,
    ) -> Result<Prepared, Error> {
        let foreign = self.source.name != *self.target;
        let mut renamed: HashMap<Label, Label> = HashMap::new();
        let mut rename = |label: Label| *renamed.entry(label).or_insert_with(|| labels.fresh_label());

        let mut instructions = Vec::with_capacity(source.instructions.len());
        for insn in &source.instructions {
            let insn = match insn {
                Insn::LineNumber { .. } => continue,
                Insn::InvokeDynamic { .. } | Insn::Ldc(LdcConstant::Pooled(_)) if foreign => {
                    return Err(Error::UnsupportedInstruction(format!(
                        "{} in {}.{} refers to the constant pool of its class",
                        insn, self.source.name, source.name
                    )))
                }
                Insn::Var(Opcode::RET, _) | Insn::Jump(Opcode::JSR | Opcode::JSR_W, _) => {
                    return Err(Error::UnsupportedInstruction(format!(
                        "{} in {}.{}",
                        insn, self.source.name, source.name
                    )))
                }
                Insn::Var(op, var) => Insn::Var(*op, locals.map(*var)?),
                Insn::IInc { var, delta } => Insn::IInc {
                    var: locals.map(*var)?,
                    delta: *delta,
                },
                other => other.map_labels(&mut rename),
            };
            instructions.push(insn);
        }

        let try_catch = source
            .try_catch
            .iter()
            .map(|block| TryCatchBlock {
                start: rename(block.start),
                end: rename(block.end),
                handler: rename(block.handler),
                catch_type: block.catch_type.clone(),
            })
            .collect();

        Ok(Prepared {
            instructions,
            try_catch,
        })
    }

    /// Splice the code of a source method into `target` at the declared anchor
    ///
    /// Returns the range of the spliced instructions in the new body.
    pub fn inject(
        &self,
        target: &mut MethodNode,
        declaration: &InjectDeclaration,
    ) -> Result<Range<usize>, Error> {
        let source = self.source_method(&declaration.method)?;
        self.logger.debug(&format!(
            "Injecting {}.{} into {}.{}{}",
            self.source.name, source.name, self.target, target.name, target.descriptor
        ));

        let point = locator::locate(target, declaration)?;
        let locals = LocalMap::new(source, target, true)?;
        let mut prepared = self.prepare(source, &locals, &mut target.labels)?;

        if !declaration.keep_fallthrough_return {
            // Only the trailing return falls through; earlier ones still leave the target method
            let trailing = prepared
                .instructions
                .iter()
                .rposition(|insn| !matches!(insn, Insn::Label(_)));
            if let Some(idx) = trailing {
                if prepared.instructions[idx] == Insn::Simple(Opcode::RETURN) {
                    let after = target.fresh_label();
                    prepared.instructions[idx] = Insn::Jump(Opcode::GOTO, after);
                    prepared.instructions.push(Insn::Label(after));
                }
            }
        }

        let injected = prepared.instructions;
        let count = injected.len();
        let spliced = match point {
            InjectionPoint::Insert(index) => {
                target.instructions.splice(index..index, injected);
                index..index + count
            }
            InjectionPoint::Replace(start, end) => {
                // Jumps elsewhere may still target labels in the replaced range
                let kept: Vec<Insn> = target.instructions[start..=end]
                    .iter()
                    .filter(|insn| matches!(insn, Insn::Label(_)))
                    .cloned()
                    .collect();
                let first = start + kept.len();
                target
                    .instructions
                    .splice(start..=end, kept.into_iter().chain(injected));
                first..first + count
            }
        };

        // Handlers of injected code take precedence over the ones around it
        let mut try_catch = prepared.try_catch;
        try_catch.append(&mut target.try_catch);
        target.try_catch = try_catch;
        Ok(spliced)
    }

    /// Swap the body of `target` for the body of a source method
    pub fn replace(&self, target: &mut MethodNode, declaration: &ReplaceDeclaration) -> Result<(), Error> {
        let source = self.source_method(&declaration.method)?;
        self.logger.debug(&format!(
            "Replacing body of {}.{}{} with {}.{}",
            self.target, target.name, target.descriptor, self.source.name, source.name
        ));

        let source_return = source.parsed_descriptor()?.return_type;
        if source_return != target.parsed_descriptor()?.return_type {
            return Err(Error::InvalidPatch(format!(
                "return type of {}{} does not match {}{}",
                source.name, source.descriptor, target.name, target.descriptor
            )));
        }

        let locals = LocalMap::new(source, target, false)?;
        let mut labels = LabelGenerator::new();
        let prepared = self.prepare(source, &locals, &mut labels)?;
        target.labels = labels;
        target.set_instructions(prepared.instructions);
        target.try_catch = prepared.try_catch;
        Ok(())
    }
}

/// Check that every path through a method agrees on stack depths
pub fn validate_stack(method: &MethodNode) -> Result<(), Error> {
    StackEmulator::for_method(method).run()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::{ClassAccessFlags, MethodAccessFlags, Name, UnqualifiedName};
    use crate::patch::descriptor::{Anchor, Position};
    use crate::patch::NoopLogger;

    fn name(name: &str) -> BinaryName {
        BinaryName::from_str(name).unwrap()
    }

    fn method(access: MethodAccessFlags, name: &str, desc: &str, insns: Vec<Insn>) -> MethodNode {
        let mut method = MethodNode::new(access, UnqualifiedName::from_str(name).unwrap(), desc);
        method.set_instructions(insns);
        method
    }

    fn source_class(methods: Vec<MethodNode>) -> ClassDescriptor {
        let mut class = ClassDescriptor::new(
            name("p/Patch"),
            Some(BinaryName::OBJECT),
            ClassAccessFlags::PUBLIC,
        );
        class.methods = methods;
        class
    }

    /// `int add(int a, int b) { int sum = a + b; return sum; }`
    fn add() -> MethodNode {
        method(
            MethodAccessFlags::PUBLIC,
            "add",
            "(II)I",
            vec![
                Insn::Var(Opcode::ILOAD, 1),
                Insn::Var(Opcode::ILOAD, 2),
                Insn::Simple(Opcode::IADD),
                Insn::Var(Opcode::ISTORE, 3),
                Insn::Var(Opcode::ILOAD, 3),
                Insn::Simple(Opcode::IRETURN),
            ],
        )
    }

    #[test]
    fn inject_with_locals_and_fallthrough() {
        let mut labels = LabelGenerator::new();
        let skip = labels.fresh_label();
        // static void log(int a, int b) { int x = a; if (x == 0) return; x++; }
        let hook = method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "hook",
            "(II)V",
            vec![
                Insn::Var(Opcode::ILOAD, 0),
                Insn::Var(Opcode::ISTORE, 2),
                Insn::Var(Opcode::ILOAD, 2),
                Insn::Jump(Opcode::IFNE, skip),
                Insn::Simple(Opcode::RETURN),
                Insn::Label(skip),
                Insn::IInc { var: 2, delta: 1 },
                Insn::Simple(Opcode::RETURN),
            ],
        );
        let source = source_class(vec![hook]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let mut target = add();
        target.set_instructions(vec![
            Insn::Var(Opcode::ILOAD, 1),
            Insn::Var(Opcode::ISTORE, 3),
            Insn::Simple(Opcode::RETURN),
        ]);
        target.descriptor = String::from("(II)V");
        let declaration = InjectDeclaration::new("hook", "add", Anchor::Head, Position::Before);
        patcher.inject(&mut target, &declaration).unwrap();

        let insns = &target.instructions;
        // parameters shift past `this`, the local lands after the target's own local 3
        assert_eq!(insns[0], Insn::Var(Opcode::ILOAD, 1));
        assert_eq!(insns[1], Insn::Var(Opcode::ISTORE, 4));
        assert_eq!(insns[6], Insn::IInc { var: 4, delta: 1 });

        // the guard still leaves the method, only the trailing return falls through
        assert_eq!(insns[4], Insn::Simple(Opcode::RETURN));
        let after = match insns[8] {
            Insn::Label(label) => label,
            ref other => panic!("expected a label, found {}", other),
        };
        assert_eq!(insns[7], Insn::Jump(Opcode::GOTO, after));
        assert_eq!(insns[9], Insn::Var(Opcode::ILOAD, 1));
        assert_eq!(insns.len(), 12);

        validate_stack(&target).unwrap();
    }

    #[test]
    fn early_return_in_guard_survives() {
        let mut labels = LabelGenerator::new();
        let skip = labels.fresh_label();
        let hook = method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "hook",
            "(I)V",
            vec![
                Insn::Var(Opcode::ILOAD, 0),
                Insn::Jump(Opcode::IFNE, skip),
                Insn::Simple(Opcode::RETURN),
                Insn::Label(skip),
                Insn::Simple(Opcode::RETURN),
            ],
        );
        let source = source_class(vec![hook]);
        let target_name = name("a/Runner");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let mut target = method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "run",
            "(I)V",
            vec![Insn::Var(Opcode::ILOAD, 0), Insn::Simple(Opcode::POP), Insn::Simple(Opcode::RETURN)],
        );
        let declaration = InjectDeclaration::new("hook", "run", Anchor::Head, Position::Before);
        let spliced = patcher.inject(&mut target, &declaration).unwrap();
        assert_eq!(spliced, 0..6);

        let insns = &target.instructions;
        assert_eq!(insns[2], Insn::Simple(Opcode::RETURN));
        assert!(matches!(insns[4], Insn::Jump(Opcode::GOTO, _)));
        assert_eq!(insns[6], Insn::Var(Opcode::ILOAD, 0));
        validate_stack(&target).unwrap();
    }

    #[test]
    fn keep_fallthrough_return() {
        let hook = method(
            MethodAccessFlags::PUBLIC,
            "hook",
            "()V",
            vec![Insn::Simple(Opcode::RETURN)],
        );
        let source = source_class(vec![hook]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let mut target = add();
        let mut declaration = InjectDeclaration::new("hook", "add", Anchor::Head, Position::Before);
        declaration.keep_fallthrough_return = true;
        patcher.inject(&mut target, &declaration).unwrap();
        assert_eq!(target.instructions[0], Insn::Simple(Opcode::RETURN));
        assert_eq!(target.instructions.len(), 7);
    }

    #[test]
    fn mismatched_parameters() {
        let hook = method(
            MethodAccessFlags::STATIC,
            "hook",
            "(J)V",
            vec![Insn::Simple(Opcode::RETURN)],
        );
        let instance_hook = method(
            MethodAccessFlags::PUBLIC,
            "instanceHook",
            "()V",
            vec![Insn::Simple(Opcode::RETURN)],
        );
        let source = source_class(vec![hook, instance_hook]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let mut target = add();
        let declaration = InjectDeclaration::new("hook", "add", Anchor::Head, Position::Before);
        assert!(matches!(
            patcher.inject(&mut target, &declaration),
            Err(Error::InvalidPatch(_))
        ));

        let mut static_target = add();
        static_target.access = MethodAccessFlags::STATIC;
        let declaration =
            InjectDeclaration::new("instanceHook", "add", Anchor::Head, Position::Before);
        assert!(matches!(
            patcher.inject(&mut static_target, &declaration),
            Err(Error::InvalidPatch(_))
        ));
    }

    #[test]
    fn foreign_invokedynamic() {
        let hook = method(
            MethodAccessFlags::STATIC,
            "hook",
            "()V",
            vec![
                Insn::InvokeDynamic {
                    name: String::from("run"),
                    descriptor: String::from("()Ljava/lang/Runnable;"),
                    bootstrap: 0,
                },
                Insn::Simple(Opcode::POP),
                Insn::Simple(Opcode::RETURN),
            ],
        );
        let source = source_class(vec![hook]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };
        let mut target = add();
        let declaration = InjectDeclaration::new("hook", "add", Anchor::Tail, Position::Before);
        assert!(matches!(
            patcher.inject(&mut target, &declaration),
            Err(Error::UnsupportedInstruction(_))
        ));
    }

    #[test]
    fn replace_keeps_referenced_labels() {
        let mut target = add();
        let label = target.fresh_label();
        target.instructions.insert(2, Insn::Label(label));

        let hook = method(
            MethodAccessFlags::PUBLIC,
            "hook",
            "()V",
            vec![Insn::Simple(Opcode::ISUB), Insn::Simple(Opcode::RETURN)],
        );
        let source = source_class(vec![hook]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let declaration = InjectDeclaration::new(
            "hook",
            "add",
            Anchor::Pattern(String::from("L*\nIADD")),
            Position::Replace,
        );
        let spliced = patcher.inject(&mut target, &declaration).unwrap();
        assert_eq!(spliced, 3..6);

        assert_eq!(target.instructions[2], Insn::Label(label));
        assert_eq!(target.instructions[3], Insn::Simple(Opcode::ISUB));
        assert!(matches!(target.instructions[4], Insn::Jump(Opcode::GOTO, _)));
        validate_stack(&target).unwrap();
    }

    #[test]
    fn replace_whole_body() {
        let replacement = method(
            MethodAccessFlags::PUBLIC,
            "fixedAdd",
            "(II)I",
            vec![
                Insn::Var(Opcode::ILOAD, 1),
                Insn::Var(Opcode::ILOAD, 2),
                Insn::Simple(Opcode::ISUB),
                Insn::Simple(Opcode::IRETURN),
            ],
        );
        let wrong = method(
            MethodAccessFlags::PUBLIC,
            "wrong",
            "()V",
            vec![Insn::Simple(Opcode::RETURN)],
        );
        let source = source_class(vec![replacement, wrong]);
        let target_name = name("a/Calc");
        let patcher = MethodPatcher {
            source: &source,
            target: &target_name,
            logger: &NoopLogger,
        };

        let mut target = add();
        let declaration = ReplaceDeclaration {
            method: String::from("fixedAdd"),
            target: String::from("add"),
        };
        patcher.replace(&mut target, &declaration).unwrap();
        assert_eq!(target.instructions[2], Insn::Simple(Opcode::ISUB));
        assert_eq!(target.instructions.len(), 4);

        let declaration = ReplaceDeclaration {
            method: String::from("wrong"),
            target: String::from("add"),
        };
        assert!(matches!(
            patcher.replace(&mut add(), &declaration),
            Err(Error::InvalidPatch(_))
        ));
    }
}
