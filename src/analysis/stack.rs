use super::Error;
use crate::jvm::code::{Insn, Label, Opcode};
use crate::jvm::descriptors::{field_width, JavaMethodDescriptor, ParseDescriptor};
use crate::jvm::{MethodNode, TryCatchBlock};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Stack effect of opcodes whose effect does not depend on their operands
///
/// Returns `None` for the opcodes that need their operand to know the effect: constant loads,
/// field accesses, invocations, and `MULTIANEWARRAY`.
pub fn fixed_stack_delta(op: Opcode) -> Option<i32> {
    use Opcode::*;

    let delta = match op {
        LDC | LDC_W | LDC2_W | GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD | INVOKEVIRTUAL
        | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE | INVOKEDYNAMIC | MULTIANEWARRAY => {
            return None
        }

        ACONST_NULL | ICONST_M1 | ICONST_0 | ICONST_1 | ICONST_2 | ICONST_3 | ICONST_4
        | ICONST_5 | FCONST_0 | FCONST_1 | FCONST_2 | BIPUSH | SIPUSH | ILOAD | FLOAD | ALOAD
        | ILOAD_0 | ILOAD_1 | ILOAD_2 | ILOAD_3 | FLOAD_0 | FLOAD_1 | FLOAD_2 | FLOAD_3
        | ALOAD_0 | ALOAD_1 | ALOAD_2 | ALOAD_3 | DUP | DUP_X1 | DUP_X2 | I2L | I2D | F2L
        | F2D | NEW | JSR | JSR_W => 1,

        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 | LLOAD | DLOAD | LLOAD_0 | LLOAD_1
        | LLOAD_2 | LLOAD_3 | DLOAD_0 | DLOAD_1 | DLOAD_2 | DLOAD_3 | DUP2 | DUP2_X1
        | DUP2_X2 => 2,

        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD | ISTORE | FSTORE | ASTORE
        | ISTORE_0 | ISTORE_1 | ISTORE_2 | ISTORE_3 | FSTORE_0 | FSTORE_1 | FSTORE_2
        | FSTORE_3 | ASTORE_0 | ASTORE_1 | ASTORE_2 | ASTORE_3 | POP | IADD | FADD | ISUB
        | FSUB | IMUL | FMUL | IDIV | FDIV | IREM | FREM | ISHL | LSHL | ISHR | LSHR | IUSHR
        | LUSHR | IAND | IOR | IXOR | L2I | L2F | D2I | D2F | FCMPL | FCMPG | IFEQ | IFNE
        | IFLT | IFGE | IFGT | IFLE | IFNULL | IFNONNULL | TABLESWITCH | LOOKUPSWITCH
        | IRETURN | FRETURN | ARETURN | ATHROW | MONITORENTER | MONITOREXIT => -1,

        LSTORE | DSTORE | LSTORE_0 | LSTORE_1 | LSTORE_2 | LSTORE_3 | DSTORE_0 | DSTORE_1
        | DSTORE_2 | DSTORE_3 | POP2 | LADD | DADD | LSUB | DSUB | LMUL | DMUL | LDIV | DDIV
        | LREM | DREM | LAND | LOR | LXOR | IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE
        | IF_ICMPGT | IF_ICMPLE | IF_ACMPEQ | IF_ACMPNE | LRETURN | DRETURN => -2,

        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE | LCMP | DCMPL | DCMPG => -3,

        LASTORE | DASTORE => -4,

        _ => 0,
    };
    Some(delta)
}

fn parse_method(descriptor: &str) -> Result<JavaMethodDescriptor, Error> {
    JavaMethodDescriptor::parse(descriptor)
        .map_err(|err| Error::BadDescriptor(descriptor.to_owned(), err.to_string()))
}

/// Net change in operand stack depth caused by one instruction
pub fn stack_delta(insn: &Insn) -> Result<i32, Error> {
    Ok(match insn {
        Insn::Label(_) | Insn::LineNumber { .. } => 0,
        Insn::Ldc(constant) => constant.width() as i32,
        Insn::Field(op, field) => {
            let size = field_width(&field.descriptor)
                .map_err(|err| Error::BadDescriptor(field.descriptor.clone(), err.to_string()))?
                as i32;
            match op {
                Opcode::GETFIELD => size - 1,
                Opcode::GETSTATIC => size,
                Opcode::PUTFIELD => -size - 1,
                _ => -size,
            }
        }
        Insn::Method { opcode, member, .. } => {
            let descriptor = parse_method(&member.descriptor)?;
            let effect =
                descriptor.return_width() as i32 - descriptor.parameter_length(false) as i32;
            if *opcode == Opcode::INVOKESTATIC {
                effect
            } else {
                effect - 1
            }
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let descriptor = parse_method(descriptor)?;
            descriptor.return_width() as i32 - descriptor.parameter_length(false) as i32
        }
        Insn::MultiANewArray { dimensions, .. } => 1 - *dimensions as i32,
        other => other.opcode().and_then(fixed_stack_delta).unwrap_or(0),
    })
}

/// Result of emulating a method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackAnalysis {
    /// Stack depth on entry to every reachable label
    pub gates: BTreeMap<Label, u16>,

    /// Largest stack depth reached anywhere
    pub max_depth: u16,
}

/// Replays an instruction stream along every control flow edge, tracking only stack depth
///
/// Each pass starts at a label (or the method entry) and runs until control cannot fall through
/// anymore or until it falls into another label. Labels discovered along the way are queued
/// for their own pass, so every label is walked exactly once. When a label is reached a second
/// time, the incoming depth must match the one already recorded.
pub struct StackEmulator<'a> {
    instructions: &'a [Insn],
    try_catch: &'a [TryCatchBlock],

    /// Index of every label in `instructions`
    positions: HashMap<Label, usize>,

    /// Entry depths recorded so far (keys are the visited set)
    gates: BTreeMap<Label, i32>,

    /// Labels recorded but not walked yet
    queue: VecDeque<Label>,

    max_depth: i32,
}

impl<'a> StackEmulator<'a> {
    pub fn new(instructions: &'a [Insn], try_catch: &'a [TryCatchBlock]) -> StackEmulator<'a> {
        StackEmulator {
            instructions,
            try_catch,
            positions: HashMap::new(),
            gates: BTreeMap::new(),
            queue: VecDeque::new(),
            max_depth: 0,
        }
    }

    pub fn for_method(method: &'a MethodNode) -> StackEmulator<'a> {
        StackEmulator::new(&method.instructions, &method.try_catch)
    }

    pub fn run(mut self) -> Result<StackAnalysis, Error> {
        let instructions = self.instructions;
        for (idx, insn) in instructions.iter().enumerate() {
            if let Insn::Label(label) = insn {
                self.positions.insert(*label, idx);
            }
        }

        // Handlers are entered with just the exception on the stack
        let try_catch = self.try_catch;
        for block in try_catch {
            self.record(block.handler, 1)?;
        }

        self.walk(0, 0)?;
        while let Some(label) = self.queue.pop_front() {
            let start = self.positions[&label];
            let depth = self.gates[&label];
            self.walk(start + 1, depth)?;
        }

        Ok(StackAnalysis {
            gates: self
                .gates
                .into_iter()
                .map(|(label, depth)| (label, depth as u16))
                .collect(),
            max_depth: self.max_depth as u16,
        })
    }

    /// Check the depth for a label, recording and queueing it if it is new
    fn record(&mut self, label: Label, depth: i32) -> Result<(), Error> {
        if !self.positions.contains_key(&label) {
            return Err(Error::UnknownLabel(label));
        }
        match self.gates.get(&label) {
            Some(recorded) if *recorded != depth => Err(Error::InconsistentStack {
                label,
                recorded: *recorded,
                found: depth,
            }),
            Some(_) => Ok(()),
            None => {
                log::trace!("stack gate {} at depth {}", label, depth);
                self.gates.insert(label, depth);
                self.queue.push_back(label);
                self.max_depth = self.max_depth.max(depth);
                Ok(())
            }
        }
    }

    /// Walk forward from `start` until control flow leaves the straight line
    fn walk(&mut self, start: usize, mut depth: i32) -> Result<(), Error> {
        let instructions = self.instructions;
        for (idx, insn) in instructions.iter().enumerate().skip(start) {
            let op = match insn {
                Insn::Label(label) => return self.record(*label, depth),
                Insn::LineNumber { .. } => continue,
                other => match other.opcode() {
                    Some(op) => op,
                    None => continue,
                },
            };
            if matches!(op, Opcode::JSR | Opcode::JSR_W | Opcode::RET) {
                return Err(Error::UnsupportedInstruction(op, idx));
            }

            depth += stack_delta(insn)?;
            if depth < 0 {
                return Err(Error::StackUnderflow(idx));
            }
            self.max_depth = self.max_depth.max(depth);

            for target in insn.jump_targets() {
                self.record(target, depth)?;
            }
            if op.ends_block() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Stack depth on entry to every label of a method
pub fn compute_gates(method: &MethodNode) -> Result<BTreeMap<Label, u16>, Error> {
    StackEmulator::for_method(method)
        .run()
        .map(|analysis| analysis.gates)
}
