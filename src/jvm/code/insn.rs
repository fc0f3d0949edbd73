use super::{Label, Opcode};
use crate::jvm::descriptors::{BaseType, FieldType};
use crate::jvm::{BinaryName, MemberKind, MemberReference, Name};
use std::fmt;

/// Constant operand of an `LDC` instruction
#[derive(Clone, Debug, PartialEq)]
pub enum LdcConstant {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),

    /// Class literal, as an internal name (or array descriptor)
    Class(String),

    /// Method type, as a method descriptor
    MethodType(String),

    /// Raw index into the constant pool the method was read from
    ///
    /// Used for method handles and dynamically computed constants, which only stay meaningful
    /// while the class is written back with its original constant pool.
    Pooled(u16),
}

impl LdcConstant {
    /// Number of stack slots the loaded value occupies
    pub fn width(&self) -> usize {
        match self {
            LdcConstant::Long(_) | LdcConstant::Double(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for LdcConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LdcConstant::Integer(i) => write!(f, "{}", i),
            LdcConstant::Float(x) => write!(f, "{:?}F", x),
            LdcConstant::Long(l) => write!(f, "{}L", l),
            LdcConstant::Double(d) => write!(f, "{:?}D", d),
            LdcConstant::String(s) => write!(f, "{:?}", s),
            LdcConstant::Class(c) if c.starts_with('[') => write!(f, "{}.class", c),
            LdcConstant::Class(c) => write!(f, "L{};.class", c),
            LdcConstant::MethodType(d) => f.write_str(d),
            LdcConstant::Pooled(idx) => write!(f, "#{}", idx),
        }
    }
}

/// A single node in an instruction stream
///
/// Besides real instructions, the stream contains label markers (the targets of jumps and the
/// bounds of exception handlers) and line number markers. Neither of those emit any bytecode.
#[derive(Clone, Debug, PartialEq)]
pub enum Insn {
    /// Marks a position in the stream
    Label(Label),

    /// Source line number for the code starting at the label
    LineNumber { line: u16, start: Label },

    /// Instruction without operands
    Simple(Opcode),

    /// `BIPUSH`, `SIPUSH`, `NEWARRAY`
    Int(Opcode, i32),

    /// Loads, stores and `RET`
    Var(Opcode, u16),

    IInc { var: u16, delta: i16 },

    /// `NEW`, `ANEWARRAY`, `CHECKCAST`, `INSTANCEOF`
    ///
    /// The operand is an internal name (or an array descriptor).
    Type(Opcode, String),

    /// `GETFIELD`, `PUTFIELD`, `GETSTATIC`, `PUTSTATIC`
    Field(Opcode, MemberReference),

    /// `INVOKEVIRTUAL`, `INVOKESPECIAL`, `INVOKESTATIC`, `INVOKEINTERFACE`
    Method {
        opcode: Opcode,
        member: MemberReference,
        interface: bool,
    },

    InvokeDynamic {
        name: String,
        descriptor: String,
        /// Index into the `BootstrapMethods` attribute
        bootstrap: u16,
    },

    /// Conditional and unconditional branches
    Jump(Opcode, Label),

    Ldc(LdcConstant),

    TableSwitch {
        low: i32,
        high: i32,
        default: Label,
        targets: Vec<Label>,
    },

    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },

    MultiANewArray { descriptor: String, dimensions: u8 },
}

impl Insn {
    /// Underlying opcode, if this is a real instruction
    pub fn opcode(&self) -> Option<Opcode> {
        Some(match self {
            Insn::Label(_) | Insn::LineNumber { .. } => return None,
            Insn::Simple(op)
            | Insn::Int(op, _)
            | Insn::Var(op, _)
            | Insn::Type(op, _)
            | Insn::Field(op, _)
            | Insn::Jump(op, _) => *op,
            Insn::Method { opcode, .. } => *opcode,
            Insn::IInc { .. } => Opcode::IINC,
            Insn::InvokeDynamic { .. } => Opcode::INVOKEDYNAMIC,
            Insn::Ldc(_) => Opcode::LDC,
            Insn::TableSwitch { .. } => Opcode::TABLESWITCH,
            Insn::LookupSwitch { .. } => Opcode::LOOKUPSWITCH,
            Insn::MultiANewArray { .. } => Opcode::MULTIANEWARRAY,
        })
    }

    /// Label markers and line numbers
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Label(_) | Insn::LineNumber { .. })
    }

    /// Labels this instruction may transfer control to (excluding fallthrough)
    pub fn jump_targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump(_, target) => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            Insn::LookupSwitch { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, label)| *label));
                all
            }
            _ => vec![],
        }
    }

    /// Copy of the instruction with every label rewritten
    pub fn map_labels(&self, mut map: impl FnMut(Label) -> Label) -> Insn {
        match self {
            Insn::Label(label) => Insn::Label(map(*label)),
            Insn::LineNumber { line, start } => Insn::LineNumber {
                line: *line,
                start: map(*start),
            },
            Insn::Jump(op, target) => Insn::Jump(*op, map(*target)),
            Insn::TableSwitch {
                low,
                high,
                default,
                targets,
            } => Insn::TableSwitch {
                low: *low,
                high: *high,
                default: map(*default),
                targets: targets.iter().map(|l| map(*l)).collect(),
            },
            Insn::LookupSwitch { default, pairs } => Insn::LookupSwitch {
                default: map(*default),
                pairs: pairs.iter().map(|(k, l)| (*k, map(*l))).collect(),
            },
            other => other.clone(),
        }
    }

    /// Push an integer constant using the most compact instruction
    pub fn push_int(value: i32) -> Insn {
        match value {
            -1 => Insn::Simple(Opcode::ICONST_M1),
            0 => Insn::Simple(Opcode::ICONST_0),
            1 => Insn::Simple(Opcode::ICONST_1),
            2 => Insn::Simple(Opcode::ICONST_2),
            3 => Insn::Simple(Opcode::ICONST_3),
            4 => Insn::Simple(Opcode::ICONST_4),
            5 => Insn::Simple(Opcode::ICONST_5),
            -128..=127 => Insn::Int(Opcode::BIPUSH, value),
            -32768..=32767 => Insn::Int(Opcode::SIPUSH, value),
            _ => Insn::Ldc(LdcConstant::Integer(value)),
        }
    }

    /// Load a local variable of the given type
    pub fn load(typ: &FieldType, var: u16) -> Insn {
        let op = match typ {
            FieldType::Base(BaseType::Long) => Opcode::LLOAD,
            FieldType::Base(BaseType::Float) => Opcode::FLOAD,
            FieldType::Base(BaseType::Double) => Opcode::DLOAD,
            FieldType::Base(_) => Opcode::ILOAD,
            FieldType::Object(_) | FieldType::Array { .. } => Opcode::ALOAD,
        };
        Insn::Var(op, var)
    }

    /// Return a value of the given type (or `void`)
    pub fn return_value(typ: Option<&FieldType>) -> Insn {
        let op = match typ {
            None => Opcode::RETURN,
            Some(FieldType::Base(BaseType::Long)) => Opcode::LRETURN,
            Some(FieldType::Base(BaseType::Float)) => Opcode::FRETURN,
            Some(FieldType::Base(BaseType::Double)) => Opcode::DRETURN,
            Some(FieldType::Base(_)) => Opcode::IRETURN,
            Some(FieldType::Object(_) | FieldType::Array { .. }) => Opcode::ARETURN,
        };
        Insn::Simple(op)
    }

    pub fn field(op: Opcode, owner: &BinaryName, name: &str, descriptor: &str) -> Insn {
        Insn::Field(
            op,
            MemberReference::new(owner.as_str(), name, descriptor, MemberKind::Field),
        )
    }

    pub fn invoke_static(owner: &BinaryName, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: Opcode::INVOKESTATIC,
            member: MemberReference::new(owner.as_str(), name, descriptor, MemberKind::Method),
            interface: false,
        }
    }

    pub fn invoke_virtual(owner: &BinaryName, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: Opcode::INVOKEVIRTUAL,
            member: MemberReference::new(owner.as_str(), name, descriptor, MemberKind::Method),
            interface: false,
        }
    }

    pub fn invoke_special(owner: &BinaryName, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: Opcode::INVOKESPECIAL,
            member: MemberReference::new(owner.as_str(), name, descriptor, MemberKind::Method),
            interface: false,
        }
    }

    pub fn invoke_interface(owner: &BinaryName, name: &str, descriptor: &str) -> Insn {
        Insn::Method {
            opcode: Opcode::INVOKEINTERFACE,
            member: MemberReference::new(owner.as_str(), name, descriptor, MemberKind::Method),
            interface: true,
        }
    }
}

fn array_type_name(code: i32) -> Option<&'static str> {
    Some(match code {
        4 => "T_BOOLEAN",
        5 => "T_CHAR",
        6 => "T_FLOAT",
        7 => "T_DOUBLE",
        8 => "T_BYTE",
        9 => "T_SHORT",
        10 => "T_INT",
        11 => "T_LONG",
        _ => return None,
    })
}

/// Single line disassembly, in the format instruction patterns are matched against
impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(label) => write!(f, "{}", label),
            Insn::LineNumber { line, start } => write!(f, "LINENUMBER {} {}", line, start),
            Insn::Simple(op) => f.write_str(op.mnemonic()),
            Insn::Int(Opcode::NEWARRAY, code) => match array_type_name(*code) {
                Some(name) => write!(f, "NEWARRAY {}", name),
                None => write!(f, "NEWARRAY {}", code),
            },
            Insn::Int(op, value) => write!(f, "{} {}", op.mnemonic(), value),
            Insn::Var(op, var) => write!(f, "{} {}", op.mnemonic(), var),
            Insn::IInc { var, delta } => write!(f, "IINC {} {}", var, delta),
            Insn::Type(op, typ) => write!(f, "{} {}", op.mnemonic(), typ),
            Insn::Field(op, member) => write!(
                f,
                "{} {}.{} : {}",
                op.mnemonic(),
                member.owner,
                member.name,
                member.descriptor
            ),
            Insn::Method {
                opcode,
                member,
                interface,
            } => {
                write!(
                    f,
                    "{} {}.{} {}",
                    opcode.mnemonic(),
                    member.owner,
                    member.name,
                    member.descriptor
                )?;
                if *interface && *opcode != Opcode::INVOKEINTERFACE {
                    f.write_str(" (itf)")?;
                }
                Ok(())
            }
            Insn::InvokeDynamic {
                name,
                descriptor,
                bootstrap,
            } => write!(f, "INVOKEDYNAMIC {}{} [{}]", name, descriptor, bootstrap),
            Insn::Jump(op, target) => write!(f, "{} {}", op.mnemonic(), target),
            Insn::Ldc(constant) => write!(f, "LDC {}", constant),
            Insn::TableSwitch {
                low,
                high,
                default,
                targets,
            } => {
                write!(f, "TABLESWITCH {}..{}", low, high)?;
                for target in targets {
                    write!(f, " {}", target)?;
                }
                write!(f, " default: {}", default)
            }
            Insn::LookupSwitch { default, pairs } => {
                f.write_str("LOOKUPSWITCH")?;
                for (key, target) in pairs {
                    write!(f, " {}: {}", key, target)?;
                }
                write!(f, " default: {}", default)
            }
            Insn::MultiANewArray {
                descriptor,
                dimensions,
            } => write!(f, "MULTIANEWARRAY {} {}", descriptor, dimensions),
        }
    }
}

/// Disassemble an instruction stream, one line per node
pub fn disassemble(insns: &[Insn]) -> Vec<String> {
    insns.iter().map(|insn| insn.to_string()).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disassembly_text() {
        let owner = BinaryName::from_str("com/example/Point").unwrap();
        let insns = vec![
            Insn::Var(Opcode::ALOAD, 0),
            Insn::field(Opcode::GETFIELD, &owner, "x", "I"),
            Insn::invoke_static(&BinaryName::OBJECT, "hash", "(I)I"),
            Insn::Ldc(LdcConstant::Long(7)),
            Insn::Ldc(LdcConstant::String(String::from("hi"))),
            Insn::Int(Opcode::NEWARRAY, 10),
        ];
        assert_eq!(
            disassemble(&insns),
            vec![
                "ALOAD 0",
                "GETFIELD com/example/Point.x : I",
                "INVOKESTATIC java/lang/Object.hash (I)I",
                "LDC 7L",
                "LDC \"hi\"",
                "NEWARRAY T_INT",
            ]
        );
    }

    #[test]
    fn compact_int_pushes() {
        assert_eq!(Insn::push_int(3), Insn::Simple(Opcode::ICONST_3));
        assert_eq!(Insn::push_int(100), Insn::Int(Opcode::BIPUSH, 100));
        assert_eq!(Insn::push_int(1000), Insn::Int(Opcode::SIPUSH, 1000));
        assert_eq!(
            Insn::push_int(100_000),
            Insn::Ldc(LdcConstant::Integer(100_000))
        );
    }
}
