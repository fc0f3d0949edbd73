use super::constants::read_constant;
use super::{Constant, Deserialize, PoolView, Version};
use crate::jvm::code::{Insn, Label, LabelGenerator, LdcConstant, Opcode};
use crate::jvm::{
    BinaryName, ClassAccessFlags, ClassDescriptor, Error, FieldAccessFlags, FieldNode,
    MemberKind, MemberReference, MethodAccessFlags, MethodNode, Name, RawAttribute,
    TryCatchBlock, UnqualifiedName,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;

const MAGIC: u32 = 0xCAFE_BABE;

/// Parses class files into [`ClassDescriptor`]s
///
/// Method bodies are decoded into instruction streams with labels at every jump target,
/// exception handler boundary and line number. Stack map frames and local variable tables are
/// dropped (they are invalidated by patching anyway). All other attributes are kept raw.
pub struct ClassReader;

impl ClassReader {
    pub fn read(bytes: &[u8]) -> Result<ClassDescriptor, Error> {
        let mut input = Cursor::new(bytes);

        if u32::deserialize(&mut input)? != MAGIC {
            return Err(Error::MalformedClass(String::from("bad magic number")));
        }
        let version = Version::deserialize(&mut input)?;

        // Constant pool
        let count = u16::deserialize(&mut input)?;
        let mut constants: Vec<Constant> = Vec::with_capacity(count as usize);
        while constants.len() + 1 < count as usize {
            let constant = read_constant(&mut input)?;
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            constants.push(constant);
            if wide {
                constants.push(Constant::Unusable);
            }
        }
        let pool = PoolView(&constants);

        let access = ClassAccessFlags::from_bits_truncate(u16::deserialize(&mut input)?);
        let name = binary_name(pool.class_name(u16::deserialize(&mut input)?)?)?;
        let super_name = match u16::deserialize(&mut input)? {
            0 => None,
            idx => Some(binary_name(pool.class_name(idx)?)?),
        };
        let interfaces = Vec::<u16>::deserialize(&mut input)?
            .into_iter()
            .map(|idx| binary_name(pool.class_name(idx)?))
            .collect::<Result<Vec<_>, Error>>()?;

        let field_count = u16::deserialize(&mut input)?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let access = FieldAccessFlags::from_bits_truncate(u16::deserialize(&mut input)?);
            let name = unqualified_name(pool.utf8(u16::deserialize(&mut input)?)?)?;
            let descriptor = pool.utf8(u16::deserialize(&mut input)?)?;
            let mut field = FieldNode::new(access, name, descriptor);
            field.attributes = read_attributes(&mut input, pool)?;
            fields.push(field);
        }

        let method_count = u16::deserialize(&mut input)?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(read_method(&mut input, pool)?);
        }

        let attributes = read_attributes(&mut input, pool)?;

        log::debug!(
            "Read class {} ({} fields, {} methods)",
            name,
            fields.len(),
            methods.len()
        );

        Ok(ClassDescriptor {
            version,
            access,
            name,
            super_name,
            interfaces,
            fields,
            methods,
            attributes,
            constant_pool: Some(Arc::new(constants)),
        })
    }
}

fn binary_name(name: &str) -> Result<BinaryName, Error> {
    BinaryName::from_str(name).map_err(Error::InvalidName)
}

fn unqualified_name(name: &str) -> Result<UnqualifiedName, Error> {
    UnqualifiedName::from_str(name).map_err(Error::InvalidName)
}

fn read_attributes(input: &mut Cursor<&[u8]>, pool: PoolView) -> Result<Vec<RawAttribute>, Error> {
    let count = u16::deserialize(input)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attributes.push(read_attribute(input, pool)?);
    }
    Ok(attributes)
}

fn read_attribute(input: &mut Cursor<&[u8]>, pool: PoolView) -> Result<RawAttribute, Error> {
    let name = pool.utf8(u16::deserialize(input)?)?.to_owned();
    let len = u32::deserialize(input)? as usize;
    let start = input.position() as usize;
    let bytes: &[u8] = input.get_ref();
    let info = bytes
        .get(start..start + len)
        .ok_or_else(|| Error::MalformedClass(format!("attribute '{}' is truncated", name)))?
        .to_vec();
    input.set_position((start + len) as u64);
    Ok(RawAttribute { name, info })
}

fn read_method(input: &mut Cursor<&[u8]>, pool: PoolView) -> Result<MethodNode, Error> {
    let access = MethodAccessFlags::from_bits_truncate(u16::deserialize(input)?);
    let name = unqualified_name(pool.utf8(u16::deserialize(input)?)?)?;
    let descriptor = pool.utf8(u16::deserialize(input)?)?;
    let mut method = MethodNode::new(access, name, descriptor);

    for attribute in read_attributes(input, pool)? {
        if attribute.name == "Code" {
            read_code(&attribute.info, pool, &mut method)?;
        } else {
            method.attributes.push(attribute);
        }
    }
    Ok(method)
}

/// Instruction whose branch targets are still byte offsets
enum Pending {
    Ready(Insn),
    Jump(Opcode, u32),
    Table {
        low: i32,
        high: i32,
        default: u32,
        targets: Vec<u32>,
    },
    Lookup {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
}

fn read_code(info: &[u8], pool: PoolView, method: &mut MethodNode) -> Result<(), Error> {
    let mut input = Cursor::new(info);
    let _max_stack = u16::deserialize(&mut input)?;
    let _max_locals = u16::deserialize(&mut input)?;
    let code_length = u32::deserialize(&mut input)? as usize;
    let code_start = input.position() as usize;
    let code = info
        .get(code_start..code_start + code_length)
        .ok_or_else(|| Error::MalformedClass(format!("code of '{}' is truncated", method.name)))?;
    input.set_position((code_start + code_length) as u64);

    // Exception table, still in offsets
    let handler_count = u16::deserialize(&mut input)?;
    let mut handlers = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        let start = u16::deserialize(&mut input)? as u32;
        let end = u16::deserialize(&mut input)? as u32;
        let handler = u16::deserialize(&mut input)? as u32;
        let catch_type = match u16::deserialize(&mut input)? {
            0 => None,
            idx => Some(pool.class_name(idx)?.to_owned()),
        };
        handlers.push((start, end, handler, catch_type));
    }

    let mut line_numbers: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
    for attribute in read_attributes(&mut input, pool)? {
        match attribute.name.as_str() {
            "LineNumberTable" => {
                let mut table = Cursor::new(attribute.info.as_slice());
                let count = u16::deserialize(&mut table)?;
                for _ in 0..count {
                    let start = u16::deserialize(&mut table)? as u32;
                    let line = u16::deserialize(&mut table)?;
                    line_numbers.entry(start).or_default().push(line);
                }
            }
            other => log::debug!("Dropping code attribute '{}' of '{}'", other, method.name),
        }
    }

    // Decode instructions
    let mut decoded: Vec<(u32, Pending)> = vec![];
    let mut cursor = Cursor::new(code);
    while (cursor.position() as usize) < code.len() {
        let offset = cursor.position() as u32;
        let pending = decode_insn(&mut cursor, offset, pool)?;
        decoded.push((offset, pending));
    }

    // Every offset that needs a label
    let mut label_offsets: BTreeSet<u32> = BTreeSet::new();
    for (_, pending) in &decoded {
        match pending {
            Pending::Ready(_) => (),
            Pending::Jump(_, target) => {
                label_offsets.insert(*target);
            }
            Pending::Table {
                default, targets, ..
            } => {
                label_offsets.insert(*default);
                label_offsets.extend(targets.iter().copied());
            }
            Pending::Lookup { default, pairs } => {
                label_offsets.insert(*default);
                label_offsets.extend(pairs.iter().map(|(_, target)| *target));
            }
        }
    }
    for (start, end, handler, _) in &handlers {
        label_offsets.extend([*start, *end, *handler]);
    }
    label_offsets.extend(line_numbers.keys().copied());

    let mut generator = LabelGenerator::new();
    let labels: BTreeMap<u32, Label> = label_offsets
        .into_iter()
        .map(|offset| (offset, generator.fresh_label()))
        .collect();
    let label_at = |offset: u32| -> Result<Label, Error> {
        labels.get(&offset).copied().ok_or_else(|| {
            Error::MalformedClass(format!("branch into the middle of an instruction at {}", offset))
        })
    };

    let mut instructions = Vec::with_capacity(decoded.len() + labels.len());
    let place_markers = |offset: u32, instructions: &mut Vec<Insn>| {
        if let Some(label) = labels.get(&offset) {
            instructions.push(Insn::Label(*label));
            for line in line_numbers.get(&offset).into_iter().flatten() {
                instructions.push(Insn::LineNumber {
                    line: *line,
                    start: *label,
                });
            }
        }
    };
    for (offset, pending) in decoded {
        place_markers(offset, &mut instructions);
        let insn = match pending {
            Pending::Ready(insn) => insn,
            Pending::Jump(op, target) => Insn::Jump(op, label_at(target)?),
            Pending::Table {
                low,
                high,
                default,
                targets,
            } => Insn::TableSwitch {
                low,
                high,
                default: label_at(default)?,
                targets: targets
                    .into_iter()
                    .map(label_at)
                    .collect::<Result<_, _>>()?,
            },
            Pending::Lookup { default, pairs } => Insn::LookupSwitch {
                default: label_at(default)?,
                pairs: pairs
                    .into_iter()
                    .map(|(key, target)| Ok((key, label_at(target)?)))
                    .collect::<Result<_, Error>>()?,
            },
        };
        instructions.push(insn);
    }
    place_markers(code.len() as u32, &mut instructions);

    method.try_catch = handlers
        .into_iter()
        .map(|(start, end, handler, catch_type)| {
            Ok(TryCatchBlock {
                start: label_at(start)?,
                end: label_at(end)?,
                handler: label_at(handler)?,
                catch_type,
            })
        })
        .collect::<Result<_, Error>>()?;
    method.labels = generator;
    method.instructions = instructions;
    Ok(())
}

fn relative(offset: u32, delta: i32) -> Result<u32, Error> {
    let target = offset as i64 + delta as i64;
    if target < 0 {
        return Err(Error::MalformedClass(format!(
            "branch at {} jumps before the start of the method",
            offset
        )));
    }
    Ok(target as u32)
}

fn ldc_constant(pool: PoolView, index: u16) -> Result<LdcConstant, Error> {
    Ok(match pool.get(index)? {
        Constant::Integer(value) => LdcConstant::Integer(*value),
        Constant::Float(value) => LdcConstant::Float(*value),
        Constant::Long(value) => LdcConstant::Long(*value),
        Constant::Double(value) => LdcConstant::Double(*value),
        Constant::String(utf8) => LdcConstant::String(pool.utf8(*utf8)?.to_owned()),
        Constant::Class(name) => LdcConstant::Class(pool.utf8(*name)?.to_owned()),
        Constant::MethodType(desc) => LdcConstant::MethodType(pool.utf8(*desc)?.to_owned()),
        _ => LdcConstant::Pooled(index),
    })
}

fn member(pool: PoolView, index: u16, kind: MemberKind) -> Result<(MemberReference, bool), Error> {
    let (owner, name, descriptor, is_interface) = pool.member_ref(index)?;
    Ok((
        MemberReference::new(owner, name, descriptor, kind),
        is_interface,
    ))
}

fn decode_insn(code: &mut Cursor<&[u8]>, offset: u32, pool: PoolView) -> Result<Pending, Error> {
    use Opcode::*;

    let byte = u8::deserialize(code)?;
    let op = Opcode::from_byte(byte)
        .ok_or_else(|| Error::MalformedClass(format!("unknown opcode {:#x} at {}", byte, offset)))?;

    if let Some((generic, var)) = op.expand_short_form() {
        return Ok(Pending::Ready(Insn::Var(generic, var)));
    }

    let insn = match op {
        BIPUSH => Insn::Int(op, i8::deserialize(code)? as i32),
        SIPUSH => Insn::Int(op, i16::deserialize(code)? as i32),
        NEWARRAY => Insn::Int(op, u8::deserialize(code)? as i32),
        LDC => Insn::Ldc(ldc_constant(pool, u8::deserialize(code)? as u16)?),
        LDC_W | LDC2_W => Insn::Ldc(ldc_constant(pool, u16::deserialize(code)?)?),
        ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE | DSTORE | ASTORE
        | RET => Insn::Var(op, u8::deserialize(code)? as u16),
        IINC => Insn::IInc {
            var: u8::deserialize(code)? as u16,
            delta: i8::deserialize(code)? as i16,
        },
        WIDE => {
            let inner_byte = u8::deserialize(code)?;
            match Opcode::from_byte(inner_byte) {
                Some(IINC) => Insn::IInc {
                    var: u16::deserialize(code)?,
                    delta: i16::deserialize(code)?,
                },
                Some(
                    inner @ (ILOAD | LLOAD | FLOAD | DLOAD | ALOAD | ISTORE | LSTORE | FSTORE
                    | DSTORE | ASTORE | RET),
                ) => Insn::Var(inner, u16::deserialize(code)?),
                _ => {
                    return Err(Error::MalformedClass(format!(
                        "invalid wide instruction {:#x} at {}",
                        inner_byte, offset
                    )))
                }
            }
        }
        GOTO_W => return Ok(Pending::Jump(GOTO, relative(offset, i32::deserialize(code)?)?)),
        JSR_W => return Ok(Pending::Jump(JSR, relative(offset, i32::deserialize(code)?)?)),
        _ if op.is_jump() => {
            let delta = i16::deserialize(code)? as i32;
            return Ok(Pending::Jump(op, relative(offset, delta)?));
        }
        TABLESWITCH | LOOKUPSWITCH => {
            // Operands are aligned to 4 bytes from the start of the code
            while code.position() % 4 != 0 {
                u8::deserialize(code)?;
            }
            let default = relative(offset, i32::deserialize(code)?)?;
            if op == TABLESWITCH {
                let low = i32::deserialize(code)?;
                let high = i32::deserialize(code)?;
                if high < low {
                    return Err(Error::MalformedClass(format!(
                        "tableswitch at {} has high < low",
                        offset
                    )));
                }
                let mut targets = Vec::with_capacity((high as i64 - low as i64 + 1) as usize);
                for _ in low..=high {
                    targets.push(relative(offset, i32::deserialize(code)?)?);
                }
                return Ok(Pending::Table {
                    low,
                    high,
                    default,
                    targets,
                });
            } else {
                let count = i32::deserialize(code)?;
                let mut pairs = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let key = i32::deserialize(code)?;
                    pairs.push((key, relative(offset, i32::deserialize(code)?)?));
                }
                return Ok(Pending::Lookup { default, pairs });
            }
        }
        GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
            let (field, _) = member(pool, u16::deserialize(code)?, MemberKind::Field)?;
            Insn::Field(op, field)
        }
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => {
            let (method, interface) = member(pool, u16::deserialize(code)?, MemberKind::Method)?;
            Insn::Method {
                opcode: op,
                member: method,
                interface,
            }
        }
        INVOKEINTERFACE => {
            let (method, _) = member(pool, u16::deserialize(code)?, MemberKind::Method)?;
            let _count = u8::deserialize(code)?;
            let _zero = u8::deserialize(code)?;
            Insn::Method {
                opcode: op,
                member: method,
                interface: true,
            }
        }
        INVOKEDYNAMIC => {
            let index = u16::deserialize(code)?;
            let _zero = u16::deserialize(code)?;
            match pool.get(index)? {
                Constant::InvokeDynamic {
                    bootstrap_method,
                    name_and_type,
                } => {
                    let (name, descriptor) = pool.name_and_type(*name_and_type)?;
                    Insn::InvokeDynamic {
                        name: name.to_owned(),
                        descriptor: descriptor.to_owned(),
                        bootstrap: *bootstrap_method,
                    }
                }
                _ => return Err(Error::MissingConstant(index)),
            }
        }
        NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
            Insn::Type(op, pool.class_name(u16::deserialize(code)?)?.to_owned())
        }
        MULTIANEWARRAY => {
            let descriptor = pool.class_name(u16::deserialize(code)?)?.to_owned();
            let dimensions = u8::deserialize(code)?;
            Insn::MultiANewArray {
                descriptor,
                dimensions,
            }
        }
        _ => Insn::Simple(op),
    };
    Ok(Pending::Ready(insn))
}
