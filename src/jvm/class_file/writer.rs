use super::{Constant, ConstantsPool, PoolView, Serialize};
use crate::analysis::StackEmulator;
use crate::jvm::code::{Insn, Label, LdcConstant, Opcode};
use crate::jvm::descriptors::{JavaMethodDescriptor, ParseDescriptor};
use crate::jvm::{ClassDescriptor, Error, MethodNode, Name, RawAttribute};
use byteorder::WriteBytesExt;
use std::collections::{HashMap, HashSet};

const MAGIC: u32 = 0xCAFE_BABE;

/// Turns a finished class tree into class file bytes
///
/// This is the seam through which patched classes leave the engine. Implementations that need
/// verifiable output for class versions 50+ are expected to also compute stack map frames.
pub trait ClassAssembler: Send + Sync {
    fn assemble(&self, class: &ClassDescriptor) -> Result<Vec<u8>, Error>;
}

/// Default assembler
///
/// Builds a fresh constant pool (seeded from the class's original pool, when there is one, so
/// that raw attributes keep pointing at the right entries), computes `max_stack`/`max_locals`,
/// and lays out code, widening branches whose offsets do not fit in 16 bits. No `StackMapTable` is emitted.
#[derive(Default)]
pub struct ClassWriter;

impl ClassWriter {
    pub fn new() -> ClassWriter {
        ClassWriter
    }
}

impl ClassAssembler for ClassWriter {
    fn assemble(&self, class: &ClassDescriptor) -> Result<Vec<u8>, Error> {
        let seed = class.constant_pool.as_deref().map(|pool| pool.as_slice());
        let mut pool = match seed {
            Some(constants) => ConstantsPool::seeded(constants),
            None => ConstantsPool::new(),
        };

        if class.version.requires_stack_map_frames() {
            log::debug!(
                "Writing {} (version {}) without stack map frames",
                class.name,
                class.version.major
            );
        }

        // Everything after the constant pool
        let mut body: Vec<u8> = vec![];
        class.access.serialize(&mut body)?;
        pool.get_class(class.name.as_str())?.serialize(&mut body)?;
        let super_class = match &class.super_name {
            Some(super_name) => pool.get_class(super_name.as_str())?,
            None => 0,
        };
        super_class.serialize(&mut body)?;
        let interfaces = class
            .interfaces
            .iter()
            .map(|iface| pool.get_class(iface.as_str()))
            .collect::<Result<Vec<u16>, Error>>()?;
        interfaces.serialize(&mut body)?;

        (class.fields.len() as u16).serialize(&mut body)?;
        for field in &class.fields {
            field.access.serialize(&mut body)?;
            pool.get_utf8(field.name.as_str())?.serialize(&mut body)?;
            pool.get_utf8(&field.descriptor)?.serialize(&mut body)?;
            write_raw_attributes(&mut pool, &field.attributes, &mut body)?;
        }

        (class.methods.len() as u16).serialize(&mut body)?;
        for method in &class.methods {
            method.access.serialize(&mut body)?;
            pool.get_utf8(method.name.as_str())?.serialize(&mut body)?;
            pool.get_utf8(&method.descriptor)?.serialize(&mut body)?;

            let code = if method.has_code() {
                Some(encode_code(&mut pool, seed, method)?)
            } else {
                None
            };
            let count = method.attributes.len() + code.is_some() as usize;
            (count as u16).serialize(&mut body)?;
            if let Some(code) = code {
                write_attribute(&mut pool, "Code", &code, &mut body)?;
            }
            for attribute in &method.attributes {
                write_attribute(&mut pool, &attribute.name, &attribute.info, &mut body)?;
            }
        }

        write_raw_attributes(&mut pool, &class.attributes, &mut body)?;

        let mut output: Vec<u8> = vec![];
        MAGIC.serialize(&mut output)?;
        class.version.serialize(&mut output)?;
        pool.serialize(&mut output)?;
        output.extend_from_slice(&body);
        Ok(output)
    }
}

fn write_attribute<W: WriteBytesExt>(
    pool: &mut ConstantsPool,
    name: &str,
    info: &[u8],
    writer: &mut W,
) -> Result<(), Error> {
    pool.get_utf8(name)?.serialize(writer)?;
    (info.len() as u32).serialize(writer)?;
    writer.write_all(info)?;
    Ok(())
}

fn write_raw_attributes<W: WriteBytesExt>(
    pool: &mut ConstantsPool,
    attributes: &[RawAttribute],
    writer: &mut W,
) -> Result<(), Error> {
    (attributes.len() as u16).serialize(writer)?;
    for attribute in attributes {
        write_attribute(pool, &attribute.name, &attribute.info, writer)?;
    }
    Ok(())
}

/// Instruction after the first layout pass
enum Laid {
    /// Fully encoded bytes
    Bytes(Vec<u8>),
    Jump(Opcode, Label),
    Switch(Insn),
    Mark(Label),
    Nothing,
}

/// Encoded size of a jump, `wide` once its offset no longer fits in 16 bits
fn jump_size(op: Opcode, wide: bool) -> usize {
    match op {
        Opcode::GOTO_W | Opcode::JSR_W => 5,
        Opcode::GOTO | Opcode::JSR if wide => 5,
        // Inverted branch over a `GOTO_W`
        _ if wide => 8,
        _ => 3,
    }
}

/// Offset of every laid out item and label, plus the total code length
fn place(laid: &[Laid], wide: &HashSet<usize>) -> (Vec<usize>, HashMap<Label, usize>, usize) {
    let mut offsets = Vec::with_capacity(laid.len());
    let mut labels = HashMap::new();
    let mut offset = 0;
    for (idx, item) in laid.iter().enumerate() {
        offsets.push(offset);
        let size = match item {
            Laid::Mark(label) => {
                labels.insert(*label, offset);
                0
            }
            Laid::Bytes(bytes) => bytes.len(),
            Laid::Jump(op, _) => jump_size(*op, wide.contains(&idx)),
            Laid::Switch(insn) => switch_size(offset, insn),
            Laid::Nothing => 0,
        };
        offset += size;
    }
    (offsets, labels, offset)
}

/// Encode the contents of a `Code` attribute
fn encode_code(
    pool: &mut ConstantsPool,
    seed: Option<&[Constant]>,
    method: &MethodNode,
) -> Result<Vec<u8>, Error> {
    let method_name = format!("{}{}", method.name, method.descriptor);
    let descriptor = JavaMethodDescriptor::parse(&method.descriptor)
        .map_err(|err| Error::BadDescriptor(method.descriptor.clone(), err.to_string()))?;

    // First pass: resolve constants
    let mut laid: Vec<Laid> = Vec::with_capacity(method.instructions.len());
    for insn in &method.instructions {
        laid.push(match insn {
            Insn::Label(label) => Laid::Mark(*label),
            Insn::LineNumber { .. } => Laid::Nothing,
            Insn::Jump(op, target) => Laid::Jump(*op, *target),
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => Laid::Switch(insn.clone()),
            other => Laid::Bytes(encode_simple(pool, seed, other, &method_name)?),
        });
    }

    // Compute offsets. Widening a jump moves everything after it, so repeat until no other jump
    // falls out of range.
    let mut wide: HashSet<usize> = HashSet::new();
    let (offsets, label_offsets, end) = loop {
        let (offsets, labels, end) = place(&laid, &wide);
        let mut widened = false;
        for (idx, item) in laid.iter().enumerate() {
            if let Laid::Jump(op, target) = item {
                if wide.contains(&idx) || matches!(op, Opcode::GOTO_W | Opcode::JSR_W) {
                    continue;
                }
                let to = labels.get(target).ok_or_else(|| Error::UndefinedLabel {
                    method: method_name.clone(),
                    label: *target,
                })?;
                if i16::try_from(*to as i64 - offsets[idx] as i64).is_err() {
                    wide.insert(idx);
                    widened = true;
                }
            }
        }
        if !widened {
            break (offsets, labels, end);
        }
    };
    if end > u16::MAX as usize {
        return Err(Error::MethodCodeOverflow(method_name));
    }

    let target_of = |label: &Label| -> Result<usize, Error> {
        label_offsets
            .get(label)
            .copied()
            .ok_or_else(|| Error::UndefinedLabel {
                method: method_name.clone(),
                label: *label,
            })
    };

    // Second pass: emit bytes now that all label offsets are known
    let mut code: Vec<u8> = Vec::with_capacity(end);
    for (idx, layout) in laid.into_iter().enumerate() {
        let at = offsets[idx];
        match layout {
            Laid::Nothing | Laid::Mark(_) => (),
            Laid::Bytes(bytes) => code.extend_from_slice(&bytes),
            Laid::Jump(op, target) => {
                let delta = target_of(&target)? as i64 - at as i64;
                let far = match op {
                    Opcode::GOTO_W | Opcode::JSR_W => Some(op),
                    Opcode::GOTO if wide.contains(&idx) => Some(Opcode::GOTO_W),
                    Opcode::JSR if wide.contains(&idx) => Some(Opcode::JSR_W),
                    _ => None,
                };
                if let Some(far) = far {
                    far.byte().serialize(&mut code)?;
                    (delta as i32).serialize(&mut code)?;
                } else if wide.contains(&idx) {
                    let skip = op.inverted().ok_or_else(|| Error::JumpOutOfRange {
                        method: method_name.clone(),
                        target,
                    })?;
                    skip.byte().serialize(&mut code)?;
                    8i16.serialize(&mut code)?;
                    Opcode::GOTO_W.byte().serialize(&mut code)?;
                    ((delta - 3) as i32).serialize(&mut code)?;
                } else {
                    let delta = i16::try_from(delta).map_err(|_| Error::JumpOutOfRange {
                        method: method_name.clone(),
                        target,
                    })?;
                    op.byte().serialize(&mut code)?;
                    delta.serialize(&mut code)?;
                }
            }
            Laid::Switch(insn) => {
                let relative = |label: &Label| -> Result<i32, Error> {
                    Ok((target_of(label)? as i64 - at as i64) as i32)
                };
                code.push(insn.opcode().map_or(0, |op| op.byte()));
                while code.len() % 4 != 0 {
                    code.push(0);
                }
                match &insn {
                    Insn::TableSwitch {
                        low,
                        high,
                        default,
                        targets,
                    } => {
                        relative(default)?.serialize(&mut code)?;
                        low.serialize(&mut code)?;
                        high.serialize(&mut code)?;
                        for target in targets {
                            relative(target)?.serialize(&mut code)?;
                        }
                    }
                    Insn::LookupSwitch { default, pairs } => {
                        relative(default)?.serialize(&mut code)?;
                        (pairs.len() as i32).serialize(&mut code)?;
                        for (key, target) in pairs {
                            key.serialize(&mut code)?;
                            relative(target)?.serialize(&mut code)?;
                        }
                    }
                    _ => (),
                }
            }
        }
    }

    let analysis = StackEmulator::new(&method.instructions, &method.try_catch)
        .run()
        .map_err(|err| Error::UnencodableInstruction {
            method: method_name.clone(),
            instruction: err.to_string(),
        })?;
    let max_stack = analysis.max_depth;
    let max_locals = method.max_locals(descriptor.parameter_length(!method.is_static())) as u16;

    let mut output: Vec<u8> = vec![];
    max_stack.serialize(&mut output)?;
    max_locals.serialize(&mut output)?;
    (code.len() as u32).serialize(&mut output)?;
    output.extend_from_slice(&code);

    (method.try_catch.len() as u16).serialize(&mut output)?;
    for block in &method.try_catch {
        (target_of(&block.start)? as u16).serialize(&mut output)?;
        (target_of(&block.end)? as u16).serialize(&mut output)?;
        (target_of(&block.handler)? as u16).serialize(&mut output)?;
        let catch_type = match &block.catch_type {
            Some(catch_type) => pool.get_class(catch_type)?,
            None => 0,
        };
        catch_type.serialize(&mut output)?;
    }

    let mut line_table: Vec<u8> = vec![];
    let mut line_count: u16 = 0;
    for insn in &method.instructions {
        if let Insn::LineNumber { line, start } = insn {
            (target_of(start)? as u16).serialize(&mut line_table)?;
            line.serialize(&mut line_table)?;
            line_count += 1;
        }
    }
    if line_count > 0 {
        1u16.serialize(&mut output)?;
        let mut info: Vec<u8> = vec![];
        line_count.serialize(&mut info)?;
        info.extend_from_slice(&line_table);
        write_attribute(pool, "LineNumberTable", &info, &mut output)?;
    } else {
        0u16.serialize(&mut output)?;
    }

    Ok(output)
}

fn switch_size(offset: usize, insn: &Insn) -> usize {
    let padding = 3 - (offset % 4);
    match insn {
        Insn::TableSwitch { targets, .. } => 1 + padding + 12 + 4 * targets.len(),
        Insn::LookupSwitch { pairs, .. } => 1 + padding + 8 + 8 * pairs.len(),
        _ => 0,
    }
}

fn encode_var(op: Opcode, var: u16, out: &mut Vec<u8>) -> Result<(), Error> {
    let short_base = match op {
        Opcode::ILOAD => Some(0x1a),
        Opcode::LLOAD => Some(0x1e),
        Opcode::FLOAD => Some(0x22),
        Opcode::DLOAD => Some(0x26),
        Opcode::ALOAD => Some(0x2a),
        Opcode::ISTORE => Some(0x3b),
        Opcode::LSTORE => Some(0x3f),
        Opcode::FSTORE => Some(0x43),
        Opcode::DSTORE => Some(0x47),
        Opcode::ASTORE => Some(0x4b),
        _ => None,
    };
    match (short_base, var) {
        (Some(base), 0..=3) => out.push(base + var as u8),
        (_, 0..=255) => {
            out.push(op.byte());
            out.push(var as u8);
        }
        _ => {
            out.push(Opcode::WIDE.byte());
            out.push(op.byte());
            var.serialize(out)?;
        }
    }
    Ok(())
}

/// Is a pooled constant loaded with `LDC2_W`?
fn pooled_is_wide(seed: Option<&[Constant]>, index: u16) -> Result<bool, Error> {
    let view = match seed {
        Some(constants) => PoolView(constants),
        None => return Err(Error::MissingConstant(index)),
    };
    Ok(match view.get(index)? {
        Constant::Long(_) | Constant::Double(_) => true,
        Constant::Dynamic { name_and_type, .. } => {
            let (_, descriptor) = view.name_and_type(*name_and_type)?;
            descriptor == "J" || descriptor == "D"
        }
        _ => false,
    })
}

/// Encode any instruction whose encoding does not depend on its offset
fn encode_simple(
    pool: &mut ConstantsPool,
    seed: Option<&[Constant]>,
    insn: &Insn,
    method_name: &str,
) -> Result<Vec<u8>, Error> {
    let mut out: Vec<u8> = vec![];
    match insn {
        Insn::Simple(op) => out.push(op.byte()),
        Insn::Int(op, value) => {
            out.push(op.byte());
            match op {
                Opcode::SIPUSH => (*value as i16).serialize(&mut out)?,
                _ => out.push(*value as u8),
            }
        }
        Insn::Var(op, var) => encode_var(*op, *var, &mut out)?,
        Insn::IInc { var, delta } => {
            if *var <= 255 && i8::try_from(*delta).is_ok() {
                out.push(Opcode::IINC.byte());
                out.push(*var as u8);
                (*delta as i8).serialize(&mut out)?;
            } else {
                out.push(Opcode::WIDE.byte());
                out.push(Opcode::IINC.byte());
                var.serialize(&mut out)?;
                delta.serialize(&mut out)?;
            }
        }
        Insn::Type(op, typ) => {
            out.push(op.byte());
            pool.get_class(typ)?.serialize(&mut out)?;
        }
        Insn::Field(op, field) => {
            out.push(op.byte());
            pool.get_field_ref(&field.owner, &field.name, &field.descriptor)?
                .serialize(&mut out)?;
        }
        Insn::Method {
            opcode,
            member,
            interface,
        } => {
            out.push(opcode.byte());
            let index =
                pool.get_method_ref(&member.owner, &member.name, &member.descriptor, *interface)?;
            index.serialize(&mut out)?;
            if *opcode == Opcode::INVOKEINTERFACE {
                let descriptor = JavaMethodDescriptor::parse(&member.descriptor).map_err(|err| {
                    Error::BadDescriptor(member.descriptor.clone(), err.to_string())
                })?;
                out.push(descriptor.parameter_length(true) as u8);
                out.push(0);
            }
        }
        Insn::InvokeDynamic {
            name,
            descriptor,
            bootstrap,
        } => {
            out.push(Opcode::INVOKEDYNAMIC.byte());
            pool.get_invoke_dynamic(*bootstrap, name, descriptor)?
                .serialize(&mut out)?;
            0u16.serialize(&mut out)?;
        }
        Insn::Ldc(constant) => {
            let (index, wide) = match constant {
                LdcConstant::Integer(value) => (pool.get_integer(*value)?, false),
                LdcConstant::Float(value) => (pool.get_float(*value)?, false),
                LdcConstant::Long(value) => (pool.get_long(*value)?, true),
                LdcConstant::Double(value) => (pool.get_double(*value)?, true),
                LdcConstant::String(value) => (pool.get_string(value)?, false),
                LdcConstant::Class(name) => (pool.get_class(name)?, false),
                LdcConstant::MethodType(desc) => (pool.get_method_type(desc)?, false),
                LdcConstant::Pooled(index) => {
                    let wide = pooled_is_wide(seed, *index).map_err(|_| {
                        Error::UnencodableInstruction {
                            method: method_name.to_owned(),
                            instruction: insn.to_string(),
                        }
                    })?;
                    (*index, wide)
                }
            };
            if wide {
                out.push(Opcode::LDC2_W.byte());
                index.serialize(&mut out)?;
            } else if index <= 255 {
                out.push(Opcode::LDC.byte());
                out.push(index as u8);
            } else {
                out.push(Opcode::LDC_W.byte());
                index.serialize(&mut out)?;
            }
        }
        Insn::MultiANewArray {
            descriptor,
            dimensions,
        } => {
            out.push(Opcode::MULTIANEWARRAY.byte());
            pool.get_class(descriptor)?.serialize(&mut out)?;
            out.push(*dimensions);
        }
        Insn::Label(_)
        | Insn::LineNumber { .. }
        | Insn::Jump(..)
        | Insn::TableSwitch { .. }
        | Insn::LookupSwitch { .. } => {
            return Err(Error::UnencodableInstruction {
                method: method_name.to_owned(),
                instruction: insn.to_string(),
            })
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ClassReader;
    use crate::jvm::{
        BinaryName, ClassAccessFlags, FieldAccessFlags, FieldNode, MethodAccessFlags,
        UnqualifiedName,
    };

    fn sample_class() -> ClassDescriptor {
        let mut class = ClassDescriptor::new(
            BinaryName::from_str("me/Counter").unwrap(),
            Some(BinaryName::OBJECT),
            ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        );
        class.fields.push(FieldNode::new(
            FieldAccessFlags::PRIVATE,
            UnqualifiedName::from_str("count").unwrap(),
            "I",
        ));

        // static int clamp(int x) { if (x < 0) return 0; return x; }
        let mut method = MethodNode::new(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            UnqualifiedName::from_str("clamp").unwrap(),
            "(I)I",
        );
        let positive = method.fresh_label();
        method.instructions = vec![
            Insn::Var(Opcode::ILOAD, 0),
            Insn::Jump(Opcode::IFGE, positive),
            Insn::Simple(Opcode::ICONST_0),
            Insn::Simple(Opcode::IRETURN),
            Insn::Label(positive),
            Insn::Var(Opcode::ILOAD, 0),
            Insn::Simple(Opcode::IRETURN),
        ];
        class.methods.push(method);
        class
    }

    #[test]
    fn write_then_read_method_body() {
        let class = sample_class();
        let bytes = ClassWriter::new().assemble(&class).unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);

        let read = ClassReader::read(&bytes).unwrap();
        assert_eq!(read.name, class.name);
        assert_eq!(read.super_name, Some(BinaryName::OBJECT));
        assert_eq!(read.fields.len(), 1);
        assert_eq!(read.fields[0].descriptor, "I");
        assert_eq!(
            read.methods[0].instructions,
            class.methods[0].instructions,
            "labels are assigned in offset order, so the body comes back identical"
        );
    }

    #[test]
    fn code_layout() {
        let class = sample_class();
        let mut pool = ConstantsPool::new();
        let code = encode_code(&mut pool, None, &class.methods[0]).unwrap();

        // max_stack, max_locals, code_length
        assert_eq!(&code[0..2], &[0, 1]);
        assert_eq!(&code[2..4], &[0, 1]);
        assert_eq!(&code[4..8], &[0, 0, 0, 8]);

        // iload_0; ifge +5; iconst_0; ireturn; iload_0; ireturn
        assert_eq!(
            &code[8..16],
            &[0x1a, 0x9c, 0x00, 0x05, 0x03, 0xac, 0x1a, 0xac]
        );
    }

    #[test]
    fn far_branches_are_widened() {
        let mut class = sample_class();
        let padding = vec![Insn::Simple(Opcode::NOP); 33000];
        class.methods[0].instructions.splice(2..2, padding);

        let mut pool = ConstantsPool::new();
        let code = encode_code(&mut pool, None, &class.methods[0]).unwrap();

        // iload_0; iflt +8; goto_w +33007
        assert_eq!(
            &code[8..17],
            &[0x1a, 0x9b, 0x00, 0x08, 0xc8, 0x00, 0x00, 0x80, 0xef]
        );

        let read = ClassReader::read(&ClassWriter::new().assemble(&class).unwrap()).unwrap();
        let body = &read.methods[0].instructions;
        assert!(matches!(body[1], Insn::Jump(Opcode::IFLT, _)));
        assert!(matches!(body[2], Insn::Jump(Opcode::GOTO, _)));
    }

    #[test]
    fn undefined_label() {
        let mut class = sample_class();
        class.methods[0].instructions.remove(4);
        assert!(matches!(
            ClassWriter::new().assemble(&class),
            Err(Error::UndefinedLabel { .. })
        ));
    }
}
