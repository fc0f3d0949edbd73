use super::{Deserialize, Serialize};
use crate::jvm::Error;
use crate::util::Width;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;

/// Constants as in the constant pool
///
/// Indices are raw constant pool indices. Entries which take up two slots (`Long` and `Double`)
/// are followed by an [`Constant::Unusable`] entry so that a vector of constants can be indexed
/// directly with `index - 1`.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (the encoding of the null character
    /// `\u{0000}` and the encoding of supplementary characters is different).
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),

    /// Class or an interface
    Class(u16),

    /// Constant object of type `java.lang.String`
    String(u16),
    FieldRef {
        class: u16,
        name_and_type: u16,
    },

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: u16,
        name_and_type: u16,
        is_interface: bool,
    },
    NameAndType {
        name: u16,
        descriptor: u16,
    },
    MethodHandle {
        kind: u8,
        member: u16,
    },
    MethodType(u16),

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_method: u16,
        name_and_type: u16,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        bootstrap_method: u16,
        name_and_type: u16,
    },
    Module(u16),
    Package(u16),

    /// Placeholder for the second slot of `Long` and `Double` constants
    Unusable,
}

impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(float) => {
                4u8.serialize(writer)?;
                float.serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(double) => {
                6u8.serialize(writer)?;
                double.serialize(writer)?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(utf8) => {
                8u8.serialize(writer)?;
                utf8.serialize(writer)?;
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if !is_interface { 10u8 } else { 11u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle { kind, member } => {
                15u8.serialize(writer)?;
                kind.serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType(descriptor) => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            } => {
                17u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::Module(name) => {
                19u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Package(name) => {
                20u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Unusable => (),
        };
        Ok(())
    }
}

/// Read one constant (not including the placeholder after wide constants)
pub fn read_constant<R: ReadBytesExt>(reader: &mut R) -> Result<Constant, Error> {
    let tag = u8::deserialize(reader)?;
    let constant = match tag {
        1 => {
            let len = u16::deserialize(reader)?;
            let mut bytes = vec![0; len as usize];
            reader.read_exact(&mut bytes)?;
            Constant::Utf8(decode_modified_utf8(&bytes)?)
        }
        3 => Constant::Integer(i32::deserialize(reader)?),
        4 => Constant::Float(f32::deserialize(reader)?),
        5 => Constant::Long(i64::deserialize(reader)?),
        6 => Constant::Double(f64::deserialize(reader)?),
        7 => Constant::Class(u16::deserialize(reader)?),
        8 => Constant::String(u16::deserialize(reader)?),
        9 => Constant::FieldRef {
            class: u16::deserialize(reader)?,
            name_and_type: u16::deserialize(reader)?,
        },
        10 | 11 => Constant::MethodRef {
            class: u16::deserialize(reader)?,
            name_and_type: u16::deserialize(reader)?,
            is_interface: tag == 11,
        },
        12 => Constant::NameAndType {
            name: u16::deserialize(reader)?,
            descriptor: u16::deserialize(reader)?,
        },
        15 => Constant::MethodHandle {
            kind: u8::deserialize(reader)?,
            member: u16::deserialize(reader)?,
        },
        16 => Constant::MethodType(u16::deserialize(reader)?),
        17 => Constant::Dynamic {
            bootstrap_method: u16::deserialize(reader)?,
            name_and_type: u16::deserialize(reader)?,
        },
        18 => Constant::InvokeDynamic {
            bootstrap_method: u16::deserialize(reader)?,
            name_and_type: u16::deserialize(reader)?,
        },
        19 => Constant::Module(u16::deserialize(reader)?),
        20 => Constant::Package(u16::deserialize(reader)?),
        other => {
            return Err(Error::MalformedClass(format!(
                "unknown constant pool tag {}",
                other
            )))
        }
    };
    Ok(constant)
}

/// Read-only view of a constant pool, with lookups that check entry kinds
#[derive(Copy, Clone)]
pub struct PoolView<'a>(pub &'a [Constant]);

impl<'a> PoolView<'a> {
    pub fn get(&self, index: u16) -> Result<&'a Constant, Error> {
        match index.checked_sub(1).and_then(|i| self.0.get(i as usize)) {
            Some(Constant::Unusable) | None => Err(Error::MissingConstant(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&'a str, Error> {
        match self.get(index)? {
            Constant::Utf8(string) => Ok(string),
            _ => Err(Error::MissingConstant(index)),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&'a str, Error> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(Error::MissingConstant(index)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&'a str, &'a str), Error> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(Error::MissingConstant(index)),
        }
    }

    /// Resolve a field or method reference into `(owner, name, descriptor, is_interface)`
    pub fn member_ref(&self, index: u16) -> Result<(&'a str, &'a str, &'a str, bool), Error> {
        let (class, name_and_type, is_interface) = match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, false),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => (*class, *name_and_type, *is_interface),
            _ => return Err(Error::MissingConstant(index)),
        };
        let owner = self.class_name(class)?;
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok((owner, name, descriptor, is_interface))
    }
}

/// Class file constants pool builder
///
/// The pool is append only. It may be seeded with the constants of a class that was read in, in
/// which case all of those keep their original indices.
pub struct ConstantsPool {
    constants: Vec<Constant>,

    /// Serialized form of each constant, for deduplication (this sidesteps floats not being `Eq`)
    index: HashMap<Vec<u8>, u16>,
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool {
            constants: vec![],
            index: HashMap::new(),
        }
    }

    /// Make a pool which starts out with existing constants at their existing indices
    pub fn seeded(existing: &[Constant]) -> ConstantsPool {
        let mut pool = ConstantsPool {
            constants: existing.to_vec(),
            index: HashMap::new(),
        };
        for (i, constant) in existing.iter().enumerate() {
            if *constant != Constant::Unusable {
                pool.index.entry(key(constant)).or_insert(i as u16 + 1);
            }
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    fn get_or_insert(&mut self, constant: Constant) -> Result<u16, Error> {
        let key = key(&constant);
        if let Some(idx) = self.index.get(&key) {
            return Ok(*idx);
        }

        // Note: the largest valid index is 65535, indexing starts at 1, and some constants take
        // two spaces.
        let offset = self.constants.len() + 1;
        if offset + constant.width() > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow {
                offset: offset as u16,
            });
        }
        let wide = constant.width() == 2;
        self.constants.push(constant);
        if wide {
            self.constants.push(Constant::Unusable);
        }
        self.index.insert(key, offset as u16);
        Ok(offset as u16)
    }

    pub fn get_utf8(&mut self, utf8: &str) -> Result<u16, Error> {
        self.get_or_insert(Constant::Utf8(utf8.to_owned()))
    }

    pub fn get_class(&mut self, name: &str) -> Result<u16, Error> {
        let name = self.get_utf8(name)?;
        self.get_or_insert(Constant::Class(name))
    }

    pub fn get_string(&mut self, string: &str) -> Result<u16, Error> {
        let utf8 = self.get_utf8(string)?;
        self.get_or_insert(Constant::String(utf8))
    }

    pub fn get_integer(&mut self, value: i32) -> Result<u16, Error> {
        self.get_or_insert(Constant::Integer(value))
    }

    pub fn get_float(&mut self, value: f32) -> Result<u16, Error> {
        self.get_or_insert(Constant::Float(value))
    }

    pub fn get_long(&mut self, value: i64) -> Result<u16, Error> {
        self.get_or_insert(Constant::Long(value))
    }

    pub fn get_double(&mut self, value: f64) -> Result<u16, Error> {
        self.get_or_insert(Constant::Double(value))
    }

    pub fn get_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, Error> {
        let name = self.get_utf8(name)?;
        let descriptor = self.get_utf8(descriptor)?;
        self.get_or_insert(Constant::NameAndType { name, descriptor })
    }

    pub fn get_field_ref(&mut self, owner: &str, name: &str, desc: &str) -> Result<u16, Error> {
        let class = self.get_class(owner)?;
        let name_and_type = self.get_name_and_type(name, desc)?;
        self.get_or_insert(Constant::FieldRef {
            class,
            name_and_type,
        })
    }

    pub fn get_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        desc: &str,
        is_interface: bool,
    ) -> Result<u16, Error> {
        let class = self.get_class(owner)?;
        let name_and_type = self.get_name_and_type(name, desc)?;
        self.get_or_insert(Constant::MethodRef {
            class,
            name_and_type,
            is_interface,
        })
    }

    pub fn get_method_type(&mut self, descriptor: &str) -> Result<u16, Error> {
        let descriptor = self.get_utf8(descriptor)?;
        self.get_or_insert(Constant::MethodType(descriptor))
    }

    pub fn get_invoke_dynamic(
        &mut self,
        bootstrap_method: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, Error> {
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        self.get_or_insert(Constant::InvokeDynamic {
            bootstrap_method,
            name_and_type,
        })
    }
}

impl Default for ConstantsPool {
    fn default() -> Self {
        ConstantsPool::new()
    }
}

/// Count (one more than the number of slots) followed by the entries
impl Serialize for ConstantsPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        ((self.constants.len() + 1) as u16).serialize(writer)?;
        for constant in &self.constants {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

fn key(constant: &Constant) -> Vec<u8> {
    let mut buffer = vec![];
    // Writing into a vector never fails
    let _ = constant.serialize(&mut buffer);
    buffer
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u0000` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for unit in string.encode_utf16() {
        let code = unit as u32;
        if code != 0 && code < 0x80 {
            buffer.push(code as u8);
        } else if code < 0x800 {
            buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
            buffer.push((code & 0x3F) as u8 | 0b1000_0000);
        } else {
            buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
            buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
            buffer.push((code & 0x3F) as u8 | 0b1000_0000);
        }
    }
    buffer
}

/// Inverse of [`encode_modified_utf8`]
///
/// Unpaired surrogates are replaced with `U+FFFD`.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, Error> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    let truncated = || Error::MalformedClass(String::from("truncated modified UTF-8"));

    while let Some(b0) = iter.next() {
        let unit = if b0 & 0x80 == 0 {
            b0 as u16
        } else if b0 & 0xE0 == 0xC0 {
            let b1 = iter.next().ok_or_else(truncated)?;
            ((b0 as u16 & 0x1F) << 6) | (b1 as u16 & 0x3F)
        } else if b0 & 0xF0 == 0xE0 {
            let b1 = iter.next().ok_or_else(truncated)?;
            let b2 = iter.next().ok_or_else(truncated)?;
            ((b0 as u16 & 0x0F) << 12) | ((b1 as u16 & 0x3F) << 6) | (b2 as u16 & 0x3F)
        } else {
            return Err(Error::MalformedClass(format!(
                "invalid modified UTF-8 lead byte {:#x}",
                b0
            )));
        };
        units.push(unit);
    }
    Ok(String::from_utf16_lossy(&units))
}
