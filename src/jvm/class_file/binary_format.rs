use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Result;

/// Utility trait for serializing data inside class files
///
/// Java class files have some peculiarities that make it useful to define an extra trait (instead
/// of just using `serde`):
///
///   - tags are always `u8`
///   - when serializing a sequence, the length of the sequence is usually `u16`
///
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

/// Counterpart of [`Serialize`] for the fixed-width primitives class files are made of
pub trait Deserialize: Sized {
    /// Read the construct from a binary input stream
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self>;
}

macro_rules! primitive_format {
    ($typ:ty, $write:ident, $read:ident) => {
        impl Serialize for $typ {
            fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
                writer.$write::<BigEndian>(*self)
            }
        }

        impl Deserialize for $typ {
            fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
                reader.$read::<BigEndian>()
            }
        }
    };
}

primitive_format!(u16, write_u16, read_u16);
primitive_format!(u32, write_u32, read_u32);
primitive_format!(i16, write_i16, read_i16);
primitive_format!(i32, write_i32, read_i32);
primitive_format!(i64, write_i64, read_i64);
primitive_format!(f32, write_f32, read_f32);
primitive_format!(f64, write_f64, read_f64);

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Deserialize for u8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u8()
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

impl Deserialize for i8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i8()
    }
}

/// Size in `u16` is the first thing serialized
impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u16).serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

/// Size in `u16` is the first thing deserialized
impl<A: Deserialize> Deserialize for Vec<A> {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let len = u16::deserialize(reader)?;
        (0..len).map(|_| A::deserialize(reader)).collect()
    }
}
