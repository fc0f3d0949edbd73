use super::class_file::Serialize;
use bitflags::bitflags;
use byteorder::WriteBytesExt;
use std::io::Result;

bitflags! {
    /// Access flags on classes
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.1-200-E.1
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    /// Access flags on methods
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.6-200-A.1
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

bitflags! {
    /// Access flags on fields
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.5-200-A.1
    pub struct FieldAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

/// Visibility of a member, derived from its access flags
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Package,
    Private,
}

impl Visibility {
    fn from_bits(bits: u16) -> Visibility {
        if bits & 0x0001 != 0 {
            Visibility::Public
        } else if bits & 0x0002 != 0 {
            Visibility::Private
        } else if bits & 0x0004 != 0 {
            Visibility::Protected
        } else {
            Visibility::Package
        }
    }
}

impl FieldAccessFlags {
    pub fn visibility(&self) -> Visibility {
        Visibility::from_bits(self.bits())
    }

    /// Flags after widening: public, and non-final if `drop_final` is set
    pub fn widened(&self, drop_final: bool) -> FieldAccessFlags {
        let mut flags = *self;
        flags.remove(FieldAccessFlags::PRIVATE | FieldAccessFlags::PROTECTED);
        flags.insert(FieldAccessFlags::PUBLIC);
        if drop_final {
            flags.remove(FieldAccessFlags::FINAL);
        }
        flags
    }
}

impl MethodAccessFlags {
    pub fn visibility(&self) -> Visibility {
        Visibility::from_bits(self.bits())
    }
}

impl Serialize for ClassAccessFlags {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.bits().serialize(writer)
    }
}

impl Serialize for MethodAccessFlags {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.bits().serialize(writer)
    }
}

impl Serialize for FieldAccessFlags {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.bits().serialize(writer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn widening_fields() {
        let flags = FieldAccessFlags::PRIVATE | FieldAccessFlags::FINAL | FieldAccessFlags::STATIC;
        assert_eq!(flags.visibility(), Visibility::Private);

        let widened = flags.widened(true);
        assert_eq!(widened, FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC);
        assert_eq!(widened.visibility(), Visibility::Public);

        let kept_final = flags.widened(false);
        assert!(kept_final.contains(FieldAccessFlags::FINAL));
    }

    #[test]
    fn package_private() {
        assert_eq!(FieldAccessFlags::empty().visibility(), Visibility::Package);
        assert_eq!(
            MethodAccessFlags::PROTECTED.visibility(),
            Visibility::Protected
        );
    }
}
