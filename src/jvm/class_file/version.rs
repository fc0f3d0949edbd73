use super::{Deserialize, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Result;

/// Class file format version
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const JAVA5: Version = Version {
        major: 49,
        minor: 0,
    };
    pub const JAVA8: Version = Version {
        major: 52,
        minor: 0,
    };

    /// From this version on, verification requires a `StackMapTable`
    pub fn requires_stack_map_frames(&self) -> bool {
        self.major > 50
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor.serialize(writer)?;
        self.major.serialize(writer)
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let minor = u16::deserialize(reader)?;
        let major = u16::deserialize(reader)?;
        Ok(Version { major, minor })
    }
}
