use std::fmt::Display;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::Byteable;
use crate::error::Result;

/// A 64-bit record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey(pub u64);

impl PrimaryKey {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PrimaryKey {
    fn from(id: u64) -> Self {
        PrimaryKey(id)
    }
}

impl Byteable for PrimaryKey {
    fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<BigEndian>(self.0)?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Self> {
        Ok(PrimaryKey(r.read_u64::<BigEndian>()?))
    }

    fn size(&self) -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = PrimaryKey(0xDEAD_BEEF_CAFE_F00D);
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(PrimaryKey::read_from(&mut bytes.as_slice()).unwrap(), key);
    }
}
