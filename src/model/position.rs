use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Byteable, PrimaryKey};
use crate::error::Result;

/// The location of a search term: a record and the token index of the term
/// within the original text. Used only by the search index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    record: PrimaryKey,
    index: u32,
}

impl Position {
    pub fn new(record: PrimaryKey, index: u32) -> Self {
        Self { record, index }
    }

    pub fn record(self) -> PrimaryKey {
        self.record
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

impl Byteable for Position {
    fn write_to(&self, w: &mut impl Write) -> Result<()> {
        self.record.write_to(w)?;
        w.write_u32::<BigEndian>(self.index)?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Self> {
        let record = PrimaryKey::read_from(r)?;
        let index = r.read_u32::<BigEndian>()?;
        Ok(Self { record, index })
    }

    fn size(&self) -> usize {
        12
    }
}
