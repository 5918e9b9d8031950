//! The storage tier: revisions, parity projection, and the block machinery
//! shared by the primary, secondary, and search indexes.
//!
//! Writes enter as [`revision::Write`]s in the buffer, are mirrored into
//! flavored [`revision::Revision`]s inside [`block::Block`]s, and are read
//! back through [`record::Record`] projections that derive presence from
//! revision-count parity.

pub mod block;
pub mod bloom;
pub mod record;
pub mod revision;
pub mod search;

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;

/// What a revision does to its (locator, key, value) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Action {
    Add = 1,
    Remove = 2,
}

impl Action {
    pub fn write_to(self, w: &mut impl Write) -> Result<()> {
        w.write_u8(self as u8)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        match r.read_u8()? {
            1 => Ok(Action::Add),
            2 => Ok(Action::Remove),
            other => errcorrupt!("unknown action tag {other}"),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Action::Add => write!(f, "ADD"),
            Action::Remove => write!(f, "REMOVE"),
        }
    }
}
