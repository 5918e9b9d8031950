//! Canonical typed leaves: the values that revisions are made of.
//!
//! Every leaf has a total ordering and a canonical big-endian byte form. The
//! byte forms are order-preserving (comparing encoded payloads byte-wise
//! agrees with the natural order of the type), which is what lets flushed
//! blocks be scanned as sorted runs.

pub mod key;
pub mod position;
pub mod text;
pub mod token;
pub mod value;

pub use key::PrimaryKey;
pub use position::Position;
pub use text::Text;
pub use token::Token;
pub use value::{Datum, Type, Value};

use std::io::{Read, Write};

use crate::error::Result;

/// A type with a canonical, self-delimiting byte form.
pub trait Byteable: Sized {
    /// Append the canonical byte form to `w`.
    fn write_to(&self, w: &mut impl Write) -> Result<()>;

    /// Read one value back from `r`. The encoding is self-delimiting, so the
    /// reader is left positioned at the next datum.
    fn read_from(r: &mut impl Read) -> Result<Self>;

    /// The encoded size in bytes.
    fn size(&self) -> usize;

    /// The canonical byte form as an owned vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        // Writing to a Vec cannot fail.
        self.write_to(&mut buf).expect("vec write");
        buf
    }
}
