use std::fmt::Display;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::Byteable;
use crate::error::{Error, Result};

/// An immutable UTF-8 byte sequence. Ordering is byte-lexicographic, which
/// for UTF-8 agrees with code-point order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Text(String);

impl Text {
    pub fn wrap(s: impl Into<String>) -> Self {
        Text(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Self {
        Text(s.to_string())
    }
}

impl From<String> for Text {
    fn from(s: String) -> Self {
        Text(s)
    }
}

impl Byteable for Text {
    fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<BigEndian>(self.0.len() as u32)?;
        w.write_all(self.0.as_bytes())?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Self> {
        let len = r.read_u32::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        let s = String::from_utf8(buf)
            .map_err(|_| Error::Corruption("text is not valid utf-8".to_string()))?;
        Ok(Text(s))
    }

    fn size(&self) -> usize {
        4 + self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for s in ["", "name", "héllo wörld", "a\u{0}b"] {
            let text = Text::wrap(s);
            let bytes = text.to_bytes();
            assert_eq!(bytes.len(), text.size());
            let decoded = Text::read_from(&mut bytes.as_slice()).unwrap();
            assert_eq!(text, decoded);
        }
    }

    #[test]
    fn test_ordering_is_byte_lexicographic() {
        assert!(Text::wrap("a") < Text::wrap("ab"));
        assert!(Text::wrap("ab") < Text::wrap("b"));
    }
}
