use std::fmt::Display;

use xxhash_rust::xxh3::Xxh3;

use super::{Byteable, PrimaryKey, Text};

/// An opaque 128-bit identity for a *notion of a thing* that can be locked,
/// such as a key in a record. Tokens are stable hashes of the byte forms of
/// the objects they wrap, so any caller naming the same tuple gets the same
/// token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token([u8; 16]);

impl Token {
    /// Hash an ordered tuple of byte strings into a token. Each part is
    /// length-prefixed before hashing so that `("ab", "c")` and `("a", "bc")`
    /// produce different tokens.
    pub fn wrap<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Token {
        let mut hasher = Xxh3::new();
        for part in parts {
            hasher.update(&(part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        Token(hasher.digest128().to_be_bytes())
    }

    /// The token for a key in a record.
    pub fn field(key: &Text, record: PrimaryKey) -> Token {
        let key_bytes = key.to_bytes();
        let record_bytes = record.to_bytes();
        Token::wrap([key_bytes.as_slice(), record_bytes.as_slice()])
    }

    /// The token for a whole record.
    pub fn record(record: PrimaryKey) -> Token {
        let record_bytes = record.to_bytes();
        Token::wrap([record_bytes.as_slice()])
    }

    /// The token for a whole key (across records), used by index reads.
    pub fn key(key: &Text) -> Token {
        let key_bytes = key.to_bytes();
        Token::wrap([key_bytes.as_slice()])
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_tuple_same_token() {
        let a = Token::field(&Text::wrap("name"), PrimaryKey(1));
        let b = Token::field(&Text::wrap("name"), PrimaryKey(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_tuples_differ() {
        let key = Text::wrap("name");
        assert_ne!(Token::field(&key, PrimaryKey(1)), Token::field(&key, PrimaryKey(2)));
        assert_ne!(Token::field(&key, PrimaryKey(1)), Token::record(PrimaryKey(1)));
        assert_ne!(Token::key(&key), Token::record(PrimaryKey(1)));
    }

    #[test]
    fn test_length_prefix_disambiguates() {
        let a = Token::wrap([b"ab".as_slice(), b"c".as_slice()]);
        let b = Token::wrap([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }
}
