use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;

use super::{Byteable, PrimaryKey};
use crate::error::Result;

/// Wire-level type tags. Tags participate in the total order across types:
/// values of different types compare by tag alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Type {
    Boolean = 1,
    Integer = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    String = 6,
    Link = 7,
}

impl Type {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Type::Boolean,
            2 => Type::Integer,
            3 => Type::Long,
            4 => Type::Float,
            5 => Type::Double,
            6 => Type::String,
            7 => Type::Link,
            other => return errcorrupt!("unknown value type tag {other}"),
        })
    }
}

/// The typed payload of a value.
///
/// The payload encodings are order-preserving: signed integers have their
/// sign bit flipped, floats use the IEEE-754 total-order bit trick, and
/// strings are raw UTF-8 bytes. Comparing two encoded payloads of the same
/// type byte-wise therefore agrees with [`Datum::cmp`].
#[derive(Clone, Debug)]
pub enum Datum {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Link(PrimaryKey),
}

impl Datum {
    pub fn ty(&self) -> Type {
        match self {
            Datum::Boolean(_) => Type::Boolean,
            Datum::Integer(_) => Type::Integer,
            Datum::Long(_) => Type::Long,
            Datum::Float(_) => Type::Float,
            Datum::Double(_) => Type::Double,
            Datum::String(_) => Type::String,
            Datum::Link(_) => Type::Link,
        }
    }

    /// The string form used by the REGEX operators and audit descriptions.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Datum::Boolean(b) => write!(f, "{b}"),
            Datum::Integer(i) => write!(f, "{i}"),
            Datum::Long(l) => write!(f, "{l}"),
            Datum::Float(x) => write!(f, "{x}"),
            Datum::Double(x) => write!(f, "{x}"),
            Datum::String(s) => write!(f, "{s}"),
            Datum::Link(k) => write!(f, "@{k}"),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        use Datum::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Link(a), Link(b)) => a.cmp(b),
            _ => (self.ty() as u8).cmp(&(other.ty() as u8)),
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.ty() as u8);
        match self {
            Datum::Boolean(b) => b.hash(state),
            Datum::Integer(i) => i.hash(state),
            Datum::Long(l) => l.hash(state),
            Datum::Float(x) => x.to_bits().hash(state),
            Datum::Double(x) => x.to_bits().hash(state),
            Datum::String(s) => s.hash(state),
            Datum::Link(k) => k.hash(state),
        }
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}

impl From<i32> for Datum {
    fn from(i: i32) -> Self {
        Datum::Integer(i)
    }
}

impl From<i64> for Datum {
    fn from(l: i64) -> Self {
        Datum::Long(l)
    }
}

impl From<f32> for Datum {
    fn from(x: f32) -> Self {
        Datum::Float(x)
    }
}

impl From<f64> for Datum {
    fn from(x: f64) -> Self {
        Datum::Double(x)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<PrimaryKey> for Datum {
    fn from(k: PrimaryKey) -> Self {
        Datum::Link(k)
    }
}

/// A typed value, optionally stamped with the version of the revision that
/// stored it.
///
/// A value with a version is *forStorage*: it was created by the engine on a
/// write path. A value without one is *notForStorage*: a query operand.
/// Equality ignores the version whenever either side is notForStorage, so a
/// query value matches any stored incarnation of the same payload, while two
/// forStorage values from different revisions stay distinguishable. Ordering
/// and hashing always use the payload alone.
#[derive(Clone, Debug)]
pub struct Value {
    data: Datum,
    version: Option<u64>,
}

impl Value {
    /// Create a notForStorage (query) value.
    pub fn of(data: impl Into<Datum>) -> Self {
        Self { data: data.into(), version: None }
    }

    /// Create a forStorage value stamped with `version`.
    pub fn for_storage(data: impl Into<Datum>, version: u64) -> Self {
        Self { data: data.into(), version: Some(version) }
    }

    pub fn data(&self) -> &Datum {
        &self.data
    }

    pub fn ty(&self) -> Type {
        self.data.ty()
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn is_for_storage(&self) -> bool {
        self.version.is_some()
    }

    /// The notForStorage form of this value, used wherever presence is
    /// decided by payload identity.
    pub fn normalized(&self) -> Value {
        Value { data: self.data.clone(), version: None }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.data)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.version, other.version) {
            (Some(a), Some(b)) => a == b && self.data == other.data,
            _ => self.data == other.data,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data.cmp(&other.data)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

// Canonical wire form: `[tag: u8][payload]`. Fixed-width payloads are
// big-endian with the order-preserving transforms below; strings carry a u32
// length. The version is never encoded here; revisions persist it themselves
// and re-stamp values on read.
impl Byteable for Value {
    fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u8(self.ty() as u8)?;
        match &self.data {
            Datum::Boolean(b) => w.write_u8(*b as u8)?,
            Datum::Integer(i) => w.write_u32::<BigEndian>(flip_i32(*i))?,
            Datum::Long(l) => w.write_u64::<BigEndian>(flip_i64(*l))?,
            Datum::Float(x) => w.write_u32::<BigEndian>(order_f32(*x))?,
            Datum::Double(x) => w.write_u64::<BigEndian>(order_f64(*x))?,
            Datum::String(s) => {
                w.write_u32::<BigEndian>(s.len() as u32)?;
                w.write_all(s.as_bytes())?;
            }
            Datum::Link(k) => w.write_u64::<BigEndian>(k.value())?,
        }
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Self> {
        let ty = Type::from_tag(r.read_u8()?)?;
        let data = match ty {
            Type::Boolean => Datum::Boolean(r.read_u8()? != 0),
            Type::Integer => Datum::Integer(unflip_i32(r.read_u32::<BigEndian>()?)),
            Type::Long => Datum::Long(unflip_i64(r.read_u64::<BigEndian>()?)),
            Type::Float => Datum::Float(unorder_f32(r.read_u32::<BigEndian>()?)),
            Type::Double => Datum::Double(unorder_f64(r.read_u64::<BigEndian>()?)),
            Type::String => {
                let len = r.read_u32::<BigEndian>()? as usize;
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)?;
                let s = String::from_utf8(buf)
                    .map_err(|_| crate::error::Error::Corruption("string value is not valid utf-8".to_string()))?;
                Datum::String(s)
            }
            Type::Link => Datum::Link(PrimaryKey(r.read_u64::<BigEndian>()?)),
        };
        Ok(Value { data, version: None })
    }

    fn size(&self) -> usize {
        1 + match &self.data {
            Datum::Boolean(_) => 1,
            Datum::Integer(_) | Datum::Float(_) => 4,
            Datum::Long(_) | Datum::Double(_) | Datum::Link(_) => 8,
            Datum::String(s) => 4 + s.len(),
        }
    }
}

// Flip the sign bit so that two's complement sorts as unsigned big-endian.
fn flip_i32(i: i32) -> u32 {
    (i as u32) ^ (1 << 31)
}

fn unflip_i32(u: u32) -> i32 {
    (u ^ (1 << 31)) as i32
}

fn flip_i64(i: i64) -> u64 {
    (i as u64) ^ (1 << 63)
}

fn unflip_i64(u: u64) -> i64 {
    (u ^ (1 << 63)) as i64
}

// IEEE-754 total order as unsigned bytes: negative floats flip every bit,
// positive floats flip only the sign bit.
fn order_f32(x: f32) -> u32 {
    let bits = x.to_bits();
    if bits & (1 << 31) != 0 {
        !bits
    } else {
        bits | (1 << 31)
    }
}

fn unorder_f32(u: u32) -> f32 {
    let bits = if u & (1 << 31) != 0 { u & !(1 << 31) } else { !u };
    f32::from_bits(bits)
}

fn order_f64(x: f64) -> u64 {
    let bits = x.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn unorder_f64(u: u64) -> f64 {
    let bits = if u & (1 << 63) != 0 { u & !(1 << 63) } else { !u };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Value> {
        vec![
            Value::of(false),
            Value::of(true),
            Value::of(-42i32),
            Value::of(0i32),
            Value::of(42i32),
            Value::of(i64::MIN),
            Value::of(i64::MAX),
            Value::of(-1.5f32),
            Value::of(3.25f32),
            Value::of(-2.5f64),
            Value::of(1e300f64),
            Value::of(""),
            Value::of("alice"),
            Value::of(PrimaryKey(7)),
        ]
    }

    #[test]
    fn test_round_trip() {
        for value in samples() {
            let bytes = value.to_bytes();
            assert_eq!(bytes.len(), value.size());
            let decoded = Value::read_from(&mut bytes.as_slice()).unwrap();
            assert_eq!(value, decoded, "round trip failed for {value:?}");
        }
    }

    #[test]
    fn test_for_storage_round_trip_equals_original() {
        // The version is carried by the revision, not the value bytes, and
        // equality ignores it when one side is notForStorage.
        let value = Value::for_storage("bob", 1234);
        let decoded = Value::read_from(&mut value.to_bytes().as_slice()).unwrap();
        assert!(!decoded.is_for_storage());
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_encoding_preserves_order_within_type() {
        let ints: Vec<i32> = vec![i32::MIN, -100, -1, 0, 1, 100, i32::MAX];
        let mut last: Option<Vec<u8>> = None;
        for i in ints {
            let bytes = Value::of(i).to_bytes();
            if let Some(prev) = last {
                assert!(prev < bytes, "encoding out of order at {i}");
            }
            last = Some(bytes);
        }

        let floats: Vec<f64> = vec![f64::NEG_INFINITY, -1.5, -0.0, 0.0, 2.5, f64::INFINITY];
        let mut last: Option<Vec<u8>> = None;
        for x in floats {
            let bytes = Value::of(x).to_bytes();
            if let Some(prev) = last {
                assert!(prev <= bytes, "encoding out of order at {x}");
            }
            last = Some(bytes);
        }
    }

    #[test]
    fn test_cross_type_order_is_by_tag() {
        let sorted = samples();
        for pair in sorted.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_equality_version_rules() {
        let query = Value::of("alice");
        let stored1 = Value::for_storage("alice", 1);
        let stored2 = Value::for_storage("alice", 2);

        // notForStorage matches any stored incarnation.
        assert_eq!(query, stored1);
        assert_eq!(query, stored2);
        // Two forStorage values from different revisions are distinct.
        assert_ne!(stored1, stored2);
        assert_eq!(stored1, stored1.clone());
    }

    #[test]
    fn test_ordering_ignores_version() {
        let a = Value::for_storage(1i32, 99);
        let b = Value::of(2i32);
        assert!(a < b);
    }
}
