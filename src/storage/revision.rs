use std::io::{Read, Write as IoWrite};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::Action;
use crate::error::Result;
use crate::model::{Byteable, PrimaryKey, Position, Text, Value};

/// An immutable (locator, key, value, version, action) quadruple: the only
/// unit of writing in the engine.
///
/// The three index flavors bind different type triples:
/// - primary: locator = record id, key = attribute, value = stored value
/// - secondary: locator = attribute, key = stored value, value = record id
/// - search: locator = attribute, key = term substring, value = position
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Revision<L, K, V> {
    locator: L,
    key: K,
    value: V,
    version: u64,
    action: Action,
}

pub type PrimaryRevision = Revision<PrimaryKey, Text, Value>;
pub type SecondaryRevision = Revision<Text, Value, PrimaryKey>;
pub type SearchRevision = Revision<Text, Text, Position>;

impl<L, K, V> Revision<L, K, V> {
    pub fn new(locator: L, key: K, value: V, version: u64, action: Action) -> Self {
        Self { locator, key, value, version, action }
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn into_parts(self) -> (L, K, V, u64, Action) {
        (self.locator, self.key, self.value, self.version, self.action)
    }
}

impl<L: Byteable, K: Byteable, V: Byteable> Revision<L, K, V> {
    /// Canonical byte form: `[action: u8][version: u64][locator][key][value]`.
    /// Containers prefix each revision with a u32 size.
    pub fn write_to(&self, w: &mut impl IoWrite) -> Result<()> {
        self.action.write_to(w)?;
        w.write_u64::<BigEndian>(self.version)?;
        self.locator.write_to(w)?;
        self.key.write_to(w)?;
        self.value.write_to(w)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let action = Action::read_from(r)?;
        let version = r.read_u64::<BigEndian>()?;
        let locator = L::read_from(r)?;
        let key = K::read_from(r)?;
        let value = V::read_from(r)?;
        Ok(Self { locator, key, value, version, action })
    }

    pub fn size(&self) -> usize {
        1 + 8 + self.locator.size() + self.key.size() + self.value.size()
    }
}

/// A buffered write: a primary-form revision waiting in the write-ahead
/// queue. The value is forStorage, stamped with the write's own version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    key: Text,
    value: Value,
    record: PrimaryKey,
    version: u64,
    action: Action,
}

impl Write {
    pub fn new(key: Text, value: Value, record: PrimaryKey, version: u64, action: Action) -> Self {
        let value = Value::for_storage(value.data().clone(), version);
        Self { key, value, record, version, action }
    }

    pub fn key(&self) -> &Text {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn record(&self) -> PrimaryKey {
        self.record
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// The primary-index revision for this write, with the value normalized
    /// to payload identity.
    pub fn primary(&self) -> PrimaryRevision {
        Revision::new(
            self.record,
            self.key.clone(),
            self.value.normalized(),
            self.version,
            self.action,
        )
    }

    /// The secondary-index mirror of this write.
    pub fn secondary(&self) -> SecondaryRevision {
        Revision::new(
            self.key.clone(),
            self.value.normalized(),
            self.record,
            self.version,
            self.action,
        )
    }

    /// Page entry form: `[action: u8][version: u64][record: u64][key][value]`.
    pub fn write_to(&self, w: &mut impl IoWrite) -> Result<()> {
        self.action.write_to(w)?;
        w.write_u64::<BigEndian>(self.version)?;
        self.record.write_to(w)?;
        self.key.write_to(w)?;
        self.value.write_to(w)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let action = Action::read_from(r)?;
        let version = r.read_u64::<BigEndian>()?;
        let record = PrimaryKey::read_from(r)?;
        let key = Text::read_from(r)?;
        let value = Value::read_from(r)?;
        Ok(Self { key, value: Value::for_storage(value.data().clone(), version), record, version, action })
    }

    pub fn size(&self) -> usize {
        1 + 8 + 8 + self.key.size() + self.value.size()
    }

    /// A human-readable description for audit logs.
    pub fn describe(&self) -> String {
        format!("{} {} AS {} IN {}", self.action, self.key, self.value, self.record)
    }
}
