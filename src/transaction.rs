//! Multi-operation transactions (staging mode).
//!
//! A transaction accumulates writes in a private set, invisible to every
//! other client. Reads merge the engine snapshot at the transaction's start
//! version with the pending writes. Commit is two-phase: acquire write locks
//! on every touched write token and read locks on every read token, in
//! ascending token order (so concurrent commits cannot deadlock), then
//! validate optimistically that no other writer committed into the
//! transaction's footprint after it started. Validation failure surfaces
//! [`Error::TransactionConflict`] and discards the write set; the client may
//! retry.

use std::collections::{BTreeMap, BTreeSet};

use crate::engine::{valid_key, Engine};
use crate::error::{Error, Result};
use crate::lock::{ReadGuard, WriteGuard};
use crate::model::{Datum, PrimaryKey, Text, Token, Value};
use crate::storage::revision::Write;
use crate::storage::Action;
use crate::time::Timestamp;

struct Staged {
    key: Text,
    value: Datum,
    record: PrimaryKey,
    action: Action,
}

enum Guard<'a> {
    Read(#[allow(dead_code)] ReadGuard<'a>),
    Write(#[allow(dead_code)] WriteGuard<'a>),
}

/// A staged session against one engine. Dropping the transaction without
/// committing abandons it, exactly like [`Transaction::abort`].
pub struct Transaction<'e> {
    engine: &'e Engine,
    /// Snapshot horizon: reads see committed versions at or before this.
    start: u64,
    staged: Vec<Staged>,
    read_tokens: BTreeSet<Token>,
    write_tokens: BTreeSet<Token>,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            start: engine.current_version(),
            staged: Vec::new(),
            read_tokens: BTreeSet::new(),
            write_tokens: BTreeSet::new(),
        }
    }

    /// The values live for `key` in `record` from this transaction's
    /// viewpoint: the snapshot at start, merged with pending writes.
    pub fn fetch(&mut self, key: &str, record: u64) -> Result<BTreeSet<Value>> {
        let key_text = valid_key(key)?;
        let record = PrimaryKey(record);
        self.read_tokens.insert(Token::field(&key_text, record));

        let mut values = self.engine.fetch_at(key, record.value(), Timestamp::At(self.start))?;
        for staged in &self.staged {
            if staged.key == key_text && staged.record == record {
                let value = Value::of(staged.value.clone());
                match staged.action {
                    Action::Add => {
                        values.insert(value);
                    }
                    Action::Remove => {
                        values.remove(&value);
                    }
                }
            }
        }
        Ok(values)
    }

    /// Whether `value` is live for `key` in `record` in this transaction's
    /// view.
    pub fn verify(&mut self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        Ok(self.fetch(key, record)?.contains(&Value::of(value.into())))
    }

    /// Stage an add. Returns false when the value is already present in the
    /// merged view.
    pub fn add(&mut self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        self.write(key, value.into(), record, Action::Add)
    }

    /// Stage a remove. Returns false when the value is absent from the
    /// merged view.
    pub fn remove(&mut self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        self.write(key, value.into(), record, Action::Remove)
    }

    fn write(&mut self, key: &str, value: Datum, record: u64, action: Action) -> Result<bool> {
        let present = self.verify(key, value.clone(), record)?;
        let legal = match action {
            Action::Add => !present,
            Action::Remove => present,
        };
        if !legal {
            return Ok(false);
        }
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        self.write_tokens.insert(Token::field(&key, record));
        self.staged.push(Staged { key, value, record, action });
        Ok(true)
    }

    /// Two-phase commit. On success every staged write is durable under a
    /// fresh, contiguous run of versions; on conflict nothing is written.
    pub fn commit(self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        // Lock the whole footprint in ascending token order. A token that is
        // both read and written gets its write lock only.
        let mut footprint: BTreeMap<Token, bool> = BTreeMap::new();
        for token in &self.read_tokens {
            footprint.insert(*token, false);
        }
        for token in &self.write_tokens {
            footprint.insert(*token, true);
        }
        let mut guards = Vec::with_capacity(footprint.len());
        for (token, exclusive) in &footprint {
            if *exclusive {
                guards.push(Guard::Write(self.engine.locks.write(*token)));
            } else {
                guards.push(Guard::Read(self.engine.locks.read(*token)));
            }
        }

        // Optimistic validation: nobody may have committed into the
        // footprint after this transaction's snapshot was taken.
        for token in footprint.keys() {
            if let Some(version) = self.engine.last_commit.get(token) {
                if *version > self.start {
                    tracing::debug!(token = %token, "transaction conflict");
                    return Err(Error::TransactionConflict);
                }
            }
        }

        // Apply the write set under one fsync.
        let mut last_version = 0;
        for staged in &self.staged {
            let version = self.engine.clock.next();
            let write = Write::new(
                staged.key.clone(),
                Value::of(staged.value.clone()),
                staged.record,
                version,
                staged.action,
            );
            self.engine.buffer.insert(write)?;
            last_version = version;
        }
        self.engine.buffer.sync()?;
        for token in &self.write_tokens {
            self.engine.last_commit.insert(*token, last_version);
        }

        drop(guards);
        self.engine.maybe_transfer()?;
        Ok(())
    }

    /// Discard the write set.
    pub fn abort(self) {
        // Nothing was shared, so there is nothing to undo.
    }
}
