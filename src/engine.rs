//! The storage engine façade.
//!
//! The engine composes the write-ahead [`Buffer`], the block-backed
//! [`Database`], and the token [`LockService`] into the operation surface
//! the service layer calls.
//!
//! # Write path
//!
//! ```text
//! add(key, value, record)
//!   │ write lock on token {key, record}
//!   ▼
//! legality check (parity) ──► version = clock.next()
//!   │                                 │
//!   ▼                                 ▼
//! Buffer.insert(Write) ──► fsync ──► unlock
//!   │
//!   ▼ (page sealed?)
//! transfer: replay oldest sealed page into fresh primary/secondary/search
//! blocks, flush them durably, then publish + delete the page atomically
//! ```
//!
//! # Read path
//!
//! Reads take a read lock on their token and the transport read lock, gather
//! matching revisions from the buffer pages and from every block whose bloom
//! filter admits the locator, sort them by version, and project them through
//! a parity [`Record`]. A reader therefore sees each revision exactly once,
//! no matter which tier currently holds it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::buffer::Buffer;
use crate::config::EngineConfig;
use crate::db::{Database, ValueScan};
use crate::errinput;
use crate::error::{Error, Result};
use crate::flock::DirectoryLock;
use crate::lock::LockService;
use crate::model::{Datum, Position, PrimaryKey, Text, Token, Value};
use crate::pool;
use crate::storage::record::Record;
use crate::storage::revision::{PrimaryRevision, Write};
use crate::storage::search;
use crate::storage::Action;
use crate::time::{Timestamp, VersionClock};
use crate::transaction::Transaction;

/// Comparison operators for [`Engine::find`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Half-open: low inclusive, high exclusive.
    Between,
    Regex,
    NotRegex,
    LinksTo,
}

impl Operator {
    fn arity(self) -> usize {
        match self {
            Operator::Between => 2,
            _ => 1,
        }
    }

    /// Normalize raw operands: check arity and coerce LINKS_TO operands into
    /// link values so they compare against stored links.
    fn operands(self, values: &[Datum]) -> Result<Vec<Value>> {
        if values.len() != self.arity() {
            return errinput!(
                "operator {self:?} takes {} operand(s), got {}",
                self.arity(),
                values.len()
            );
        }
        if self == Operator::LinksTo {
            let record = match &values[0] {
                Datum::Link(record) => *record,
                Datum::Long(l) if *l >= 0 => PrimaryKey(*l as u64),
                Datum::Integer(i) if *i >= 0 => PrimaryKey(*i as u64),
                other => return errinput!("LINKS_TO requires a record id, got {other}"),
            };
            return Ok(vec![Value::of(record)]);
        }
        Ok(values.iter().map(|d| Value::of(d.clone())).collect())
    }

    /// How the secondary index should be scanned for these operands.
    fn scan<'a>(self, operands: &'a [Value]) -> ValueScan<'a> {
        match self {
            Operator::Eq | Operator::LinksTo => ValueScan::Eq(&operands[0]),
            Operator::Lt => ValueScan::Range(Bound::Unbounded, Bound::Excluded(&operands[0])),
            Operator::Lte => ValueScan::Range(Bound::Unbounded, Bound::Included(&operands[0])),
            Operator::Gt => ValueScan::Range(Bound::Excluded(&operands[0]), Bound::Unbounded),
            Operator::Gte => ValueScan::Range(Bound::Included(&operands[0]), Bound::Unbounded),
            Operator::Between => {
                ValueScan::Range(Bound::Included(&operands[0]), Bound::Excluded(&operands[1]))
            }
            Operator::Neq | Operator::Regex | Operator::NotRegex => ValueScan::All,
        }
    }

    /// The final per-value predicate applied to the live index.
    fn predicate<'a>(self, operands: &'a [Value]) -> Result<Box<dyn Fn(&Value) -> bool + 'a>> {
        Ok(match self {
            Operator::Neq => Box::new(move |v| v != &operands[0]),
            Operator::Regex | Operator::NotRegex => {
                let pattern = operands[0].data().as_str().ok_or_else(|| {
                    Error::InvalidInput("regex operators take a string pattern".to_string())
                })?;
                let re = regex::Regex::new(pattern)
                    .map_err(|e| Error::InvalidInput(format!("invalid regex: {e}")))?;
                let negate = self == Operator::NotRegex;
                Box::new(move |v: &Value| re.is_match(&v.to_string()) != negate)
            }
            _ => {
                let scan = self.scan(operands);
                Box::new(move |v| scan.matches(v))
            }
        })
    }
}

/// A single-node storage engine instance.
pub struct Engine {
    pub(crate) clock: VersionClock,
    pub(crate) buffer: Buffer,
    pub(crate) db: Database,
    pub(crate) locks: LockService,
    /// Readers hold this shared; a transfer's publish+delete step holds it
    /// exclusively, so composite reads across buffer and blocks stay
    /// consistent.
    pub(crate) transport: RwLock<()>,
    /// At most one transfer runs at a time.
    transfer: Mutex<()>,
    /// Last committed version per token, consulted by transaction
    /// validation.
    pub(crate) last_commit: DashMap<Token, u64>,
    stopwords: Arc<HashSet<String>>,
    _buffer_lock: DirectoryLock,
    _db_lock: DirectoryLock,
}

impl Engine {
    /// Open (or recover) an engine from the configured directories. Refuses
    /// to start when the buffer and database directories overlap or are
    /// already locked by another process.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.buffer_dir)?;
        std::fs::create_dir_all(&config.db_dir)?;
        let buffer_lock = DirectoryLock::acquire(&config.buffer_dir)?;
        let db_lock = DirectoryLock::acquire(&config.db_dir)?;

        let pool = Arc::new(pool::named("search-index", config.search_threads)?);
        let stopwords = Arc::new(config.stopwords.clone());
        let buffer = Buffer::open(&config.buffer_dir, config.buffer_page_size)?;
        let db = Database::open(&config.db_dir, config.block_size_cap, pool, stopwords.clone())?;

        let floor = buffer.max_version().max(db.max_version());
        tracing::info!(version_floor = floor, "engine online");

        let engine = Self {
            clock: VersionClock::starting_after(floor),
            buffer,
            db,
            locks: LockService::new(),
            transport: RwLock::new(()),
            transfer: Mutex::new(()),
            last_commit: DashMap::new(),
            stopwords,
            _buffer_lock: buffer_lock,
            _db_lock: db_lock,
        };
        // Drain any backlog a previous run left behind.
        engine.maybe_transfer()?;
        Ok(engine)
    }

    /// Add `value` for `key` in `record`. Returns false (and writes nothing)
    /// when the value is already present.
    pub fn add(&self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        self.write_if(key, value.into(), PrimaryKey(record), Action::Add)
    }

    /// Remove `value` for `key` in `record`. Returns false when the value is
    /// not present.
    pub fn remove(&self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        self.write_if(key, value.into(), PrimaryKey(record), Action::Remove)
    }

    /// Atomically make `value` the only value for `key` in `record`.
    pub fn set(&self, key: &str, value: impl Into<Datum>, record: u64) -> Result<()> {
        let key = valid_key(key)?;
        let value = value.into();
        let record = PrimaryKey(record);
        let token = Token::field(&key, record);
        {
            let _guard = self.locks.write(token);
            let _transport = self.transport.read();
            let live = self.field_values(&key, record, Timestamp::Now)?;
            for old in &live {
                self.commit_write(&key, old.data().clone(), record, Action::Remove, token)?;
            }
            self.commit_write(&key, value, record, Action::Add, token)?;
        }
        self.maybe_transfer()
    }

    /// Remove every value for `key` in `record`.
    pub fn clear_key(&self, key: &str, record: u64) -> Result<()> {
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        let token = Token::field(&key, record);
        {
            let _guard = self.locks.write(token);
            let _transport = self.transport.read();
            let live = self.field_values(&key, record, Timestamp::Now)?;
            for value in &live {
                self.commit_write(&key, value.data().clone(), record, Action::Remove, token)?;
            }
        }
        self.maybe_transfer()
    }

    /// Clear every key in `record`. Decomposed into per-key atomics, like
    /// every compound operation.
    pub fn clear(&self, record: u64) -> Result<()> {
        for key in self.describe(record)? {
            self.clear_key(key.as_str(), record)?;
        }
        Ok(())
    }

    /// Atomically swap `expected` for `replacement` under `key` in `record`.
    /// Returns false (and writes nothing) when `expected` is not present.
    pub fn verify_and_swap(
        &self,
        key: &str,
        expected: impl Into<Datum>,
        record: u64,
        replacement: impl Into<Datum>,
    ) -> Result<bool> {
        let key = valid_key(key)?;
        let expected = Value::of(expected.into());
        let replacement = Value::of(replacement.into());
        let record = PrimaryKey(record);
        let token = Token::field(&key, record);
        let swapped = {
            let _guard = self.locks.write(token);
            let _transport = self.transport.read();
            let mut live = self.field_values(&key, record, Timestamp::Now)?;
            if live.remove(&expected) {
                self.commit_write(&key, expected.data().clone(), record, Action::Remove, token)?;
                if !live.contains(&replacement) {
                    self.commit_write(&key, replacement.data().clone(), record, Action::Add, token)?;
                }
                true
            } else {
                false
            }
        };
        if swapped {
            self.maybe_transfer()?;
        }
        Ok(swapped)
    }

    /// Reinstate the state of `key` in `record` as of `ts` by replaying the
    /// inverse of everything that happened since. Idempotent: reverting
    /// twice to the same timestamp writes nothing the second time.
    pub fn revert(&self, key: &str, record: u64, ts: Timestamp) -> Result<()> {
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        let token = Token::field(&key, record);
        {
            let _guard = self.locks.write(token);
            let _transport = self.transport.read();
            let now = self.field_values(&key, record, Timestamp::Now)?;
            let then = self.field_values(&key, record, ts)?;
            for value in now.difference(&then) {
                self.commit_write(&key, value.data().clone(), record, Action::Remove, token)?;
            }
            for value in then.difference(&now) {
                self.commit_write(&key, value.data().clone(), record, Action::Add, token)?;
            }
        }
        self.maybe_transfer()
    }

    /// The values live for `key` in `record`.
    pub fn fetch(&self, key: &str, record: u64) -> Result<BTreeSet<Value>> {
        self.fetch_at(key, record, Timestamp::Now)
    }

    pub fn fetch_at(&self, key: &str, record: u64, ts: Timestamp) -> Result<BTreeSet<Value>> {
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::field(&key, record));
        let _transport = self.transport.read();
        self.field_values(&key, record, ts)
    }

    /// Whether `value` is live for `key` in `record`.
    pub fn verify(&self, key: &str, value: impl Into<Datum>, record: u64) -> Result<bool> {
        self.verify_at(key, value, record, Timestamp::Now)
    }

    pub fn verify_at(
        &self,
        key: &str,
        value: impl Into<Datum>,
        record: u64,
        ts: Timestamp,
    ) -> Result<bool> {
        Ok(self.fetch_at(key, record, ts)?.contains(&Value::of(value.into())))
    }

    /// The most recently added live value for `key` in `record`.
    pub fn get(&self, key: &str, record: u64) -> Result<Option<Value>> {
        self.get_at(key, record, Timestamp::Now)
    }

    pub fn get_at(&self, key: &str, record: u64, ts: Timestamp) -> Result<Option<Value>> {
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::field(&key, record));
        let _transport = self.transport.read();
        let projection = self.field_record(&key, record)?;
        Ok(projection.newest_live(&key, ts).map(|(value, _)| value))
    }

    /// The keys with at least one live value in `record`.
    pub fn describe(&self, record: u64) -> Result<BTreeSet<Text>> {
        self.describe_at(record, Timestamp::Now)
    }

    pub fn describe_at(&self, record: u64, ts: Timestamp) -> Result<BTreeSet<Text>> {
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::record(record));
        let _transport = self.transport.read();
        Ok(self.whole_record(record)?.describe(ts))
    }

    /// Every live (key, values) pair in `record`.
    pub fn select(&self, record: u64) -> Result<BTreeMap<Text, BTreeSet<Value>>> {
        self.select_at(record, Timestamp::Now)
    }

    pub fn select_at(&self, record: u64, ts: Timestamp) -> Result<BTreeMap<Text, BTreeSet<Value>>> {
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::record(record));
        let _transport = self.transport.read();
        Ok(self.whole_record(record)?.live(ts))
    }

    /// Whether `record` currently holds any data.
    pub fn ping(&self, record: u64) -> Result<bool> {
        Ok(!self.describe(record)?.is_empty())
    }

    /// The full revision log for `record`, in version (= insertion) order.
    pub fn audit(&self, record: u64) -> Result<BTreeMap<u64, String>> {
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::record(record));
        let _transport = self.transport.read();
        let projection = self.whole_record(record)?;
        Ok(projection
            .history(None)
            .into_iter()
            .map(|r| (r.version(), describe_revision(r)))
            .collect())
    }

    /// The revision log for `key` in `record`.
    pub fn audit_key(&self, key: &str, record: u64) -> Result<BTreeMap<u64, String>> {
        let key = valid_key(key)?;
        let record = PrimaryKey(record);
        let _guard = self.locks.read(Token::field(&key, record));
        let _transport = self.transport.read();
        let projection = self.field_record(&key, record)?;
        Ok(projection
            .history(Some(&key))
            .into_iter()
            .map(|r| (r.version(), describe_revision(r)))
            .collect())
    }

    /// The records whose live values for `key` satisfy `operator` at `ts`.
    pub fn find(
        &self,
        key: &str,
        operator: Operator,
        values: &[Datum],
    ) -> Result<BTreeSet<PrimaryKey>> {
        self.find_at(key, operator, values, Timestamp::Now)
    }

    pub fn find_at(
        &self,
        key: &str,
        operator: Operator,
        values: &[Datum],
        ts: Timestamp,
    ) -> Result<BTreeSet<PrimaryKey>> {
        let key = valid_key(key)?;
        let operands = operator.operands(values)?;
        let predicate = operator.predicate(&operands)?;

        let _guard = self.locks.read(Token::key(&key));
        let _transport = self.transport.read();

        let scan = operator.scan(&operands);
        let mut revisions = self.db.secondary_revisions(&key, &scan)?;
        revisions.extend(self.buffer.secondary_revisions(&key, |v| scan.matches(v))?);
        revisions.sort_by_key(|r| r.version());

        let index = Record::from_revisions(key.clone(), revisions)?;
        let mut records = BTreeSet::new();
        for (value, live) in index.live(ts) {
            if predicate(&value) {
                records.extend(live);
            }
        }
        Ok(records)
    }

    /// Full-text search: the records whose live string values for `key`
    /// contain the query terms (each matching a stored term exactly or as a
    /// substring) in the same relative order. Stopwords in the query are
    /// skipped.
    pub fn search(&self, key: &str, query: &str) -> Result<BTreeSet<PrimaryKey>> {
        let key = valid_key(key)?;
        let tokens: Vec<String> = search::tokenize(query)
            .into_iter()
            .filter(|t| !self.stopwords.contains(t))
            .collect();
        if tokens.is_empty() {
            return Ok(BTreeSet::new());
        }

        let _guard = self.locks.read(Token::key(&key));
        let _transport = self.transport.read();

        let mut per_token: Vec<HashMap<PrimaryKey, BTreeSet<u32>>> = Vec::new();
        for token in &tokens {
            let term = Text::wrap(token.as_str());
            let mut revisions = self.db.search_revisions(&key, &term)?;
            revisions.extend(self.buffer.search_revisions(&key, token, &self.stopwords)?);
            revisions.sort_by_key(|r| r.version());

            let postings = Record::from_revisions(key.clone(), revisions)?;
            let live: BTreeSet<Position> = postings.fetch(&term, Timestamp::Now);
            let mut by_record: HashMap<PrimaryKey, BTreeSet<u32>> = HashMap::new();
            for position in live {
                by_record.entry(position.record()).or_default().insert(position.index());
            }
            per_token.push(by_record);
        }

        let mut results = BTreeSet::new();
        if let Some(first) = per_token.first() {
            'candidates: for record in first.keys() {
                let mut positions = Vec::with_capacity(per_token.len());
                for token_map in &per_token {
                    match token_map.get(record) {
                        Some(set) => positions.push(set.clone()),
                        None => continue 'candidates,
                    }
                }
                if search::matches_in_order(&positions) {
                    results.insert(*record);
                }
            }
        }
        Ok(results)
    }

    /// Mint a fresh primary key. Delegated to the version clock, so keys are
    /// globally unique and monotonic within one engine instance.
    pub fn create(&self) -> PrimaryKey {
        PrimaryKey(self.clock.next())
    }

    /// The latest version this engine has issued. A read at
    /// `Timestamp::At(current_version())` sees everything committed so far.
    pub fn current_version(&self) -> u64 {
        self.clock.current()
    }

    /// Enter staging mode: a transaction whose writes are invisible to other
    /// clients until commit.
    pub fn stage(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    fn write_if(&self, key: &str, value: Datum, record: PrimaryKey, action: Action) -> Result<bool> {
        let key = valid_key(key)?;
        let token = Token::field(&key, record);
        let applied = {
            let _guard = self.locks.write(token);
            let _transport = self.transport.read();
            let live = self.field_values(&key, record, Timestamp::Now)?;
            let present = live.contains(&Value::of(value.clone()));
            let legal = match action {
                Action::Add => !present,
                Action::Remove => present,
            };
            if legal {
                self.commit_write(&key, value, record, action, token)?;
            }
            legal
        };
        if applied {
            self.maybe_transfer()?;
        }
        Ok(applied)
    }

    /// Stamp a version, append to the buffer, and make it durable. Callers
    /// hold the write lock for `token`.
    fn commit_write(
        &self,
        key: &Text,
        value: Datum,
        record: PrimaryKey,
        action: Action,
        token: Token,
    ) -> Result<u64> {
        let version = self.clock.next();
        let write = Write::new(key.clone(), Value::of(value), record, version, action);
        self.buffer.insert(write)?;
        self.buffer.sync()?;
        self.last_commit.insert(token, version);
        Ok(version)
    }

    /// Replay sealed buffer pages into blocks. The expensive part (indexing
    /// and flushing) runs outside any shared lock; only the final
    /// publish+delete step excludes readers. `finish` promotes the batch's
    /// staging files into place as its commit step, so a transfer that fails
    /// partway leaves nothing a recovery scan would admit and the page is
    /// simply replayed from scratch on the next attempt.
    pub(crate) fn maybe_transfer(&self) -> Result<()> {
        if !self.buffer.can_transfer() {
            return Ok(());
        }
        let Some(_transferring) = self.transfer.try_lock() else {
            return Ok(());
        };
        while let Some(page) = self.buffer.oldest_sealed() {
            let mut batch = self.db.new_batch();
            page.scan(|w| batch.accept(w))?;
            let blocks = batch.finish()?;
            {
                let _transport = self.transport.write();
                self.db.publish(blocks);
                self.buffer.remove(&page)?;
            }
            tracing::debug!(page = page.id(), "transferred buffer page");
        }
        Ok(())
    }

    /// The parity projection of one key in one record. Callers hold the
    /// transport read lock.
    fn field_record(&self, key: &Text, record: PrimaryKey) -> Result<Record<PrimaryKey, Text, Value>> {
        let mut revisions = self.db.primary_revisions(record, Some(key))?;
        revisions.extend(self.buffer.primary_revisions(record, Some(key))?);
        revisions.sort_by_key(|r| r.version());
        Record::from_revisions(record, revisions)
    }

    fn field_values(&self, key: &Text, record: PrimaryKey, ts: Timestamp) -> Result<BTreeSet<Value>> {
        Ok(self.field_record(key, record)?.fetch(key, ts))
    }

    /// The parity projection of a whole record.
    fn whole_record(&self, record: PrimaryKey) -> Result<Record<PrimaryKey, Text, Value>> {
        let mut revisions = self.db.primary_revisions(record, None)?;
        revisions.extend(self.buffer.primary_revisions(record, None)?);
        revisions.sort_by_key(|r| r.version());
        Record::from_revisions(record, revisions)
    }
}

fn describe_revision(r: &PrimaryRevision) -> String {
    format!("{} {} AS {} IN {}", r.action(), r.key(), r.value(), r.locator())
}

pub(crate) fn valid_key(key: &str) -> Result<Text> {
    if key.trim().is_empty() {
        return errinput!("key cannot be empty");
    }
    Ok(Text::wrap(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Engine {
        Engine::open(EngineConfig::new(dir.path().join("buffer"), dir.path().join("db"))).unwrap()
    }

    /// An engine whose pages seal after every write, so each operation is
    /// transferred into blocks immediately.
    fn open_transferring(dir: &TempDir) -> Engine {
        Engine::open(
            EngineConfig::new(dir.path().join("buffer"), dir.path().join("db"))
                .buffer_page_size(1),
        )
        .unwrap()
    }

    fn values(engine: &Engine, key: &str, record: u64) -> Vec<Value> {
        engine.fetch(key, record).unwrap().into_iter().collect()
    }

    #[test]
    fn test_add_fetch_describe_verify() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        assert!(engine.add("name", "alice", 1).unwrap());
        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);
        let keys = engine.describe(1).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![Text::wrap("name")]);
        assert!(engine.verify("name", "alice", 1).unwrap());
        assert!(!engine.verify("name", "bob", 1).unwrap());
        assert!(engine.ping(1).unwrap());
        assert!(!engine.ping(2).unwrap());
    }

    #[test]
    fn test_duplicate_add_and_absent_remove_are_noops() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        assert!(engine.add("name", "alice", 1).unwrap());
        assert!(!engine.add("name", "alice", 1).unwrap());
        assert!(!engine.remove("name", "bob", 1).unwrap());
        assert!(engine.remove("name", "alice", 1).unwrap());
        assert!(!engine.remove("name", "alice", 1).unwrap());
        // The no-ops left no trace in the history.
        assert_eq!(engine.audit(1).unwrap().len(), 2);
    }

    #[test]
    fn test_add_remove_add_audit() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("name", "alice", 1).unwrap();
        engine.remove("name", "alice", 1).unwrap();
        engine.add("name", "alice", 1).unwrap();

        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);

        let audit = engine.audit(1).unwrap();
        assert_eq!(audit.len(), 3);
        let entries: Vec<String> = audit.into_values().collect();
        assert!(entries[0].starts_with("ADD"));
        assert!(entries[1].starts_with("REMOVE"));
        assert!(entries[2].starts_with("ADD"));
    }

    #[test]
    fn test_time_travel() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        let t0 = engine.current_version();
        engine.add("x", 5i32, 7).unwrap();
        let t1 = engine.current_version();
        engine.remove("x", 5i32, 7).unwrap();
        let t2 = engine.current_version();

        assert!(engine.fetch_at("x", 7, Timestamp::At(t0)).unwrap().is_empty());
        assert_eq!(
            engine.fetch_at("x", 7, Timestamp::At(t1)).unwrap().into_iter().collect::<Vec<_>>(),
            vec![Value::of(5i32)]
        );
        assert!(engine.fetch_at("x", 7, Timestamp::At(t2)).unwrap().is_empty());
        assert!(engine.fetch("x", 7).unwrap().is_empty());
    }

    #[test]
    fn test_find_operators() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("age", 30i32, 1).unwrap();
        engine.add("age", 40i32, 2).unwrap();
        engine.add("age", 50i32, 3).unwrap();

        let find = |op, vals: &[Datum]| {
            engine
                .find("age", op, vals)
                .unwrap()
                .into_iter()
                .map(|k| k.value())
                .collect::<Vec<u64>>()
        };

        assert_eq!(find(Operator::Gt, &[Datum::Integer(35)]), vec![2, 3]);
        assert_eq!(
            find(Operator::Between, &[Datum::Integer(30), Datum::Integer(45)]),
            vec![1, 2]
        );
        assert_eq!(find(Operator::Eq, &[Datum::Integer(40)]), vec![2]);
        assert_eq!(find(Operator::Neq, &[Datum::Integer(40)]), vec![1, 3]);
        assert_eq!(find(Operator::Lte, &[Datum::Integer(40)]), vec![1, 2]);
        assert_eq!(find(Operator::Lt, &[Datum::Integer(30)]), Vec::<u64>::new());
        assert_eq!(find(Operator::Gte, &[Datum::Integer(50)]), vec![3]);

        // Removed values drop out of the index view.
        engine.remove("age", 40i32, 2).unwrap();
        assert_eq!(find(Operator::Gt, &[Datum::Integer(35)]), vec![3]);
    }

    #[test]
    fn test_find_regex_and_links() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("name", "alice", 1).unwrap();
        engine.add("name", "alfred", 2).unwrap();
        engine.add("name", "bob", 3).unwrap();
        engine.add("friend", Datum::Link(PrimaryKey(1)), 3).unwrap();

        let matched = engine
            .find("name", Operator::Regex, &[Datum::from("^al")])
            .unwrap();
        assert_eq!(matched.into_iter().map(|k| k.value()).collect::<Vec<_>>(), vec![1, 2]);

        let unmatched = engine
            .find("name", Operator::NotRegex, &[Datum::from("^al")])
            .unwrap();
        assert_eq!(unmatched.into_iter().map(|k| k.value()).collect::<Vec<_>>(), vec![3]);

        let linked = engine
            .find("friend", Operator::LinksTo, &[Datum::Long(1)])
            .unwrap();
        assert_eq!(linked.into_iter().map(|k| k.value()).collect::<Vec<_>>(), vec![3]);

        // Bad arity and bad patterns surface as input errors.
        assert!(engine.find("name", Operator::Eq, &[]).is_err());
        assert!(engine
            .find("name", Operator::Regex, &[Datum::from("(")])
            .is_err());
    }

    #[test]
    fn test_search_substring_in_order() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("bio", "foo bar baz", 1).unwrap();
        engine.add("bio", "food barn", 2).unwrap();
        engine.add("bio", "barn food", 3).unwrap();

        let hits = engine.search("bio", "fo ar").unwrap();
        let ids: Vec<u64> = hits.iter().map(|k| k.value()).collect();
        // Substring match with order preserved: records 1 and 2 qualify;
        // record 3 has the terms in the wrong order.
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
        assert!(!ids.contains(&3));

        // Stopwords in the query are skipped entirely.
        let hits = engine.search("bio", "the foo").unwrap();
        assert!(hits.iter().any(|k| k.value() == 1));
        assert!(engine.search("bio", "the").unwrap().is_empty());

        // Removing the value removes it from search.
        engine.remove("bio", "foo bar baz", 1).unwrap();
        let hits = engine.search("bio", "fo ar").unwrap();
        assert!(!hits.iter().any(|k| k.value() == 1));
    }

    #[test]
    fn test_search_scoped_by_key() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("bio", "hello world", 1).unwrap();
        engine.add("note", "hello world", 2).unwrap();

        let hits = engine.search("bio", "hello").unwrap();
        assert_eq!(hits.into_iter().map(|k| k.value()).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_set_and_clear() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("color", "red", 1).unwrap();
        engine.add("color", "blue", 1).unwrap();
        engine.set("color", "green", 1).unwrap();
        assert_eq!(values(&engine, "color", 1), vec![Value::of("green")]);

        engine.add("shape", "round", 1).unwrap();
        engine.clear(1).unwrap();
        assert!(engine.describe(1).unwrap().is_empty());
        assert!(!engine.ping(1).unwrap());
        // History is preserved even though the record is now empty.
        assert!(!engine.audit(1).unwrap().is_empty());
    }

    #[test]
    fn test_verify_and_swap() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("balance", 100i32, 1).unwrap();
        assert!(engine.verify_and_swap("balance", 100i32, 1, 110i32).unwrap());
        assert_eq!(values(&engine, "balance", 1), vec![Value::of(110i32)]);

        // The expectation no longer holds, so nothing changes.
        assert!(!engine.verify_and_swap("balance", 100i32, 1, 120i32).unwrap());
        assert_eq!(values(&engine, "balance", 1), vec![Value::of(110i32)]);
    }

    #[test]
    fn test_revert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        engine.add("name", "alice", 1).unwrap();
        let checkpoint = engine.current_version();
        engine.add("name", "bob", 1).unwrap();
        engine.remove("name", "alice", 1).unwrap();

        engine.revert("name", 1, Timestamp::At(checkpoint)).unwrap();
        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);
        let history_len = engine.audit(1).unwrap().len();

        engine.revert("name", 1, Timestamp::At(checkpoint)).unwrap();
        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);
        // The second revert was a no-op: no new revisions.
        assert_eq!(engine.audit(1).unwrap().len(), history_len);
    }

    #[test]
    fn test_create_is_unique_and_monotonic() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let mut last = PrimaryKey(0);
        for _ in 0..100 {
            let key = engine.create();
            assert!(key > last);
            last = key;
        }
    }

    #[test]
    fn test_versions_strictly_increase_across_operations() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        for i in 0..20 {
            engine.add("k", i as i64, 1).unwrap();
        }
        let audit = engine.audit(1).unwrap();
        let versions: Vec<u64> = audit.keys().copied().collect();
        assert_eq!(versions.len(), 20);
        for pair in versions.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_reads_span_buffer_and_blocks() {
        let dir = TempDir::new().unwrap();
        let engine = open_transferring(&dir);

        engine.add("name", "alice", 1).unwrap();
        engine.add("name", "bob", 1).unwrap();
        engine.remove("name", "alice", 1).unwrap();
        engine.add("age", 30i32, 1).unwrap();

        // Everything above has been pushed into blocks by now.
        assert!(engine.buffer.primary_revisions(PrimaryKey(1), None).unwrap().len() < 4);

        assert_eq!(values(&engine, "name", 1), vec![Value::of("bob")]);
        assert_eq!(engine.describe(1).unwrap().len(), 2);
        assert_eq!(engine.audit(1).unwrap().len(), 4);
        assert_eq!(
            engine
                .find("age", Operator::Gte, &[Datum::Integer(30)])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_index_mirror_after_transfer() {
        let dir = TempDir::new().unwrap();
        let engine = open_transferring(&dir);

        engine.add("bio", "hello world", 1).unwrap();
        engine.remove("bio", "hello world", 1).unwrap();

        let primary = engine.db.primary_revisions(PrimaryKey(1), None).unwrap();
        let secondary = engine
            .db
            .secondary_revisions(&Text::wrap("bio"), &ValueScan::All)
            .unwrap();
        assert_eq!(primary.len(), 2);
        assert_eq!(secondary.len(), 2);

        // The same (version, action) pairs exist in both indexes, and the
        // search index mirrors the string revisions.
        let primary_pairs: Vec<(u64, Action)> =
            primary.iter().map(|r| (r.version(), r.action())).collect();
        let secondary_pairs: Vec<(u64, Action)> =
            secondary.iter().map(|r| (r.version(), r.action())).collect();
        assert_eq!(primary_pairs, secondary_pairs);

        let search_hits = engine
            .db
            .search_revisions(&Text::wrap("bio"), &Text::wrap("hello"))
            .unwrap();
        assert_eq!(search_hits.len(), 2);
        assert_eq!(search_hits[0].version(), primary_pairs[0].0);
        assert_eq!(search_hits[1].version(), primary_pairs[1].0);
    }

    #[test]
    fn test_restart_recovers_everything() {
        let dir = TempDir::new().unwrap();
        let last_version;
        {
            let engine = open_transferring(&dir);
            engine.add("name", "alice", 1).unwrap();
            engine.add("bio", "rust engineer", 1).unwrap();
            engine.add("age", 30i32, 1).unwrap();
            last_version = engine.current_version();
        }

        let engine = open_transferring(&dir);
        // The clock resumed past everything persisted.
        assert!(engine.current_version() >= last_version);
        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);
        assert_eq!(engine.describe(1).unwrap().len(), 3);
        assert!(engine.search("bio", "rust").unwrap().iter().any(|k| k.value() == 1));
        assert_eq!(
            engine
                .find("age", Operator::Eq, &[Datum::Integer(30)])
                .unwrap()
                .len(),
            1
        );

        // And writes continue with fresh versions.
        assert!(engine.add("name", "bob", 1).unwrap());
        assert_eq!(engine.fetch("name", 1).unwrap().len(), 2);
    }

    #[test]
    fn test_restart_recovers_unsealed_buffer() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open(&dir);
            engine.add("name", "alice", 1).unwrap();
        }
        // Nothing was transferred: the data only exists in the buffer page.
        let engine = open(&dir);
        assert_eq!(values(&engine, "name", 1), vec![Value::of("alice")]);
    }

    #[test]
    fn test_second_engine_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let _engine = open(&dir);
        let result =
            Engine::open(EngineConfig::new(dir.path().join("buffer"), dir.path().join("db")));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        assert!(matches!(engine.add("", "x", 1), Err(Error::InvalidInput(_))));
        assert!(matches!(engine.fetch("  ", 1), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let engine = &engine;
                s.spawn(move || {
                    for i in 0..25u64 {
                        assert!(engine.add("n", (t * 100 + i) as i64, t).unwrap());
                    }
                });
            }
        });

        for t in 0..4u64 {
            assert_eq!(engine.fetch("n", t).unwrap().len(), 25);
        }
    }

    #[test]
    fn test_concurrent_add_remove_same_field_keeps_parity() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);

        // Writers race on one field; the token lock serializes them, so
        // every successful add is either still live or was removed by a
        // matching successful remove.
        let adds = std::sync::atomic::AtomicU64::new(0);
        let removes = std::sync::atomic::AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let engine = &engine;
                let adds = &adds;
                let removes = &removes;
                s.spawn(move || {
                    for _ in 0..50 {
                        if engine.add("flag", true, 9).unwrap() {
                            adds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                        if engine.remove("flag", true, 9).unwrap() {
                            removes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        let live = engine.verify("flag", true, 9).unwrap();
        let adds = adds.load(std::sync::atomic::Ordering::SeqCst);
        let removes = removes.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(live, adds > removes);
        assert_eq!(engine.audit(9).unwrap().len() as u64, adds + removes);
    }
}
