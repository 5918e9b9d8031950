use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use super::revision::Revision;
use super::Action;
use crate::error::Result;
use crate::time::Timestamp;

/// A transient projection of the revision stream for one locator.
///
/// The record holds its revisions in version order and derives every answer
/// from parity: a (key, value) pair is present at time `t` iff an odd number
/// of its revisions have a version at or before `t`. Nothing else records
/// presence.
#[derive(Debug)]
pub struct Record<L, K, V> {
    locator: L,
    revisions: Vec<Revision<L, K, V>>,
}

impl<L, K, V> Record<L, K, V>
where
    L: PartialEq + Debug,
    K: Ord + Clone,
    V: Ord + Clone,
{
    pub fn new(locator: L) -> Self {
        Self { locator, revisions: Vec::new() }
    }

    /// Build a record from revisions that are already sorted by version.
    pub fn from_revisions(locator: L, revisions: Vec<Revision<L, K, V>>) -> Result<Self> {
        let mut record = Record::new(locator);
        for revision in revisions {
            record.append(revision)?;
        }
        Ok(record)
    }

    /// Append the next revision. Revisions must arrive in version order and
    /// must belong to this record's locator. Equal versions are legal only
    /// for distinct triples (a search write expands into many revisions that
    /// share one version), and their relative order is immaterial to parity.
    pub fn append(&mut self, revision: Revision<L, K, V>) -> Result<()> {
        if revision.locator() != &self.locator {
            return Err(crate::error::Error::InvariantViolation(format!(
                "revision locator {:?} does not match record locator {:?}",
                revision.locator(),
                self.locator
            )));
        }
        if let Some(last) = self.revisions.last() {
            if revision.version() < last.version() {
                return Err(crate::error::Error::InvariantViolation(format!(
                    "revision version {} precedes {}",
                    revision.version(),
                    last.version()
                )));
            }
        }
        self.revisions.push(revision);
        Ok(())
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// The set of (key, value) pairs live at `ts`, grouped by key.
    pub fn live(&self, ts: Timestamp) -> BTreeMap<K, BTreeSet<V>> {
        let horizon = ts.horizon();
        let mut live: BTreeMap<K, BTreeSet<V>> = BTreeMap::new();
        for revision in &self.revisions {
            if revision.version() > horizon {
                break;
            }
            let values = live.entry(revision.key().clone()).or_default();
            // Toggling membership is parity counting over a version-sorted
            // stream.
            if !values.remove(revision.value()) {
                values.insert(revision.value().clone());
            }
        }
        live.retain(|_, values| !values.is_empty());
        live
    }

    /// The keys with at least one live value at `ts`.
    pub fn describe(&self, ts: Timestamp) -> BTreeSet<K> {
        self.live(ts).into_keys().collect()
    }

    /// The values live under `key` at `ts`.
    pub fn fetch(&self, key: &K, ts: Timestamp) -> BTreeSet<V> {
        let horizon = ts.horizon();
        let mut values = BTreeSet::new();
        for revision in &self.revisions {
            if revision.version() > horizon {
                break;
            }
            if revision.key() != key {
                continue;
            }
            if !values.remove(revision.value()) {
                values.insert(revision.value().clone());
            }
        }
        values
    }

    /// The most recently added value still live under `key` at `ts`, with
    /// the version of the ADD that made it live.
    pub fn newest_live(&self, key: &K, ts: Timestamp) -> Option<(V, u64)> {
        let live = self.fetch(key, ts);
        let horizon = ts.horizon();
        self.revisions
            .iter()
            .rev()
            .filter(|r| r.version() <= horizon && r.action() == Action::Add && r.key() == key)
            .find(|r| live.contains(r.value()))
            .map(|r| (r.value().clone(), r.version()))
    }

    /// The version-ordered revision stream, optionally filtered by key.
    pub fn history(&self, key: Option<&K>) -> Vec<&Revision<L, K, V>> {
        self.revisions
            .iter()
            .filter(|r| key.map_or(true, |k| r.key() == k))
            .collect()
    }
}
