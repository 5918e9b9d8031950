//! Append-only revision blocks.
//!
//! A block holds revisions over one (locator, key, value) type triple and
//! moves through two phases:
//!
//! ```text
//! ┌──────────────────┐   flush()   ┌─────────────────────────────┐
//! │  MUTABLE         │────────────►│  IMMUTABLE                  │
//! │  SkipMap, sorted │             │  NNN.blk  sorted, mmap'd    │
//! │  concurrent      │             │  NNN.bf   bloom filter      │
//! │  inserts         │             │  NNN.idx  locator ranges    │
//! └──────────────────┘             └─────────────────────────────┘
//! ```
//!
//! The mutable phase accepts concurrent inserts through a lock-free skip map
//! keyed on (locator, key, value, version), which is exactly the on-disk sort
//! order, so flushing is a single ordered sweep. The immutable phase serves
//! reads from a shared memory map routed by a bloom filter and an in-memory
//! locator → byte-range index.
//!
//! Flushing writes all three files under staging names (`NNN.blk.tmp` and
//! friends); `promote()` renames them into place once the rest of the
//! transfer batch has flushed too. Recovery scans only admit final names, so
//! a transfer that dies mid-batch leaves nothing behind but staging files
//! that the next open sweeps away.

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Bound;

use crate::errcorrupt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_skiplist::SkipMap;
use memmap2::Mmap;
use parking_lot::RwLock;

use super::bloom::{BloomFilter, BloomFilterBuilder};
use super::revision::Revision;
use super::Action;
use crate::error::{Error, Result};
use crate::model::{Byteable, PrimaryKey, Position, Text, Value};

const BLOCK_MAGIC: u32 = 0x42_4C_4B; // ASCII "BLK"
const BLOCK_FORMAT: u16 = 1;
const BLOCK_HEADER_SIZE: usize = 30; // magic + format + id + count + max_version

const INDEX_MAGIC: u32 = 0x49_44_58; // ASCII "IDX"
const INDEX_FORMAT: u16 = 1;

/// Suffix for flushed-but-unpublished block files. Recovery scans only admit
/// final names, so a transfer that dies after flushing leaves nothing a
/// restart would double-count.
pub const STAGING_SUFFIX: &str = "tmp";

pub type PrimaryBlock = Block<PrimaryKey, Text, Value>;
pub type SecondaryBlock = Block<Text, Value, PrimaryKey>;
pub type SearchBlock = Block<Text, Text, Position>;

/// The sort key for one revision: the flush order of §4.2.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey<L, K, V> {
    locator: L,
    key: K,
    value: V,
    version: u64,
}

struct Mutable<L: Ord + Send + 'static, K: Ord + Send + 'static, V: Ord + Send + 'static> {
    entries: SkipMap<EntryKey<L, K, V>, Action>,
    size: AtomicUsize,
}

struct Stored<L> {
    mmap: Mmap,
    /// locator → [start, end) byte range in the block file.
    ranges: HashMap<L, (u64, u64)>,
    filter: BloomFilter,
    max_version: u64,
    count: u64,
    path: PathBuf,
}

enum State<L: Ord + Send + 'static, K: Ord + Send + 'static, V: Ord + Send + 'static> {
    Mutable(Mutable<L, K, V>),
    Immutable(Stored<L>),
}

/// An append-only, sorted-on-flush collection of revisions over one
/// (locator, key, value) schema.
pub struct Block<L: Ord + Send + 'static, K: Ord + Send + 'static, V: Ord + Send + 'static> {
    id: u64,
    state: RwLock<State<L, K, V>>,
}

impl<L, K, V> Block<L, K, V>
where
    L: Byteable + Ord + Hash + Eq + Clone + Send + Sync + 'static,
    K: Byteable + Ord + Clone + Send + Sync + 'static,
    V: Byteable + Ord + Clone + Send + Sync + 'static,
{
    /// Create a new, empty, mutable block.
    pub fn mutable(id: u64) -> Self {
        Self {
            id,
            state: RwLock::new(State::Mutable(Mutable {
                entries: SkipMap::new(),
                size: AtomicUsize::new(0),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a revision. Fails with [`Error::ReadOnly`] once the block has
    /// been flushed. Inserts may run concurrently; the skip map keeps them
    /// sorted.
    pub fn insert(&self, locator: L, key: K, value: V, version: u64, action: Action) -> Result<()> {
        let state = self.state.read();
        match &*state {
            State::Mutable(mutable) => {
                let entry = EntryKey { locator, key, value, version };
                let size = entry_size(&entry);
                mutable.entries.insert(entry, action);
                mutable.size.fetch_add(size, Ordering::Relaxed);
                Ok(())
            }
            State::Immutable(_) => Err(Error::ReadOnly),
        }
    }

    /// Approximate byte size of the mutable contents; 0 once immutable.
    pub fn pending_size(&self) -> usize {
        match &*self.state.read() {
            State::Mutable(mutable) => mutable.size.load(Ordering::Relaxed),
            State::Immutable(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &*self.state.read() {
            State::Mutable(mutable) => mutable.entries.is_empty(),
            State::Immutable(stored) => stored.count == 0,
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(&*self.state.read(), State::Mutable(_))
    }

    /// The largest revision version in the block, if known (immutable phase).
    pub fn max_version(&self) -> u64 {
        match &*self.state.read() {
            State::Mutable(mutable) => {
                mutable.entries.iter().map(|e| e.key().version).max().unwrap_or(0)
            }
            State::Immutable(stored) => stored.max_version,
        }
    }

    /// O(1) probe: may the block contain revisions for `locator`? Mutable
    /// blocks answer true (they must be scanned).
    pub fn might_contain(&self, locator: &L) -> bool {
        match &*self.state.read() {
            State::Mutable(_) => true,
            State::Immutable(stored) => stored.filter.might_contain(&locator.to_bytes()),
        }
    }

    /// O(1) probe on the (locator, key) pair.
    pub fn might_contain_pair(&self, locator: &L, key: &K) -> bool {
        match &*self.state.read() {
            State::Mutable(_) => true,
            State::Immutable(stored) => stored.filter.might_contain(&pair_probe(locator, key)),
        }
    }

    /// All revisions for `locator`, in (key, value, version) order.
    pub fn seek(&self, locator: &L) -> Result<Vec<Revision<L, K, V>>> {
        self.seek_filtered(locator, |_| true, |_| false)
    }

    /// Revisions for `locator` whose key equals `key`.
    pub fn seek_key(&self, locator: &L, key: &K) -> Result<Vec<Revision<L, K, V>>> {
        self.seek_filtered(locator, |k| k == key, |k| k > key)
    }

    /// Revisions for `locator` whose key falls within the bounds. Immutable
    /// runs stop early once the key range is exhausted.
    pub fn seek_range(
        &self,
        locator: &L,
        min: Bound<&K>,
        max: Bound<&K>,
    ) -> Result<Vec<Revision<L, K, V>>> {
        let above_min = move |k: &K| match min {
            Bound::Included(b) => k >= b,
            Bound::Excluded(b) => k > b,
            Bound::Unbounded => true,
        };
        let beyond_max = move |k: &K| match max {
            Bound::Included(b) => k > b,
            Bound::Excluded(b) => k >= b,
            Bound::Unbounded => false,
        };
        self.seek_filtered(locator, move |k| above_min(k) && !beyond_max(k), beyond_max)
    }

    fn seek_filtered(
        &self,
        locator: &L,
        keep: impl Fn(&K) -> bool,
        past_end: impl Fn(&K) -> bool,
    ) -> Result<Vec<Revision<L, K, V>>> {
        let state = self.state.read();
        match &*state {
            State::Mutable(mutable) => {
                let mut out = Vec::new();
                for entry in mutable.entries.iter() {
                    let EntryKey { locator: l, key, value, version } = entry.key();
                    if l == locator && keep(key) {
                        out.push(Revision::new(
                            l.clone(),
                            key.clone(),
                            value.clone(),
                            *version,
                            *entry.value(),
                        ));
                    }
                }
                Ok(out)
            }
            State::Immutable(stored) => {
                let Some(&(start, end)) = stored.ranges.get(locator) else {
                    return Ok(Vec::new());
                };
                let mut slice = &stored.mmap[start as usize..end as usize];
                let mut out = Vec::new();
                while !slice.is_empty() {
                    let size = slice.read_u32::<BigEndian>()? as usize;
                    if size > slice.len() {
                        return errcorrupt!(
                            "revision overruns its range in {}",
                            stored.path.display()
                        );
                    }
                    let (mut entry, rest) = slice.split_at(size);
                    let revision = Revision::<L, K, V>::read_from(&mut entry)?;
                    // Entries are sorted by key within a locator run.
                    if past_end(revision.key()) {
                        break;
                    }
                    if keep(revision.key()) {
                        out.push(revision);
                    }
                    slice = rest;
                }
                Ok(out)
            }
        }
    }

    /// Sort the contents to disk, transitioning the block to its immutable
    /// phase. The data file and its `.bf` and `.idx` sidecars land under
    /// staging names in `dir`; [`Block::promote`] renames them into place
    /// once the whole transfer batch has flushed. Reads are served through a
    /// memory map either way.
    pub fn flush(&self, dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        let mutable = match &*state {
            State::Mutable(mutable) => mutable,
            State::Immutable(_) => return Err(Error::ReadOnly),
        };
        if mutable.entries.is_empty() {
            return Err(Error::InvariantViolation("cannot flush an empty block".to_string()));
        }

        let blk_path = staging_path(dir, self.id, "blk");
        let file = File::create(&blk_path)?;
        let mut w = BufWriter::new(&file);

        let count = mutable.entries.len() as u64;
        let max_version = mutable.entries.iter().map(|e| e.key().version).max().unwrap_or(0);

        w.write_u32::<BigEndian>(BLOCK_MAGIC)?;
        w.write_u16::<BigEndian>(BLOCK_FORMAT)?;
        w.write_u64::<BigEndian>(self.id)?;
        w.write_u64::<BigEndian>(count)?;
        w.write_u64::<BigEndian>(max_version)?;

        let mut filter = BloomFilterBuilder::with_capacity(count as usize * 2);
        let mut ranges: Vec<(L, u64, u64)> = Vec::new();
        let mut offset = BLOCK_HEADER_SIZE as u64;

        for entry in mutable.entries.iter() {
            let EntryKey { locator, key, value, version } = entry.key();
            let size = entry_size(entry.key());
            w.write_u32::<BigEndian>(size as u32)?;
            Action::write_to(*entry.value(), &mut w)?;
            w.write_u64::<BigEndian>(*version)?;
            locator.write_to(&mut w)?;
            key.write_to(&mut w)?;
            value.write_to(&mut w)?;

            filter.insert(&locator.to_bytes());
            filter.insert(&pair_probe(locator, key));

            let entry_end = offset + 4 + size as u64;
            match ranges.last_mut() {
                Some((last, _, end)) if last == locator => *end = entry_end,
                _ => ranges.push((locator.clone(), offset, entry_end)),
            }
            offset = entry_end;
        }
        w.flush()?;
        file.sync_data()?;
        drop(w);

        let filter = filter.finalize();
        filter.store(&staging_path(dir, self.id, "bf"))?;
        store_index(&staging_path(dir, self.id, "idx"), &ranges)?;

        let file = File::open(&blk_path)?;
        // Safety: the file is never modified or truncated after this point;
        // blocks are immutable until deletion.
        let mmap = unsafe { Mmap::map(&file)? };

        tracing::debug!(
            id = self.id,
            revisions = count,
            bytes = mmap.len(),
            path = %blk_path.display(),
            "flushed block"
        );

        *state = State::Immutable(Stored {
            mmap,
            ranges: ranges.into_iter().map(|(l, s, e)| (l, (s, e))).collect(),
            filter,
            max_version,
            count,
            path: blk_path,
        });
        Ok(())
    }

    /// Rename the flushed files from their staging names into place. This is
    /// the commit point that makes the block visible to recovery scans;
    /// callers invoke it only once every block of the same transfer batch
    /// has flushed durably. Idempotent after the first promotion.
    pub fn promote(&self) -> Result<()> {
        let mut state = self.state.write();
        let stored = match &mut *state {
            State::Immutable(stored) => stored,
            State::Mutable(_) => {
                return Err(Error::InvariantViolation(
                    "cannot promote a block that has not been flushed".to_string(),
                ))
            }
        };
        let dir = match stored.path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => {
                return Err(Error::IO(format!(
                    "block file {} has no parent directory",
                    stored.path.display()
                )))
            }
        };
        let final_blk = file_path(&dir, self.id, "blk");
        if stored.path == final_blk {
            return Ok(());
        }
        // Sidecars first, the data file last: a torn promotion can leave
        // stray sidecars (swept at the next open) but never a data file
        // that a recovery scan would admit without its sidecars.
        std::fs::rename(staging_path(&dir, self.id, "bf"), file_path(&dir, self.id, "bf"))?;
        std::fs::rename(staging_path(&dir, self.id, "idx"), file_path(&dir, self.id, "idx"))?;
        std::fs::rename(&stored.path, &final_blk)?;
        stored.path = final_blk;
        Ok(())
    }

    /// Open an immutable block from `dir` by id.
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let blk_path = file_path(dir, id, "blk");
        let file = File::open(&blk_path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < BLOCK_HEADER_SIZE {
            return errcorrupt!("block file {} is truncated", blk_path.display());
        }
        let mut header = &mmap[..BLOCK_HEADER_SIZE];
        let magic = header.read_u32::<BigEndian>()?;
        if magic != BLOCK_MAGIC {
            return errcorrupt!("bad block magic {magic:#x} in {}", blk_path.display());
        }
        let format = header.read_u16::<BigEndian>()?;
        if format != BLOCK_FORMAT {
            return errcorrupt!("unsupported block format {format}");
        }
        let stored_id = header.read_u64::<BigEndian>()?;
        if stored_id != id {
            return errcorrupt!("block {} claims id {stored_id}", blk_path.display());
        }
        let count = header.read_u64::<BigEndian>()?;
        let max_version = header.read_u64::<BigEndian>()?;

        let filter = BloomFilter::load(&file_path(dir, id, "bf"))?;
        let ranges = load_index::<L>(&file_path(dir, id, "idx"), mmap.len() as u64)?;

        Ok(Self {
            id,
            state: RwLock::new(State::Immutable(Stored {
                mmap,
                ranges,
                filter,
                max_version,
                count,
                path: blk_path,
            })),
        })
    }
}

fn entry_size<L: Byteable, K: Byteable, V: Byteable>(entry: &EntryKey<L, K, V>) -> usize {
    1 + 8 + entry.locator.size() + entry.key.size() + entry.value.size()
}

fn file_path(dir: &Path, id: u64, ext: &str) -> PathBuf {
    dir.join(format!("{id:03}.{ext}"))
}

fn staging_path(dir: &Path, id: u64, ext: &str) -> PathBuf {
    dir.join(format!("{id:03}.{ext}.{STAGING_SUFFIX}"))
}

/// The bloom probe for a (locator, key) pair. Both encodings are
/// self-delimiting, so plain concatenation is unambiguous.
fn pair_probe<L: Byteable, K: Byteable>(locator: &L, key: &K) -> Vec<u8> {
    let mut probe = locator.to_bytes();
    probe.extend_from_slice(&key.to_bytes());
    probe
}

fn store_index<L: Byteable>(path: &Path, ranges: &[(L, u64, u64)]) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(&file);
    w.write_u32::<BigEndian>(INDEX_MAGIC)?;
    w.write_u16::<BigEndian>(INDEX_FORMAT)?;
    w.write_u32::<BigEndian>(ranges.len() as u32)?;
    for (locator, start, end) in ranges {
        locator.write_to(&mut w)?;
        w.write_u64::<BigEndian>(*start)?;
        w.write_u64::<BigEndian>(*end)?;
    }
    w.flush()?;
    file.sync_data()?;
    Ok(())
}

fn load_index<L: Byteable + Hash + Eq>(path: &Path, file_len: u64) -> Result<HashMap<L, (u64, u64)>> {
    let mut r = BufReader::new(File::open(path)?);
    let magic = r.read_u32::<BigEndian>()?;
    if magic != INDEX_MAGIC {
        return errcorrupt!("bad locator index magic {magic:#x} in {}", path.display());
    }
    let format = r.read_u16::<BigEndian>()?;
    if format != INDEX_FORMAT {
        return errcorrupt!("unsupported locator index format {format}");
    }
    let count = r.read_u32::<BigEndian>()?;
    let mut ranges = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let locator = L::read_from(&mut r)?;
        let start = r.read_u64::<BigEndian>()?;
        let end = r.read_u64::<BigEndian>()?;
        if start > end || end > file_len {
            return errcorrupt!("locator range [{start}, {end}) exceeds block length {file_len}");
        }
        ranges.insert(locator, (start, end));
    }
    Ok(ranges)
}
