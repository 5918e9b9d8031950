//! The block-backed tier: owner of the primary, secondary, and search
//! indexes.
//!
//! Each index is a set of immutable blocks under its own subdirectory
//! (`primary/`, `secondary/`, `search/`). Ingest happens through a
//! [`Batch`]: buffered writes are mirrored into fresh mutable blocks of all
//! three flavors (the index triple consistency invariant), flushed durably,
//! and only then published to readers, so a reader never observes a
//! half-transferred page.

use std::collections::HashSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errcorrupt;
use crate::error::Result;
use crate::model::{PrimaryKey, Text, Value};
use crate::storage::block::{self, Block, PrimaryBlock, SearchBlock, SecondaryBlock};
use crate::storage::revision::{PrimaryRevision, SearchRevision, SecondaryRevision, Write};
use crate::storage::search;

const PRIMARY_DIR: &str = "primary";
const SECONDARY_DIR: &str = "secondary";
const SEARCH_DIR: &str = "search";

/// How a secondary read narrows the stored values under a key. Scans keep
/// whole value groups, so parity counting downstream stays sound.
pub enum ValueScan<'a> {
    /// Every value under the key (NEQ and the regex operators).
    All,
    /// One exact value, bloom-probed by (key, value) pair first.
    Eq(&'a Value),
    /// A contiguous value range, served from the sorted runs with early stop.
    Range(Bound<&'a Value>, Bound<&'a Value>),
}

impl ValueScan<'_> {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueScan::All => true,
            ValueScan::Eq(v) => value == *v,
            ValueScan::Range(min, max) => {
                let above = match min {
                    Bound::Included(b) => value >= *b,
                    Bound::Excluded(b) => value > *b,
                    Bound::Unbounded => true,
                };
                let below = match max {
                    Bound::Included(b) => value <= *b,
                    Bound::Excluded(b) => value < *b,
                    Bound::Unbounded => true,
                };
                above && below
            }
        }
    }
}

pub struct Database {
    dir: PathBuf,
    block_cap: usize,
    pool: Arc<rayon::ThreadPool>,
    stopwords: Arc<HashSet<String>>,
    next_block_id: AtomicU64,
    primary: RwLock<Vec<Arc<PrimaryBlock>>>,
    secondary: RwLock<Vec<Arc<SecondaryBlock>>>,
    search: RwLock<Vec<Arc<SearchBlock>>>,
    quarantined_primary: Vec<u64>,
    quarantined_secondary: Vec<u64>,
    quarantined_search: Vec<u64>,
}

impl Database {
    /// Open the database under `dir`, recovering every block in the three
    /// index trees. Unreadable blocks are quarantined: reads on that flavor
    /// fail until the operator repairs or removes the files, while writes
    /// and the other flavors continue.
    pub fn open(
        dir: &Path,
        block_cap: usize,
        pool: Arc<rayon::ThreadPool>,
        stopwords: Arc<HashSet<String>>,
    ) -> Result<Self> {
        let mut max_id = 0;

        let (primary, quarantined_primary) =
            open_blocks::<PrimaryKey, Text, Value>(&dir.join(PRIMARY_DIR), &mut max_id)?;
        let (secondary, quarantined_secondary) =
            open_blocks::<Text, Value, PrimaryKey>(&dir.join(SECONDARY_DIR), &mut max_id)?;
        let (search, quarantined_search) =
            open_blocks::<Text, Text, crate::model::Position>(&dir.join(SEARCH_DIR), &mut max_id)?;

        tracing::info!(
            dir = %dir.display(),
            primary = primary.len(),
            secondary = secondary.len(),
            search = search.len(),
            "opened database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            block_cap,
            pool,
            stopwords,
            next_block_id: AtomicU64::new(max_id + 1),
            primary: RwLock::new(primary),
            secondary: RwLock::new(secondary),
            search: RwLock::new(search),
            quarantined_primary,
            quarantined_secondary,
            quarantined_search,
        })
    }

    /// The largest revision version across all blocks, for clock recovery.
    pub fn max_version(&self) -> u64 {
        let primary = self.primary.read().iter().map(|b| b.max_version()).max().unwrap_or(0);
        let secondary = self.secondary.read().iter().map(|b| b.max_version()).max().unwrap_or(0);
        let search = self.search.read().iter().map(|b| b.max_version()).max().unwrap_or(0);
        primary.max(secondary).max(search)
    }

    /// Start a batch for one transferred page.
    pub fn new_batch(&self) -> Batch<'_> {
        Batch {
            db: self,
            primary: PrimaryBlock::mutable(self.next_id()),
            secondary: SecondaryBlock::mutable(self.next_id()),
            search: SearchBlock::mutable(self.next_id()),
            done: BatchBlocks::default(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_block_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make a finished batch visible to readers. Callers hold the engine's
    /// transport write lock so that publishing and deleting the source page
    /// appear atomic.
    pub fn publish(&self, blocks: BatchBlocks) {
        let BatchBlocks { primary, secondary, search } = blocks;
        self.primary.write().extend(primary.into_iter().map(Arc::new));
        self.secondary.write().extend(secondary.into_iter().map(Arc::new));
        self.search.write().extend(search.into_iter().map(Arc::new));
    }

    /// Primary-index revisions for `record`, optionally narrowed to one key,
    /// from every block whose bloom filter admits the locator.
    pub fn primary_revisions(
        &self,
        record: PrimaryKey,
        key: Option<&Text>,
    ) -> Result<Vec<PrimaryRevision>> {
        if let Some(id) = self.quarantined_primary.first() {
            return errcorrupt!("primary block {id} is quarantined");
        }
        let blocks: Vec<Arc<PrimaryBlock>> = self.primary.read().clone();
        let mut out = Vec::new();
        for block in blocks {
            match key {
                Some(k) => {
                    if block.might_contain_pair(&record, k) {
                        out.extend(block.seek_key(&record, k)?);
                    }
                }
                None => {
                    if block.might_contain(&record) {
                        out.extend(block.seek(&record)?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Secondary-index revisions under `key`, narrowed by `scan`.
    pub fn secondary_revisions(
        &self,
        key: &Text,
        scan: &ValueScan<'_>,
    ) -> Result<Vec<SecondaryRevision>> {
        if let Some(id) = self.quarantined_secondary.first() {
            return errcorrupt!("secondary block {id} is quarantined");
        }
        let blocks: Vec<Arc<SecondaryBlock>> = self.secondary.read().clone();
        let mut out = Vec::new();
        for block in blocks {
            match scan {
                ValueScan::Eq(value) => {
                    if block.might_contain_pair(key, value) {
                        out.extend(block.seek_key(key, *value)?);
                    }
                }
                ValueScan::Range(min, max) => {
                    if block.might_contain(key) {
                        out.extend(block.seek_range(key, *min, *max)?);
                    }
                }
                ValueScan::All => {
                    if block.might_contain(key) {
                        out.extend(block.seek(key)?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Search-index revisions for the exact term `token` under `key`. Every
    /// indexed substring is a key in the search blocks, so query tokens probe
    /// exactly.
    pub fn search_revisions(&self, key: &Text, token: &Text) -> Result<Vec<SearchRevision>> {
        if let Some(id) = self.quarantined_search.first() {
            return errcorrupt!("search block {id} is quarantined");
        }
        let blocks: Vec<Arc<SearchBlock>> = self.search.read().clone();
        let mut out = Vec::new();
        for block in blocks {
            if block.might_contain_pair(key, token) {
                out.extend(block.seek_key(key, token)?);
            }
        }
        Ok(out)
    }

    fn flavor_dir(&self, flavor: &str) -> PathBuf {
        self.dir.join(flavor)
    }
}

fn open_blocks<L, K, V>(
    dir: &Path,
    max_id: &mut u64,
) -> Result<(Vec<Arc<Block<L, K, V>>>, Vec<u64>)>
where
    L: crate::model::Byteable + Ord + std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    K: crate::model::Byteable + Ord + Clone + Send + Sync + 'static,
    V: crate::model::Byteable + Ord + Clone + Send + Sync + 'static,
{
    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        paths.push(entry?.path());
    }

    // Sweep leftovers from transfers that never committed: staging files,
    // and sidecars whose data file was never promoted. The source pages are
    // still in the buffer, so nothing is lost by deleting them.
    for path in &paths {
        if path.extension().and_then(|e| e.to_str()) == Some(block::STAGING_SUFFIX) {
            tracing::warn!(path = %path.display(), "removing staged block file from an uncommitted transfer");
            std::fs::remove_file(path)?;
        }
    }
    let mut ids = Vec::new();
    for path in &paths {
        if path.extension().and_then(|e| e.to_str()) != Some("blk") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    for path in &paths {
        let ext = path.extension().and_then(|e| e.to_str());
        if ext != Some("bf") && ext != Some("idx") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(id) = id {
            if !ids.contains(&id) {
                tracing::warn!(path = %path.display(), "removing orphaned block sidecar");
                std::fs::remove_file(path)?;
            }
        }
    }

    let mut blocks = Vec::new();
    let mut quarantined = Vec::new();
    for id in ids {
        *max_id = (*max_id).max(id);
        match Block::open(dir, id) {
            Ok(block) => blocks.push(Arc::new(block)),
            Err(e) => {
                tracing::error!(block = id, dir = %dir.display(), error = %e, "quarantining unreadable block");
                quarantined.push(id);
            }
        }
    }
    Ok((blocks, quarantined))
}

/// The mutable destination of one page transfer. Writes accepted here are
/// mirrored into all three indexes; blocks that exceed the size cap roll
/// over mid-batch.
pub struct Batch<'a> {
    db: &'a Database,
    primary: PrimaryBlock,
    secondary: SecondaryBlock,
    search: SearchBlock,
    done: BatchBlocks,
}

/// The durably flushed blocks produced by a batch, awaiting publication.
#[derive(Default)]
pub struct BatchBlocks {
    pub primary: Vec<PrimaryBlock>,
    pub secondary: Vec<SecondaryBlock>,
    pub search: Vec<SearchBlock>,
}

impl Batch<'_> {
    /// Mirror one buffered write into the three mutable blocks. The same
    /// (version, action) lands in the primary and secondary indexes and, for
    /// string values, in the search index.
    pub fn accept(&mut self, write: &Write) -> Result<()> {
        let value = write.value().normalized();
        self.primary.insert(
            write.record(),
            write.key().clone(),
            value.clone(),
            write.version(),
            write.action(),
        )?;
        self.secondary.insert(
            write.key().clone(),
            value.clone(),
            write.record(),
            write.version(),
            write.action(),
        )?;
        search::index_value(
            &self.search,
            &self.db.pool,
            &self.db.stopwords,
            write.key(),
            &value,
            write.record(),
            write.version(),
            write.action(),
        )?;
        self.roll_over_full()
    }

    fn roll_over_full(&mut self) -> Result<()> {
        let cap = self.db.block_cap;
        if self.primary.pending_size() >= cap {
            let full = std::mem::replace(&mut self.primary, PrimaryBlock::mutable(self.db.next_id()));
            full.flush(&self.db.flavor_dir(PRIMARY_DIR))?;
            self.done.primary.push(full);
        }
        if self.secondary.pending_size() >= cap {
            let full =
                std::mem::replace(&mut self.secondary, SecondaryBlock::mutable(self.db.next_id()));
            full.flush(&self.db.flavor_dir(SECONDARY_DIR))?;
            self.done.secondary.push(full);
        }
        if self.search.pending_size() >= cap {
            let full = std::mem::replace(&mut self.search, SearchBlock::mutable(self.db.next_id()));
            full.flush(&self.db.flavor_dir(SEARCH_DIR))?;
            self.done.search.push(full);
        }
        Ok(())
    }

    /// Durably flush every non-empty block, then promote the whole batch
    /// from staging names into place and hand the blocks back for
    /// publication. Promotion is the commit point: if any flush fails, no
    /// file of this batch is visible to a recovery scan, and the source page
    /// can be replayed from scratch without double-counting revisions.
    pub fn finish(mut self) -> Result<BatchBlocks> {
        if !self.primary.is_empty() {
            self.primary.flush(&self.db.flavor_dir(PRIMARY_DIR))?;
            self.done.primary.push(self.primary);
        }
        if !self.secondary.is_empty() {
            self.secondary.flush(&self.db.flavor_dir(SECONDARY_DIR))?;
            self.done.secondary.push(self.secondary);
        }
        if !self.search.is_empty() {
            self.search.flush(&self.db.flavor_dir(SEARCH_DIR))?;
            self.done.search.push(self.search);
        }
        for block in &self.done.primary {
            block.promote()?;
        }
        for block in &self.done.secondary {
            block.promote()?;
        }
        for block in &self.done.search {
            block.promote()?;
        }
        Ok(self.done)
    }
}
