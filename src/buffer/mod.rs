//! The durable write-ahead buffer.
//!
//! Incoming writes land here first, in fixed-size page files, and stay
//! readable until a transfer replays them into the database's blocks. The
//! newest page is the single append target; once it reaches the configured
//! size it is sealed (checksummed, finalized) and a fresh page is opened.
//! Transfers always consume the oldest sealed page, so writes leave the
//! buffer in the order they arrived.

pub mod page;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::model::{Position, PrimaryKey, Text, Value};
use crate::storage::revision::{PrimaryRevision, Revision, SearchRevision, SecondaryRevision, Write};
use crate::storage::search;
use page::Page;

pub struct Buffer {
    dir: PathBuf,
    page_size: usize,
    /// Oldest page at the front; the newest (back) is the only unsealed one.
    pages: RwLock<VecDeque<Arc<Page>>>,
    next_id: AtomicU64,
    /// Sealed pages that failed recovery. While any exist, reads fail
    /// (every buffer scan would have to touch them) but writes continue.
    quarantined: Vec<(u64, Error)>,
}

impl Buffer {
    /// Open the buffer in `dir`, recovering any pages left by a previous
    /// run. Corrupt sealed pages are quarantined; a fresh current page is
    /// created if the newest recovered page is already sealed.
    pub fn open(dir: &Path, page_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut paths: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("page") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            paths.push((id, path));
        }
        paths.sort_by_key(|(id, _)| *id);

        let mut pages = VecDeque::new();
        let mut quarantined = Vec::new();
        let last = paths.len().saturating_sub(1);
        for (i, (id, path)) in paths.iter().enumerate() {
            match Page::open(path) {
                Ok(page) => {
                    // A crash between sealing and rolling can leave an
                    // unsealed page behind the newest one; it will never take
                    // another append, so finish sealing it now.
                    if i != last && !page.is_sealed() {
                        page.seal()?;
                    }
                    pages.push_back(Arc::new(page));
                }
                Err(e) => {
                    tracing::error!(page = id, error = %e, "quarantining unreadable buffer page");
                    quarantined.push((*id, e));
                }
            }
        }

        let next_id =
            AtomicU64::new(paths.last().map(|(id, _)| id + 1).unwrap_or(1));

        let buffer = Self { dir: dir.to_path_buf(), page_size, pages: RwLock::new(pages), next_id, quarantined };
        let needs_fresh_page = {
            let pages = buffer.pages.read();
            pages.back().map_or(true, |p| p.is_sealed())
        };
        if needs_fresh_page {
            buffer.roll(None)?;
        }

        tracing::info!(
            dir = %dir.display(),
            pages = buffer.pages.read().len(),
            quarantined = buffer.quarantined.len(),
            "opened buffer"
        );
        Ok(buffer)
    }

    /// The largest version among buffered writes, for clock recovery.
    pub fn max_version(&self) -> u64 {
        let pages = self.pages.read();
        let mut max = 0;
        for page in pages.iter() {
            let _ = page.scan(|w| {
                max = max.max(w.version());
                Ok(())
            });
        }
        max
    }

    /// Append a write to the current page, sealing it and opening a new one
    /// when it fills. Durability is deferred to [`Buffer::sync`], which
    /// callers invoke once per commit.
    pub fn insert(&self, write: Write) -> Result<()> {
        loop {
            let current = {
                let pages = self.pages.read();
                pages.back().cloned().ok_or(Error::ReadOnly)?
            };
            match current.append(write.clone()) {
                Ok(size) => {
                    if size >= self.page_size {
                        self.roll(Some(current.id()))?;
                    }
                    return Ok(());
                }
                // Sealed underneath us; retry against the new current page.
                Err(Error::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Fsync the current page.
    pub fn sync(&self) -> Result<()> {
        let current = {
            let pages = self.pages.read();
            pages.back().cloned()
        };
        match current {
            Some(page) => page.sync(),
            None => Ok(()),
        }
    }

    /// Seal `full` (when it is still current) and open a fresh page.
    fn roll(&self, full: Option<u64>) -> Result<()> {
        let mut pages = self.pages.write();
        if let Some(full) = full {
            match pages.back() {
                Some(current) if current.id() == full => current.seal()?,
                // Another writer already rolled.
                _ => return Ok(()),
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let page = Page::create(&self.dir, id)?;
        tracing::debug!(page = id, "opened buffer page");
        pages.push_back(Arc::new(page));
        Ok(())
    }

    /// Whether a sealed page is waiting to be transferred.
    pub fn can_transfer(&self) -> bool {
        self.pages.read().front().map_or(false, |p| p.is_sealed())
    }

    /// The oldest sealed page, if any.
    pub fn oldest_sealed(&self) -> Option<Arc<Page>> {
        let pages = self.pages.read();
        pages.front().filter(|p| p.is_sealed()).cloned()
    }

    /// Drop `page` from the buffer and delete its file. Callers serialize
    /// this against readers with the engine's transport lock.
    pub fn remove(&self, page: &Arc<Page>) -> Result<()> {
        let mut pages = self.pages.write();
        match pages.front() {
            Some(front) if front.id() == page.id() => {
                pages.pop_front();
            }
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "page {} is not the oldest buffered page",
                    page.id()
                )))
            }
        }
        drop(pages);
        page.delete()?;
        tracing::debug!(page = page.id(), "removed transferred page");
        Ok(())
    }

    /// Run `f` over every buffered write, oldest page first.
    pub fn scan(&self, mut f: impl FnMut(&Write) -> Result<()>) -> Result<()> {
        if let Some((id, e)) = self.quarantined.first() {
            return Err(Error::Corruption(format!("buffer page {id} is quarantined: {e}")));
        }
        let pages: Vec<Arc<Page>> = self.pages.read().iter().cloned().collect();
        for page in pages {
            page.scan(&mut f)?;
        }
        Ok(())
    }

    /// Buffered primary-index revisions for `record`, optionally filtered by
    /// key.
    pub fn primary_revisions(
        &self,
        record: PrimaryKey,
        key: Option<&Text>,
    ) -> Result<Vec<PrimaryRevision>> {
        let mut out = Vec::new();
        self.scan(|w| {
            if w.record() == record && key.map_or(true, |k| w.key() == k) {
                out.push(w.primary());
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Buffered secondary-index revisions for `key` whose stored value
    /// satisfies `matches`.
    pub fn secondary_revisions(
        &self,
        key: &Text,
        matches: impl Fn(&Value) -> bool,
    ) -> Result<Vec<SecondaryRevision>> {
        let mut out = Vec::new();
        self.scan(|w| {
            if w.key() == key && matches(w.value()) {
                out.push(w.secondary());
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Synthesized search-index revisions for the query `token` under `key`:
    /// what the search block would hold after this buffer is transferred.
    pub fn search_revisions(
        &self,
        key: &Text,
        token: &str,
        stopwords: &HashSet<String>,
    ) -> Result<Vec<SearchRevision>> {
        let mut out = Vec::new();
        self.scan(|w| {
            if w.key() != key {
                return Ok(());
            }
            let Some(text) = w.value().data().as_str() else {
                return Ok(());
            };
            for (position, stored) in search::tokenize(text).into_iter().enumerate() {
                if stopwords.contains(&stored) {
                    continue;
                }
                if stored.contains(token) {
                    out.push(Revision::new(
                        key.clone(),
                        Text::wrap(token),
                        Position::new(w.record(), position as u32),
                        w.version(),
                        w.action(),
                    ));
                }
            }
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Action;
    use tempfile::TempDir;

    fn write(key: &str, value: &str, record: u64, version: u64, action: Action) -> Write {
        Write::new(Text::wrap(key), Value::of(value), PrimaryKey(record), version, action)
    }

    #[test]
    fn test_insert_and_scan() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path(), 1024 * 1024).unwrap();

        buffer.insert(write("name", "alice", 1, 1, Action::Add)).unwrap();
        buffer.insert(write("name", "bob", 2, 2, Action::Add)).unwrap();
        buffer.sync().unwrap();

        let mut versions = Vec::new();
        buffer
            .scan(|w| {
                versions.push(w.version());
                Ok(())
            })
            .unwrap();
        assert_eq!(versions, vec![1, 2]);
        assert!(!buffer.can_transfer());
    }

    #[test]
    fn test_page_rollover_and_transfer_order() {
        let dir = TempDir::new().unwrap();
        // Tiny pages so every write rolls over.
        let buffer = Buffer::open(dir.path(), 1).unwrap();

        for version in 1..=3 {
            buffer.insert(write("k", "v", 1, version, Action::Add)).unwrap();
        }
        assert!(buffer.can_transfer());

        let oldest = buffer.oldest_sealed().unwrap();
        let mut versions = Vec::new();
        oldest
            .scan(|w| {
                versions.push(w.version());
                Ok(())
            })
            .unwrap();
        assert_eq!(versions, vec![1]);

        buffer.remove(&oldest).unwrap();
        let next = buffer.oldest_sealed().unwrap();
        assert!(next.id() > oldest.id());
    }

    #[test]
    fn test_recovery_restores_writes() {
        let dir = TempDir::new().unwrap();
        {
            let buffer = Buffer::open(dir.path(), 1024).unwrap();
            buffer.insert(write("name", "alice", 1, 10, Action::Add)).unwrap();
            buffer.insert(write("name", "alice", 1, 11, Action::Remove)).unwrap();
            buffer.sync().unwrap();
        }

        let buffer = Buffer::open(dir.path(), 1024).unwrap();
        assert_eq!(buffer.max_version(), 11);
        let revisions = buffer.primary_revisions(PrimaryKey(1), None).unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].action(), Action::Add);
        assert_eq!(revisions[1].action(), Action::Remove);
    }

    #[test]
    fn test_quarantined_page_fails_reads_but_not_writes() {
        let dir = TempDir::new().unwrap();
        {
            let buffer = Buffer::open(dir.path(), 1).unwrap();
            buffer.insert(write("k", "v", 1, 1, Action::Add)).unwrap();
            buffer.insert(write("k", "v", 1, 2, Action::Add)).unwrap();
        }
        // Corrupt the sealed page's entry bytes.
        let sealed = dir.path().join("00001.page");
        let mut bytes = std::fs::read(&sealed).unwrap();
        let len = bytes.len();
        bytes[len - 10] ^= 0xFF;
        std::fs::write(&sealed, &bytes).unwrap();

        let buffer = Buffer::open(dir.path(), 1024).unwrap();
        assert!(matches!(buffer.scan(|_| Ok(())), Err(Error::Corruption(_))));
        buffer.insert(write("k", "v", 2, 3, Action::Add)).unwrap();
    }

    #[test]
    fn test_secondary_and_search_projections() {
        let dir = TempDir::new().unwrap();
        let buffer = Buffer::open(dir.path(), 1024 * 1024).unwrap();
        buffer.insert(write("bio", "foo bar", 1, 1, Action::Add)).unwrap();
        buffer.insert(write("bio", "food barn", 2, 2, Action::Add)).unwrap();
        buffer.insert(write("age", "x", 3, 3, Action::Add)).unwrap();

        let secondary = buffer
            .secondary_revisions(&Text::wrap("bio"), |_| true)
            .unwrap();
        assert_eq!(secondary.len(), 2);
        assert_eq!(secondary[0].locator(), &Text::wrap("bio"));
        assert_eq!(secondary[0].value(), &PrimaryKey(1));

        let stopwords = search::default_stopwords();
        let hits = buffer
            .search_revisions(&Text::wrap("bio"), "fo", &stopwords)
            .unwrap();
        // "fo" is a substring of "foo" (record 1, pos 0) and "food" (record 2, pos 0).
        assert_eq!(hits.len(), 2);
        let records: Vec<u64> = hits.iter().map(|r| r.value().record().value()).collect();
        assert_eq!(records, vec![1, 2]);
    }
}
