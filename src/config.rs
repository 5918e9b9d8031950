use std::collections::HashSet;
use std::path::PathBuf;

use crate::errinput;
use crate::error::Result;
use crate::storage::search;

/// Configuration for an engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding buffer pages.
    pub buffer_dir: PathBuf,

    /// Directory holding the block trees (primary, secondary, search).
    pub db_dir: PathBuf,

    /// Maximum size of a buffer page before it is sealed (default: 8MB)
    pub buffer_page_size: usize,

    /// Maximum size of a mutable block before it rolls over during a
    /// transfer (default: 64MB)
    pub block_size_cap: usize,

    /// Number of threads in the search indexing pool (default: 0, which lets
    /// the pool size itself to the machine)
    pub search_threads: usize,

    /// Terms excluded from search indexing and search queries.
    pub stopwords: HashSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_dir: PathBuf::from("./emberdb/buffer"),
            db_dir: PathBuf::from("./emberdb/db"),
            buffer_page_size: 8 * 1024 * 1024, // 8MB
            block_size_cap: 64 * 1024 * 1024,  // 64MB
            search_threads: 0,
            stopwords: search::default_stopwords(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given buffer and database directories.
    pub fn new(buffer_dir: impl Into<PathBuf>, db_dir: impl Into<PathBuf>) -> Self {
        Self {
            buffer_dir: buffer_dir.into(),
            db_dir: db_dir.into(),
            ..Default::default()
        }
    }

    /// Set the buffer page size.
    pub fn buffer_page_size(mut self, size: usize) -> Self {
        self.buffer_page_size = size;
        self
    }

    /// Set the mutable block size cap.
    pub fn block_size_cap(mut self, size: usize) -> Self {
        self.block_size_cap = size;
        self
    }

    /// Set the search indexing pool size.
    pub fn search_threads(mut self, threads: usize) -> Self {
        self.search_threads = threads;
        self
    }

    /// Replace the stopword set.
    pub fn stopwords(mut self, stopwords: HashSet<String>) -> Self {
        self.stopwords = stopwords;
        self
    }

    /// Reject configurations where the buffer and database directories are
    /// the same path or where one is nested inside the other. Both trees are
    /// managed independently (pages are deleted after transfer, blocks are
    /// never rewritten), so overlap would let one subsystem destroy the
    /// other's files.
    pub fn validate(&self) -> Result<()> {
        let buffer = normalize(&self.buffer_dir);
        let db = normalize(&self.db_dir);
        if buffer == db {
            return errinput!("buffer and database directories must differ: {}", buffer.display());
        }
        if buffer.starts_with(&db) || db.starts_with(&buffer) {
            return errinput!(
                "buffer and database directories must not be nested: {} vs {}",
                buffer.display(),
                db.display()
            );
        }
        if self.buffer_page_size == 0 {
            return errinput!("buffer page size must be nonzero");
        }
        if self.block_size_cap == 0 {
            return errinput!("block size cap must be nonzero");
        }
        Ok(())
    }
}

/// Lexically normalize a path (strip `.` components, fold `..`) so that
/// nesting checks do not depend on the directories existing yet.
fn normalize(path: &std::path::Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_page_size, 8 * 1024 * 1024);
        assert_eq!(config.block_size_cap, 64 * 1024 * 1024);
        assert!(config.stopwords.contains("the"));
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/buf", "/tmp/db")
            .buffer_page_size(1024)
            .block_size_cap(4096)
            .search_threads(2);

        assert_eq!(config.buffer_dir, PathBuf::from("/tmp/buf"));
        assert_eq!(config.db_dir, PathBuf::from("/tmp/db"));
        assert_eq!(config.buffer_page_size, 1024);
        assert_eq!(config.block_size_cap, 4096);
        assert_eq!(config.search_threads, 2);
        config.validate().expect("config should be valid");
    }

    #[test]
    fn test_same_directory_rejected() {
        let config = EngineConfig::new("/tmp/data", "/tmp/data");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_directory_rejected() {
        let config = EngineConfig::new("/tmp/data/buffer", "/tmp/data");
        assert!(config.validate().is_err());

        let config = EngineConfig::new("/tmp/data", "/tmp/data/db");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dot_components_do_not_evade_nesting_check() {
        let config = EngineConfig::new("/tmp/data/./buffer", "/tmp/data");
        assert!(config.validate().is_err());
    }
}
